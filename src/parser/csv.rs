/// Split one record into fields honouring a single-character separator and
/// a single-character quote.
///
/// A field that starts with the quote character has its surrounding quotes
/// removed and may contain the separator; everything else is passed through
/// verbatim, so a quote in the middle of a bare field is just a character.
pub fn split_record(line: &str, separator: char, quote: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        let mut field = String::new();

        if chars.peek() == Some(&quote) {
            chars.next();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == quote {
                    closed = true;
                    break;
                }
                field.push(c);
            }
            // Unterminated quote: keep what we have. Trailing characters
            // between the closing quote and the separator are appended
            // verbatim.
            if closed {
                while let Some(&c) = chars.peek() {
                    if c == separator {
                        break;
                    }
                    field.push(c);
                    chars.next();
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == separator {
                    break;
                }
                field.push(c);
                chars.next();
            }
        }

        fields.push(field);

        match chars.next() {
            Some(c) if c == separator => continue,
            _ => break,
        }
    }

    fields
}
