use std::fmt::Write;

/// The reserved label carrying the logical host group; always present and
/// always rendered first.
pub const ENVIRONMENT_LABEL: &str = "environment";

/// An ordered set of `(key, value)` label pairs plus the mandatory
/// `environment` value.
///
/// Two sets are equal iff they share the environment and the same pairs in
/// the same order; the derived `Hash` respects that. A set is built up while
/// one log line is parsed, then cloned into the instrument key and never
/// mutated again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelSet {
    environment: String,
    pairs: Vec<(String, String)>,
}

impl LabelSet {
    /// An empty environment is a programming error: config loading maps a
    /// missing environment name to `"N/A"` before any set is built.
    pub fn new(environment: impl Into<String>) -> Self {
        let environment = environment.into();
        assert!(!environment.is_empty(), "environment label must not be empty");

        Self {
            environment,
            pairs: Vec::new(),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Overwrite in place if `key` is already present, append otherwise.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        debug_assert_ne!(key, ENVIRONMENT_LABEL, "'environment' is reserved");

        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    /// Builder-style `set`, used where a set is assembled in one expression.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        if key == ENVIRONMENT_LABEL {
            return Some(&self.environment);
        }
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Render the Prometheus label-list body (without the surrounding
    /// braces): `environment="..."`, then `le` if supplied, then each pair
    /// in insertion order.
    pub fn render(&self, le: Option<&str>) -> String {
        let mut out = String::with_capacity(32 + self.pairs.len() * 16);
        let _ = write!(out, "environment=\"{}\"", escape(&self.environment));

        if let Some(le) = le {
            let _ = write!(out, ",le=\"{}\"", escape(le));
        }

        for (key, value) in &self.pairs {
            let _ = write!(out, ",{}=\"{}\"", key, escape(value));
        }

        out
    }
}

/// Label-value escaping per the Prometheus text format.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out
}
