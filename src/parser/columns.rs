use std::collections::HashMap;

use crate::error::ParseError;
use crate::metrics::LabelSet;

/// The transient result of parsing one log line: the labels collected so
/// far plus the numeric observations keyed by metric base name.
#[derive(Debug, Clone)]
pub struct ParsedLine {
    pub labels: LabelSet,
    pub metrics: HashMap<String, f64>,
}

impl ParsedLine {
    pub fn new(environment: &str) -> Self {
        Self {
            labels: LabelSet::new(environment),
            metrics: HashMap::new(),
        }
    }
}

impl PartialEq for ParsedLine {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels && self.metrics == other.metrics
    }
}

/// Consumes one raw CSV field and mutates the parse buffer.
///
/// Readers are stateless; one shared vector serves every scraper thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnReader {
    /// Record the field as the value of label `name`.
    Label { name: String },
    /// Parse the field as a float and record it as observation `name`.
    Number { name: String },
    /// Like `Number`, but the CLF placeholder `-` counts as zero.
    ClfNumber { name: String },
    /// Split `<method> <uri> <version>` into the three request labels; the
    /// uri is truncated at the first `?`.
    RequestHeader,
    /// Consume the column without effect.
    Ignore,
}

impl ColumnReader {
    pub fn apply(&self, field: &str, line: &mut ParsedLine) -> Result<(), ParseError> {
        match self {
            Self::Label { name } => {
                line.labels.set(name.clone(), field);
                Ok(())
            }
            Self::Number { name } => {
                let value = parse_number(name, field)?;
                line.metrics.insert(name.clone(), value);
                Ok(())
            }
            Self::ClfNumber { name } => {
                let value = if field == "-" {
                    0.0
                } else {
                    parse_number(name, field)?
                };
                line.metrics.insert(name.clone(), value);
                Ok(())
            }
            Self::RequestHeader => {
                let mut parts = field.split(' ');
                match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some(method), Some(uri), Some(version), None) => {
                        line.labels.set("request_method", method);
                        let uri = uri.split('?').next().unwrap_or(uri);
                        line.labels.set("request_uri", uri);
                        line.labels.set("request_http_version", version);
                        Ok(())
                    }
                    _ => Err(ParseError::MalformedRequestHeader {
                        value: field.to_string(),
                    }),
                }
            }
            Self::Ignore => Ok(()),
        }
    }
}

fn parse_number(name: &str, field: &str) -> Result<f64, ParseError> {
    field.parse().map_err(|_| ParseError::NotANumber {
        column: name.to_string(),
        value: field.to_string(),
    })
}
