use std::time::Duration;
use thiserror::Error;

/// Error kinds produced while scraping a single target.
///
/// Everything except `Configuration` is retryable: the scraper logs the
/// error, enters cooldown and reconnects. `Configuration` is only raised
/// while loading the scrape config and terminates startup.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("no new line within {timeout:?} while tailing {file}")]
    Starvation { file: String, timeout: Duration },

    #[error("connect attempt to {host} timed out after {timeout:?}")]
    ConnectTimeout { host: String, timeout: Duration },

    #[error("authentication as {user}@{host} failed")]
    Auth { host: String, user: String },

    #[error("ssh error on {host}: {source}")]
    Ssh {
        host: String,
        #[source]
        source: russh::Error,
    },

    #[error("i/o error on {host}: {source}")]
    Io {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("inventory script failed: {0}")]
    Inventory(String),
}

impl ScrapeError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// A single CSV record (or one of its columns) could not be parsed.
///
/// Recovery is local: the record is dropped and the parser error counters
/// are incremented, then parsing continues with the next line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },

    #[error("column {column:?} is not a number: {value:?}")]
    NotANumber { column: String, value: String },

    #[error("request header is not of the form <method> <uri> <version>: {value:?}")]
    MalformedRequestHeader { value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_error_display_carries_host() {
        let err = ScrapeError::ConnectTimeout {
            host: "db-1.example.org".to_string(),
            timeout: Duration::from_secs(30),
        };

        assert!(err.to_string().contains("db-1.example.org"));
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::ColumnCount {
            expected: 7,
            found: 6,
        };

        assert_eq!(err.to_string(), "expected 7 columns, found 6");
    }
}
