use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{ParseError, ScrapeError};
use crate::metrics::{LabelSet, MetricRegistry};

use super::{split_record, ColumnReader, ParsedLine};

const READ_CHUNK: usize = 8 * 1024;

/// Why a parser run ended without error.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The underlying stream reached end-of-stream.
    Eof,
    /// The cancellation signal fired; the parser stopped silently.
    Cancelled,
}

/// Pulls CSV records from a byte stream and turns them into metric updates.
///
/// One parser serves one tailing session: it knows the target's environment
/// and id, shares the configured reader vector, and writes every update
/// through the registry. Reads are bounded by the read timeout; crossing it
/// is reported as starvation so the scraper can reconnect.
pub struct LogParser {
    environment: String,
    target_id: String,
    readers: Arc<Vec<ColumnReader>>,
    registry: Arc<MetricRegistry>,
    separator: char,
    quote: char,
    read_timeout: Duration,
    token: CancellationToken,
}

impl LogParser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        environment: impl Into<String>,
        target_id: impl Into<String>,
        readers: Arc<Vec<ColumnReader>>,
        registry: Arc<MetricRegistry>,
        separator: char,
        quote: char,
        read_timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            environment: environment.into(),
            target_id: target_id.into(),
            readers,
            registry,
            separator,
            quote,
            read_timeout,
            token,
        }
    }

    /// Consume `stream` until end-of-stream, cancellation or starvation.
    ///
    /// Cancellation is polled at every suspension point; the partial line
    /// still in the buffer when end-of-stream hits is parsed as a final
    /// record.
    pub async fn run<R>(&self, mut stream: R) -> Result<ParseOutcome, ScrapeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];
        let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK);

        loop {
            let read = tokio::select! {
                () = self.token.cancelled() => return Ok(ParseOutcome::Cancelled),
                read = timeout(self.read_timeout, stream.read(&mut chunk)) => read,
            };

            let n = match read {
                Err(_elapsed) => {
                    return Err(ScrapeError::Starvation {
                        file: self.target_id.clone(),
                        timeout: self.read_timeout,
                    });
                }
                Ok(Err(source)) => {
                    return Err(ScrapeError::Io {
                        host: self.target_id.clone(),
                        source,
                    });
                }
                Ok(Ok(0)) => {
                    if !pending.is_empty() {
                        self.handle_record(&String::from_utf8_lossy(&pending));
                    }
                    return Ok(ParseOutcome::Eof);
                }
                Ok(Ok(n)) => n,
            };

            self.flush_bytes(n);
            pending.extend_from_slice(&chunk[..n]);

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.is_empty() {
                    continue;
                }
                self.handle_record(&String::from_utf8_lossy(&line));
            }
        }
    }

    /// Account stream bytes to `ssh_bytes_in`, keyed by environment only.
    fn flush_bytes(&self, n: usize) {
        self.registry
            .ssh_bytes_in()
            .with_labels(&LabelSet::new(&self.environment))
            .add(n as f64);
    }

    fn handle_record(&self, line: &str) {
        match self.parse_record(line) {
            Ok(parsed) => self.record_success(&parsed),
            Err(err) => self.record_parse_error(line, &err),
        }
    }

    /// Decode one record through the reader vector. The record is dropped
    /// wholesale on any error; no partial update reaches the registry.
    fn parse_record(&self, line: &str) -> Result<ParsedLine, ParseError> {
        let fields = split_record(line, self.separator, self.quote);
        if fields.len() != self.readers.len() {
            return Err(ParseError::ColumnCount {
                expected: self.readers.len(),
                found: fields.len(),
            });
        }

        let mut parsed = ParsedLine::new(&self.environment);
        for (reader, field) in self.readers.iter().zip(&fields) {
            reader.apply(field, &mut parsed)?;
        }
        Ok(parsed)
    }

    fn record_success(&self, parsed: &ParsedLine) {
        self.registry
            .lines_parsed()
            .with_labels(&parsed.labels)
            .add(1.0);

        let with_target = parsed
            .labels
            .clone()
            .with("target", &self.target_id);
        self.registry
            .lines_parsed_per_target()
            .with_labels(&with_target)
            .add(1.0);

        for (name, amount) in &parsed.metrics {
            match self.registry.family(name) {
                Some(family) => family.with_labels(&parsed.labels).add(*amount),
                None => {
                    // Unreachable with a validated configuration.
                    debug_assert!(false, "unknown metric family {name:?}");
                    error!(metric = %name, "observation for unknown metric family");
                }
            }
        }
    }

    fn record_parse_error(&self, line: &str, err: &ParseError) {
        debug!(target_id = %self.target_id, %err, line, "dropping unparseable record");

        self.registry
            .parser_errors()
            .with_labels(&LabelSet::new(&self.environment))
            .add(1.0);

        let labels = LabelSet::new(&self.environment).with("target", &self.target_id);
        self.registry
            .parser_errors_per_target()
            .with_labels(&labels)
            .add(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{FamilyDef, InstrumentKind, RegistrySettings};

    fn registry() -> Arc<MetricRegistry> {
        let defs = [FamilyDef {
            base_name: "bytes_sent".to_string(),
            help: "Sum of \"bytes_sent\"".to_string(),
            kind: InstrumentKind::Counter,
            buckets: None,
        }];
        Arc::new(MetricRegistry::new(RegistrySettings::default(), &defs).unwrap())
    }

    fn readers() -> Arc<Vec<ColumnReader>> {
        Arc::new(vec![
            ColumnReader::Label {
                name: "status".to_string(),
            },
            ColumnReader::ClfNumber {
                name: "bytes_sent".to_string(),
            },
        ])
    }

    fn parser(registry: &Arc<MetricRegistry>, token: CancellationToken) -> LogParser {
        LogParser::new(
            "prod",
            "ssh://host-1/var/log/access.log",
            readers(),
            Arc::clone(registry),
            ' ',
            '"',
            Duration::from_millis(200),
            token,
        )
    }

    #[tokio::test]
    async fn test_parses_lines_and_updates_registry() {
        let registry = registry();
        let parser = parser(&registry, CancellationToken::new());

        let input = b"200 123\n200 7\n404 -\n" as &[u8];
        let outcome = parser.run(input).await.unwrap();
        assert_eq!(outcome, ParseOutcome::Eof);

        let labels = LabelSet::new("prod").with("status", "200");
        assert_eq!(registry.lines_parsed().with_labels(&labels).value(), 2.0);
        assert_eq!(
            registry.family("bytes_sent").unwrap().with_labels(&labels).value(),
            130.0
        );

        let labels_404 = LabelSet::new("prod").with("status", "404");
        assert_eq!(
            registry.family("bytes_sent").unwrap().with_labels(&labels_404).value(),
            0.0
        );
        assert_eq!(registry.parser_errors().child_count(), 0);
    }

    #[tokio::test]
    async fn test_per_target_counters_carry_target_label() {
        let registry = registry();
        let parser = parser(&registry, CancellationToken::new());

        parser.run(b"200 1\n" as &[u8]).await.unwrap();

        let labels = LabelSet::new("prod")
            .with("status", "200")
            .with("target", "ssh://host-1/var/log/access.log");
        assert_eq!(
            registry.lines_parsed_per_target().with_labels(&labels).value(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_bad_record_counts_error_and_leaves_no_partial_update() {
        let registry = registry();
        let parser = parser(&registry, CancellationToken::new());

        // Wrong column count, then a bad number.
        parser.run(b"onlyone\n200 xyz\n" as &[u8]).await.unwrap();

        let env_only = LabelSet::new("prod");
        assert_eq!(registry.parser_errors().with_labels(&env_only).value(), 2.0);

        let per_target = env_only
            .clone()
            .with("target", "ssh://host-1/var/log/access.log");
        assert_eq!(
            registry.parser_errors_per_target().with_labels(&per_target).value(),
            2.0
        );

        assert_eq!(registry.lines_parsed().child_count(), 0);
        assert_eq!(registry.family("bytes_sent").unwrap().child_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let registry = registry();
        let parser = parser(&registry, CancellationToken::new());

        parser.run(b"\n\n200 5\n\n" as &[u8]).await.unwrap();

        assert_eq!(registry.lines_parsed().child_count(), 1);
        assert_eq!(registry.parser_errors().child_count(), 0);
    }

    #[tokio::test]
    async fn test_final_partial_line_is_parsed_at_eof() {
        let registry = registry();
        let parser = parser(&registry, CancellationToken::new());

        parser.run(b"200 5" as &[u8]).await.unwrap();

        assert_eq!(registry.lines_parsed().child_count(), 1);
    }

    #[tokio::test]
    async fn test_bytes_are_accounted_per_environment() {
        let registry = registry();
        let parser = parser(&registry, CancellationToken::new());

        let input = b"200 123\n" as &[u8];
        parser.run(input).await.unwrap();

        assert_eq!(
            registry.ssh_bytes_in().with_labels(&LabelSet::new("prod")).value(),
            input.len() as f64
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_raises_starvation() {
        let registry = registry();
        let parser = parser(&registry, CancellationToken::new());

        let (_writer, reader) = tokio::io::duplex(64);
        let err = parser.run(reader).await.unwrap_err();

        assert!(matches!(err, ScrapeError::Starvation { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_cleanly() {
        let registry = registry();
        let token = CancellationToken::new();
        let parser = LogParser::new(
            "prod",
            "ssh://host-1/var/log/access.log",
            readers(),
            Arc::clone(&registry),
            ' ',
            '"',
            Duration::from_secs(60),
            token.clone(),
        );

        let (_writer, reader) = tokio::io::duplex(64);
        let run = tokio::spawn(async move { parser.run(reader).await });

        token.cancel();
        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, ParseOutcome::Cancelled);
    }
}
