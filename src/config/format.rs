use crate::error::ScrapeError;
use crate::metrics::{FamilyDef, InstrumentKind, RESERVED_NAMES};
use crate::parser::ColumnReader;

use super::GlobalConfig;

/// Bucket upper bounds used when a histogram spec names no bounds of its
/// own (`+Inf` is appended by the registry).
pub const DEFAULT_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// The compiled `format` section: the per-column readers in configuration
/// order and the metric families the numeric columns give rise to.
#[derive(Debug, Clone)]
pub struct ScrapeFormat {
    pub readers: Vec<ColumnReader>,
    pub families: Vec<FamilyDef>,
}

/// Compile `global.format` into readers and family definitions, enforcing
/// every naming rule: reserved names, the metric-name charset, forbidden
/// suffixes, histogram specs only on numeric columns and only when defined.
pub fn build_format(global: &GlobalConfig) -> Result<ScrapeFormat, ScrapeError> {
    let mut readers = Vec::with_capacity(global.format.len());
    let mut families: Vec<FamilyDef> = Vec::new();

    for (index, entry) in global.format.iter().enumerate() {
        let Some(mapping) = entry else {
            readers.push(ColumnReader::Ignore);
            continue;
        };

        if mapping.len() != 1 {
            return Err(ScrapeError::configuration(format!(
                "format entry {index} must be a single-key mapping, found {} keys",
                mapping.len()
            )));
        }
        let (name, type_spec) = mapping.iter().next().expect("len checked above");

        let Some(type_spec) = type_spec else {
            readers.push(ColumnReader::Ignore);
            continue;
        };

        let (reader_type, histogram_spec) = match type_spec.split_once('+') {
            Some((reader_type, spec)) => (reader_type, Some(spec)),
            None => (type_spec.as_str(), None),
        };

        match reader_type {
            "label" => {
                if name == "environment" {
                    return Err(ScrapeError::configuration(
                        "'environment' is a reserved label name",
                    ));
                }
                if histogram_spec.is_some() {
                    return Err(ScrapeError::configuration(format!(
                        "label {name:?} cannot carry a histogram spec"
                    )));
                }
                readers.push(ColumnReader::Label { name: name.clone() });
            }
            "request_header" => {
                if histogram_spec.is_some() {
                    return Err(ScrapeError::configuration(format!(
                        "request_header {name:?} cannot carry a histogram spec"
                    )));
                }
                readers.push(ColumnReader::RequestHeader);
            }
            "number" | "clf_number" => {
                validate_metric_name(name)?;
                if families.iter().any(|f| f.base_name == *name) {
                    return Err(ScrapeError::configuration(format!(
                        "duplicate metric name {name:?}"
                    )));
                }

                let def = match histogram_spec {
                    Some(spec) => {
                        let bounds = global.histograms.get(spec).ok_or_else(|| {
                            ScrapeError::configuration(format!(
                                "metric {name:?} references undefined histogram spec {spec:?}"
                            ))
                        })?;
                        let buckets = match bounds {
                            Some(bounds) if !bounds.is_empty() => bounds.clone(),
                            _ => DEFAULT_BUCKETS.to_vec(),
                        };
                        FamilyDef {
                            base_name: name.clone(),
                            help: format!("Histogram of \"{name}\""),
                            kind: InstrumentKind::Histogram,
                            buckets: Some(buckets),
                        }
                    }
                    None => FamilyDef {
                        base_name: name.clone(),
                        help: format!("Sum of \"{name}\""),
                        kind: InstrumentKind::Counter,
                        buckets: None,
                    },
                };
                families.push(def);

                readers.push(match reader_type {
                    "number" => ColumnReader::Number { name: name.clone() },
                    _ => ColumnReader::ClfNumber { name: name.clone() },
                });
            }
            other => {
                return Err(ScrapeError::configuration(format!(
                    "unknown reader type {other:?} for column {name:?}"
                )));
            }
        }
    }

    Ok(ScrapeFormat { readers, families })
}

fn validate_metric_name(name: &str) -> Result<(), ScrapeError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_')
    {
        return Err(ScrapeError::configuration(format!(
            "invalid metric name {name:?}"
        )));
    }

    for suffix in ["_sum", "_count", "_bucket", "_total"] {
        if name.ends_with(suffix) {
            return Err(ScrapeError::configuration(format!(
                "metric name {name:?} must not end in {suffix:?}"
            )));
        }
    }

    if RESERVED_NAMES.contains(&name) {
        return Err(ScrapeError::configuration(format!(
            "{name:?} is a reserved metric name"
        )));
    }

    Ok(())
}
