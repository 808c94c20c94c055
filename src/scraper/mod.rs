//! Per-target scraping: the SSH tail lifecycle and the supervisor that
//! reconciles the active scraper set against the configured or
//! script-provided inventory.

mod ssh;
mod supervisor;

use std::sync::Arc;

use crate::metrics::MetricRegistry;
use crate::parser::ColumnReader;

pub use ssh::SshScraper;
pub use supervisor::Supervisor;

/// Everything a scraper shares with its siblings: the compiled reader
/// vector, the registry and the CSV dialect.
#[derive(Clone)]
pub struct ScraperContext {
    pub readers: Arc<Vec<ColumnReader>>,
    pub registry: Arc<MetricRegistry>,
    pub separator: char,
    pub quote: char,
}
