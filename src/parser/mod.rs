//! Line parsing: CSV record decoding, the per-column readers built from the
//! `format` section, and the async `LogParser` that feeds parsed records
//! into the metric registry.

mod columns;
mod csv;
mod stream;

pub use columns::{ColumnReader, ParsedLine};
pub use csv::split_record;
pub use stream::{LogParser, ParseOutcome};
