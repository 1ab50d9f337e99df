//! Normalized table output: row schemas, the CSV writer, and the
//! best-effort sheet mirror.

pub mod csv_writer;
pub mod sheet;
pub mod tables;

pub use csv_writer::TableWriter;
pub use sheet::{HttpSheetClient, SheetSink};
pub use tables::Table;
