//! Sample persistence for streaming sessions
//!
//! The CSV sink is the session's append-only record store: one file per
//! successful start, one row per sample.

pub mod csv_sink;

pub use csv_sink::CsvSink;
