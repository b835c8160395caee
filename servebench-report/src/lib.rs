#![warn(missing_docs)]
//! servebench Report - Persisting and Presenting Runs
//!
//! - CSV (append-only, one row per iteration)
//! - JSON (the whole run with metadata)
//! - Human-readable terminal table

mod csv;
mod error;
mod formatting;
mod json;
mod report;

pub use crate::csv::{CsvReportSink, default_report_filename};
pub use error::ReportError;
pub use formatting::format_human_output;
pub use json::{generate_json_report, write_json_report};
pub use report::{ReportMeta, RunReport, SCHEMA_VERSION, SystemInfo};
