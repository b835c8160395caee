//! Report errors

use thiserror::Error;

/// Errors while writing or rendering reports
#[derive(Debug, Error)]
pub enum ReportError {
    /// Opening or writing a report file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or header parsing failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON encoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A row does not fit the header already in the file
    #[error("Row columns [{got}] do not match the report header [{expected}]")]
    ColumnMismatch {
        /// Header of the file
        expected: String,
        /// Columns of the rejected row
        got: String,
    },
}

impl servebench_core::Categorized for ReportError {
    fn category(&self) -> servebench_core::ErrorCategory {
        servebench_core::ErrorCategory::Collaborator
    }
}
