//! Error taxonomy shared by every component.

use serde::{Deserialize, Serialize};

/// Coarse classification of a failure, used for reporting and for deciding
/// how far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Target process or service unreachable when a run or measurement starts
    Setup,
    /// A collaborator answered with an unexpected status
    Collaborator,
    /// Accelerator tool invocation, parsing, or pid matching failed
    Telemetry,
    /// Sample data was malformed
    Aggregation,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorCategory::Setup => "setup failure",
            ErrorCategory::Collaborator => "collaborator failure",
            ErrorCategory::Telemetry => "telemetry failure",
            ErrorCategory::Aggregation => "aggregation failure",
        };
        f.write_str(label)
    }
}

/// Implemented by every error type in this crate.
pub trait Categorized {
    /// Which taxonomy class this error belongs to
    fn category(&self) -> ErrorCategory;
}
