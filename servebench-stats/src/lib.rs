#![warn(missing_docs)]
//! servebench Statistics
//!
//! Small, allocation-light reductions over measurement series:
//! - min / max / mean for sampler axes (RAM, CPU)
//! - full summaries with percentiles for per-hit wait times
//!
//! Empty inputs never panic; they produce `None` so callers can record an
//! explicit "no data" marker.

mod percentiles;
mod summary;

pub use percentiles::{Percentiles, compute_percentile, compute_percentiles};
pub use summary::{MinMaxMean, SummaryStatistics, compute_summary, min_max_mean};
