//! Per-iteration records and the rows derived from them

use crate::controller::BenchmarkState;
use crate::dispatch::HitResult;
use crate::monitor::{AxisSummary, MonitorSummary};
use serde::{Deserialize, Serialize};
use servebench_stats::{SummaryStatistics, compute_summary};

/// Success counts and wait-time statistics of one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Over successful hits, in milliseconds
    pub wait: Option<SummaryStatistics>,
}

impl HitStats {
    pub fn from_results<R, M>(results: &[HitResult<R, M>]) -> Self {
        let waits: Vec<f64> = results
            .iter()
            .filter(|r| r.is_ok())
            .map(|r| r.wait_time.as_secs_f64() * 1000.0)
            .collect();
        Self {
            total: results.len(),
            succeeded: waits.len(),
            failed: results.len() - waits.len(),
            wait: compute_summary(&waits),
        }
    }

    /// Fraction of failed hits, 0.0 when nothing was dispatched
    pub fn failure_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

/// Everything learned from one completed iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub state: BenchmarkState,
    pub summary: MonitorSummary,
    pub hits: HitStats,
    /// Strategy-defined columns appended to the report row
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_columns: Vec<(String, String)>,
}

/// One report row: ordered `(column, value)` pairs.
///
/// Empty values mean "tracked but no data".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportRow {
    cells: Vec<(String, String)>,
}

impl ReportRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl ToString) {
        self.cells.push((column.into(), value.to_string()));
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(c, _)| c.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(_, v)| v.as_str())
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Flatten a record into the fixed column layout. Axes that were not
    /// tracked (`None` in the summary) get no columns.
    pub fn from_record(record: &IterationRecord) -> Self {
        let mut row = Self::new();
        let summary = &record.summary;

        row.push("iteration", record.state.iteration);
        row.push("batch_size", record.state.batch_size);
        row.push("hit_size", record.state.hit_size);
        if let Some(elapsed) = summary.elapsed_ms {
            row.push("elapsed_ms", format!("{:.3}", elapsed));
        }

        row.push("hits_ok", record.hits.succeeded);
        row.push("hits_failed", record.hits.failed);
        let wait = record.hits.wait.as_ref();
        row.push("wait_mean_ms", fmt_opt(wait.map(|w| w.mean), 3));
        row.push("wait_p50_ms", fmt_opt(wait.map(|w| w.p50), 3));
        row.push("wait_p95_ms", fmt_opt(wait.map(|w| w.p95), 3));
        row.push("wait_max_ms", fmt_opt(wait.map(|w| w.max), 3));

        if let Some(ram) = &summary.ram_uss_bytes {
            push_axis(&mut row, "ram_uss", "_bytes", ram, 0);
        }
        if let Some(cpu) = &summary.cpu_percent {
            push_axis(&mut row, "cpu_percent", "", cpu, 2);
        }
        if let Some(mib) = summary.accelerator_mem_mib {
            row.push("accelerator_mem_mib", mib);
        }

        for (column, value) in &record.extra_columns {
            row.push(column.clone(), value);
        }
        row
    }
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_default()
}

fn push_axis(row: &mut ReportRow, prefix: &str, suffix: &str, axis: &AxisSummary, precision: usize) {
    let observed = axis.observed();
    row.push(
        format!("{}_min{}", prefix, suffix),
        fmt_opt(observed.map(|m| m.min), precision),
    );
    row.push(
        format!("{}_max{}", prefix, suffix),
        fmt_opt(observed.map(|m| m.max), precision),
    );
    row.push(
        format!("{}_avg{}", prefix, suffix),
        fmt_opt(observed.map(|m| m.mean), precision),
    );
}

/// Append-only destination for report rows
pub trait RowSink {
    fn write_row(&mut self, row: &ReportRow) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl RowSink for Vec<ReportRow> {
    fn write_row(&mut self, row: &ReportRow) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.push(row.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HitError;
    use servebench_stats::MinMaxMean;
    use std::time::Duration;

    fn hit(index: usize, ok: bool, ms: u64) -> HitResult<(), ()> {
        HitResult {
            index,
            outcome: if ok {
                Ok(())
            } else {
                Err(HitError::Transport("reset".to_string()))
            },
            metadata: Some(()),
            wait_time: Duration::from_millis(ms),
        }
    }

    fn record(summary: MonitorSummary) -> IterationRecord {
        IterationRecord {
            state: BenchmarkState {
                batch_size: 5,
                hit_size: 3,
                iteration: 2,
            },
            summary,
            hits: HitStats::from_results(&[hit(0, true, 10), hit(1, true, 30), hit(2, false, 99)]),
            extra_columns: vec![("files".to_string(), "5".to_string())],
        }
    }

    #[test]
    fn test_hit_stats() {
        let stats = HitStats::from_results(&[hit(0, true, 10), hit(1, false, 5), hit(2, true, 30)]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        let wait = stats.wait.as_ref().unwrap();
        assert!((wait.mean - 20.0).abs() < 0.5);
        assert!((stats.failure_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_hit_stats_all_failed() {
        let stats = HitStats::from_results(&[hit(0, false, 1)]);
        assert!(stats.wait.is_none());
        assert_eq!(stats.failure_ratio(), 1.0);
    }

    #[test]
    fn test_row_column_order() {
        let summary = MonitorSummary {
            elapsed_ms: Some(12.5),
            ram_uss_bytes: Some(AxisSummary::Observed(MinMaxMean {
                min: 100.0,
                max: 300.0,
                mean: 200.0,
            })),
            cpu_percent: Some(AxisSummary::NoData),
            accelerator_mem_mib: Some(2048),
            sample_count: 3,
            ..MonitorSummary::default()
        };
        let row = ReportRow::from_record(&record(summary));
        let columns: Vec<&str> = row.columns().collect();
        assert_eq!(
            columns,
            vec![
                "iteration",
                "batch_size",
                "hit_size",
                "elapsed_ms",
                "hits_ok",
                "hits_failed",
                "wait_mean_ms",
                "wait_p50_ms",
                "wait_p95_ms",
                "wait_max_ms",
                "ram_uss_min_bytes",
                "ram_uss_max_bytes",
                "ram_uss_avg_bytes",
                "cpu_percent_min",
                "cpu_percent_max",
                "cpu_percent_avg",
                "accelerator_mem_mib",
                "files",
            ]
        );
        assert_eq!(row.get("ram_uss_max_bytes"), Some("300"));
        assert_eq!(row.get("cpu_percent_avg"), Some(""));
        assert_eq!(row.get("hits_failed"), Some("1"));
        assert_eq!(row.get("elapsed_ms"), Some("12.500"));
    }

    #[test]
    fn test_row_omits_disabled_axes() {
        let row = ReportRow::from_record(&record(MonitorSummary::default()));
        assert!(row.get("elapsed_ms").is_none());
        assert!(row.get("ram_uss_min_bytes").is_none());
        assert!(row.get("accelerator_mem_mib").is_none());
        assert_eq!(row.get("iteration"), Some("2"));
    }

    #[test]
    fn test_vec_sink_appends() {
        let mut sink: Vec<ReportRow> = Vec::new();
        let row = ReportRow::from_record(&record(MonitorSummary::default()));
        sink.write_row(&row).unwrap();
        sink.write_row(&row).unwrap();
        assert_eq!(sink.len(), 2);
    }
}
