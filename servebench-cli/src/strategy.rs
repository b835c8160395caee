//! Built-in benchmark strategy
//!
//! `DirectoryStrategy` fills every hit with `batch_size` files taken
//! round-robin from an input directory. Whether to grow the batch further
//! is decided by a `ThresholdPolicy`.

use crate::client::FilePart;
use crate::config::{PolicyConfig, ServebenchConfig};
use servebench_core::{
    AxisSummary, BenchmarkState, BenchmarkStrategy, HitError, HitResult, HitStats, MonitorSummary,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

/// What one hit carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitFiles {
    /// Files in the multipart body
    pub file_count: usize,
    /// Their combined size
    pub total_bytes: u64,
}

/// Limits checked after every iteration. `None` disables a limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdPolicy {
    /// Mean wait of successful hits
    pub max_mean_wait: Option<Duration>,
    /// 95th percentile wait of successful hits
    pub max_p95_wait: Option<Duration>,
    /// Failed hits over all hits, in `0.0..=1.0`
    pub max_failure_ratio: Option<f64>,
    /// Stop once an iteration ran at this batch size
    pub max_batch_size: Option<u32>,
    /// Peak unique set size of the server
    pub max_ram_uss_mib: Option<u64>,
    /// Device memory of the server
    pub max_accelerator_mib: Option<u64>,
}

impl ThresholdPolicy {
    /// Build from the `[policy]` section
    pub fn from_config(policy: &PolicyConfig) -> anyhow::Result<Self> {
        let duration = |value: &Option<String>| -> anyhow::Result<Option<Duration>> {
            value.as_deref().map(ServebenchConfig::parse_duration).transpose()
        };
        Ok(Self {
            max_mean_wait: duration(&policy.max_mean_wait)?,
            max_p95_wait: duration(&policy.max_p95_wait)?,
            max_failure_ratio: policy.max_failure_ratio,
            max_batch_size: policy.max_batch_size,
            max_ram_uss_mib: policy.max_ram_uss_mib,
            max_accelerator_mib: policy.max_accelerator_mib,
        })
    }

    /// Whether no limit is set at all
    pub fn is_unbounded(&self) -> bool {
        *self == Self::default()
    }

    /// The first limit this iteration exceeded, if any
    pub fn exceeded(
        &self,
        hits: &HitStats,
        summary: &MonitorSummary,
        state: &BenchmarkState,
    ) -> Option<String> {
        if let Some(max) = self.max_failure_ratio {
            let ratio = hits.failure_ratio();
            if ratio > max {
                return Some(format!(
                    "failure ratio {:.2} > {:.2} ({} of {} hits failed)",
                    ratio, max, hits.failed, hits.total
                ));
            }
        }

        let max_ms = |d: Option<Duration>| d.map(|d| d.as_secs_f64() * 1000.0);
        if let (Some(max), Some(wait)) = (max_ms(self.max_mean_wait), hits.wait.as_ref()) {
            if wait.mean > max {
                return Some(format!("mean wait {:.1}ms > {:.1}ms", wait.mean, max));
            }
        }
        if let (Some(max), Some(wait)) = (max_ms(self.max_p95_wait), hits.wait.as_ref()) {
            if wait.p95 > max {
                return Some(format!("p95 wait {:.1}ms > {:.1}ms", wait.p95, max));
            }
        }

        if let (Some(max), Some(AxisSummary::Observed(ram))) =
            (self.max_ram_uss_mib, summary.ram_uss_bytes.as_ref())
        {
            let peak_mib = ram.max / (1024.0 * 1024.0);
            if peak_mib > max as f64 {
                return Some(format!("peak USS {:.1}MiB > {}MiB", peak_mib, max));
            }
        }

        if let (Some(max), Some(used)) = (self.max_accelerator_mib, summary.accelerator_mem_mib) {
            if used > max {
                return Some(format!("accelerator memory {}MiB > {}MiB", used, max));
            }
        }

        if let Some(max) = self.max_batch_size {
            if state.batch_size >= max {
                return Some(format!("batch size {} reached limit {}", state.batch_size, max));
            }
        }

        None
    }
}

/// Round-robin files from a directory, stopped by a [`ThresholdPolicy`]
#[derive(Debug)]
pub struct DirectoryStrategy {
    files: Vec<PathBuf>,
    cursor: AtomicUsize,
    policy: ThresholdPolicy,
}

impl DirectoryStrategy {
    /// Regular files directly under `dir`, in name order. Fails when there are none.
    pub fn new(dir: impl AsRef<Path>, policy: ThresholdPolicy) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        if files.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no input files in {}", dir.display()),
            ));
        }
        files.sort();
        Ok(Self {
            files,
            cursor: AtomicUsize::new(0),
            policy,
        })
    }

    /// Input files in round-robin order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Limits applied after each iteration
    pub fn policy(&self) -> &ThresholdPolicy {
        &self.policy
    }
}

impl BenchmarkStrategy for DirectoryStrategy {
    type Payload = Vec<FilePart>;
    type Metadata = HitFiles;

    fn prepare_hit(&self, batch_size: u32) -> Result<(Vec<FilePart>, HitFiles), HitError> {
        let start = self.cursor.fetch_add(batch_size as usize, Ordering::Relaxed);
        let mut parts = Vec::with_capacity(batch_size as usize);
        let mut total_bytes = 0u64;

        for i in 0..batch_size as usize {
            let path = &self.files[(start + i) % self.files.len()];
            let bytes = std::fs::read(path)
                .map_err(|e| HitError::Prepare(format!("{}: {}", path.display(), e)))?;
            total_bytes += bytes.len() as u64;
            parts.push(FilePart {
                name: format!("input{}", i),
                file_name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("input{}", i)),
                bytes,
            });
        }

        let meta = HitFiles {
            file_count: parts.len(),
            total_bytes,
        };
        Ok((parts, meta))
    }

    fn should_continue<R>(
        &self,
        results: &[HitResult<R, HitFiles>],
        summary: &MonitorSummary,
        state: &BenchmarkState,
    ) -> bool {
        let hits = HitStats::from_results(results);
        match self.policy.exceeded(&hits, summary, state) {
            Some(limit) => {
                info!(iteration = state.iteration, batch_size = state.batch_size, %limit, "stopping");
                false
            }
            None => true,
        }
    }

    fn report_columns<R>(
        &self,
        results: &[HitResult<R, HitFiles>],
        _summary: &MonitorSummary,
        _state: &BenchmarkState,
    ) -> Vec<(String, String)> {
        let payloads: Vec<&HitFiles> = results.iter().filter_map(|r| r.metadata.as_ref()).collect();
        let mean_bytes = if payloads.is_empty() {
            String::new()
        } else {
            let total: u64 = payloads.iter().map(|m| m.total_bytes).sum();
            format!("{:.0}", total as f64 / payloads.len() as f64)
        };
        let files: usize = payloads.iter().map(|m| m.file_count).sum();
        vec![
            ("files_sent".to_string(), files.to_string()),
            ("payload_bytes_mean".to_string(), mean_bytes),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servebench_stats::MinMaxMean;

    fn input_dir(files: &[(&str, usize)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, len) in files {
            std::fs::write(dir.path().join(name), vec![b'x'; *len]).unwrap();
        }
        std::fs::create_dir(dir.path().join("subdir")).unwrap();
        dir
    }

    fn state(batch_size: u32) -> BenchmarkState {
        BenchmarkState {
            batch_size,
            hit_size: 2,
            iteration: 1,
        }
    }

    fn result(ok: bool, wait_ms: u64) -> HitResult<(), HitFiles> {
        HitResult {
            index: 0,
            outcome: if ok {
                Ok(())
            } else {
                Err(HitError::Transport("reset".to_string()))
            },
            metadata: Some(HitFiles {
                file_count: 2,
                total_bytes: 30,
            }),
            wait_time: Duration::from_millis(wait_ms),
        }
    }

    #[test]
    fn test_round_robin_files() {
        let dir = input_dir(&[("a.jpg", 10), ("b.jpg", 20), ("c.jpg", 30)]);
        let strategy = DirectoryStrategy::new(dir.path(), ThresholdPolicy::default()).unwrap();
        assert_eq!(strategy.files().len(), 3);

        let (parts, meta) = strategy.prepare_hit(2).unwrap();
        let names: Vec<_> = parts.iter().map(|p| p.file_name.as_str()).collect();
        assert_eq!(names, ["a.jpg", "b.jpg"]);
        assert_eq!(meta, HitFiles { file_count: 2, total_bytes: 30 });

        let (parts, meta) = strategy.prepare_hit(2).unwrap();
        let names: Vec<_> = parts.iter().map(|p| p.file_name.as_str()).collect();
        assert_eq!(names, ["c.jpg", "a.jpg"]);
        assert_eq!(meta.total_bytes, 40);
        assert_eq!(parts[1].name, "input1");
    }

    #[test]
    fn test_batch_larger_than_directory_wraps() {
        let dir = input_dir(&[("only.bin", 5)]);
        let strategy = DirectoryStrategy::new(dir.path(), ThresholdPolicy::default()).unwrap();
        let (parts, meta) = strategy.prepare_hit(4).unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(meta.total_bytes, 20);
    }

    #[test]
    fn test_empty_directory_rejected() {
        let dir = input_dir(&[]);
        let err = DirectoryStrategy::new(dir.path(), ThresholdPolicy::default()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_failure_ratio_limit() {
        let policy = ThresholdPolicy {
            max_failure_ratio: Some(0.0),
            ..ThresholdPolicy::default()
        };
        let ok = HitStats::from_results(&[result(true, 5), result(true, 7)]);
        let summary = MonitorSummary::default();
        assert!(policy.exceeded(&ok, &summary, &state(1)).is_none());

        let failed = HitStats::from_results(&[result(true, 5), result(false, 7)]);
        let limit = policy.exceeded(&failed, &summary, &state(1)).unwrap();
        assert!(limit.contains("failure ratio"));
    }

    #[test]
    fn test_wait_limits() {
        let policy = ThresholdPolicy {
            max_mean_wait: Some(Duration::from_millis(50)),
            ..ThresholdPolicy::default()
        };
        let summary = MonitorSummary::default();
        let fast = HitStats::from_results(&[result(true, 10), result(true, 20)]);
        assert!(policy.exceeded(&fast, &summary, &state(1)).is_none());
        let slow = HitStats::from_results(&[result(true, 80), result(true, 90)]);
        assert!(policy.exceeded(&slow, &summary, &state(1)).unwrap().contains("mean wait"));
    }

    #[test]
    fn test_resource_and_batch_limits() {
        let policy = ThresholdPolicy {
            max_ram_uss_mib: Some(100),
            max_accelerator_mib: Some(2000),
            max_batch_size: Some(9),
            ..ThresholdPolicy::default()
        };
        let hits = HitStats::from_results(&[result(true, 1)]);

        let mut summary = MonitorSummary {
            ram_uss_bytes: Some(AxisSummary::Observed(MinMaxMean {
                min: 1.0,
                max: 50.0 * 1024.0 * 1024.0,
                mean: 2.0,
            })),
            accelerator_mem_mib: Some(1500),
            ..MonitorSummary::default()
        };
        assert!(policy.exceeded(&hits, &summary, &state(5)).is_none());
        assert!(policy.exceeded(&hits, &summary, &state(9)).unwrap().contains("batch size"));

        summary.accelerator_mem_mib = Some(2048);
        assert!(policy.exceeded(&hits, &summary, &state(5)).unwrap().contains("accelerator"));

        summary.ram_uss_bytes = Some(AxisSummary::Observed(MinMaxMean {
            min: 1.0,
            max: 200.0 * 1024.0 * 1024.0,
            mean: 2.0,
        }));
        assert!(policy.exceeded(&hits, &summary, &state(5)).unwrap().contains("USS"));
    }

    #[test]
    fn test_should_continue_and_columns() {
        let dir = input_dir(&[("a", 1)]);
        let policy = ThresholdPolicy {
            max_batch_size: Some(3),
            ..ThresholdPolicy::default()
        };
        let strategy = DirectoryStrategy::new(dir.path(), policy).unwrap();
        let results = [result(true, 1), result(true, 2)];
        let summary = MonitorSummary::default();
        assert!(strategy.should_continue(&results, &summary, &state(1)));
        assert!(!strategy.should_continue(&results, &summary, &state(3)));

        let columns = strategy.report_columns(&results, &summary, &state(1));
        assert_eq!(
            columns,
            vec![
                ("files_sent".to_string(), "4".to_string()),
                ("payload_bytes_mean".to_string(), "30".to_string()),
            ]
        );
    }

    #[test]
    fn test_policy_from_config() {
        let config = PolicyConfig {
            max_mean_wait: Some("2s".to_string()),
            max_batch_size: Some(16),
            ..PolicyConfig::default()
        };
        let policy = ThresholdPolicy::from_config(&config).unwrap();
        assert_eq!(policy.max_mean_wait, Some(Duration::from_secs(2)));
        assert_eq!(policy.max_failure_ratio, Some(0.0));
        assert!(!policy.is_unbounded());
        assert!(ThresholdPolicy::default().is_unbounded());
    }
}
