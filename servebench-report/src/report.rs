//! Report Data Structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use servebench_core::{
    BenchmarkOutcome, BenchmarkPlan, IterationRecord, MonitorOptions, Phase, Registration,
    StopReason, UnregisterOutcome,
};

/// Bumped whenever the JSON layout changes incompatibly
pub const SCHEMA_VERSION: u32 = 1;

/// Complete record of one benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// When, where, and for which model
    pub meta: ReportMeta,
    /// Plan the run followed
    pub plan: BenchmarkPlan,
    /// Telemetry axes in effect
    pub monitor: MonitorOptions,
    /// How registration went
    pub registration: Registration,
    /// Completed iterations, in order
    pub iterations: Vec<IterationRecord>,
    /// Why iteration ended
    pub stop: StopReason,
    /// The single unregistration attempt
    pub unregistration: UnregisterOutcome,
    /// `Done` or `Failed`
    pub final_phase: Phase,
}

impl RunReport {
    /// Assemble a report from a finished run
    pub fn new(
        meta: ReportMeta,
        plan: BenchmarkPlan,
        monitor: MonitorOptions,
        outcome: BenchmarkOutcome,
    ) -> Self {
        Self {
            meta,
            plan,
            monitor,
            registration: outcome.registration,
            iterations: outcome.iterations,
            stop: outcome.stop,
            unregistration: outcome.unregistration,
            final_phase: outcome.final_phase,
        }
    }

    /// Largest batch size that completed an iteration
    pub fn max_completed_batch_size(&self) -> Option<u32> {
        self.iterations.iter().map(|r| r.state.batch_size).max()
    }
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMeta {
    /// [`SCHEMA_VERSION`] at write time
    pub schema_version: u32,
    /// servebench version
    pub version: String,
    /// Report creation time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Benchmarked model
    pub model_name: String,
    /// Host details
    pub system: SystemInfo,
}

impl ReportMeta {
    /// Metadata stamped with the current time
    pub fn now(model_name: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            model_name: model_name.into(),
            system: SystemInfo::collect(),
        }
    }
}

/// Host the benchmark ran on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Operating system
    pub os: String,
    /// CPU architecture
    pub arch: String,
    /// CPU model name
    pub cpu: String,
    /// Logical cores
    pub cpu_cores: u32,
    /// Total memory in GB
    pub memory_gb: f64,
}

impl SystemInfo {
    /// Collect host details. Linux-only fields degrade to "Unknown" / 0.
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu: cpu_model().unwrap_or_else(|| "Unknown".to_string()),
            cpu_cores: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            memory_gb: memory_gb().unwrap_or(0.0),
        }
    }
}

fn cpu_model() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/cpuinfo").ok().and_then(|content| {
            content
                .lines()
                .find(|l| l.starts_with("model name"))
                .and_then(|l| l.split(':').nth(1))
                .map(|s| s.trim().to_string())
        })
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

fn memory_gb() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/meminfo").ok().and_then(|content| {
            content
                .lines()
                .find(|l| l.starts_with("MemTotal"))
                .and_then(|l| l.split_whitespace().nth(1).and_then(|s| s.parse::<u64>().ok()))
                .map(|kb| kb as f64 / 1024.0 / 1024.0)
        })
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
