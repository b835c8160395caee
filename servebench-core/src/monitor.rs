//! Monitored Invocation
//!
//! [`Monitor::measure`] runs one closure while a sampler watches the target
//! process, then folds everything it learned into a [`MonitorSummary`]:
//!
//! ```text
//!   launch sampler ─▶ wait_ready ─▶ t0 ─▶ op() ─▶ t1 ─▶ stop sampler
//!                                                         │
//!                              accelerator query ◀────────┘
//!                                      │
//!                                      ▼
//!                                  aggregate
//! ```
//!
//! The sampler handle is owned by the stack frame of the measurement, so it
//! is terminated on every exit path: normal return, an `Err` from the
//! operation, or a panic unwinding through it.

use crate::accelerator::{AcceleratorQuery, NvidiaSmi, TelemetryError};
use crate::error::{Categorized, ErrorCategory};
use crate::sampler::{SampleSeries, SamplerError, SamplerLauncher, ThreadLauncher};
use serde::{Deserialize, Serialize};
use servebench_ipc::{ProcessSample, SidecarConfig};
use servebench_stats::{MinMaxMean, min_max_mean};
use std::convert::Infallible;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by the monitoring machinery itself
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Invalid monitor options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("Malformed sample #{index}: {message}")]
    MalformedSample { index: usize, message: String },
}

impl Categorized for MonitorError {
    fn category(&self) -> ErrorCategory {
        match self {
            MonitorError::InvalidOptions(_) => ErrorCategory::Setup,
            MonitorError::Sampler(e) => e.category(),
            MonitorError::Telemetry(e) => e.category(),
            MonitorError::MalformedSample { .. } => ErrorCategory::Aggregation,
        }
    }
}

/// Either the monitor failed or the measured operation did
#[derive(Debug, Error)]
pub enum MeasureError<E> {
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("Measured operation failed: {0}")]
    Operation(E),
}

/// Which axes to measure and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorOptions {
    /// Wall-clock time of the operation
    pub timer: bool,
    /// Unique set size of the target
    pub ram: bool,
    /// CPU percent of the target
    pub cpu: bool,
    /// Accelerator memory held by the target
    pub accelerator: bool,
    /// Keep the raw ram/cpu series in the summary
    pub keep_samples: bool,
    /// Pause between two samples
    pub sample_interval: Duration,
    /// How long to wait for the sampler's first sample
    pub ready_timeout: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            timer: true,
            ram: true,
            cpu: true,
            accelerator: false,
            keep_samples: false,
            sample_interval: Duration::from_millis(20),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

impl MonitorOptions {
    /// Only the wall-clock timer
    pub fn timer_only() -> Self {
        Self {
            ram: false,
            cpu: false,
            ..Self::default()
        }
    }

    /// Whether a sampler is needed
    pub fn needs_sampler(&self) -> bool {
        self.ram || self.cpu
    }

    /// Whether any axis requires a target process
    pub fn needs_target(&self) -> bool {
        self.ram || self.cpu || self.accelerator
    }

    /// Check the options on their own and against the target they will be
    /// used with.
    pub fn validate(&self, target_pid: Option<u32>) -> Result<(), MonitorError> {
        if self.needs_sampler() && self.ready_timeout.is_zero() {
            return Err(MonitorError::InvalidOptions(
                "ready_timeout must be greater than zero".to_string(),
            ));
        }
        if self.needs_sampler() && self.sample_interval.is_zero() {
            return Err(MonitorError::InvalidOptions(
                "sample_interval must be greater than zero".to_string(),
            ));
        }
        if self.needs_target() {
            match target_pid {
                None => {
                    return Err(MonitorError::InvalidOptions(
                        "ram, cpu and accelerator tracking require a target pid".to_string(),
                    ));
                }
                Some(0) => {
                    return Err(MonitorError::InvalidOptions("target pid must be > 0".to_string()));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Reduction of one sampled axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AxisSummary {
    /// The axis was tracked but not a single sample arrived
    NoData,
    /// Envelope and mean of the samples
    Observed(MinMaxMean),
}

impl AxisSummary {
    /// The reduction, if there was data
    pub fn observed(&self) -> Option<&MinMaxMean> {
        match self {
            AxisSummary::NoData => None,
            AxisSummary::Observed(m) => Some(m),
        }
    }
}

/// Raw sampler output kept when `keep_samples` is on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSeries {
    pub ram_uss_bytes: Vec<u64>,
    pub cpu_percent: Vec<f64>,
}

/// What one measured run cost. Disabled axes are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorSummary {
    pub elapsed_ms: Option<f64>,
    pub ram_uss_bytes: Option<AxisSummary>,
    pub cpu_percent: Option<AxisSummary>,
    pub accelerator_mem_mib: Option<u64>,
    /// Samples collected by the sampler (0 when no sampler ran)
    pub sample_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawSeries>,
    /// Set when the target exited while being sampled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampler_interruption: Option<String>,
}

/// Value returned by the operation plus its cost
#[derive(Debug, Clone)]
pub struct Measured<T> {
    pub value: T,
    pub summary: MonitorSummary,
}

/// Runs operations under observation
pub struct Monitor {
    options: MonitorOptions,
    launcher: Box<dyn SamplerLauncher>,
    accelerator: Box<dyn AcceleratorQuery>,
}

impl Monitor {
    /// Thread-isolated sampling and the default `nvidia-smi` query
    pub fn new(options: MonitorOptions) -> Self {
        Self {
            options,
            launcher: Box::new(ThreadLauncher),
            accelerator: Box::new(NvidiaSmi::default()),
        }
    }

    /// Replace the sampler launcher
    pub fn with_launcher(mut self, launcher: impl SamplerLauncher + 'static) -> Self {
        self.launcher = Box::new(launcher);
        self
    }

    /// Replace the accelerator query
    pub fn with_accelerator(mut self, accelerator: impl AcceleratorQuery + 'static) -> Self {
        self.accelerator = Box::new(accelerator);
        self
    }

    pub fn options(&self) -> &MonitorOptions {
        &self.options
    }

    /// Measure an infallible operation.
    pub fn measure<T, F>(&self, target_pid: Option<u32>, op: F) -> Result<Measured<T>, MonitorError>
    where
        F: FnOnce() -> T,
    {
        self.try_measure(target_pid, || Ok::<T, Infallible>(op()))
            .map_err(|e| match e {
                MeasureError::Monitor(e) => e,
                MeasureError::Operation(never) => match never {},
            })
    }

    /// Measure a fallible operation.
    ///
    /// On `Err` from `op` the sampler is still stopped and the error is
    /// returned as [`MeasureError::Operation`]; no summary is produced.
    pub fn try_measure<T, E, F>(
        &self,
        target_pid: Option<u32>,
        op: F,
    ) -> Result<Measured<T>, MeasureError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let options = &self.options;
        options.validate(target_pid)?;

        let sampler = match (options.needs_sampler(), target_pid) {
            (true, Some(pid)) => {
                let config = SidecarConfig {
                    target_pid: pid,
                    interval_ns: options.sample_interval.as_nanos() as u64,
                    track_ram: options.ram,
                    track_cpu: options.cpu,
                };
                let mut handle = self.launcher.launch(config).map_err(MonitorError::from)?;
                handle
                    .wait_ready(options.ready_timeout)
                    .map_err(MonitorError::from)?;
                Some(handle)
            }
            _ => None,
        };

        let start = Instant::now();
        let result = op();
        let elapsed = start.elapsed();

        let series = match sampler.map(|s| s.stop()).transpose() {
            Ok(series) => series,
            Err(e) => {
                // The operation's own failure takes precedence.
                if let Err(op_err) = result {
                    warn!(error = %e, "sampler failed to stop after operation error");
                    return Err(MeasureError::Operation(op_err));
                }
                return Err(MonitorError::from(e).into());
            }
        };

        let value = result.map_err(MeasureError::Operation)?;

        let accelerator_mem_mib = match (options.accelerator, target_pid) {
            (true, Some(pid)) => Some(
                self.accelerator
                    .memory_for_pid(pid)
                    .map_err(MonitorError::from)?,
            ),
            _ => None,
        };

        let summary = aggregate(options, series.as_ref(), elapsed, accelerator_mem_mib)?;
        debug!(
            elapsed_ms = ?summary.elapsed_ms,
            samples = summary.sample_count,
            "measurement complete"
        );
        Ok(Measured { value, summary })
    }
}

/// Fold sampler output and timings into a summary.
///
/// A tracked axis with no samples reports [`AxisSummary::NoData`].
pub fn aggregate(
    options: &MonitorOptions,
    series: Option<&SampleSeries>,
    elapsed: Duration,
    accelerator_mem_mib: Option<u64>,
) -> Result<MonitorSummary, MonitorError> {
    let samples: &[ProcessSample] = series.map(|s| s.samples()).unwrap_or(&[]);

    if let Some((index, sample)) = samples
        .iter()
        .enumerate()
        .find(|(_, s)| !s.cpu_percent.is_finite() || s.cpu_percent < 0.0)
    {
        return Err(MonitorError::MalformedSample {
            index,
            message: format!("cpu_percent = {}", sample.cpu_percent),
        });
    }

    let reduce = |values: Vec<f64>| match min_max_mean(values) {
        Some(m) => AxisSummary::Observed(m),
        None => AxisSummary::NoData,
    };

    let ram_uss_bytes = options
        .ram
        .then(|| reduce(samples.iter().map(|s| s.ram_uss_bytes as f64).collect()));
    let cpu_percent = options
        .cpu
        .then(|| reduce(samples.iter().map(|s| s.cpu_percent).collect()));

    let raw = (options.keep_samples && options.needs_sampler()).then(|| RawSeries {
        ram_uss_bytes: samples.iter().map(|s| s.ram_uss_bytes).collect(),
        cpu_percent: samples.iter().map(|s| s.cpu_percent).collect(),
    });

    Ok(MonitorSummary {
        elapsed_ms: options.timer.then(|| elapsed.as_secs_f64() * 1000.0),
        ram_uss_bytes,
        cpu_percent,
        accelerator_mem_mib,
        sample_count: samples.len(),
        raw,
        sampler_interruption: series.and_then(|s| s.interruption().map(str::to_string)),
    })
}
