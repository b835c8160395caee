#![warn(missing_docs)]
//! # servebench
//!
//! Benchmarks a TorchServe-style model server under growing load while
//! watching what the load costs.
//!
//! - **Adaptive loop**: register the model, fire `hit_size` concurrent hits
//!   per iteration with a growing batch size, stop when a policy says so,
//!   unregister exactly once
//! - **Resource sampling**: unique set size and CPU percent of the server
//!   process, sampled on a thread or in an isolated sidecar process
//! - **Accelerator telemetry**: per-process device memory from `nvidia-smi`
//!   (CSV or XML)
//! - **Reports**: append-only CSV, JSON run summaries, terminal tables
//!
//! ## Measuring a closure
//!
//! ```ignore
//! use servebench::{Monitor, MonitorOptions};
//!
//! let monitor = Monitor::new(MonitorOptions::default());
//! let measured = monitor.measure(Some(server_pid), || expensive_call())?;
//! println!("{:?}", measured.summary.ram_uss_bytes);
//! ```
//!
//! ## Custom strategies
//!
//! Implement [`BenchmarkStrategy`] to decide what each hit carries and when
//! to stop, then hand it to a [`BenchmarkController`] together with a
//! [`ServiceManager`] and an [`InferenceEndpoint`].

// Re-export the engine
pub use servebench_core::{
    AcceleratorQuery, AcceleratorRecord, AxisSummary, BenchmarkController, BenchmarkOutcome,
    BenchmarkPlan, BenchmarkState, BenchmarkStrategy, Categorized, ControllerError, ErrorCategory,
    HitDispatcher, HitError, HitResult, HitStats, InferenceEndpoint, IterationRecord, Monitor,
    MonitorError, MonitorOptions, MonitorSummary, NvidiaSmi, Phase, ProcessLauncher, QueryFormat,
    RecordFilter, Registration, RegistrationRequest, ReportRow, RowSink, SamplerError,
    ServiceError, ServiceManager, StopReason, SystemProbe, ThreadLauncher, UnregisterOutcome,
    Unregistration,
};

// Re-export reporting
pub use servebench_report::{
    CsvReportSink, ReportError, ReportMeta, RunReport, format_human_output, generate_json_report,
    write_json_report,
};

// Re-export stats
pub use servebench_stats::{SummaryStatistics, compute_summary};

// Re-export the built-in collaborators
pub use servebench_cli::{
    DirectoryStrategy, FilePart, InferenceClient, ManagementClient, ServebenchConfig,
    ThresholdPolicy,
};

/// Run the servebench CLI.
///
/// The `servebench` binary is just:
/// ```ignore
/// fn main() -> anyhow::Result<()> {
///     servebench::run()
/// }
/// ```
pub use servebench_cli::run;
