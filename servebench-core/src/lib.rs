//! servebench Core - Measurement Engine
//!
//! Everything needed to benchmark a model server under growing load while
//! watching what it costs:
//! - `ProcessProbe` / `SystemProbe` for per-process USS and CPU
//! - a sampler sidecar on a thread or in a separate process
//! - `nvidia-smi` telemetry parsing and pid matching
//! - `Monitor::measure`, which wraps any closure in a sampled run
//! - `HitDispatcher` for concurrent hits
//! - `BenchmarkController`, the register / iterate / unregister loop

mod accelerator;
mod controller;
mod dispatch;
mod error;
mod monitor;
mod probe;
mod record;
mod sampler;
mod sidecar;
mod worker;

pub use accelerator::{
    AcceleratorQuery, AcceleratorRecord, CSV_QUERY_FIELDS, NvidiaSmi, QueryFormat, RecordFilter,
    TelemetryError, filter_records, parse_csv, parse_memory_mib, parse_xml, select_single,
};
pub use controller::{
    BenchmarkController, BenchmarkOutcome, BenchmarkPlan, BenchmarkState, BenchmarkStrategy,
    ControllerError, InferenceEndpoint, Phase, Registration, RegistrationRequest, ServiceError,
    ServiceManager, StopReason, UnregisterOutcome, Unregistration,
};
pub use dispatch::{DispatchError, FnHit, HitDispatcher, HitError, HitFactory, HitResult, panic_message};
pub use error::{Categorized, ErrorCategory};
pub use monitor::{
    AxisSummary, MeasureError, Measured, Monitor, MonitorError, MonitorOptions, MonitorSummary,
    RawSeries, aggregate,
};
#[cfg(target_os = "linux")]
pub use probe::read_uss_bytes;
pub use probe::{ProbeError, ProbeReading, ProcessProbe, SystemProbe, parse_private_kb};
pub use record::{HitStats, IterationRecord, ReportRow, RowSink};
pub use sampler::{
    ProcessLauncher, SampleSeries, SamplerError, SamplerHandle, SamplerLauncher, ThreadLauncher,
};
pub use worker::{SidecarMain, shutdown_requested};
