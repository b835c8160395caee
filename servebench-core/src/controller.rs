//! Adaptive Benchmark Controller
//!
//! Drives one benchmark run against a model server:
//!
//! ```text
//!  Idle ──register──▶ Registered ──▶ Iterating ──▶ Unregistering ──▶ Done
//!    │                                  │  ▲                     └──▶ Failed
//!    │                                  └──┘ batch_size += increment
//!    └──registration failed──▶ Failed
//! ```
//!
//! Every iteration dispatches `hit_size` hits of the current batch size
//! inside one monitored invocation and asks the strategy whether to go on.
//! Once the service is registered, unregistration is attempted exactly
//! once, however iteration ended.

use crate::dispatch::{DispatchError, HitDispatcher, HitError, HitFactory, HitResult, panic_message};
use crate::error::{Categorized, ErrorCategory};
use crate::monitor::{MeasureError, Monitor, MonitorError, MonitorSummary};
use crate::record::{HitStats, IterationRecord, ReportRow, RowSink};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failures of the model-server management API
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("Service unreachable: {0}")]
    Unreachable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{operation} returned unexpected status {status}: {body}")]
    UnexpectedStatus {
        operation: String,
        status: u16,
        body: String,
    },
}

impl Categorized for ServiceError {
    fn category(&self) -> ErrorCategory {
        match self {
            ServiceError::Unreachable(_) => ErrorCategory::Setup,
            ServiceError::Transport(_) | ServiceError::UnexpectedStatus { .. } => {
                ErrorCategory::Collaborator
            }
        }
    }
}

/// Errors that end a run
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Invalid benchmark plan: {0}")]
    InvalidPlan(String),

    #[error("Service is not running: {0}")]
    ServiceUnavailable(String),

    #[error("Registration failed: {0}")]
    Registration(ServiceError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Measured operation panicked: {message}")]
    OperationPanicked { message: String },

    #[error("Stopping policy panicked: {message}")]
    PolicyPanicked { message: String },

    #[error("Failed to write report row: {0}")]
    Report(String),
}

impl Categorized for ControllerError {
    fn category(&self) -> ErrorCategory {
        match self {
            ControllerError::InvalidPlan(_) | ControllerError::ServiceUnavailable(_) => {
                ErrorCategory::Setup
            }
            ControllerError::Registration(e) => e.category(),
            ControllerError::Monitor(e) => e.category(),
            ControllerError::Dispatch(e) => e.category(),
            ControllerError::OperationPanicked { .. }
            | ControllerError::PolicyPanicked { .. }
            | ControllerError::Report(_) => ErrorCategory::Collaborator,
        }
    }
}

/// Parameters of a model registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub model_name: String,
    /// Archive location passed as `url=`
    pub archive: String,
    /// Server-side batch size
    pub batch_size: u32,
    pub max_batch_delay_ms: u64,
    pub initial_workers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    Created,
    AlreadyRegistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unregistration {
    Removed,
    NotRegistered,
}

/// Model-server management API
pub trait ServiceManager: Sync {
    /// Both the inference and the management API answer
    fn is_running(&self) -> Result<bool, ServiceError>;

    /// Register a model. "Already registered" is success.
    fn register(&self, request: &RegistrationRequest) -> Result<Registration, ServiceError>;

    /// Remove a model. "Not registered" is success.
    fn unregister(&self, model_name: &str) -> Result<Unregistration, ServiceError>;
}

/// Model-server inference API
pub trait InferenceEndpoint: Sync {
    type Payload;
    type Response: Send;

    fn predict(&self, payload: Self::Payload) -> Result<Self::Response, HitError>;
}

/// Caller-supplied hit construction and stopping policy
pub trait BenchmarkStrategy: Sync {
    type Payload;
    type Metadata: Send;

    /// Build one hit for the current batch size
    fn prepare_hit(&self, batch_size: u32) -> Result<(Self::Payload, Self::Metadata), HitError>;

    /// Decide whether the next, larger batch size should run
    fn should_continue<R>(
        &self,
        results: &[HitResult<R, Self::Metadata>],
        summary: &MonitorSummary,
        state: &BenchmarkState,
    ) -> bool;

    /// Extra report columns for this iteration
    fn report_columns<R>(
        &self,
        _results: &[HitResult<R, Self::Metadata>],
        _summary: &MonitorSummary,
        _state: &BenchmarkState,
    ) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Fixed parameters of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkPlan {
    pub model_name: String,
    pub archive: String,
    pub initial_workers: u32,
    pub max_batch_delay_ms: u64,
    /// Hits per iteration; also the server-side batch size
    pub hit_size: u32,
    pub starting_batch_size: u32,
    pub batch_size_increment: u32,
    /// Safety cap on the number of iterations
    pub max_iterations: Option<u32>,
    /// Process to monitor (the model server)
    pub target_pid: Option<u32>,
    /// Bound on concurrently running hits
    pub max_concurrency: Option<usize>,
    /// Pause after registering and unregistering
    #[serde(with = "duration_ms")]
    pub settle_time: Duration,
}

impl BenchmarkPlan {
    pub fn new(model_name: impl Into<String>) -> Self {
        let model_name = model_name.into();
        Self {
            archive: format!("{}.mar", model_name),
            model_name,
            initial_workers: 1,
            max_batch_delay_ms: 100,
            hit_size: 1,
            starting_batch_size: 1,
            batch_size_increment: 1,
            max_iterations: None,
            target_pid: None,
            max_concurrency: None,
            settle_time: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.model_name.trim().is_empty() {
            return Err(ControllerError::InvalidPlan("model_name must not be empty".to_string()));
        }
        if self.hit_size == 0 {
            return Err(ControllerError::InvalidPlan("hit_size must be > 0".to_string()));
        }
        if self.starting_batch_size == 0 {
            return Err(ControllerError::InvalidPlan(
                "starting_batch_size must be > 0".to_string(),
            ));
        }
        if self.batch_size_increment == 0 {
            return Err(ControllerError::InvalidPlan(
                "batch_size_increment must be > 0".to_string(),
            ));
        }
        if self.max_iterations == Some(0) {
            return Err(ControllerError::InvalidPlan("max_iterations must be > 0".to_string()));
        }
        if self.max_concurrency == Some(0) {
            return Err(ControllerError::InvalidPlan("max_concurrency must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn registration_request(&self) -> RegistrationRequest {
        RegistrationRequest {
            model_name: self.model_name.clone(),
            archive: self.archive.clone(),
            batch_size: self.hit_size,
            max_batch_delay_ms: self.max_batch_delay_ms,
            initial_workers: self.initial_workers,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Where the loop is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkState {
    pub batch_size: u32,
    pub hit_size: u32,
    /// 1-based
    pub iteration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Registered,
    Iterating,
    Unregistering,
    Done,
    Failed,
}

/// Why iteration ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The strategy declined to continue
    Policy,
    /// `max_iterations` was reached
    IterationLimit,
    /// An iteration failed
    Error {
        category: ErrorCategory,
        message: String,
    },
}

/// Result of the single unregistration attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnregisterOutcome {
    Removed,
    NotRegistered,
    Failed { message: String },
}

impl From<Result<Unregistration, ServiceError>> for UnregisterOutcome {
    fn from(result: Result<Unregistration, ServiceError>) -> Self {
        match result {
            Ok(Unregistration::Removed) => UnregisterOutcome::Removed,
            Ok(Unregistration::NotRegistered) => UnregisterOutcome::NotRegistered,
            Err(e) => UnregisterOutcome::Failed {
                message: e.to_string(),
            },
        }
    }
}

/// Everything a finished run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkOutcome {
    pub registration: Registration,
    pub iterations: Vec<IterationRecord>,
    pub stop: StopReason,
    pub unregistration: UnregisterOutcome,
    pub final_phase: Phase,
}

impl BenchmarkOutcome {
    /// Total hits across all completed iterations
    pub fn total_hits(&self) -> usize {
        self.iterations.iter().map(|r| r.hits.total).sum()
    }
}

/// Hits of one iteration: the strategy prepares, the endpoint sends.
struct IterationHits<'a, E, S> {
    endpoint: &'a E,
    strategy: &'a S,
    batch_size: u32,
}

impl<E, S> HitFactory for IterationHits<'_, E, S>
where
    E: InferenceEndpoint,
    S: BenchmarkStrategy<Payload = E::Payload>,
{
    type Payload = E::Payload;
    type Response = E::Response;
    type Metadata = S::Metadata;

    fn prepare(&self, _index: usize) -> Result<(Self::Payload, Self::Metadata), HitError> {
        self.strategy.prepare_hit(self.batch_size)
    }

    fn send(&self, payload: Self::Payload) -> Result<Self::Response, HitError> {
        self.endpoint.predict(payload)
    }
}

/// The adaptive loop
pub struct BenchmarkController<'a, M, E, S> {
    plan: BenchmarkPlan,
    manager: &'a M,
    endpoint: &'a E,
    strategy: &'a S,
    monitor: &'a Monitor,
    sink: Option<&'a mut dyn RowSink>,
    progress: ProgressBar,
    phase: Phase,
}

impl<'a, M, E, S> BenchmarkController<'a, M, E, S>
where
    M: ServiceManager,
    E: InferenceEndpoint,
    S: BenchmarkStrategy<Payload = E::Payload>,
{
    pub fn new(
        plan: BenchmarkPlan,
        manager: &'a M,
        endpoint: &'a E,
        strategy: &'a S,
        monitor: &'a Monitor,
    ) -> Self {
        Self {
            plan,
            manager,
            endpoint,
            strategy,
            monitor,
            sink: None,
            progress: ProgressBar::hidden(),
            phase: Phase::Idle,
        }
    }

    /// Write one row per completed iteration to `sink`
    pub fn with_sink(mut self, sink: &'a mut dyn RowSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Show a terminal spinner while iterating
    pub fn with_progress(mut self, enabled: bool) -> Self {
        if enabled {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            self.progress = pb;
        }
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn transition(&mut self, next: Phase) {
        debug!(from = ?self.phase, to = ?next, "phase change");
        self.phase = next;
    }

    /// Run the whole benchmark.
    ///
    /// Returns `Err` only when nothing was registered: an invalid plan, an
    /// unreachable service, or a failed registration. Failures after
    /// registration end iteration, are recorded in
    /// [`BenchmarkOutcome::stop`], and still lead to unregistration.
    pub fn run(mut self) -> Result<BenchmarkOutcome, ControllerError> {
        self.plan.validate()?;
        self.monitor.options().validate(self.plan.target_pid)?;

        match self.manager.is_running() {
            Ok(true) => {}
            Ok(false) => {
                self.transition(Phase::Failed);
                return Err(ControllerError::ServiceUnavailable(
                    "health checks did not return 200".to_string(),
                ));
            }
            Err(e) => {
                self.transition(Phase::Failed);
                return Err(ControllerError::ServiceUnavailable(e.to_string()));
            }
        }

        let request = self.plan.registration_request();
        let registration = match self.manager.register(&request) {
            Ok(r) => r,
            Err(e) => {
                self.transition(Phase::Failed);
                return Err(ControllerError::Registration(e));
            }
        };
        info!(model = %self.plan.model_name, ?registration, "model registered");
        self.transition(Phase::Registered);
        self.settle();

        self.transition(Phase::Iterating);
        let (iterations, stop) = self.iterate();

        self.transition(Phase::Unregistering);
        let unregistration = UnregisterOutcome::from(self.manager.unregister(&self.plan.model_name));
        match &unregistration {
            UnregisterOutcome::Failed { message } => {
                warn!(model = %self.plan.model_name, %message, "unregistration failed")
            }
            other => info!(model = %self.plan.model_name, outcome = ?other, "model unregistered"),
        }
        self.settle();

        let final_phase = match stop {
            StopReason::Error { .. } => Phase::Failed,
            StopReason::Policy | StopReason::IterationLimit => Phase::Done,
        };
        self.transition(final_phase);
        self.progress.finish_and_clear();

        Ok(BenchmarkOutcome {
            registration,
            iterations,
            stop,
            unregistration,
            final_phase,
        })
    }

    fn settle(&self) {
        if !self.plan.settle_time.is_zero() {
            std::thread::sleep(self.plan.settle_time);
        }
    }

    fn iterate(&mut self) -> (Vec<IterationRecord>, StopReason) {
        let mut records = Vec::new();
        let mut state = BenchmarkState {
            batch_size: self.plan.starting_batch_size,
            hit_size: self.plan.hit_size,
            iteration: 1,
        };

        loop {
            self.progress.set_message(format!(
                "iteration {} | batch_size {} | hit_size {}",
                state.iteration, state.batch_size, state.hit_size
            ));

            let (record, proceed) = match self.run_iteration(&state) {
                Ok(done) => done,
                Err(e) => {
                    warn!(iteration = state.iteration, error = %e, "iteration failed");
                    return (
                        records,
                        StopReason::Error {
                            category: e.category(),
                            message: e.to_string(),
                        },
                    );
                }
            };

            info!(
                iteration = state.iteration,
                batch_size = state.batch_size,
                hits_ok = record.hits.succeeded,
                hits_failed = record.hits.failed,
                elapsed_ms = ?record.summary.elapsed_ms,
                "iteration complete"
            );

            if let Some(sink) = self.sink.as_deref_mut() {
                if let Err(e) = sink.write_row(&ReportRow::from_record(&record)) {
                    let err = ControllerError::Report(e.to_string());
                    records.push(record);
                    return (
                        records,
                        StopReason::Error {
                            category: err.category(),
                            message: err.to_string(),
                        },
                    );
                }
            }
            records.push(record);

            if !proceed {
                return (records, StopReason::Policy);
            }
            if self.plan.max_iterations.is_some_and(|max| state.iteration >= max) {
                return (records, StopReason::IterationLimit);
            }

            state.iteration += 1;
            state.batch_size = state.batch_size.saturating_add(self.plan.batch_size_increment);
        }
    }

    /// One monitored dispatch plus the policy decision.
    fn run_iteration(&self, state: &BenchmarkState) -> Result<(IterationRecord, bool), ControllerError> {
        let factory = IterationHits {
            endpoint: self.endpoint,
            strategy: self.strategy,
            batch_size: state.batch_size,
        };
        let hit_count = state.hit_size as usize;
        let dispatcher = HitDispatcher::new(self.plan.max_concurrency);
        let monitor = self.monitor;
        let target_pid = self.plan.target_pid;
        let strategy = self.strategy;

        // Unwinding out of `try_measure` drops its sampler handle, which
        // terminates the sampler before the panic reaches this point.
        let measured = catch_unwind(AssertUnwindSafe(|| {
            monitor.try_measure(target_pid, || dispatcher.dispatch_all(hit_count, &factory))
        }))
        .map_err(|panic| ControllerError::OperationPanicked {
            message: panic_message(panic.as_ref()),
        })?
        .map_err(|e| match e {
            MeasureError::Monitor(e) => ControllerError::Monitor(e),
            MeasureError::Operation(e) => ControllerError::Dispatch(e),
        })?;

        let results = measured.value;
        let summary = measured.summary;
        let (proceed, extra_columns) = catch_unwind(AssertUnwindSafe(|| {
            (
                strategy.should_continue(&results, &summary, state),
                strategy.report_columns(&results, &summary, state),
            )
        }))
        .map_err(|panic| ControllerError::PolicyPanicked {
            message: panic_message(panic.as_ref()),
        })?;

        Ok((
            IterationRecord {
                state: *state,
                summary,
                hits: HitStats::from_results(&results),
                extra_columns,
            },
            proceed,
        ))
    }
}
