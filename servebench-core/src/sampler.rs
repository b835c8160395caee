//! Process Metrics Sampler
//!
//! A sidecar execution context that repeatedly probes a target process and
//! streams the readings back over a channel:
//!
//! ```text
//!   probe ok ─▶ Sample ─▶ Started ─▶ Sample ─▶ Sample … ─▶ (Stop) ─▶ Stopped
//!   probe err ─▶ Failure
//! ```
//!
//! `Started` is emitted after the first `Sample` is queued, so a controller
//! that has observed readiness always holds at least one sample. The
//! controller always terminates the sampler, either through
//! [`SamplerHandle::stop`] or by dropping the handle.
//!
//! One exception: when the target exits mid-run there is nothing left to
//! observe, so the loop sends `Failure` and returns without waiting for
//! `Stop`. The handle records that as an interruption of the series
//! ([`SampleSeries::interruption`]) and the later `stop` still reaps the
//! thread or process.
//!
//! Two isolation levels share this protocol: a dedicated thread (this
//! module) and a separate process speaking rkyv frames (see
//! [`crate::sidecar`]).

use crate::error::{Categorized, ErrorCategory};
use crate::probe::{ProbeError, ProcessProbe, SystemProbe};
use crate::sidecar::SidecarProcess;
use servebench_ipc::{FailureKind, ProcessSample, SamplerMessage, SidecarConfig};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from starting, observing, or stopping a sampler
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("Sampler could not observe process {pid}: {message}")]
    Setup {
        pid: u32,
        kind: FailureKind,
        message: String,
    },

    #[error("Sampler did not signal readiness within {0:?}")]
    ReadyTimeout(Duration),

    #[error("Failed to spawn sampler: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Sampler IPC error: {0}")]
    Ipc(String),

    #[error("Sampler exited unexpectedly: {0}")]
    Exited(String),

    #[error("Sampler protocol error: expected {expected}, got {got}")]
    Protocol { expected: String, got: String },

    #[error("Invalid sampler configuration: {0}")]
    InvalidConfig(String),
}

impl Categorized for SamplerError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Setup
    }
}

impl From<servebench_ipc::FrameError> for SamplerError {
    fn from(e: servebench_ipc::FrameError) -> Self {
        SamplerError::Ipc(e.to_string())
    }
}

/// The samples of one monitored run, in insertion order.
///
/// Only ever handed out after the sampler has stopped, so there is no
/// concurrent writer.
#[derive(Debug, Clone, Default)]
pub struct SampleSeries {
    samples: Vec<ProcessSample>,
    interruption: Option<String>,
}

impl SampleSeries {
    #[cfg(test)]
    pub(crate) fn from_samples(samples: Vec<ProcessSample>) -> Self {
        Self {
            samples,
            interruption: None,
        }
    }

    /// Samples in the order the sampler recorded them
    pub fn samples(&self) -> &[ProcessSample] {
        &self.samples
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample was recorded
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// USS column
    pub fn ram_uss_bytes(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().map(|s| s.ram_uss_bytes)
    }

    /// CPU column
    pub fn cpu_percent(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.cpu_percent)
    }

    /// Why sampling ended before it was stopped, if it did
    pub fn interruption(&self) -> Option<&str> {
        self.interruption.as_deref()
    }
}

/// Waits between samples; returns `true` once a stop has been requested.
pub(crate) trait StopSignal {
    fn wait(&mut self, interval: Duration) -> bool;
}

impl StopSignal for Receiver<()> {
    fn wait(&mut self, interval: Duration) -> bool {
        match self.recv_timeout(interval) {
            Ok(()) => true,
            // Parent handle dropped without a message: treat as stop.
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

fn failure_kind(e: &ProbeError) -> FailureKind {
    match e {
        ProbeError::ProcessNotFound(_) => FailureKind::ProcessNotFound,
        ProbeError::AccessDenied { .. } => FailureKind::AccessDenied,
        ProbeError::Malformed { .. } => FailureKind::Probe,
    }
}

/// Run the sampling protocol until `stop` fires or the target disappears.
///
/// `emit` returns `false` when the receiving side is gone, which also ends
/// the loop. Returns the number of samples emitted.
pub(crate) fn sampling_loop<P, S, E>(
    probe: &mut P,
    config: &SidecarConfig,
    stop: &mut S,
    mut emit: E,
) -> u64
where
    P: ProcessProbe + ?Sized,
    S: StopSignal + ?Sized,
    E: FnMut(SamplerMessage) -> bool,
{
    let clock = Instant::now();
    let interval = Duration::from_nanos(config.interval_ns);
    let mut taken = 0u64;

    loop {
        match probe.read(config.target_pid, config.track_ram, config.track_cpu) {
            Ok(reading) => {
                let sample = ProcessSample::new(
                    reading.ram_uss_bytes,
                    reading.cpu_percent,
                    clock.elapsed().as_nanos() as u64,
                );
                if !emit(SamplerMessage::Sample(sample)) {
                    return taken;
                }
                taken += 1;
                if taken == 1 && !emit(SamplerMessage::Started) {
                    return taken;
                }
            }
            Err(e) => {
                // Before the first sample this is a setup failure; afterwards
                // the target exited mid-run and the series is simply shorter.
                let _ = emit(SamplerMessage::Failure {
                    kind: failure_kind(&e),
                    message: e.to_string(),
                });
                return taken;
            }
        }

        if stop.wait(interval) {
            break;
        }
    }

    let _ = emit(SamplerMessage::Stopped {
        samples_taken: taken,
    });
    taken
}

enum Backend {
    Thread {
        stop_tx: Option<Sender<()>>,
        join: Option<JoinHandle<()>>,
    },
    Process(SidecarProcess),
}

/// Controller-side handle to a running sampler.
///
/// Dropping the handle terminates the sampler; this is what keeps a panic
/// in a measured operation from leaking the sidecar.
pub struct SamplerHandle {
    backend: Backend,
    events: Receiver<SamplerMessage>,
    config: SidecarConfig,
    samples: Vec<ProcessSample>,
    interruption: Option<String>,
    ready: bool,
    finished: bool,
}

impl SamplerHandle {
    /// Start a sampler on a dedicated thread using `probe`.
    pub fn spawn_thread<P>(probe: P, config: SidecarConfig) -> Result<Self, SamplerError>
    where
        P: ProcessProbe + 'static,
    {
        config.validate().map_err(SamplerError::InvalidConfig)?;

        let (event_tx, event_rx) = mpsc::channel();
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>();
        let mut probe = probe;

        let join = std::thread::Builder::new()
            .name(format!("servebench-sampler-{}", config.target_pid))
            .spawn(move || {
                let taken = sampling_loop(&mut probe, &config, &mut stop_rx, |msg| {
                    event_tx.send(msg).is_ok()
                });
                debug!(pid = config.target_pid, samples = taken, "sampler thread exiting");
            })?;

        Ok(Self::from_parts(
            Backend::Thread {
                stop_tx: Some(stop_tx),
                join: Some(join),
            },
            event_rx,
            config,
        ))
    }

    pub(crate) fn from_process(
        process: SidecarProcess,
        events: Receiver<SamplerMessage>,
        config: SidecarConfig,
    ) -> Self {
        Self::from_parts(Backend::Process(process), events, config)
    }

    fn from_parts(backend: Backend, events: Receiver<SamplerMessage>, config: SidecarConfig) -> Self {
        Self {
            backend,
            events,
            config,
            samples: Vec::new(),
            interruption: None,
            ready: false,
            finished: false,
        }
    }

    /// Pid being observed
    pub fn target_pid(&self) -> u32 {
        self.config.target_pid
    }

    /// Whether `Started` has been observed
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Block until the sampler has recorded its first sample.
    ///
    /// Fails with [`SamplerError::Setup`] if the first query failed and
    /// with [`SamplerError::ReadyTimeout`] if nothing arrives in time.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<(), SamplerError> {
        let deadline = Instant::now() + timeout;
        while !self.ready {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SamplerError::ReadyTimeout(timeout));
            }
            match self.events.recv_timeout(remaining) {
                Ok(SamplerMessage::Started) => self.ready = true,
                Ok(SamplerMessage::Sample(sample)) => self.samples.push(sample),
                Ok(SamplerMessage::Failure { kind, message }) => {
                    return Err(SamplerError::Setup {
                        pid: self.config.target_pid,
                        kind,
                        message,
                    });
                }
                Ok(SamplerMessage::Stopped { .. }) => {
                    return Err(SamplerError::Exited(
                        "sampler stopped before signalling readiness".to_string(),
                    ));
                }
                Ok(SamplerMessage::Hello(_)) => {
                    return Err(SamplerError::Protocol {
                        expected: "Sample/Started".to_string(),
                        got: "Hello".to_string(),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SamplerError::ReadyTimeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SamplerError::Exited(
                        "sampler channel closed before readiness".to_string(),
                    ));
                }
            }
        }
        debug!(pid = self.config.target_pid, "sampler ready");
        Ok(())
    }

    /// Terminate the sampler and hand back everything it recorded.
    pub fn stop(mut self) -> Result<SampleSeries, SamplerError> {
        self.terminate()?;
        Ok(SampleSeries {
            samples: std::mem::take(&mut self.samples),
            interruption: self.interruption.take(),
        })
    }

    /// Whether the sampler's execution context is still alive
    pub fn is_running(&mut self) -> bool {
        match &mut self.backend {
            Backend::Thread { join, .. } => join.as_ref().is_some_and(|j| !j.is_finished()),
            Backend::Process(process) => process.is_alive(),
        }
    }

    fn terminate(&mut self) -> Result<(), SamplerError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let result = match &mut self.backend {
            Backend::Thread { stop_tx, join } => {
                if let Some(tx) = stop_tx.take() {
                    let _ = tx.send(());
                }
                match join.take().map(|j| j.join()) {
                    Some(Err(_)) => Err(SamplerError::Exited("sampler thread panicked".to_string())),
                    _ => Ok(()),
                }
            }
            Backend::Process(process) => process.stop(),
        };

        // The sender side is gone now; everything left is final.
        self.drain();
        result
    }

    fn drain(&mut self) {
        while let Ok(msg) = self.events.try_recv() {
            match msg {
                SamplerMessage::Sample(sample) => self.samples.push(sample),
                SamplerMessage::Failure { message, .. } => {
                    warn!(pid = self.config.target_pid, %message, "sampling interrupted");
                    self.interruption = Some(message);
                }
                SamplerMessage::Started
                | SamplerMessage::Stopped { .. }
                | SamplerMessage::Hello(_) => {}
            }
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!(pid = self.config.target_pid, error = %e, "sampler did not stop cleanly");
        }
    }
}

/// How samplers are started for a monitored invocation
pub trait SamplerLauncher: Send + Sync {
    /// Start a sampler for `config`; readiness is awaited by the caller.
    fn launch(&self, config: SidecarConfig) -> Result<SamplerHandle, SamplerError>;
}

/// Sampler on a dedicated thread of this process, using [`SystemProbe`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLauncher;

impl SamplerLauncher for ThreadLauncher {
    fn launch(&self, config: SidecarConfig) -> Result<SamplerHandle, SamplerError> {
        SamplerHandle::spawn_thread(SystemProbe::new(), config)
    }
}

/// Sampler in a separate `servebench` process
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
    handshake_timeout: Duration,
}

impl ProcessLauncher {
    /// Re-execute the current binary as the sidecar
    pub fn current_exe(handshake_timeout: Duration) -> Result<Self, SamplerError> {
        Ok(Self {
            binary: std::env::current_exe()?,
            handshake_timeout,
        })
    }

    /// Use a specific binary that understands the sidecar flag
    pub fn with_binary(binary: impl Into<PathBuf>, handshake_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            handshake_timeout,
        }
    }
}

impl SamplerLauncher for ProcessLauncher {
    fn launch(&self, config: SidecarConfig) -> Result<SamplerHandle, SamplerError> {
        config.validate().map_err(SamplerError::InvalidConfig)?;
        SidecarProcess::launch(&self.binary, config, self.handshake_timeout)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::ProbeReading;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe that replays readings and tracks how many instances are alive.
    pub(crate) struct ScriptedProbe {
        pub readings: Vec<Result<ProbeReading, u32>>,
        pub cursor: usize,
        pub alive: Arc<AtomicUsize>,
    }

    impl ScriptedProbe {
        pub(crate) fn new(readings: Vec<Result<ProbeReading, u32>>, alive: Arc<AtomicUsize>) -> Self {
            alive.fetch_add(1, Ordering::SeqCst);
            Self {
                readings,
                cursor: 0,
                alive,
            }
        }

        pub(crate) fn steady(ram: u64, cpu: f64, alive: Arc<AtomicUsize>) -> Self {
            Self::new(
                vec![Ok(ProbeReading {
                    ram_uss_bytes: ram,
                    cpu_percent: cpu,
                })],
                alive,
            )
        }
    }

    impl Drop for ScriptedProbe {
        fn drop(&mut self) {
            self.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ProcessProbe for ScriptedProbe {
        fn read(&mut self, pid: u32, _: bool, _: bool) -> Result<ProbeReading, ProbeError> {
            // The last scripted entry repeats forever.
            let idx = self.cursor.min(self.readings.len() - 1);
            self.cursor += 1;
            match &self.readings[idx] {
                Ok(r) => Ok(*r),
                Err(_) => Err(ProbeError::ProcessNotFound(pid)),
            }
        }
    }

    pub(crate) fn config(pid: u32) -> SidecarConfig {
        SidecarConfig {
            target_pid: pid,
            interval_ns: 2_000_000,
            track_ram: true,
            track_cpu: true,
        }
    }

    #[test]
    fn test_ready_implies_at_least_one_sample() {
        let alive = Arc::new(AtomicUsize::new(0));
        let mut handle =
            SamplerHandle::spawn_thread(ScriptedProbe::steady(1024, 10.0, alive.clone()), config(7))
                .unwrap();
        handle.wait_ready(Duration::from_secs(5)).unwrap();
        assert!(handle.is_ready());
        assert!(!handle.samples.is_empty());

        let series = handle.stop().unwrap();
        assert!(!series.is_empty());
        assert!(series.ram_uss_bytes().all(|b| b == 1024));
        assert!(series.interruption().is_none());
        assert_eq!(alive.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_samples_keep_insertion_order() {
        let alive = Arc::new(AtomicUsize::new(0));
        let readings = (1..=5)
            .map(|i| {
                Ok(ProbeReading {
                    ram_uss_bytes: i * 100,
                    cpu_percent: 0.0,
                })
            })
            .collect();
        let mut handle =
            SamplerHandle::spawn_thread(ScriptedProbe::new(readings, alive.clone()), config(7))
                .unwrap();
        handle.wait_ready(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let series = handle.stop().unwrap();

        let ram: Vec<u64> = series.ram_uss_bytes().collect();
        assert!(ram.len() >= 5);
        assert_eq!(&ram[..5], &[100, 200, 300, 400, 500]);
        let stamps: Vec<u64> = series.samples().iter().map(|s| s.timestamp_ns).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_missing_target_is_setup_failure() {
        let alive = Arc::new(AtomicUsize::new(0));
        let mut handle =
            SamplerHandle::spawn_thread(ScriptedProbe::new(vec![Err(99)], alive.clone()), config(99))
                .unwrap();
        let err = handle.wait_ready(Duration::from_secs(5)).unwrap_err();
        match err {
            SamplerError::Setup { pid, kind, .. } => {
                assert_eq!(pid, 99);
                assert_eq!(kind, FailureKind::ProcessNotFound);
            }
            other => panic!("expected setup failure, got {:?}", other),
        }
        drop(handle);
        assert_eq!(alive.load(Ordering::SeqCst), 0);
    }

    /// Stops after a fixed number of waits, without sleeping
    struct StopAfter(usize);

    impl StopSignal for StopAfter {
        fn wait(&mut self, _interval: Duration) -> bool {
            self.0 = self.0.saturating_sub(1);
            self.0 == 0
        }
    }

    fn kinds(messages: &[SamplerMessage]) -> Vec<&'static str> {
        messages
            .iter()
            .map(|m| match m {
                SamplerMessage::Hello(_) => "hello",
                SamplerMessage::Started => "started",
                SamplerMessage::Sample(_) => "sample",
                SamplerMessage::Failure { .. } => "failure",
                SamplerMessage::Stopped { .. } => "stopped",
            })
            .collect()
    }

    #[test]
    fn test_loop_sends_first_sample_before_started() {
        let alive = Arc::new(AtomicUsize::new(0));
        let mut probe = ScriptedProbe::steady(1, 1.0, alive);
        let mut messages = Vec::new();

        let taken = sampling_loop(&mut probe, &config(7), &mut StopAfter(3), |m| {
            messages.push(m);
            true
        });

        assert_eq!(taken, 3);
        assert_eq!(
            kinds(&messages),
            ["sample", "started", "sample", "sample", "stopped"]
        );
        assert!(matches!(messages[4], SamplerMessage::Stopped { samples_taken: 3 }));
    }

    #[test]
    fn test_loop_ends_without_stop_when_target_exits() {
        let alive = Arc::new(AtomicUsize::new(0));
        let readings = vec![
            Ok(ProbeReading {
                ram_uss_bytes: 10,
                cpu_percent: 1.0,
            }),
            Err(7),
        ];
        let mut probe = ScriptedProbe::new(readings, alive);
        let mut messages = Vec::new();

        let taken = sampling_loop(&mut probe, &config(7), &mut StopAfter(usize::MAX), |m| {
            messages.push(m);
            true
        });

        assert_eq!(taken, 1);
        assert_eq!(kinds(&messages), ["sample", "started", "failure"]);
    }

    #[test]
    fn test_target_exit_mid_run_is_recorded() {
        let alive = Arc::new(AtomicUsize::new(0));
        let readings = vec![
            Ok(ProbeReading {
                ram_uss_bytes: 10,
                cpu_percent: 1.0,
            }),
            Ok(ProbeReading {
                ram_uss_bytes: 20,
                cpu_percent: 2.0,
            }),
            Err(7),
        ];
        let mut handle =
            SamplerHandle::spawn_thread(ScriptedProbe::new(readings, alive.clone()), config(7))
                .unwrap();
        handle.wait_ready(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let series = handle.stop().unwrap();
        assert_eq!(series.len(), 2);
        assert!(series.interruption().is_some());
    }

    #[test]
    fn test_drop_terminates_thread() {
        let alive = Arc::new(AtomicUsize::new(0));
        let mut handle =
            SamplerHandle::spawn_thread(ScriptedProbe::steady(1, 1.0, alive.clone()), config(7))
                .unwrap();
        handle.wait_ready(Duration::from_secs(5)).unwrap();
        assert!(handle.is_running());
        drop(handle);
        assert_eq!(alive.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let alive = Arc::new(AtomicUsize::new(0));
        let result = SamplerHandle::spawn_thread(ScriptedProbe::steady(1, 1.0, alive), config(0));
        assert!(matches!(result, Err(SamplerError::InvalidConfig(_))));
    }

    struct NeverStarts;

    impl ProcessProbe for NeverStarts {
        fn read(&mut self, _: u32, _: bool, _: bool) -> Result<ProbeReading, ProbeError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(ProbeReading::default())
        }
    }

    #[test]
    fn test_ready_timeout() {
        let mut handle = SamplerHandle::spawn_thread(NeverStarts, config(7)).unwrap();
        let err = handle.wait_ready(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, SamplerError::ReadyTimeout(_)));
    }
}
