//! Process-isolated sampling through the real `servebench` binary
//!
//! Every test checks that no sidecar outlives the measurement, so they
//! share a lock: the child listing covers the whole test process.

#![cfg(unix)]

use servebench::{
    Categorized, ErrorCategory, Monitor, MonitorError, MonitorOptions, ProcessLauncher,
    SamplerError,
};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};

static SERIAL: Mutex<()> = Mutex::new(());

fn sidecar_monitor() -> Monitor {
    let launcher =
        ProcessLauncher::with_binary(env!("CARGO_BIN_EXE_servebench"), Duration::from_secs(10));
    Monitor::new(MonitorOptions {
        sample_interval: Duration::from_millis(5),
        ..MonitorOptions::default()
    })
    .with_launcher(launcher)
}

/// Child processes of this test binary, threads excluded
fn child_pids() -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let me = Pid::from_u32(std::process::id());
    system
        .processes()
        .values()
        .filter(|p| p.parent() == Some(me) && p.thread_kind().is_none())
        .map(|p| p.pid().as_u32())
        .collect()
}

/// Pid of a process that has already exited and been reaped
fn reaped_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[test]
fn test_sidecar_samples_and_exits() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

    let measured = sidecar_monitor()
        .measure(Some(std::process::id()), || {
            std::thread::sleep(Duration::from_millis(100));
            42
        })
        .unwrap();

    assert_eq!(measured.value, 42);
    assert!(measured.summary.sample_count >= 1);
    assert!(measured.summary.ram_uss_bytes.is_some());
    assert!(measured.summary.sampler_interruption.is_none());
    assert_eq!(child_pids(), Vec::<u32>::new());
}

#[test]
fn test_sidecar_terminated_when_operation_panics() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let monitor = sidecar_monitor();

    let caught = catch_unwind(AssertUnwindSafe(|| {
        monitor.measure(Some(std::process::id()), || -> u32 {
            std::thread::sleep(Duration::from_millis(20));
            panic!("inference exploded")
        })
    }));

    assert!(caught.is_err());
    assert_eq!(child_pids(), Vec::<u32>::new());
}

#[test]
fn test_sidecar_reports_missing_target_as_setup_error() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let pid = reaped_pid();

    let started = Instant::now();
    let err = sidecar_monitor()
        .measure(Some(pid), || -> u32 { unreachable!("operation must not run") })
        .unwrap_err();

    assert!(
        matches!(err, MonitorError::Sampler(SamplerError::Setup { pid: p, .. }) if p == pid),
        "unexpected error: {:?}",
        err
    );
    assert_eq!(err.category(), ErrorCategory::Setup);
    // Well under the ready timeout: the failure is reported, not waited out
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(child_pids(), Vec::<u32>::new());
}
