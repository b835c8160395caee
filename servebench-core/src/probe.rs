//! OS-level process metrics
//!
//! A [`ProcessProbe`] answers one question: how much unique memory and CPU
//! is process `pid` using right now. [`SystemProbe`] is the production
//! implementation; the sampler is generic so tests can script readings.
//!
//! Unique set size (USS) is read from `/proc/<pid>/smaps_rollup` on Linux
//! (private clean + private dirty + private hugetlb pages). Other platforms
//! fall back to resident memory as reported by `sysinfo`.

use crate::error::{Categorized, ErrorCategory};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use thiserror::Error;

/// Errors from a single metrics query
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Process {0} does not exist or has exited")]
    ProcessNotFound(u32),

    #[error("Access to metrics of process {pid} denied: {message}")]
    AccessDenied { pid: u32, message: String },

    #[error("Malformed metrics for process {pid}: {message}")]
    Malformed { pid: u32, message: String },
}

impl Categorized for ProbeError {
    fn category(&self) -> ErrorCategory {
        match self {
            ProbeError::ProcessNotFound(_) | ProbeError::AccessDenied { .. } => ErrorCategory::Setup,
            ProbeError::Malformed { .. } => ErrorCategory::Aggregation,
        }
    }
}

/// One reading. Untracked axes are zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProbeReading {
    /// Unique set size in bytes
    pub ram_uss_bytes: u64,
    /// CPU usage in percent of one core
    pub cpu_percent: f64,
}

/// Source of per-process metrics
pub trait ProcessProbe: Send {
    /// Query the requested axes for `pid`. Must fail with
    /// [`ProbeError::ProcessNotFound`] when the process is gone.
    fn read(&mut self, pid: u32, track_ram: bool, track_cpu: bool)
    -> Result<ProbeReading, ProbeError>;
}

/// `sysinfo` + procfs backed probe
pub struct SystemProbe {
    system: System,
}

impl SystemProbe {
    /// Create a probe with an empty process table
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProbe {
    fn read(
        &mut self,
        pid: u32,
        track_ram: bool,
        track_cpu: bool,
    ) -> Result<ProbeReading, ProbeError> {
        let sys_pid = Pid::from_u32(pid);
        // CPU usage is a delta between two refreshes of the same System;
        // the very first reading of a process is therefore 0.0.
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );

        let process = self
            .system
            .process(sys_pid)
            .ok_or(ProbeError::ProcessNotFound(pid))?;
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return Err(ProbeError::ProcessNotFound(pid));
        }

        let cpu_percent = if track_cpu {
            process.cpu_usage() as f64
        } else {
            0.0
        };

        let ram_uss_bytes = if track_ram {
            #[cfg(target_os = "linux")]
            {
                read_uss_bytes(pid)?
            }
            #[cfg(not(target_os = "linux"))]
            {
                process.memory()
            }
        } else {
            0
        };

        Ok(ProbeReading {
            ram_uss_bytes,
            cpu_percent,
        })
    }
}

/// Read USS for `pid` from procfs, preferring the pre-summed rollup.
#[cfg(target_os = "linux")]
pub fn read_uss_bytes(pid: u32) -> Result<u64, ProbeError> {
    let rollup = format!("/proc/{}/smaps_rollup", pid);
    match std::fs::read_to_string(&rollup) {
        Ok(content) => parse_private_kb(&content)
            .map(|kb| kb * 1024)
            .ok_or_else(|| ProbeError::Malformed {
                pid,
                message: format!("no Private_* lines in {}", rollup),
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Kernels before 4.14 have no rollup; sum the full map instead.
            if !std::path::Path::new(&format!("/proc/{}", pid)).exists() {
                return Err(ProbeError::ProcessNotFound(pid));
            }
            let content = std::fs::read_to_string(format!("/proc/{}/smaps", pid))
                .map_err(|e| io_to_probe_error(pid, e))?;
            Ok(parse_private_kb(&content).unwrap_or(0) * 1024)
        }
        Err(e) => Err(io_to_probe_error(pid, e)),
    }
}

#[cfg(target_os = "linux")]
fn io_to_probe_error(pid: u32, e: std::io::Error) -> ProbeError {
    match e.kind() {
        std::io::ErrorKind::NotFound => ProbeError::ProcessNotFound(pid),
        std::io::ErrorKind::PermissionDenied => ProbeError::AccessDenied {
            pid,
            message: e.to_string(),
        },
        // ESRCH surfaces as an uncategorised error when the process dies mid-read
        _ if e.raw_os_error() == Some(libc::ESRCH) => ProbeError::ProcessNotFound(pid),
        _ => ProbeError::Malformed {
            pid,
            message: e.to_string(),
        },
    }
}

/// Sum every `Private_*:` line (values in kB). `None` if none are present.
pub fn parse_private_kb(content: &str) -> Option<u64> {
    let mut total = 0u64;
    let mut seen = false;
    for line in content.lines() {
        let Some(rest) = line.strip_prefix("Private_") else {
            continue;
        };
        let Some((field, value)) = rest.split_once(':') else {
            continue;
        };
        if !matches!(field, "Clean" | "Dirty" | "Hugetlb") {
            continue;
        }
        if let Some(kb) = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        {
            total += kb;
            seen = true;
        }
    }
    seen.then_some(total)
}
