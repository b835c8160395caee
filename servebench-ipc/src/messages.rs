//! IPC Message Types
//!
//! Everything that crosses the sidecar pipes. All types derive rkyv with
//! byte validation so a corrupt frame is rejected instead of trusted.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// One point-in-time observation of the target process.
#[derive(Debug, Clone, Copy, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
#[repr(C)]
pub struct ProcessSample {
    /// Unique set size in bytes (0 when RAM tracking is off)
    pub ram_uss_bytes: u64,
    /// CPU usage in percent of one core (0.0 when CPU tracking is off)
    pub cpu_percent: f64,
    /// Nanoseconds since the sampler took its first sample
    pub timestamp_ns: u64,
}

impl ProcessSample {
    /// Create a new sample
    #[inline]
    pub fn new(ram_uss_bytes: u64, cpu_percent: f64, timestamp_ns: u64) -> Self {
        Self {
            ram_uss_bytes,
            cpu_percent,
            timestamp_ns,
        }
    }
}

/// What the sidecar should watch and how often
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct SidecarConfig {
    /// Process to observe
    pub target_pid: u32,
    /// Pause between two samples in nanoseconds
    pub interval_ns: u64,
    /// Query unique set size
    pub track_ram: bool,
    /// Query CPU percent
    pub track_cpu: bool,
}

impl SidecarConfig {
    /// Reject configurations the sidecar cannot honour.
    pub fn validate(&self) -> Result<(), String> {
        if self.target_pid == 0 {
            return Err("target_pid must be > 0".to_string());
        }
        if !self.track_ram && !self.track_cpu {
            return Err("at least one of track_ram / track_cpu must be enabled".to_string());
        }
        Ok(())
    }
}

/// Capabilities advertised by the sidecar in its `Hello`
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct SidecarCapabilities {
    /// Protocol version for compatibility
    pub protocol_version: u32,
    /// Where unique-set-size figures come from ("smaps_rollup", "smaps" or "rss")
    pub uss_source: String,
    /// Sidecar's own pid, for diagnostics
    pub sidecar_pid: u32,
}

impl Default for SidecarCapabilities {
    fn default() -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            uss_source: default_uss_source().to_string(),
            sidecar_pid: std::process::id(),
        }
    }
}

fn default_uss_source() -> &'static str {
    if cfg!(target_os = "linux") {
        "smaps_rollup"
    } else {
        "rss"
    }
}

/// Commands sent from the controller to the sidecar
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum SamplerCommand {
    /// Begin sampling
    Start(SidecarConfig),
    /// Stop sampling and exit
    Stop,
}

/// Messages sent from the sidecar to the controller
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum SamplerMessage {
    /// Handshake
    Hello(SidecarCapabilities),

    /// First sample was recorded; sent exactly once, right after that
    /// first `Sample`, so a ready controller always holds one reading
    Started,

    /// One observation
    Sample(ProcessSample),

    /// Sampling could not start or had to give up
    Failure {
        /// Error category
        kind: FailureKind,
        /// Human-readable error message
        message: String,
    },

    /// Acknowledges `Stop`
    Stopped {
        /// Total samples emitted, including the first one
        samples_taken: u64,
    },
}

/// Categories of sidecar failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum FailureKind {
    /// Target pid does not exist or has exited
    ProcessNotFound,
    /// Target exists but its metrics cannot be read
    AccessDenied,
    /// Any other probe failure
    Probe,
    /// Unexpected command or malformed config
    Protocol,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_creation() {
        let sample = ProcessSample::new(1 << 20, 55.0, 42);
        assert_eq!(sample.ram_uss_bytes, 1 << 20);
        assert!((sample.cpu_percent - 55.0).abs() < f64::EPSILON);
        assert_eq!(sample.timestamp_ns, 42);
    }

    #[test]
    fn test_config_validate_zero_pid() {
        let config = SidecarConfig {
            target_pid: 0,
            interval_ns: 1,
            track_ram: true,
            track_cpu: true,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_nothing_tracked() {
        let config = SidecarConfig {
            target_pid: 1,
            interval_ns: 1,
            track_ram: false,
            track_cpu: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_capabilities_default() {
        let caps = SidecarCapabilities::default();
        assert_eq!(caps.protocol_version, crate::PROTOCOL_VERSION);
        assert_eq!(caps.sidecar_pid, std::process::id());
    }
}
