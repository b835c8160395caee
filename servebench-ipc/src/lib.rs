#![warn(missing_docs)]
//! servebench IPC Protocol
//!
//! Binary protocol spoken between the benchmark controller and its sampler
//! sidecar process. Messages are rkyv archives wrapped in length-prefixed
//! frames, exchanged over a pair of inherited pipes.
//!
//! The conversation is always the same:
//!
//! ```text
//! sidecar  ── Hello ──────────────▶ controller
//! sidecar  ◀──────────── Start ──── controller
//! sidecar  ── Sample ─────────────▶ controller   (first reading)
//! sidecar  ── Started ────────────▶ controller
//! sidecar  ── Sample … ───────────▶ controller
//! sidecar  ◀───────────── Stop ──── controller
//! sidecar  ── Stopped ────────────▶ controller
//! ```

mod framing;
mod messages;

pub use framing::{FrameError, FrameReader, FrameWriter, MAX_FRAME_SIZE, read_frame, write_frame};
pub use messages::{
    FailureKind, ProcessSample, SamplerCommand, SamplerMessage, SidecarCapabilities, SidecarConfig,
};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the `<read_fd>,<write_fd>` pair for the sidecar.
pub const IPC_FD_ENV: &str = "SERVEBENCH_IPC_FD";

/// Hidden command-line flag that turns the `servebench` binary into a sampler sidecar.
pub const SIDECAR_FLAG: &str = "--sampler-worker";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_sample_is_compact() {
        // u64 + f64 + u64, no padding
        assert_eq!(std::mem::size_of::<ProcessSample>(), 24);
    }

    #[test]
    fn test_flag_is_long_option() {
        assert!(SIDECAR_FLAG.starts_with("--"));
    }
}
