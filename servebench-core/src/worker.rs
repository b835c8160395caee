//! Sidecar Process Entry Point
//!
//! The child half of process-isolated sampling. Reads commands from fd 3
//! and writes messages to fd 4 when `SERVEBENCH_IPC_FD` is set; otherwise
//! falls back to stdin/stdout. SIGTERM, a `Stop` command, or the command
//! pipe closing all end sampling.

use crate::probe::SystemProbe;
use crate::sampler::{StopSignal, sampling_loop};
use servebench_ipc::{
    FailureKind, FrameError, FrameReader, FrameWriter, IPC_FD_ENV, SamplerCommand,
    SamplerMessage, SidecarCapabilities,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::io::FromRawFd;

/// Set by the SIGTERM handler
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Whether SIGTERM has been received
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Install a SIGTERM handler that only sets an atomic.
#[cfg(unix)]
fn install_sigterm_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigterm_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
extern "C" fn sigterm_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(not(unix))]
fn install_sigterm_handler() {}

enum IpcTransport {
    #[cfg(unix)]
    Fds { read_fd: i32, write_fd: i32 },
    Stdio,
}

fn detect_transport() -> IpcTransport {
    #[cfg(unix)]
    if let Ok(val) = std::env::var(IPC_FD_ENV) {
        if let Some((r, w)) = val.split_once(',') {
            if let (Ok(read_fd), Ok(write_fd)) = (r.trim().parse(), w.trim().parse()) {
                return IpcTransport::Fds { read_fd, write_fd };
            }
        }
        tracing::warn!(
            value = %val,
            "invalid {} (expected <read_fd>,<write_fd>), falling back to stdio",
            IPC_FD_ENV
        );
    }
    IpcTransport::Stdio
}

/// Stop flag shared by the signal handler and the command listener
struct FlagStop {
    stop: Arc<AtomicBool>,
}

impl StopSignal for FlagStop {
    fn wait(&mut self, interval: Duration) -> bool {
        // Sleep in slices so SIGTERM and `Stop` are honoured promptly.
        let deadline = Instant::now() + interval;
        loop {
            if self.stop.load(Ordering::Relaxed) || shutdown_requested() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            std::thread::sleep(remaining.min(Duration::from_millis(10)));
        }
    }
}

type BoxedReader = FrameReader<Box<dyn std::io::Read + Send>>;
type BoxedWriter = FrameWriter<Box<dyn std::io::Write + Send>>;

/// Sidecar main loop
pub struct SidecarMain {
    reader: Option<BoxedReader>,
    writer: BoxedWriter,
}

impl SidecarMain {
    /// Attach to fd 3/4 if advertised, otherwise stdin/stdout.
    pub fn new() -> Self {
        match detect_transport() {
            #[cfg(unix)]
            IpcTransport::Fds { read_fd, write_fd } => {
                let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
                let write_file = unsafe { std::fs::File::from_raw_fd(write_fd) };
                Self {
                    reader: Some(FrameReader::new(
                        Box::new(read_file) as Box<dyn std::io::Read + Send>
                    )),
                    writer: FrameWriter::new(Box::new(write_file) as Box<dyn std::io::Write + Send>),
                }
            }
            IpcTransport::Stdio => Self {
                reader: Some(FrameReader::new(
                    Box::new(std::io::stdin()) as Box<dyn std::io::Read + Send>
                )),
                writer: FrameWriter::new(Box::new(std::io::stdout()) as Box<dyn std::io::Write + Send>),
            },
        }
    }

    /// Handshake, wait for `Start`, sample until told to stop.
    pub fn run(&mut self) -> Result<(), FrameError> {
        install_sigterm_handler();

        self.writer
            .write(&SamplerMessage::Hello(SidecarCapabilities::default()))?;

        let Some(mut reader) = self.reader.take() else {
            return Err(FrameError::InvalidFrame("sidecar already ran".to_string()));
        };

        let config = loop {
            if shutdown_requested() {
                return Ok(());
            }
            match reader.read::<SamplerCommand>() {
                Ok(SamplerCommand::Start(config)) => break config,
                Ok(SamplerCommand::Stop) | Err(FrameError::EndOfStream) => return Ok(()),
                Err(e) => return Err(e),
            }
        };

        if let Err(message) = config.validate() {
            self.writer.write(&SamplerMessage::Failure {
                kind: FailureKind::Protocol,
                message,
            })?;
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("servebench-sidecar-commands".to_string())
                .spawn(move || {
                    // Any command after Start, or the controller going away, means stop.
                    let _ = reader.read::<SamplerCommand>();
                    stop.store(true, Ordering::Relaxed);
                })
                .map_err(FrameError::Io)?;
        }

        let mut probe = SystemProbe::new();
        let mut signal = FlagStop { stop };
        let writer = &mut self.writer;
        let mut write_error = None;
        let taken = sampling_loop(&mut probe, &config, &mut signal, |msg| {
            match writer.write(&msg) {
                Ok(()) => true,
                Err(e) => {
                    write_error = Some(e);
                    false
                }
            }
        });
        tracing::debug!(samples = taken, "sidecar finished sampling");

        match write_error {
            // Controller closed its end; nothing left to report to.
            Some(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for SidecarMain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_stop_returns_when_set() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut signal = FlagStop { stop };
        let start = Instant::now();
        assert!(signal.wait(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_flag_stop_times_out() {
        let mut signal = FlagStop {
            stop: Arc::new(AtomicBool::new(false)),
        };
        assert!(!signal.wait(Duration::from_millis(15)));
    }
}
