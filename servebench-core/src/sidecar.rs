//! Process-isolated sampler
//!
//! Spawns the current binary with the hidden sidecar flag and talks to it
//! over an inherited pipe pair: fd 3 carries commands into the sidecar, fd 4
//! carries messages out. A reader thread forwards every decoded frame into
//! the same channel the thread backend uses, so [`SamplerHandle`] does not
//! care which side of a process boundary the sampling happens on.

use crate::sampler::{SamplerError, SamplerHandle};
#[cfg(unix)]
use servebench_ipc::SamplerMessage;
use servebench_ipc::SidecarConfig;
use std::path::Path;
use std::time::Duration;

#[cfg(unix)]
pub(crate) use unix::SidecarProcess;

#[cfg(not(unix))]
pub(crate) use fallback::SidecarProcess;

#[cfg(unix)]
mod unix {
    use super::*;
    use servebench_ipc::{
        FrameError, FrameReader, FrameWriter, IPC_FD_ENV, PROTOCOL_VERSION, SIDECAR_FLAG,
        SamplerCommand, SidecarCapabilities,
    };
    use std::os::unix::io::{FromRawFd, RawFd};
    use std::os::unix::process::CommandExt;
    use std::process::{Child, Command, Stdio};
    use std::sync::mpsc;
    use std::thread::JoinHandle;
    use std::time::Instant;
    use tracing::{debug, trace, warn};

    /// How long a sidecar gets to acknowledge `Stop` before it is signalled
    const STOP_GRACE: Duration = Duration::from_millis(500);

    enum PollResult {
        DataAvailable,
        Timeout,
        PipeClosed,
        Error(std::io::Error),
    }

    fn wait_for_data(fd: RawFd, timeout: Duration) -> PollResult {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

        if result < 0 {
            PollResult::Error(std::io::Error::last_os_error())
        } else if result == 0 {
            PollResult::Timeout
        } else if pollfd.revents & libc::POLLIN != 0 {
            PollResult::DataAvailable
        } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            PollResult::PipeClosed
        } else {
            PollResult::Timeout
        }
    }

    /// Create a pipe pair with close-on-exec set on both ends.
    fn create_pipe() -> Result<(RawFd, RawFd), std::io::Error> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        for &fd in &fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }
        Ok((fds[0], fds[1]))
    }

    /// First fd used for the temporary copies in [`install_child_fds`]
    const SCRATCH_FD_FLOOR: RawFd = 10;

    /// Runs in the forked child: put the command pipe on fd 3 and the
    /// message pipe on fd 4.
    ///
    /// The pipe ends may themselves sit on 3 or 4, so both are first copied
    /// above [`SCRATCH_FD_FLOOR`] and only then moved into place. Every
    /// other pipe end carries close-on-exec and disappears at `exec`.
    fn install_child_fds(cmd_read: RawFd, msg_write: RawFd) -> std::io::Result<()> {
        unsafe {
            let cmd_copy = libc::fcntl(cmd_read, libc::F_DUPFD_CLOEXEC, SCRATCH_FD_FLOOR);
            if cmd_copy < 0 {
                return Err(std::io::Error::last_os_error());
            }
            let msg_copy = libc::fcntl(msg_write, libc::F_DUPFD_CLOEXEC, SCRATCH_FD_FLOOR);
            if msg_copy < 0 {
                return Err(std::io::Error::last_os_error());
            }
            // dup2 leaves the new descriptor without close-on-exec
            if libc::dup2(cmd_copy, 3) < 0 || libc::dup2(msg_copy, 4) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn close_fd(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn send_sigterm(pid: u32) -> Result<(), std::io::Error> {
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if ret == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// A running sidecar process
    pub(crate) struct SidecarProcess {
        child: Child,
        writer: Option<FrameWriter<std::fs::File>>,
        reader_thread: Option<JoinHandle<()>>,
        capabilities: SidecarCapabilities,
    }

    impl SidecarProcess {
        /// Spawn, handshake, send `Start`, and wire the message stream into
        /// a [`SamplerHandle`].
        pub(crate) fn launch(
            binary: &Path,
            config: SidecarConfig,
            handshake_timeout: Duration,
        ) -> Result<SamplerHandle, SamplerError> {
            // cmd pipe: controller writes, sidecar reads fd 3
            let (cmd_read, cmd_write) = create_pipe()?;
            // msg pipe: sidecar writes fd 4, controller reads
            let (msg_read, msg_write) = match create_pipe() {
                Ok(fds) => fds,
                Err(e) => {
                    close_fd(cmd_read);
                    close_fd(cmd_write);
                    return Err(SamplerError::Spawn(e));
                }
            };

            let mut command = Command::new(binary);
            command
                .arg(SIDECAR_FLAG)
                .env(IPC_FD_ENV, "3,4")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::inherit());

            unsafe {
                command.pre_exec(move || install_child_fds(cmd_read, msg_write));
            }

            let child = match command.spawn() {
                Ok(c) => c,
                Err(e) => {
                    close_fd(cmd_read);
                    close_fd(cmd_write);
                    close_fd(msg_read);
                    close_fd(msg_write);
                    return Err(SamplerError::Spawn(e));
                }
            };

            close_fd(cmd_read);
            close_fd(msg_write);

            let writer = FrameWriter::new(unsafe { std::fs::File::from_raw_fd(cmd_write) });
            let mut reader = FrameReader::new(unsafe { std::fs::File::from_raw_fd(msg_read) });

            let mut process = SidecarProcess {
                child,
                writer: Some(writer),
                reader_thread: None,
                capabilities: SidecarCapabilities::default(),
            };

            // From here on `process` owns the child; an early return drops it,
            // which terminates the sidecar.
            process.capabilities = wait_for_hello(&mut reader, msg_read, handshake_timeout)?;
            debug!(
                sidecar_pid = process.capabilities.sidecar_pid,
                uss_source = %process.capabilities.uss_source,
                "sampler sidecar connected"
            );

            if let Some(writer) = process.writer.as_mut() {
                writer.write(&SamplerCommand::Start(config))?;
            }

            let (event_tx, event_rx) = mpsc::channel();
            let target_pid = config.target_pid;
            let reader_thread = std::thread::Builder::new()
                .name(format!("servebench-sidecar-reader-{}", target_pid))
                .spawn(move || forward_messages(reader, event_tx))?;
            process.reader_thread = Some(reader_thread);

            Ok(SamplerHandle::from_process(process, event_rx, config))
        }

        pub(crate) fn is_alive(&mut self) -> bool {
            matches!(self.child.try_wait(), Ok(None))
        }

        /// Ask the sidecar to stop, escalating to SIGTERM and SIGKILL.
        ///
        /// Returns once the child has been reaped and every frame it wrote
        /// has been forwarded.
        pub(crate) fn stop(&mut self) -> Result<(), SamplerError> {
            if let Some(mut writer) = self.writer.take() {
                // The sidecar may already be gone; that is what we want anyway.
                let _ = writer.write(&SamplerCommand::Stop);
            }

            let mut escalated = false;
            if !self.wait_exit(STOP_GRACE) {
                warn!(pid = self.child.id(), "sidecar ignored Stop, sending SIGTERM");
                escalated = true;
                let _ = send_sigterm(self.child.id());
                if !self.wait_exit(Duration::from_millis(100)) {
                    let _ = self.child.kill();
                }
            }
            let status = self.child.wait()?;

            if let Some(handle) = self.reader_thread.take() {
                let _ = handle.join();
            }

            if !status.success() && !escalated {
                return Err(SamplerError::Exited(format!("sidecar exited with {}", status)));
            }
            Ok(())
        }

        fn wait_exit(&mut self, limit: Duration) -> bool {
            let deadline = Instant::now() + limit;
            loop {
                if !self.is_alive() {
                    return true;
                }
                if Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl Drop for SidecarProcess {
        fn drop(&mut self) {
            if self.is_alive() {
                let _ = send_sigterm(self.child.id());
                std::thread::sleep(Duration::from_millis(50));
                if self.is_alive() {
                    let _ = self.child.kill();
                }
            }
            let _ = self.child.wait();
            if let Some(handle) = self.reader_thread.take() {
                let _ = handle.join();
            }
        }
    }

    fn wait_for_hello(
        reader: &mut FrameReader<std::fs::File>,
        fd: RawFd,
        timeout: Duration,
    ) -> Result<SidecarCapabilities, SamplerError> {
        match wait_for_data(fd, timeout) {
            PollResult::DataAvailable => {}
            PollResult::Timeout => return Err(SamplerError::ReadyTimeout(timeout)),
            PollResult::PipeClosed => {
                return Err(SamplerError::Exited(
                    "sidecar closed its pipe before the handshake".to_string(),
                ));
            }
            PollResult::Error(e) => return Err(SamplerError::Ipc(e.to_string())),
        }

        match reader.read::<SamplerMessage>()? {
            SamplerMessage::Hello(caps) => {
                if caps.protocol_version != PROTOCOL_VERSION {
                    return Err(SamplerError::Protocol {
                        expected: format!("protocol version {}", PROTOCOL_VERSION),
                        got: format!("protocol version {}", caps.protocol_version),
                    });
                }
                Ok(caps)
            }
            other => Err(SamplerError::Protocol {
                expected: "Hello".to_string(),
                got: format!("{:?}", other),
            }),
        }
    }

    fn forward_messages(
        mut reader: FrameReader<std::fs::File>,
        events: mpsc::Sender<SamplerMessage>,
    ) {
        loop {
            match reader.read::<SamplerMessage>() {
                Ok(msg) => {
                    trace!(?msg, "sidecar message");
                    if events.send(msg).is_err() {
                        break;
                    }
                }
                Err(FrameError::EndOfStream) => break,
                Err(e) => {
                    let _ = events.send(SamplerMessage::Failure {
                        kind: servebench_ipc::FailureKind::Protocol,
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    use super::*;

    /// Process isolation needs inherited pipe descriptors.
    pub(crate) struct SidecarProcess;

    impl SidecarProcess {
        pub(crate) fn launch(
            _binary: &Path,
            _config: SidecarConfig,
            _handshake_timeout: Duration,
        ) -> Result<SamplerHandle, SamplerError> {
            Err(SamplerError::Spawn(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "process-isolated sampling requires a unix platform",
            )))
        }

        pub(crate) fn is_alive(&mut self) -> bool {
            false
        }

        pub(crate) fn stop(&mut self) -> Result<(), SamplerError> {
            Ok(())
        }
    }
}
