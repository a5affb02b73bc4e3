//! Per-kind descriptor behavior, expressed as a small capability trait
//! instead of branching on `DescriptorKind` in the main loop. Grounded on
//! `coredesc.c`'s four hook points (`pre_read`, `post_line_write`,
//! `on_activate`, `on_deactivate`).

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// What the runtime should do after calling a descriptor's `pre_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreReadOutcome {
    /// Proceed with the ordinary line-reader read path.
    ReadNormally,
    /// The hook fully handled this readiness event (e.g. drained the
    /// accept queue); skip the ordinary read this cycle.
    Handled,
}

/// What the runtime should do after a write attempt errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorOutcome {
    /// Propagate the error to the generic close/DEAD path.
    Propagate,
    /// Reset the descriptor to PENDING, keeping its write queue intact,
    /// and let the origin reconnect on a future write-readiness tick.
    ResetToPending,
}

pub trait DescriptorHooks: std::fmt::Debug {
    fn pre_read(&mut self, _fd: RawFd) -> PreReadOutcome {
        PreReadOutcome::ReadNormally
    }

    fn on_write_error(&mut self, _err: &std::io::Error) -> WriteErrorOutcome {
        WriteErrorOutcome::Propagate
    }

    fn post_line_write(&mut self, _bytes_written: usize) {}

    fn on_activate(&mut self, _path: Option<&Path>) {}

    fn on_deactivate(&mut self) {}

    /// Rotated-log hook only: has the size threshold been crossed?
    fn rotate_needed(&self) -> bool {
        false
    }

    fn mark_rotated(&mut self, _new_size: u64) {}

    /// Listen-socket hook only: drain and return fds accepted during the
    /// last `pre_read`.
    fn take_accepted(&mut self) -> Vec<RawFd> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
pub struct NoopHooks;

impl DescriptorHooks for NoopHooks {}

/// Runs the accept loop until `EWOULDBLOCK`, buffering accepted fds for
/// the runtime to wrap as SOCKETR descriptors.
#[derive(Debug, Default)]
pub struct ListenSocketHooks {
    accepted: Vec<RawFd>,
}

impl DescriptorHooks for ListenSocketHooks {
    fn pre_read(&mut self, fd: RawFd) -> PreReadOutcome {
        loop {
            match nix::sys::socket::accept(fd) {
                Ok(client_fd) => {
                    let _ = nix::fcntl::fcntl(
                        client_fd,
                        nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
                    );
                    self.accepted.push(client_fd);
                }
                Err(nix::errno::Errno::EWOULDBLOCK) => break,
                Err(_) => break,
            }
        }
        PreReadOutcome::Handled
    }

    fn take_accepted(&mut self) -> Vec<RawFd> {
        std::mem::take(&mut self.accepted)
    }
}

/// On `EPIPE` a socket-write descriptor resets to PENDING rather than
/// dying outright, keeping its queued-but-unsent output so the origin can
/// reconnect and resume draining it.
#[derive(Debug, Default)]
pub struct SocketWriteHooks;

impl DescriptorHooks for SocketWriteHooks {
    fn on_write_error(&mut self, err: &std::io::Error) -> WriteErrorOutcome {
        match err.raw_os_error() {
            Some(code) if code == libc::EPIPE || code == libc::ECONNRESET => WriteErrorOutcome::ResetToPending,
            _ => WriteErrorOutcome::Propagate,
        }
    }
}

/// Tracks cumulative bytes written since open and signals when the
/// configured size threshold has been crossed. Grounded on `rotlog.c`.
#[derive(Debug)]
pub struct RotatedLogHooks {
    pub threshold: u64,
    pub bytes_written: u64,
    pub path: Option<PathBuf>,
    pub opened_at: Option<SystemTime>,
}

impl RotatedLogHooks {
    pub fn new(threshold: u64) -> Self {
        RotatedLogHooks {
            threshold,
            bytes_written: 0,
            path: None,
            opened_at: None,
        }
    }
}

impl Default for RotatedLogHooks {
    fn default() -> Self {
        RotatedLogHooks::new(u64::MAX)
    }
}

impl DescriptorHooks for RotatedLogHooks {
    fn on_activate(&mut self, path: Option<&Path>) {
        self.path = path.map(PathBuf::from);
        self.opened_at = Some(SystemTime::now());
        self.bytes_written = path
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);
    }

    fn post_line_write(&mut self, bytes_written: usize) {
        self.bytes_written += bytes_written as u64;
    }

    fn rotate_needed(&self) -> bool {
        self.bytes_written >= self.threshold
    }

    fn mark_rotated(&mut self, new_size: u64) {
        self.bytes_written = new_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotated_log_signals_once_threshold_crossed() {
        let mut h = RotatedLogHooks::new(100);
        h.on_activate(None);
        assert!(!h.rotate_needed());
        h.post_line_write(100);
        assert!(h.rotate_needed());
        h.mark_rotated(0);
        assert!(!h.rotate_needed());
    }

    #[test]
    fn socket_write_resets_on_epipe_not_on_other_errors() {
        let mut h = SocketWriteHooks;
        let epipe = std::io::Error::from_raw_os_error(libc::EPIPE);
        let other = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(h.on_write_error(&epipe), WriteErrorOutcome::ResetToPending);
        assert_eq!(h.on_write_error(&other), WriteErrorOutcome::Propagate);
    }
}
