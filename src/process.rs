//! Signal intake, daemonization, and the argv/envp snapshot that keeps
//! `execve` stable across a restart hand-off. Grounded on `proc.c`.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{self, ForkResult};

static RESTART_FLAG: AtomicBool = AtomicBool::new(false);
static ROTATE_FLAG: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

#[derive(Debug, snafu::Snafu)]
pub enum ProcessError {
    #[snafu(display("fork failed: {source}"))]
    Fork { source: nix::Error },
    #[snafu(display("setsid failed: {source}"))]
    Setsid { source: nix::Error },
    #[snafu(display("signal handler install failed: {source}"))]
    Signal { source: nix::Error },
    #[snafu(display("failed to redirect standard fd: {source}"))]
    Redirect { source: std::io::Error },
    #[snafu(display("execve failed: {source}"))]
    Exec { source: nix::Error },
}

/// Flags a signal handler may set, polled by the main loop once per
/// iteration. All signal-handler work stops at setting these; nothing
/// else touches shared state from a handler context.
pub struct SignalFlags;

impl SignalFlags {
    pub fn restart_requested() -> bool {
        RESTART_FLAG.swap(false, Ordering::SeqCst)
    }

    pub fn rotate_requested() -> bool {
        ROTATE_FLAG.swap(false, Ordering::SeqCst)
    }

    pub fn shutdown_requested() -> bool {
        SHUTDOWN_FLAG.load(Ordering::SeqCst)
    }
}

extern "C" fn on_restart(_: libc::c_int) {
    RESTART_FLAG.store(true, Ordering::SeqCst);
}

extern "C" fn on_rotate(_: libc::c_int) {
    ROTATE_FLAG.store(true, Ordering::SeqCst);
}

extern "C" fn on_shutdown(_: libc::c_int) {
    SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
}

/// Installs SIGHUP (restart), SIGUSR1 (rotate all), SIGQUIT (shutdown),
/// and, only in foreground mode, SIGINT (shutdown). Daemonized mode blocks
/// SIGINT instead so a stray terminal Ctrl-C doesn't kill the daemon.
pub fn install_handlers(foreground: bool) -> Result<(), ProcessError> {
    let action = |handler: extern "C" fn(libc::c_int)| {
        SigAction::new(SigHandler::Handler(handler), SaFlags::SA_RESTART, SigSet::empty())
    };

    unsafe {
        signal::sigaction(Signal::SIGHUP, &action(on_restart)).map_err(|source| ProcessError::Signal { source })?;
        signal::sigaction(Signal::SIGUSR1, &action(on_rotate)).map_err(|source| ProcessError::Signal { source })?;
        signal::sigaction(Signal::SIGQUIT, &action(on_shutdown)).map_err(|source| ProcessError::Signal { source })?;
    }

    if foreground {
        unsafe {
            signal::sigaction(Signal::SIGINT, &action(on_shutdown)).map_err(|source| ProcessError::Signal { source })?;
        }
    } else {
        let mut blocked = SigSet::empty();
        blocked.add(Signal::SIGINT);
        signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&blocked), None)
            .map_err(|source| ProcessError::Signal { source })?;
    }
    Ok(())
}

/// Forks, detaches from the controlling terminal, and redirects
/// stdin/stdout to `/dev/null`. stderr is left alone so the logging layer
/// can still write to it (or to a file, if redirected by the shell).
pub fn daemonize() -> Result<(), ProcessError> {
    match unsafe { unistd::fork() }.map_err(|source| ProcessError::Fork { source })? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    unistd::setsid().map_err(|source| ProcessError::Setsid { source })?;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|source| ProcessError::Redirect { source })?;
    use std::os::fd::AsRawFd;
    let null_fd = devnull.as_raw_fd();
    unistd::dup2(null_fd, libc::STDIN_FILENO).map_err(|_| ProcessError::Redirect {
        source: std::io::Error::last_os_error(),
    })?;
    unistd::dup2(null_fd, libc::STDOUT_FILENO).map_err(|_| ProcessError::Redirect {
        source: std::io::Error::last_os_error(),
    })?;
    Ok(())
}

/// A copy-on-entry snapshot of argv/envp, so `execve` during restart sees
/// a stable argument vector even if the running process mutated its own
/// `args_os()`/environment in the interim (it doesn't today, but the
/// snapshot is what `proc.c` relied on and costs nothing to keep).
pub struct ArgvSnapshot {
    argv: Vec<CString>,
}

static SNAPSHOT: OnceLock<ArgvSnapshot> = OnceLock::new();

impl ArgvSnapshot {
    pub fn capture() -> &'static ArgvSnapshot {
        SNAPSHOT.get_or_init(|| {
            let argv = std::env::args()
                .map(|a| CString::new(a).unwrap_or_default())
                .collect();
            ArgvSnapshot { argv }
        })
    }

    /// Re-executes the current binary with the captured argv plus
    /// `extra_args` appended (used to add `-x` marking a restarted child),
    /// replacing this process image.
    pub fn exec_with(&self, extra_args: &[&str]) -> Result<(), ProcessError> {
        let exe = std::env::current_exe().map_err(|source| ProcessError::Redirect { source })?;
        let exe_c = CString::new(exe.to_string_lossy().into_owned()).unwrap_or_default();

        let mut args = self.argv.clone();
        for extra in extra_args {
            args.push(CString::new(*extra).unwrap_or_default());
        }

        unistd::execv(&exe_c, &args).map_err(|source| ProcessError::Exec { source })?;
        unreachable!("execv only returns on error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_flags_latch_and_clear_on_read() {
        RESTART_FLAG.store(true, Ordering::SeqCst);
        assert!(SignalFlags::restart_requested());
        assert!(!SignalFlags::restart_requested());
    }
}
