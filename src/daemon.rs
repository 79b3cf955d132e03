//! Startup/shutdown plumbing: log sink initialization, the advisory
//! lock file, and signal disposition. None of this has a direct teacher
//! counterpart — the teacher's `src/bin/main.rs` only ever loaded a YAML
//! file and never reached a working event loop — so it's built straight
//! from the external-interface contract, using the crates the rest of
//! the pack reaches for to do the same jobs.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing_appender::non_blocking::WorkerGuard;

use crate::error::LisoError;

/// Holds the lock file open for the lifetime of the process; dropping it
/// releases the advisory lock.
pub struct LockGuard {
    _file: std::fs::File,
}

/// Acquire the advisory lock at `path`, returning `Ok(None)` if another
/// instance already holds it (the caller should then exit 0 rather than
/// treat this as an error).
pub fn acquire_lock(path: &Path) -> Result<Option<LockGuard>, LisoError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .map_err(LisoError::Io)?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(Some(LockGuard { _file: file }))
    } else {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(LisoError::Io(err))
        }
    }
}

/// Initialize the `tracing` subscriber to append structured, human
/// readable lines to `log_file`. Returns a guard that must be kept alive
/// for the life of the process, or buffered log lines are lost.
pub fn init_logging(log_file: &Path) -> Result<WorkerGuard, LisoError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(LisoError::Io)?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .init();
    Ok(guard)
}

/// Ignore `SIGPIPE` (a write to a half-closed socket should surface as an
/// `EPIPE` `io::Error`, not terminate the process) and `SIGCHLD` (CGI
/// children are reaped explicitly via `try_wait`/`wait`, not via a
/// handler).
pub fn ignore_sigpipe_and_sigchld() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }
}

/// Install a `SIGTERM` handler that flips a flag the event loop polls
/// once per tick, rather than doing teardown work inside the signal
/// handler itself.
pub fn install_sigterm_flag() -> Result<Arc<AtomicBool>, LisoError> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(LisoError::Io)?;
    Ok(flag)
}

#[allow(dead_code)]
fn flag_is_set(flag: &AtomicBool) -> bool {
    flag.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_attempt_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("lisod.lock");
        let first = acquire_lock(&lock_path).unwrap();
        assert!(first.is_some());
        let second = acquire_lock(&lock_path).unwrap();
        assert!(second.is_none());
    }
}
