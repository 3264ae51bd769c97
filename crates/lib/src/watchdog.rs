//! Abortable execution of external tools. The child runs in its own process
//! group; the parent polls completion, the abort flag and the timeout once a
//! second, and a cancelled child is killed group-wide so grandchildren do
//! not leak.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rustix::process::{Pid, Signal};

use crate::abort::{AbortHandle, AbortRequested};

/// How often every cancellation point is polled.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The child was killed because it exceeded its deadline.
#[derive(Debug, thiserror::Error)]
#[error("child process timed out after {0:?}")]
pub struct ChildTimedOut(pub Duration);

/// The watchdogged child exited with a failure.
#[derive(Debug, thiserror::Error)]
#[error("child process exited with error: {0}")]
pub struct ChildFailed(pub String);

fn kill_group(pid: u32) {
    if let Some(pid) = Pid::from_raw(pid as i32) {
        if let Err(e) = rustix::process::kill_process_group(pid, Signal::KILL) {
            tracing::warn!("failed to kill process group {pid:?}: {e}");
        }
    }
}

/// Reap a killed child; bounded, since an unkillable child (e.g. stuck in
/// uninterruptible I/O) must not wedge the worker forever.
fn reap(child: &mut std::process::Child) {
    for _ in 0..10 {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => std::thread::sleep(Duration::from_secs(2)),
            Err(e) => {
                tracing::warn!("waiting for killed child: {e}");
                return;
            }
        }
    }
    tracing::warn!("wait for child completion timed out");
}

/// Run `cmd` to completion, returning its stdout. On abort or timeout the
/// whole child process group is SIGKILLed, reaped, and a typed error is
/// returned ([`AbortRequested`] propagates unchanged so cancellation remains
/// distinguishable upstream).
pub fn run_abortable(
    cmd: &mut Command,
    abort: &AbortHandle,
    timeout: Option<Duration>,
) -> Result<String> {
    abort.checkpoint()?;
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.process_group(0);
    let mut child = cmd.spawn().context("spawning watchdogged child")?;
    let pid = child.id();
    let start = Instant::now();
    loop {
        match child.try_wait()? {
            Some(st) => {
                let mut stdout = String::new();
                let mut stderr = String::new();
                if let Some(mut f) = child.stdout.take() {
                    let _ = f.read_to_string(&mut stdout);
                }
                if let Some(mut f) = child.stderr.take() {
                    let _ = f.read_to_string(&mut stderr);
                }
                if !st.success() {
                    tracing::info!("child failed: {}", stderr.trim());
                    return Err(ChildFailed(format!("{st}: {}", stderr.trim())).into());
                }
                tracing::debug!("child process completed successfully");
                return Ok(stdout);
            }
            None => {
                if abort.aborting() {
                    kill_group(pid);
                    reap(&mut child);
                    return Err(AbortRequested.into());
                }
                if let Some(t) = timeout {
                    if start.elapsed() > t {
                        kill_group(pid);
                        reap(&mut child);
                        return Err(ChildTimedOut(t).into());
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Sleep for `duration`, waking once per poll interval to honor abort.
pub fn abortable_sleep(duration: Duration, abort: &AbortHandle) -> Result<()> {
    let start = Instant::now();
    while start.elapsed() < duration {
        abort.checkpoint()?;
        let remaining = duration - start.elapsed();
        std::thread::sleep(remaining.min(POLL_INTERVAL));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::{is_abort, FLAG_ABORT};
    use crate::config::RuntimeDirs;
    use camino::Utf8PathBuf;

    fn abort_handle() -> (tempfile::TempDir, AbortHandle) {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        (td, AbortHandle::new(&RuntimeDirs::under(&base), "sr"))
    }

    #[test]
    fn test_run_abortable_success() {
        let (_td, abort) = abort_handle();
        let out = run_abortable(Command::new("echo").arg("ran-ok"), &abort, None).unwrap();
        assert_eq!(out.trim(), "ran-ok");
    }

    #[test]
    fn test_run_abortable_failure() {
        let (_td, abort) = abort_handle();
        let e = run_abortable(
            Command::new("/bin/sh").args(["-c", "echo nope 1>&2; exit 3"]),
            &abort,
            None,
        )
        .unwrap_err();
        let failed = e.downcast_ref::<ChildFailed>().unwrap();
        assert!(failed.0.contains("nope"), "{failed}");
    }

    #[test]
    fn test_run_abortable_pending_abort() {
        let (_td, abort) = abort_handle();
        abort.flags().set(FLAG_ABORT, false).unwrap();
        let e = run_abortable(Command::new("sleep").arg("60"), &abort, None).unwrap_err();
        assert!(is_abort(&e));
    }

    #[test]
    fn test_abortable_sleep() {
        let (_td, abort) = abort_handle();
        abortable_sleep(Duration::from_millis(10), &abort).unwrap();
        abort.flags().set(FLAG_ABORT, false).unwrap();
        let e = abortable_sleep(Duration::from_secs(30), &abort).unwrap_err();
        assert!(is_abort(&e));
    }
}
