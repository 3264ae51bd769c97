//! Cooperative cancellation: a per-SR abort flag raised by the external
//! abort API, plus a process-wide termination flag set on SIGTERM.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

use crate::config::RuntimeDirs;

/// The only flag kind the engine itself raises.
pub const FLAG_ABORT: &str = "abort";

static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Record that the process was asked to terminate (SIGTERM).
pub fn request_term() {
    TERM_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn term_requested() -> bool {
    TERM_REQUESTED.load(Ordering::SeqCst)
}

/// The distinct unwind channel for cancellation. Detected via
/// [`is_abort`] at the outer loop so an aborted candidate is retried on the
/// next run instead of landing on the failed-targets list.
#[derive(Debug, thiserror::Error)]
#[error("aborting GC/coalesce due to signal")]
pub struct AbortRequested;

/// Returns true if the error (at any level of its chain) is a cancellation.
pub fn is_abort(e: &anyhow::Error) -> bool {
    e.chain().any(|c| c.downcast_ref::<AbortRequested>().is_some())
}

/// Named flag files shared between the worker and the abort API.
#[derive(Debug, Clone)]
pub struct IpcFlags {
    dir: Utf8PathBuf,
}

impl IpcFlags {
    pub fn new(dirs: &RuntimeDirs, sr_uuid: &str) -> Self {
        Self {
            dir: dirs.ipc_flag_dir(sr_uuid),
        }
    }

    fn flag_path(&self, name: &str) -> Utf8PathBuf {
        self.dir.join(name)
    }

    /// Raise the flag. With `soft`, refuse (returning false) if it is
    /// already raised.
    pub fn set(&self, name: &str, soft: bool) -> Result<bool> {
        if soft && self.test(name) {
            return Ok(false);
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir))?;
        std::fs::write(self.flag_path(name), b"1")
            .with_context(|| format!("raising flag {name}"))?;
        Ok(true)
    }

    pub fn test(&self, name: &str) -> bool {
        self.flag_path(name).exists()
    }

    pub fn clear(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.flag_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("clearing flag {name}")),
        }
    }
}

/// Handle polled at every cancellation point.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flags: IpcFlags,
}

impl AbortHandle {
    pub fn new(dirs: &RuntimeDirs, sr_uuid: &str) -> Self {
        Self {
            flags: IpcFlags::new(dirs, sr_uuid),
        }
    }

    pub fn flags(&self) -> &IpcFlags {
        &self.flags
    }

    /// True if an abort or process termination was requested.
    pub fn aborting(&self) -> bool {
        term_requested() || self.flags.test(FLAG_ABORT)
    }

    /// Bail with [`AbortRequested`] if cancellation is pending.
    pub fn checkpoint(&self) -> Result<()> {
        if self.aborting() {
            return Err(AbortRequested.into());
        }
        Ok(())
    }
}
