//! The three per-SR file locks: the SR lock (serializes structural tree
//! mutation), the gc-active lock (one worker at a time) and the gc-running
//! lock (a presence indicator per outer-loop iteration).

use std::fs::File;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use rustix::fs::FlockOperation;

use crate::abort::AbortHandle;

pub const LOCK_SR: &str = "sr";
pub const LOCK_GC_RUNNING: &str = "running";
pub const LOCK_GC_ACTIVE: &str = "gc_active";

pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(3);
pub const LOCK_RETRY_ATTEMPTS: u32 = 20;
pub const LOCK_RETRY_ATTEMPTS_SR: u32 = 100;

/// An advisory lock on a well-known file. Dropping the handle releases it.
#[derive(Debug)]
pub struct FileLock {
    path: Utf8PathBuf,
    held: Option<File>,
}

impl FileLock {
    pub fn new(dir: &Utf8Path, name: &str) -> Self {
        Self {
            path: dir.join(name),
            held: None,
        }
    }

    pub fn held(&self) -> bool {
        self.held.is_some()
    }

    /// Try once; returns false if another process holds the lock.
    pub fn try_acquire(&mut self) -> Result<bool> {
        if self.held.is_some() {
            return Ok(true);
        }
        let dir = self.path.parent().unwrap();
        std::fs::create_dir_all(dir).with_context(|| format!("creating {dir}"))?;
        let f = File::create(&self.path).with_context(|| format!("opening {}", self.path))?;
        match rustix::fs::flock(&f, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {
                self.held = Some(f);
                Ok(true)
            }
            Err(e) if e == rustix::io::Errno::WOULDBLOCK => Ok(false),
            Err(e) => Err(e).with_context(|| format!("locking {}", self.path)),
        }
    }

    /// Retry until acquired, polling the abort flag before every wait.
    pub fn acquire(&mut self, attempts: u32, abort: &AbortHandle) -> Result<()> {
        for _ in 0..attempts {
            if self.try_acquire()? {
                return Ok(());
            }
            abort.checkpoint()?;
            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }
        anyhow::bail!("unable to acquire lock {}", self.path)
    }

    pub fn release(&mut self) {
        // closing the fd drops the flock
        self.held = None;
    }
}

/// The SR lock with nested-acquire support: the worker may re-enter
/// (e.g. refresh inside the relink phase) and only the outermost release
/// drops the lock.
#[derive(Debug)]
pub struct SrLock {
    inner: FileLock,
    depth: u32,
}

impl SrLock {
    pub fn new(dir: &Utf8Path) -> Self {
        Self {
            inner: FileLock::new(dir, LOCK_SR),
            depth: 0,
        }
    }

    pub fn lock(&mut self, abort: &AbortHandle) -> Result<()> {
        if self.depth == 0 {
            self.inner.acquire(LOCK_RETRY_ATTEMPTS_SR, abort)?;
        }
        self.depth += 1;
        Ok(())
    }

    pub fn unlock(&mut self) {
        assert!(self.depth > 0);
        self.depth -= 1;
        if self.depth == 0 {
            self.inner.release();
        }
    }

    pub fn locked(&self) -> bool {
        self.depth > 0
    }
}

/// The one-worker-at-a-time gate. Acquiring it transiently takes the SR
/// lock first: a holder of the SR lock may be trying to abort us, and
/// grabbing gc-active while it waits would deadlock.
#[derive(Debug)]
pub struct GcActiveLock {
    active: FileLock,
    sr: FileLock,
}

impl GcActiveLock {
    pub fn new(dir: &Utf8Path) -> Self {
        Self {
            active: FileLock::new(dir, LOCK_GC_ACTIVE),
            sr: FileLock::new(dir, LOCK_SR),
        }
    }

    pub fn try_acquire(&mut self, abort: &AbortHandle) -> Result<bool> {
        self.sr.acquire(LOCK_RETRY_ATTEMPTS_SR, abort)?;
        let r = self.active.try_acquire();
        self.sr.release();
        r
    }

    pub fn release(&mut self) {
        self.active.release();
    }

    pub fn held(&self) -> bool {
        self.active.held()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeDirs;

    fn lockdir() -> (tempfile::TempDir, Utf8PathBuf, AbortHandle) {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        let dirs = RuntimeDirs::under(&base);
        let abort = AbortHandle::new(&dirs, "sr");
        (td, dirs.lock_dir("sr"), abort)
    }

    #[test]
    fn test_file_lock() {
        let (_td, dir, _abort) = lockdir();
        let mut a = FileLock::new(&dir, LOCK_GC_RUNNING);
        assert!(!a.held());
        assert!(a.try_acquire().unwrap());
        assert!(a.held());
        // re-acquiring our own lock is a no-op
        assert!(a.try_acquire().unwrap());
        a.release();
        assert!(!a.held());
        assert!(a.try_acquire().unwrap());
    }

    #[test]
    fn test_sr_lock_nesting() {
        let (_td, dir, abort) = lockdir();
        let mut l = SrLock::new(&dir);
        l.lock(&abort).unwrap();
        l.lock(&abort).unwrap();
        assert!(l.locked());
        l.unlock();
        assert!(l.locked());
        l.unlock();
        assert!(!l.locked());
    }

    #[test]
    fn test_gc_active() {
        let (_td, dir, abort) = lockdir();
        let mut g = GcActiveLock::new(&dir);
        assert!(g.try_acquire(&abort).unwrap());
        assert!(g.held());
        g.release();
        assert!(!g.held());
    }
}
