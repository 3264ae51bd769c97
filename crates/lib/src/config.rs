//! Filesystem layout of the per-SR transient state.

use camino::{Utf8Path, Utf8PathBuf};

/// Base directories for all transient per-SR state. The defaults are the
/// production layout; tests point everything at a temporary directory.
#[derive(Debug, Clone)]
pub struct RuntimeDirs {
    /// Where file-based SRs are mounted (`<sr_mount>/<sr-uuid>`).
    pub sr_mount: Utf8PathBuf,
    /// Transient run dir (speed logs).
    pub run: Utf8PathBuf,
    /// Non-persistent SM state (gc-ready indicator, IPC flags).
    pub nonpersistent: Utf8PathBuf,
    /// File locks.
    pub lock: Utf8PathBuf,
    /// Reference counters.
    pub refcount: Utf8PathBuf,
}

impl Default for RuntimeDirs {
    fn default() -> Self {
        Self {
            sr_mount: "/run/sr-mount".into(),
            run: "/run".into(),
            nonpersistent: "/run/nonpersistent/sm".into(),
            lock: "/run/lock/sm".into(),
            refcount: "/run/sm/refcount".into(),
        }
    }
}

impl RuntimeDirs {
    /// Root every location under `base`; used by tests.
    pub fn under(base: &Utf8Path) -> Self {
        Self {
            sr_mount: base.join("sr-mount"),
            run: base.join("run"),
            nonpersistent: base.join("nonpersistent"),
            lock: base.join("lock"),
            refcount: base.join("refcount"),
        }
    }

    pub fn sr_mountpoint(&self, sr_uuid: &str) -> Utf8PathBuf {
        self.sr_mount.join(sr_uuid)
    }

    pub fn speed_log(&self, sr_uuid: &str) -> Utf8PathBuf {
        self.run.join(format!("{sr_uuid}.speed_log"))
    }

    /// Written once the worker has completed its first scan; callers that
    /// want to wait for a live worker poll for this.
    pub fn gc_init_file(&self, sr_uuid: &str) -> Utf8PathBuf {
        self.nonpersistent.join(sr_uuid).join("gc_init")
    }

    pub fn ipc_flag_dir(&self, sr_uuid: &str) -> Utf8PathBuf {
        self.nonpersistent.join(sr_uuid).join("flags")
    }

    pub fn lock_dir(&self, sr_uuid: &str) -> Utf8PathBuf {
        self.lock.join(sr_uuid)
    }
}
