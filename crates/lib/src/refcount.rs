//! Per-VDI reference counters, consumed as an opaque primitive by the LV
//! back-end. Each (namespace, uuid) pair maps to a `(count, binary)` pair
//! persisted as one small file.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

#[derive(Debug, Clone)]
pub struct RefCounter {
    dir: Utf8PathBuf,
}

impl RefCounter {
    pub fn new(base: &camino::Utf8Path, namespace: &str) -> Self {
        Self {
            dir: base.join(namespace),
        }
    }

    fn path(&self, uuid: &str) -> Utf8PathBuf {
        self.dir.join(uuid)
    }

    /// Current `(count, binary)` for `uuid`; missing means (0, 0).
    pub fn check(&self, uuid: &str) -> Result<(u64, u64)> {
        let Some(raw) = vhdgc_utils::read_optional_string(&self.path(uuid))? else {
            return Ok((0, 0));
        };
        let mut it = raw.split_whitespace();
        let count = it.next().unwrap_or("0").parse().context("parsing refcount")?;
        let binary = it.next().unwrap_or("0").parse().context("parsing binary refcount")?;
        Ok((count, binary))
    }

    pub fn set(&self, uuid: &str, count: u64, binary: u64) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir))?;
        vhdgc_utils::replace_file_contents(&self.path(uuid), format!("{count} {binary}").as_bytes())
    }

    /// Drop the counter entirely.
    pub fn reset(&self, uuid: &str) -> Result<()> {
        match std::fs::remove_file(self.path(uuid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("resetting refcount for {uuid}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refcounter() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        let rc = RefCounter::new(&base, "lvm-some-sr");
        assert_eq!(rc.check("a").unwrap(), (0, 0));
        rc.set("a", 3, 1).unwrap();
        assert_eq!(rc.check("a").unwrap(), (3, 1));
        rc.set("a", 0, 0).unwrap();
        assert_eq!(rc.check("a").unwrap(), (0, 0));
        rc.reset("a").unwrap();
        rc.reset("a").unwrap();
        assert_eq!(rc.check("a").unwrap(), (0, 0));
    }
}
