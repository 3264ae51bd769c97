//! Durable small records keyed by (kind, uuid), used to make every coalesce
//! phase recoverable. Entries are atomic to create and remove, never
//! rewritten in place, and survive crashes and reboots.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalKind {
    /// A coalesce of this VDI has started; consulted by preemption.
    Coalesce,
    /// VHD data copy done; children must be re-pointed to the parent.
    Relink,
    /// A live leaf-coalesce is in flight; value holds the parent UUID and
    /// the pre-swap refcounts.
    Leaf,
    /// Third-party snapshot/clone hint; the GC only prunes dangling entries.
    Clone,
    /// A raw-leaf grow is zero-filling from the recorded offset.
    Zero,
}

impl JournalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalKind::Coalesce => "coalesce",
            JournalKind::Relink => "relink",
            JournalKind::Leaf => "leaf",
            JournalKind::Clone => "clone",
            JournalKind::Zero => "zero",
        }
    }
}

impl fmt::Display for JournalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Journaler: fmt::Debug {
    /// Durably record (kind, uuid) = value. Fails if the entry exists.
    fn create(&self, kind: JournalKind, uuid: &str, value: &str) -> Result<()>;
    fn get(&self, kind: JournalKind, uuid: &str) -> Result<Option<String>>;
    /// Remove an entry; removing a missing entry is an error (it indicates
    /// a protocol bug).
    fn remove(&self, kind: JournalKind, uuid: &str) -> Result<()>;
    /// All entries of one kind, keyed by uuid.
    fn entries(&self, kind: JournalKind) -> Result<BTreeMap<String, String>>;
}

/// Journal for file-based SRs: one file per entry in a dot-directory of the
/// SR mountpoint, named `<kind>_<uuid>`, holding the value.
#[derive(Debug)]
pub struct FileJournaler {
    dir: Utf8PathBuf,
}

impl FileJournaler {
    pub const SUBDIR: &'static str = ".journal";

    pub fn new(sr_path: &Utf8Path) -> Self {
        Self {
            dir: sr_path.join(Self::SUBDIR),
        }
    }

    fn entry_path(&self, kind: JournalKind, uuid: &str) -> Utf8PathBuf {
        self.dir.join(format!("{kind}_{uuid}"))
    }
}

impl Journaler for FileJournaler {
    fn create(&self, kind: JournalKind, uuid: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir))?;
        let path = self.entry_path(kind, uuid);
        anyhow::ensure!(!path.exists(), "journal entry {kind}/{uuid} already exists");
        vhdgc_utils::replace_file_contents(&path, value.as_bytes())
            .with_context(|| format!("writing journal {kind}/{uuid}"))?;
        tracing::debug!("journal: created {kind}/{uuid} = {value}");
        Ok(())
    }

    fn get(&self, kind: JournalKind, uuid: &str) -> Result<Option<String>> {
        vhdgc_utils::read_optional_string(&self.entry_path(kind, uuid))
    }

    fn remove(&self, kind: JournalKind, uuid: &str) -> Result<()> {
        let path = self.entry_path(kind, uuid);
        std::fs::remove_file(&path).with_context(|| format!("removing journal {kind}/{uuid}"))?;
        tracing::debug!("journal: removed {kind}/{uuid}");
        Ok(())
    }

    fn entries(&self, kind: JournalKind) -> Result<BTreeMap<String, String>> {
        let mut r = BTreeMap::new();
        let prefix = format!("{kind}_");
        let iter = match self.dir.read_dir_utf8() {
            Ok(it) => it,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(r),
            Err(e) => return Err(e).with_context(|| format!("listing {}", self.dir)),
        };
        for ent in iter {
            let ent = ent?;
            let name = ent.file_name();
            let Some(uuid) = name.strip_prefix(&prefix) else {
                continue;
            };
            let value = std::fs::read_to_string(ent.path())
                .with_context(|| format!("reading journal {name}"))?;
            r.insert(uuid.to_string(), value);
        }
        Ok(r)
    }
}

/// Journal for LV-based SRs: entries are encoded in the names of small
/// inactive LVs (`jrn_<kind>_<uuid>_<value>`), so a single LVM metadata
/// commit makes them durable. Values must therefore stay within the LVM
/// name alphabet; the engine's payloads (uuids, offsets, dotted refcount
/// triples) all do.
#[derive(Debug)]
pub struct LvmJournaler {
    vg_name: String,
}

impl LvmJournaler {
    const PREFIX: &'static str = "jrn";

    pub fn new(vg_name: &str) -> Self {
        Self {
            vg_name: vg_name.to_string(),
        }
    }

    fn lv_name(kind: JournalKind, uuid: &str, value: &str) -> String {
        format!("{}_{kind}_{uuid}_{value}", Self::PREFIX)
    }

    /// Split `jrn_<kind>_<uuid>_<value>` back into (uuid, value).
    fn parse(name: &str, kind: JournalKind) -> Option<(String, String)> {
        let rest = name.strip_prefix(&format!("{}_{kind}_", Self::PREFIX))?;
        let (uuid, value) = rest.split_once('_')?;
        Some((uuid.to_string(), value.to_string()))
    }

    fn find(&self, kind: JournalKind, uuid: &str) -> Result<Option<(String, String)>> {
        for lv in vhdgc_lvm::list_lvs(&self.vg_name)? {
            if let Some((u, v)) = Self::parse(&lv.name, kind) {
                if u == uuid {
                    return Ok(Some((lv.name, v)));
                }
            }
        }
        Ok(None)
    }
}

impl Journaler for LvmJournaler {
    fn create(&self, kind: JournalKind, uuid: &str, value: &str) -> Result<()> {
        anyhow::ensure!(
            self.find(kind, uuid)?.is_none(),
            "journal entry {kind}/{uuid} already exists"
        );
        let name = Self::lv_name(kind, uuid, value);
        vhdgc_lvm::create(&self.vg_name, &name, vhdgc_lvm::LVM_SIZE_INCREMENT, false)
            .with_context(|| format!("writing journal {kind}/{uuid}"))?;
        tracing::debug!("journal: created {kind}/{uuid} = {value}");
        Ok(())
    }

    fn get(&self, kind: JournalKind, uuid: &str) -> Result<Option<String>> {
        Ok(self.find(kind, uuid)?.map(|(_, v)| v))
    }

    fn remove(&self, kind: JournalKind, uuid: &str) -> Result<()> {
        let (lv_name, _) = self
            .find(kind, uuid)?
            .with_context(|| format!("journal entry {kind}/{uuid} not found"))?;
        vhdgc_lvm::remove(&self.vg_name, &lv_name)?;
        tracing::debug!("journal: removed {kind}/{uuid}");
        Ok(())
    }

    fn entries(&self, kind: JournalKind) -> Result<BTreeMap<String, String>> {
        let mut r = BTreeMap::new();
        for lv in vhdgc_lvm::list_lvs(&self.vg_name)? {
            if let Some((u, v)) = Self::parse(&lv.name, kind) {
                r.insert(u, v);
            }
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "b26dd3c5-4771-4b2b-90b5-7a54a9a25fb7";

    #[test]
    fn test_file_journaler() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        let j = FileJournaler::new(&base);

        assert_eq!(j.get(JournalKind::Relink, UUID).unwrap(), None);
        assert!(j.entries(JournalKind::Relink).unwrap().is_empty());

        j.create(JournalKind::Relink, UUID, "1").unwrap();
        assert_eq!(j.get(JournalKind::Relink, UUID).unwrap().as_deref(), Some("1"));
        // distinct kinds do not alias
        assert_eq!(j.get(JournalKind::Coalesce, UUID).unwrap(), None);
        // double create is a protocol bug
        assert!(j.create(JournalKind::Relink, UUID, "1").is_err());

        let all = j.entries(JournalKind::Relink).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[UUID], "1");

        j.remove(JournalKind::Relink, UUID).unwrap();
        assert_eq!(j.get(JournalKind::Relink, UUID).unwrap(), None);
        assert!(j.remove(JournalKind::Relink, UUID).is_err());
    }

    #[test]
    fn test_lvm_entry_name_roundtrip() {
        let name = LvmJournaler::lv_name(JournalKind::Leaf, UUID, "parent.3.1");
        let (u, v) = LvmJournaler::parse(&name, JournalKind::Leaf).unwrap();
        assert_eq!(u, UUID);
        assert_eq!(v, "parent.3.1");
        assert!(LvmJournaler::parse(&name, JournalKind::Relink).is_none());
        assert!(LvmJournaler::parse("VHD-something", JournalKind::Leaf).is_none());
    }
}
