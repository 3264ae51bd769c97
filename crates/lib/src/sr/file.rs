//! The file back-end: VDIs are `<uuid>.vhd` / `<uuid>.raw` files on a
//! mounted filesystem (EXT or NFS).

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::abort::AbortHandle;
use crate::config::RuntimeDirs;
use crate::control::Session;
use crate::journal::Journaler;
use crate::locks::FileLock;
use crate::sr::SrDriver;
use crate::tap;
use crate::tree::Forest;
use crate::vdi::{config_keys, Vdi, TMP_RENAME_PREFIX, UUID_LEN};

use vhdgc_vhd::{FILE_EXTN_RAW, FILE_EXTN_VHD};

const CACHE_FILE_EXT: &str = ".vhdcache";
/// The plugin slaves run to confirm a file is unused before deletion.
const PLUGIN_NFS_CHECK: &str = "nfs-on-slave";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheAction {
    Keep,
    Remove,
    RemoveIfInactive,
}

#[derive(Debug)]
pub struct FileSr {
    session: Session,
    sr_uuid: String,
    sr_type: String,
    path: Utf8PathBuf,
    dirs: RuntimeDirs,
    abort: AbortHandle,
}

pub fn extract_uuid(name: &str) -> Option<String> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let uuid = base
        .strip_suffix(FILE_EXTN_VHD)
        .or_else(|| base.strip_suffix(FILE_EXTN_RAW))?;
    let plain = uuid.strip_prefix(TMP_RENAME_PREFIX).unwrap_or(uuid);
    (plain.len() == UUID_LEN).then(|| uuid.to_string())
}

impl FileSr {
    pub fn new(
        session: Session,
        sr_uuid: &str,
        record: &crate::control::SrRecord,
        dirs: &RuntimeDirs,
    ) -> Self {
        Self {
            session,
            sr_uuid: sr_uuid.to_string(),
            sr_type: record.ty.clone(),
            path: dirs.sr_mountpoint(sr_uuid),
            dirs: dirs.clone(),
            abort: AbortHandle::new(dirs, sr_uuid),
        }
    }

    /// Construct against an explicit mountpoint; used by tests.
    pub fn at(session: Session, sr_uuid: &str, sr_type: &str, path: &Utf8Path, dirs: &RuntimeDirs) -> Self {
        Self {
            session,
            sr_uuid: sr_uuid.to_string(),
            sr_type: sr_type.to_string(),
            path: path.to_path_buf(),
            dirs: dirs.clone(),
            abort: AbortHandle::new(dirs, sr_uuid),
        }
    }

    fn node_from_info(&self, uuid: &str, info: &vhdgc_vhd::VhdInfo) -> Vdi {
        let file_name = format!("{uuid}{FILE_EXTN_VHD}");
        Vdi {
            uuid: uuid.to_string(),
            path: self.path.join(&file_name),
            file_name,
            raw: false,
            hidden: info.hidden,
            scan_error: info.error,
            size_virt: info.size_virt,
            size_phys: (!info.error).then_some(info.size_phys),
            size_allocated: None,
            parent_uuid: info.parent_uuid.clone(),
            children: Vec::new(),
            lv: None,
        }
    }

    /// Confirm with every other attached host that the file is unused.
    /// Failures from hosts the control plane believes offline are ignored.
    fn check_slaves(&self, vdi: &Vdi, abort: &AbortHandle) -> Result<()> {
        let online = self.session.online_hosts()?;
        for binding in self.session.attached_hosts(&self.sr_uuid)? {
            if binding.local {
                continue;
            }
            abort.checkpoint()?;
            let mut args = BTreeMap::new();
            args.insert("path".to_string(), vdi.path.to_string());
            tracing::debug!("checking {} with slave {}", vdi.uuid, binding.host);
            if let Err(e) =
                self.session
                    .call_plugin(&binding.host, PLUGIN_NFS_CHECK, "check", &args)
            {
                if online.contains(&binding.host) {
                    return Err(e);
                }
                tracing::warn!("ignoring check failure on offline host {}: {e}", binding.host);
            }
        }
        Ok(())
    }

    fn is_cache_file_name(name: &str) -> bool {
        name.len() == UUID_LEN + CACHE_FILE_EXT.len() && name.ends_with(CACHE_FILE_EXT)
    }

    fn cache_action(&self, uuid: &str, cache_path: &Utf8Path, max_age_hours: i64) -> Result<CacheAction> {
        let Some(rec) = self.session.vdi_record(uuid)? else {
            tracing::info!("cache {uuid}: VDI doesn't exist");
            return Ok(CacheAction::Remove);
        };
        if rec.managed && !rec.allow_caching {
            tracing::info!("cache {uuid}: caching disabled");
            return Ok(CacheAction::Remove);
        }
        if !rec.managed && max_age_hours >= 0 {
            let age = std::fs::metadata(cache_path.as_std_path())
                .and_then(|m| m.accessed())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or(Duration::ZERO);
            if age > Duration::from_secs(max_age_hours as u64 * 3600) {
                tracing::info!("cache {uuid}: older than {max_age_hours} hrs");
                return Ok(CacheAction::RemoveIfInactive);
            }
        }
        Ok(CacheAction::Keep)
    }

    fn sweep_one(&self, uuid: &str, action: CacheAction) -> Result<bool> {
        assert!(action != CacheAction::Keep);
        if let Some(rec) = self.session.vdi_record(uuid)? {
            if rec.allow_caching {
                tracing::info!("cache {uuid} appears to have become valid");
                return Ok(false);
            }
        }
        let full_path = self.path.join(format!("{uuid}{CACHE_FILE_EXT}"));
        if tap::find_by_path(&full_path)?.is_some() {
            if action == CacheAction::RemoveIfInactive {
                tracing::info!("cache {uuid} still in use");
                return Ok(false);
            }
            tracing::info!("shutting down tapdisk for {full_path}");
            tap::shutdown(&full_path)?;
        }
        tracing::info!("deleting file {full_path}");
        std::fs::remove_file(full_path.as_std_path())?;
        Ok(true)
    }
}

impl SrDriver for FileSr {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn path(&self) -> &Utf8Path {
        &self.path
    }

    #[context("Scanning file SR")]
    fn scan_once(&mut self) -> Result<(BTreeMap<String, Vdi>, bool)> {
        anyhow::ensure!(self.path.exists(), "directory {} not found", self.path);
        let pattern = format!("{}/*{FILE_EXTN_VHD}", self.path);
        let vhds = vhdgc_vhd::scan(&pattern, extract_uuid)?;
        let mut errors = false;
        let mut nodes = BTreeMap::new();
        for (uuid, info) in &vhds {
            errors |= info.error;
            nodes.insert(uuid.clone(), self.node_from_info(uuid, info));
        }
        // raw images carry no VHD metadata; they are visible leaf-only roots
        for ent in self.path.read_dir_utf8().with_context(|| format!("listing {}", self.path))? {
            let ent = ent?;
            let name = ent.file_name();
            if !name.ends_with(FILE_EXTN_RAW) {
                continue;
            }
            let Some(uuid) = extract_uuid(name) else {
                continue;
            };
            let size = ent.metadata().map(|m| m.len()).unwrap_or(0);
            nodes.insert(
                uuid.clone(),
                Vdi {
                    uuid: uuid.clone(),
                    file_name: name.to_string(),
                    path: self.path.join(name),
                    raw: true,
                    size_virt: size,
                    size_phys: Some(size),
                    ..Default::default()
                },
            );
        }
        Ok((nodes, errors))
    }

    fn free_space(&self) -> Result<u64> {
        let st = rustix::fs::statvfs(self.path.as_std_path())
            .with_context(|| format!("statvfs {}", self.path))?;
        Ok(st.f_bavail * st.f_bsize)
    }

    fn vdi_file_name(&self, uuid: &str, raw: bool) -> String {
        let ext = if raw { FILE_EXTN_RAW } else { FILE_EXTN_VHD };
        format!("{uuid}{ext}")
    }

    fn vdi_path(&self, uuid: &str, raw: bool) -> Utf8PathBuf {
        self.path.join(self.vdi_file_name(uuid, raw))
    }

    fn destroy_vdi(&mut self, vdi: &Vdi, abort: &AbortHandle) -> Result<()> {
        self.check_slaves(vdi, abort)?;
        std::fs::remove_file(vdi.path.as_std_path())
            .with_context(|| format!("unlinking {}", vdi.path))
    }

    fn rename_vdi(&mut self, vdi: &Vdi, new_uuid: &str) -> Result<String> {
        let new_name = self.vdi_file_name(new_uuid, vdi.raw);
        let new_path = self.path.join(&new_name);
        anyhow::ensure!(!new_path.exists(), "rename target {new_path} exists");
        tracing::info!("renaming {} -> {new_path}", vdi.path);
        std::fs::rename(vdi.path.as_std_path(), new_path.as_std_path())
            .with_context(|| format!("renaming {}", vdi.path))?;
        Ok(new_name)
    }

    fn pause_vdi(&self, vdi: &Vdi, _failfast: bool) -> Result<()> {
        tap::pause(&vdi.path).with_context(|| format!("failed to pause VDI {}", vdi.uuid))
    }

    fn unpause_vdi(&self, vdi: &Vdi) -> Result<()> {
        tap::unpause(&vdi.path, None).with_context(|| format!("failed to unpause VDI {}", vdi.uuid))
    }

    fn refresh_vdi(&self, vdi: &Vdi) -> Result<()> {
        tap::pause(&vdi.path)?;
        tap::unpause(&vdi.path, Some(&vdi.path))
            .with_context(|| format!("failed to refresh VDI {}", vdi.uuid))
    }

    fn load_phys_size(&mut self, vdi: &Vdi) -> Result<u64> {
        if vdi.raw {
            return Ok(std::fs::metadata(vdi.path.as_std_path())?.len());
        }
        vhdgc_vhd::get_size_phys(&vdi.path)
    }

    fn load_allocated_size(&mut self, vdi: &Vdi) -> Result<u64> {
        if vdi.raw {
            return Ok(std::fs::metadata(vdi.path.as_std_path())?.len());
        }
        vhdgc_vhd::get_allocated_size(&vdi.path)
    }

    fn prepare_coalesce(&mut self, _forest: &Forest, _child: &str, _size_data: u64) -> Result<()> {
        Ok(())
    }

    fn finish_coalesce(&mut self, _forest: &mut Forest, _child: &str) -> Result<()> {
        Ok(())
    }

    fn set_parent_on_disk(&mut self, child: &Vdi, parent: &Vdi) -> Result<()> {
        vhdgc_vhd::set_parent(&child.path, &parent.path, parent.raw)
    }

    fn set_hidden_on_disk(&mut self, vdi: &Vdi, hidden: bool) -> Result<()> {
        vhdgc_vhd::set_hidden(&vdi.path, hidden)
    }

    fn resize_journaled(&mut self, vdi: &Vdi, size: u64) -> Result<()> {
        // the resize journal lives next to the image, named by uuid
        let journal = self.path.join(&vdi.uuid);
        vhdgc_vhd::set_size_virt(&vdi.path, size, &journal)
    }

    fn grow_raw(
        &mut self,
        _journal: &dyn Journaler,
        vdi: &Vdi,
        _size: u64,
        _abort: &AbortHandle,
    ) -> Result<u64> {
        anyhow::bail!("cannot grow raw image {} on a file SR", vdi.uuid)
    }

    fn extra_space_for_coalesce(
        &mut self,
        forest: &Forest,
        child: &str,
        size_data: u64,
    ) -> Result<u64> {
        let v = forest.get(child).context("candidate vanished")?;
        let parent = forest.parent(child).context("candidate has no parent")?;
        let size_coalesced = size_data
            + vhdgc_vhd::calc_overhead_bitmap(size_data)
            + vhdgc_vhd::calc_overhead_empty(v.size_virt);
        tracing::debug!("coalesced size = {size_coalesced}");
        let parent_phys = match parent.size_phys {
            Some(p) => p,
            None => self.load_phys_size(parent)?,
        };
        Ok(size_coalesced.saturating_sub(parent_phys))
    }

    fn extra_space_for_leaf_coalesce(
        &mut self,
        forest: &Forest,
        child: &str,
        size_data: u64,
    ) -> Result<u64> {
        // same requirements as the inline case
        self.extra_space_for_coalesce(forest, child, size_data)
    }

    fn extra_space_for_snapshot_coalesce(
        &mut self,
        forest: &Forest,
        child: &str,
        size_data: u64,
    ) -> Result<u64> {
        let v = forest.get(child).context("candidate vanished")?;
        let extra_leaf = vhdgc_vhd::calc_overhead_empty(v.size_virt);
        Ok(self.extra_space_for_coalesce(forest, child, size_data)? + extra_leaf)
    }

    fn prepare_coalesce_leaf(&mut self, _forest: &Forest, _child: &str, _size_data: u64) -> Result<()> {
        Ok(())
    }

    fn update_node_leaf(&mut self, _child: &Vdi, _parent: &Vdi) -> Result<()> {
        Ok(())
    }

    fn finish_coalesce_leaf(&mut self, _forest: &mut Forest, _survivor: &str) -> Result<()> {
        Ok(())
    }

    fn extra_space_after_leaf(
        &mut self,
        forest: &Forest,
        child: &str,
        parent: &str,
    ) -> Result<u64> {
        let c = forest.get(child).context("child vanished")?;
        let p = forest.get(parent).context("survivor vanished")?;
        let c_phys = match c.size_phys {
            Some(v) => v,
            None => self.load_phys_size(c)?,
        };
        let p_phys = match p.size_phys {
            Some(v) => v,
            None => self.load_phys_size(p)?,
        };
        Ok(c_phys.saturating_sub(p_phys))
    }

    fn leaf_parts_present(&mut self, child_uuid: &str, parent_uuid: &str) -> Result<(bool, bool)> {
        let parent_present = self.vdi_path(parent_uuid, false).exists()
            || self.vdi_path(parent_uuid, true).exists();
        let old_child = self
            .path
            .join(format!("{TMP_RENAME_PREFIX}{child_uuid}{FILE_EXTN_VHD}"))
            .exists();
        Ok((parent_present, old_child))
    }

    fn undo_leaf_backend(
        &mut self,
        _forest: &Forest,
        _child: &str,
        _parent: &str,
        _counts: Option<(u64, u64)>,
    ) -> Result<()> {
        Ok(())
    }

    fn finish_leaf_backend(&mut self, _forest: &Forest, _child: &str) -> Result<()> {
        Ok(())
    }

    fn update_slaves_on_rename(&mut self, _vdi: &Vdi, _old: &str, _orig_parent: &str) -> Result<()> {
        Ok(())
    }

    fn update_slaves_on_resize(&mut self, _forest: &Forest, _uuid: &str) -> Result<()> {
        Ok(())
    }

    fn update_slaves_on_undo_leaf(&mut self, _forest: &Forest, _parent: &str, _child: &str) -> Result<()> {
        Ok(())
    }

    /// Sweep stale per-VDI read-cache files. Caches for managed leaves go
    /// when caching is off or the VDI is gone; caches for parent nodes go
    /// when unused for more than `max_age_hours`.
    #[context("Cleaning up cache files")]
    fn cleanup_cache(&mut self, max_age_hours: i64) -> Result<usize> {
        let mut removed = 0;
        let mut cache_files = Vec::new();
        for ent in self.path.read_dir_utf8()? {
            let ent = ent?;
            if Self::is_cache_file_name(ent.file_name()) {
                cache_files.push(ent.file_name().to_string());
            }
        }
        tracing::info!("found {} cache files", cache_files.len());
        for name in cache_files {
            let uuid = name.trim_end_matches(CACHE_FILE_EXT).to_string();
            let cache_path = self.path.join(&name);
            let action = self.cache_action(&uuid, &cache_path, max_age_hours)?;
            if action == CacheAction::Keep {
                tracing::debug!("keeping cache {uuid}");
                continue;
            }
            // lock against concurrent cache setup, keyed by the parent for
            // parent-node caches
            let lock_id = match self.session.vdi_record(&uuid)? {
                Some(rec) if rec.managed => rec
                    .sm_config
                    .get(config_keys::VHD_PARENT)
                    .cloned()
                    .unwrap_or(uuid.clone()),
                _ => uuid.clone(),
            };
            let mut lock = FileLock::new(
                &self.dirs.lock_dir(&self.sr_uuid),
                &format!("cache-{lock_id}"),
            );
            lock.acquire(crate::locks::LOCK_RETRY_ATTEMPTS, &self.abort)?;
            let r = self.sweep_one(&uuid, action);
            lock.release();
            if r? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn after_delete(&mut self, deleted_root: bool) -> Result<()> {
        if deleted_root && self.sr_type == "nfs" {
            tracing::info!("a tree root was deleted on NFS, marking cache SRs dirty");
            self.session.mark_cache_srs_dirty()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_uuid() {
        assert_eq!(
            extract_uuid("33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e.vhd").as_deref(),
            Some("33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e")
        );
        assert_eq!(
            extract_uuid("/run/sr-mount/sr/33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e.raw").as_deref(),
            Some("33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e")
        );
        // interrupted-coalesce residue keeps its prefix
        assert_eq!(
            extract_uuid("OLD_33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e.vhd").as_deref(),
            Some("OLD_33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e")
        );
        assert_eq!(extract_uuid("33a1fb37.vhd"), None);
        assert_eq!(extract_uuid("33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e.vhdcache"), None);
    }

    #[test]
    fn test_is_cache_file_name() {
        assert!(FileSr::is_cache_file_name(
            "33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e.vhdcache"
        ));
        assert!(!FileSr::is_cache_file_name("33a1fb37.vhdcache"));
        assert!(!FileSr::is_cache_file_name(
            "33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e.vhd"
        ));
    }
}
