//! The per-SR engine state and the back-end capability set. The two
//! back-ends (file and logical-volume) share all engine logic and differ
//! only in scanning, free-space queries and the allocation mechanics
//! wrapped around each coalesce.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::abort::AbortHandle;
use crate::config::RuntimeDirs;
use crate::control::{ConfigMap, Session, MSG_PRIORITY_WARNING};
use crate::journal::{JournalKind, Journaler};
use crate::locks::SrLock;
use crate::speed::SpeedLog;
use crate::tree::{Forest, TreeLogFilter};
use crate::vdi::{config_keys, config_map_for, Vdi};
use crate::vhdkit::VhdKit;

mod file;
mod lvhd;
pub use file::FileSr;
pub use lvhd::{LvhdSr, LV_PREFIX_RAW, LV_PREFIX_VHD, VG_PREFIX};

pub const SCAN_RETRY_ATTEMPTS: u32 = 3;
const PLUG_RETRY_ATTEMPTS: u32 = 9;
const PLUG_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// The message posted when coalescing is starved of space.
pub const MSG_GC_NO_SPACE: &str = "SM_GC_NO_SPACE";

/// Back-end capability set consumed by the engine. All operations act on
/// backing storage only; the forest and the control-plane inventory belong
/// to the engine.
pub trait SrDriver: fmt::Debug {
    fn kind(&self) -> &'static str;
    /// Mountpoint (file) or volume-group directory (LV).
    fn path(&self) -> &Utf8Path;

    /// One scan attempt over all VDIs. Returns the nodes plus a flag for
    /// whether any per-VDI metadata read failed (such nodes carry
    /// `scan_error`).
    fn scan_once(&mut self) -> Result<(BTreeMap<String, Vdi>, bool)>;
    fn free_space(&self) -> Result<u64>;

    fn vdi_file_name(&self, uuid: &str, raw: bool) -> String;
    fn vdi_path(&self, uuid: &str, raw: bool) -> Utf8PathBuf;

    /// Remove the backing storage, checking with other attached hosts
    /// first on a shared SR.
    fn destroy_vdi(&mut self, vdi: &Vdi, abort: &AbortHandle) -> Result<()>;
    /// Rename backing storage; returns the new file/LV name.
    fn rename_vdi(&mut self, vdi: &Vdi, new_uuid: &str) -> Result<String>;

    fn pause_vdi(&self, vdi: &Vdi, failfast: bool) -> Result<()>;
    fn unpause_vdi(&self, vdi: &Vdi) -> Result<()>;
    /// Pause+unpause so an attached tap-disk reloads the chain.
    fn refresh_vdi(&self, vdi: &Vdi) -> Result<()>;

    /// Make the backing device accessible (LV activation). No-op for files.
    fn activate_vdi(&mut self, _vdi: &Vdi) -> Result<()> {
        Ok(())
    }
    /// Undo all activations this worker performed.
    fn deactivate_all(&mut self) -> Result<()> {
        Ok(())
    }

    /// Physical utilization, loading it lazily where the scan does not
    /// provide it.
    fn load_phys_size(&mut self, vdi: &Vdi) -> Result<u64>;
    fn load_allocated_size(&mut self, vdi: &Vdi) -> Result<u64>;

    /// Bracket the VHD data copy of `child` into its parent (LV: activate
    /// the chain, make the parent writable, inflate it to the predicted
    /// size / deflate and re-protect afterwards).
    fn prepare_coalesce(&mut self, forest: &Forest, child: &str, size_data: u64) -> Result<()>;
    fn finish_coalesce(&mut self, forest: &mut Forest, child: &str) -> Result<()>;

    /// Rewrite the on-disk parent pointer of `child`.
    fn set_parent_on_disk(&mut self, child: &Vdi, parent: &Vdi) -> Result<()>;
    /// Set the hidden bit (raw LVs carry it as an LV tag).
    fn set_hidden_on_disk(&mut self, vdi: &Vdi, hidden: bool) -> Result<()>;

    /// Journaled offline resize; the journal location is back-end specific.
    fn resize_journaled(&mut self, vdi: &Vdi, size: u64) -> Result<()>;
    /// Grow a raw leaf to `size` (LV: extend + zero-fill the extension,
    /// guarded by the zero journal). Returns the new device size.
    fn grow_raw(
        &mut self,
        journal: &dyn Journaler,
        vdi: &Vdi,
        size: u64,
        abort: &AbortHandle,
    ) -> Result<u64>;

    /// Extra SR space consumed by coalescing `child` into its parent,
    /// given the coalesced data size (OR of the two block bitmaps).
    fn extra_space_for_coalesce(&mut self, forest: &Forest, child: &str, size_data: u64)
        -> Result<u64>;
    /// Same, for the leaf-coalesce variant (the leaf's deflatable slack
    /// reduces the requirement on the LV back-end).
    fn extra_space_for_leaf_coalesce(
        &mut self,
        forest: &Forest,
        child: &str,
        size_data: u64,
    ) -> Result<u64>;
    /// Same, for snapshot-coalesce (one extra empty leaf).
    fn extra_space_for_snapshot_coalesce(
        &mut self,
        forest: &Forest,
        child: &str,
        size_data: u64,
    ) -> Result<u64>;

    /// Pre-pause step of a leaf-coalesce (LV: activate the chain, deflate
    /// the leaf, inflate the parent to fit the coalesced data).
    fn prepare_coalesce_leaf(&mut self, forest: &Forest, child: &str, size_data: u64)
        -> Result<()>;
    /// Post-swap fixups (LV: the survivor inherits the leaf's binary
    /// refcount).
    fn update_node_leaf(&mut self, child: &Vdi, parent: &Vdi) -> Result<()>;
    /// Final step once the survivor holds the leaf's identity (LV: inflate
    /// fully if writable, deflate otherwise).
    fn finish_coalesce_leaf(&mut self, forest: &mut Forest, survivor: &str) -> Result<()>;
    /// Headroom needed by the survivor right after the swap; if free space
    /// is below this the obsolete leaf is deleted inside the paused window.
    fn extra_space_after_leaf(&mut self, forest: &Forest, child: &str, parent: &str)
        -> Result<u64>;

    /// Recovery probe: is the original parent still present on disk, and is
    /// the renamed (`OLD_`) child present?
    fn leaf_parts_present(&mut self, child_uuid: &str, parent_uuid: &str) -> Result<(bool, bool)>;
    /// Back-end part of the leaf-coalesce undo (LV: restore refcounts from
    /// the journaled pre-swap values, deflate the parent, re-inflate the
    /// child, re-protect).
    fn undo_leaf_backend(
        &mut self,
        forest: &Forest,
        child: &str,
        parent: &str,
        counts: Option<(u64, u64)>,
    ) -> Result<()>;
    /// Back-end part of finishing an interrupted leaf-coalesce (LV:
    /// inflate the survivor fully).
    fn finish_leaf_backend(&mut self, forest: &Forest, child: &str) -> Result<()>;

    /// Pre-swap refcounts of `uuid`, where the back-end keeps any.
    fn refcounts(&self, _uuid: &str) -> Result<Option<(u64, u64)>> {
        Ok(None)
    }

    /// Inter-host notifications (no-ops for a local file SR).
    fn update_slaves_on_rename(&mut self, vdi: &Vdi, old_name: &str, orig_parent: &str)
        -> Result<()>;
    fn update_slaves_on_resize(&mut self, forest: &Forest, uuid: &str) -> Result<()>;
    fn update_slaves_on_undo_leaf(&mut self, forest: &Forest, parent: &str, child: &str)
        -> Result<()>;

    /// Sweep stale read-cache files (file back-end only).
    fn cleanup_cache(&mut self, _max_age_hours: i64) -> Result<usize> {
        Ok(0)
    }
    /// Called after garbage deletion; `deleted_root` drives cache-SR
    /// invalidation on NFS.
    fn after_delete(&mut self, _deleted_root: bool) -> Result<()> {
        Ok(())
    }
}

/// Progress of the control-plane task handle for this run.
#[derive(Debug, Default)]
struct TaskTracker {
    handle: Option<String>,
    coalescable: usize,
    done: usize,
}

#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub create_lock: bool,
    /// Tolerate scan errors and skip the attachment/master checks.
    pub force: bool,
    pub dirs: RuntimeDirs,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            create_lock: true,
            force: false,
            dirs: RuntimeDirs::default(),
        }
    }
}

/// One attached storage repository: the engine state shared by the GC loop
/// and the coalescer.
#[derive(Debug)]
pub struct Sr {
    pub uuid: String,
    pub name: String,
    pub shared: bool,
    pub dirs: RuntimeDirs,
    pub session: Session,
    pub forest: Forest,
    pub journal: Box<dyn Journaler>,
    pub vhd: Box<dyn VhdKit>,
    pub driver: Box<dyn SrDriver>,
    pub abort: AbortHandle,
    sr_lock: Option<SrLock>,
    log_filter: TreeLogFilter,
    pub(crate) failed_targets: BTreeSet<String>,
    no_space_candidates: BTreeSet<String>,
    speed: SpeedLog,
    task: TaskTracker,
}

/// Map the control-plane SR type to a back-end.
pub fn normalize_type(ty: &str) -> Result<&'static str> {
    match ty {
        "lvhd" | "lvm" | "lvmoiscsi" | "lvmohba" | "lvhdoiscsi" | "lvhdohba" => Ok("lvhd"),
        "file" | "ext" | "nfs" | "smb" => Ok("file"),
        other => anyhow::bail!("unsupported SR type {other}"),
    }
}

impl Sr {
    /// Connect to the control plane, verify this host may run the GC for
    /// `sr_uuid`, and construct the matching back-end.
    #[context("Attaching SR {sr_uuid}")]
    pub fn attach(session: Session, sr_uuid: &str, opts: AttachOptions) -> Result<Sr> {
        let record = session.sr_record(sr_uuid)?;
        let ty = normalize_type(&record.ty)?;
        let abort = AbortHandle::new(&opts.dirs, sr_uuid);

        if !Self::plugged_here(&session, sr_uuid)? {
            if opts.force {
                tracing::warn!("SR {sr_uuid} not attached on this host, ignoring");
            } else if !Self::wait_for_plug(&session, sr_uuid)? {
                anyhow::bail!("SR {sr_uuid} not attached on this host");
            }
        }
        if opts.force {
            tracing::info!("not checking whether we are the pool master");
        } else if record.shared {
            let master = session.pool_master()?;
            let me = session.this_host()?;
            anyhow::ensure!(master == me, "this host is not the pool master, will not run");
        } else {
            let bindings = session.attached_hosts(sr_uuid)?;
            anyhow::ensure!(!bindings.is_empty(), "local SR not attached");
            anyhow::ensure!(bindings.len() == 1, "local SR multiply attached");
            anyhow::ensure!(bindings[0].local, "local SR attached elsewhere");
        }

        let (driver, journal): (Box<dyn SrDriver>, Box<dyn Journaler>) = match ty {
            "file" => {
                let d = FileSr::new(session.clone(), sr_uuid, &record, &opts.dirs);
                let j = Box::new(crate::journal::FileJournaler::new(d.path()));
                (Box::new(d), j)
            }
            _ => {
                let d = LvhdSr::new(session.clone(), sr_uuid, &opts.dirs);
                let j = Box::new(crate::journal::LvmJournaler::new(&d.vg_name()));
                (Box::new(d), j)
            }
        };

        Ok(Self::assemble(
            session,
            sr_uuid,
            &record.name_label,
            record.shared,
            opts,
            driver,
            Box::new(crate::vhdkit::VhdUtilKit),
            journal,
            abort,
        ))
    }

    /// Wire an engine from parts; the seam used by tests and embedders.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        session: Session,
        sr_uuid: &str,
        name: &str,
        shared: bool,
        opts: AttachOptions,
        driver: Box<dyn SrDriver>,
        vhd: Box<dyn VhdKit>,
        journal: Box<dyn Journaler>,
        abort: AbortHandle,
    ) -> Sr {
        let sr_lock = opts
            .create_lock
            .then(|| SrLock::new(&opts.dirs.lock_dir(sr_uuid)));
        if sr_lock.is_none() {
            tracing::info!("requested no SR locking");
        }
        let speed = SpeedLog::new(opts.dirs.speed_log(sr_uuid));
        Sr {
            uuid: sr_uuid.to_string(),
            name: name.to_string(),
            shared,
            dirs: opts.dirs,
            session,
            forest: Forest::default(),
            journal,
            vhd,
            driver,
            abort,
            sr_lock,
            log_filter: TreeLogFilter::default(),
            failed_targets: BTreeSet::new(),
            no_space_candidates: BTreeSet::new(),
            speed,
            task: TaskTracker::default(),
        }
    }

    fn plugged_here(session: &Session, sr_uuid: &str) -> Result<bool> {
        Ok(session.attached_hosts(sr_uuid)?.iter().any(|b| b.local))
    }

    fn wait_for_plug(session: &Session, sr_uuid: &str) -> Result<bool> {
        for _ in 0..PLUG_RETRY_ATTEMPTS {
            std::thread::sleep(PLUG_RETRY_INTERVAL);
            if Self::plugged_here(session, sr_uuid)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn speed_log(&self) -> &SpeedLog {
        &self.speed
    }

    /// Acquire the SR lock (nested acquires are fine). The abort flag is
    /// polled before every wait so that a holder trying to abort us cannot
    /// deadlock against us.
    pub fn lock(&mut self) -> Result<()> {
        if let Some(l) = self.sr_lock.as_mut() {
            l.lock(&self.abort)?;
        }
        Ok(())
    }

    pub fn unlock(&mut self) {
        if let Some(l) = self.sr_lock.as_mut() {
            l.unlock();
        }
    }

    /// Scan the SR and rebuild the forest, then resolve any interrupted
    /// leaf-coalesce the journal records. Retries a few times on per-VDI
    /// scan errors; with `force`, partial errors are tolerated and the
    /// affected nodes are flagged instead.
    #[context("Scanning SR")]
    pub fn scan(&mut self, force: bool) -> Result<()> {
        let mut last: Option<(BTreeMap<String, Vdi>, bool)> = None;
        for attempt in 0..SCAN_RETRY_ATTEMPTS {
            let r = self.driver.scan_once()?;
            if !r.1 {
                last = Some(r);
                break;
            }
            tracing::warn!("scan error on attempt {attempt}");
            last = Some(r);
            if attempt + 1 < SCAN_RETRY_ATTEMPTS {
                last = None;
            }
        }
        let (nodes, errors) = match last {
            Some(r) => r,
            None => unreachable!(),
        };
        if errors && !force {
            anyhow::bail!("scan error");
        }
        self.forest = Forest::build(nodes, force)?;
        self.log_filter.log_state(&self.forest);
        self.handle_interrupted_coalesce_leaf()
    }

    pub fn scan_locked(&mut self, force: bool) -> Result<()> {
        self.lock()?;
        let r = self.scan(force);
        self.unlock();
        r
    }

    /// Read one per-VDI config key through the map it lives in.
    pub fn get_config_vdi(&self, uuid: &str, key: &str) -> Result<Option<String>> {
        let cfg = self.session.vdi_config(uuid, config_map_for(key))?;
        Ok(cfg.get(key).filter(|v| !v.is_empty()).cloned())
    }

    pub fn set_config_vdi(&self, uuid: &str, key: &str, value: &str) -> Result<()> {
        let map = config_map_for(key);
        self.session.vdi_config_remove(uuid, map, key)?;
        self.session.vdi_config_set(uuid, map, key, value)?;
        tracing::debug!("set {key} = {value} for {uuid}");
        Ok(())
    }

    pub fn del_config_vdi(&self, uuid: &str, key: &str) -> Result<()> {
        self.session
            .vdi_config_remove(uuid, config_map_for(key), key)?;
        tracing::debug!("removed {key} from {uuid}");
        Ok(())
    }

    /// An SR-level other-config switch set to the given value forbids an
    /// operation.
    pub fn forbidden_by_switch(&self, switch: &str, condition: &str) -> Result<bool> {
        let rec = self.session.sr_record(&self.uuid)?;
        Ok(rec.other_config.get(switch).map(|s| s.as_str()) == Some(condition))
    }

    /// Re-reads the SR record; other-config `gc=false` disables the engine.
    pub fn gc_enabled(&self) -> Result<bool> {
        if self.forbidden_by_switch(config_keys::GC, "false")? {
            tracing::info!("GC is disabled for this SR, abort");
            return Ok(false);
        }
        Ok(true)
    }

    /// All-or-nothing pause of a set of VDIs: on partial failure, whatever
    /// was paused is unpaused again and the failure propagates.
    pub fn pause_vdis(&mut self, uuids: &[String]) -> Result<()> {
        let mut paused: Vec<String> = Vec::new();
        for uuid in uuids {
            let v = self.forest.get(uuid).context("paused VDI vanished")?;
            if let Err(e) = self.driver.pause_vdi(v, false) {
                tracing::warn!("failed to pause {uuid}: {e}");
                for u in &paused {
                    if let Some(v) = self.forest.get(u) {
                        if let Err(e) = self.driver.unpause_vdi(v) {
                            tracing::error!("failed to unpause {u}: {e}");
                        }
                    }
                }
                return Err(e).context("failed to pause VDIs");
            }
            paused.push(uuid.clone());
        }
        Ok(())
    }

    pub fn unpause_vdis(&mut self, uuids: &[String]) -> Result<()> {
        let mut failed = false;
        for uuid in uuids {
            if let Some(v) = self.forest.get(uuid) {
                if let Err(e) = self.driver.unpause_vdi(v) {
                    tracing::error!("failed to unpause {uuid}: {e}");
                    failed = true;
                }
            }
        }
        anyhow::ensure!(!failed, "failed to unpause VDIs");
        Ok(())
    }

    /// Pause+unpause under the SR lock so an attached consumer re-reads the
    /// chain.
    pub fn refresh_vdi(&mut self, uuid: &str) -> Result<()> {
        self.lock()?;
        let r = (|| {
            let v = self.forest.get(uuid).context("VDI vanished")?;
            self.driver.refresh_vdi(v)
        })();
        self.unlock();
        r
    }

    /// Query the block bitmap and refresh the cached copy in the VDI's
    /// config (zlib-deflated, base64).
    pub fn update_block_info(&mut self, uuid: &str) -> Result<Vec<u8>> {
        let v = self.forest.get(uuid).context("VDI vanished")?.clone();
        self.driver.activate_vdi(&v)?;
        let bitmap = self.vhd.block_bitmap(&v.path)?;
        self.set_config_vdi(uuid, config_keys::VHD_BLOCKS, &encode_bitmap(&bitmap)?)?;
        Ok(bitmap)
    }

    fn needs_block_info(&self, v: &Vdi) -> Result<bool> {
        if v.scan_error || v.raw || v.is_leaf() {
            return Ok(false);
        }
        Ok(self.get_config_vdi(&v.uuid, config_keys::VHD_BLOCKS)?.is_none())
    }

    pub fn need_update_block_info(&self) -> Result<bool> {
        for v in self.forest.iter() {
            if self.needs_block_info(v)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Populate the bitmap cache for every inner node missing it.
    pub fn update_all_block_info(&mut self) -> Result<()> {
        let missing: Vec<String> = self
            .forest
            .iter()
            .filter_map(|v| match self.needs_block_info(v) {
                Ok(true) => Some(Ok(v.uuid.clone())),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<_>>()?;
        let updated = !missing.is_empty();
        for uuid in missing {
            self.update_block_info(&uuid)?;
        }
        if updated {
            // release device activations sooner rather than later
            self.cleanup();
        }
        Ok(())
    }

    pub fn free_space(&self) -> Result<u64> {
        self.driver.free_space()
    }

    /// Anything to do? Garbage, a coalesce candidate, a leaf candidate or a
    /// missing bitmap cache all count.
    pub fn has_work(&mut self) -> Result<bool> {
        if !self.find_garbage()?.is_empty() {
            return Ok(true);
        }
        if self.find_coalesceable()?.is_some() {
            return Ok(true);
        }
        if self.find_leaf_coalesceable()?.is_some() {
            return Ok(true);
        }
        self.need_update_block_info()
    }

    pub fn find_garbage(&self) -> Result<Vec<String>> {
        let journal = &*self.journal;
        let has_relink = |uuid: &str| -> bool {
            journal
                .get(JournalKind::Relink, uuid)
                .ok()
                .flatten()
                .is_some()
        };
        Ok(self.forest.prunable(&has_relink))
    }

    /// Delete all garbage, then prune journal entries that no longer refer
    /// to a present VDI.
    pub fn garbage_collect(&mut self, dry_run: bool) -> Result<()> {
        let garbage = self.find_garbage()?;
        tracing::info!("found {} VDIs for deletion", garbage.len());
        for uuid in &garbage {
            tracing::info!("  {}", self.forest.get(uuid).map(|v| v.to_string()).unwrap_or_default());
        }
        if !dry_run {
            self.delete_vdis(&garbage)?;
        }
        self.cleanup_journals(dry_run)
    }

    fn delete_vdis(&mut self, uuids: &[String]) -> Result<()> {
        let mut deleted_root = false;
        for uuid in uuids {
            self.abort.checkpoint()?;
            tracing::info!("deleting unlinked VDI {uuid}");
            if self.forest.parent(uuid).is_none() {
                deleted_root = true;
            }
            self.delete_vdi(uuid)?;
        }
        self.driver.after_delete(deleted_root)
    }

    /// Destroy one childless VDI: backing storage, forest node, inventory.
    pub fn delete_vdi(&mut self, uuid: &str) -> Result<()> {
        let v = self.forest.get(uuid).with_context(|| format!("deleting unknown VDI {uuid}"))?;
        anyhow::ensure!(v.is_leaf(), "VDI {uuid} has children, can't delete");
        let v = v.clone();
        self.lock()?;
        let r = (|| -> Result<()> {
            self.driver.destroy_vdi(&v, &self.abort)?;
            self.session.forget_vdi(uuid)?;
            Ok(())
        })();
        self.unlock();
        r?;
        self.forest.detach(uuid);
        self.clear_no_space_msg(uuid)?;
        Ok(())
    }

    /// Remove stale coalesce indicators (they only mark which VDI was being
    /// coalesced, for preemption decisions).
    pub fn cleanup_coalesce_journals(&mut self) -> Result<()> {
        for (uuid, _) in self.journal.entries(JournalKind::Coalesce)? {
            self.journal.remove(JournalKind::Coalesce, &uuid)?;
        }
        Ok(())
    }

    /// Delete journal entries referring to VDIs that no longer exist.
    pub fn cleanup_journals(&mut self, dry_run: bool) -> Result<()> {
        for kind in [JournalKind::Zero, JournalKind::Relink, JournalKind::Clone] {
            for (uuid, value) in self.journal.entries(kind)? {
                if self.forest.get(&uuid).is_some() {
                    continue;
                }
                tracing::info!("deleting stale '{kind}' journal entry for {uuid} ({value})");
                if !dry_run {
                    self.journal.remove(kind, &uuid)?;
                }
            }
        }
        Ok(())
    }

    /// Release transient resources held by the back-end (LV activations).
    pub fn cleanup(&mut self) {
        if let Err(e) = self.driver.deactivate_all() {
            tracing::error!("error deactivating LVs while cleaning up: {e}");
        }
    }

    // ------------------------------------------------------------------
    // no-space bookkeeping

    pub(crate) fn note_no_space(&mut self, uuid: &str) {
        self.no_space_candidates.insert(uuid.to_string());
    }

    pub(crate) fn clear_no_space_msg(&mut self, uuid: &str) -> Result<()> {
        self.no_space_candidates.remove(uuid);
        match self.get_config_vdi(uuid, config_keys::GC_NO_SPACE) {
            Ok(Some(_)) => self.del_config_vdi(uuid, config_keys::GC_NO_SPACE)?,
            Ok(None) => {}
            // the VDI may already be gone from the inventory
            Err(e) => tracing::debug!("no-space tag lookup failed for {uuid}: {e}"),
        }
        Ok(())
    }

    /// Post (rate-limited by message liveness) or withdraw the "no space to
    /// coalesce" user message depending on whether any candidate is starved.
    pub fn check_no_space_candidates(&mut self) -> Result<()> {
        let rec = self.session.sr_record(&self.uuid)?;
        let msg_id = rec.sm_config.get(config_keys::GC_NO_SPACE).cloned();
        if !self.no_space_candidates.is_empty() {
            let missing = match &msg_id {
                Some(id) => !self.session.message_exists(id)?,
                None => true,
            };
            let msg_id = if missing {
                tracing::warn!("could not coalesce due to a lack of space in SR {}", self.uuid);
                let body = format!(
                    "Unable to perform data coalesce due to a lack of space in SR {}",
                    self.uuid
                );
                let id = self.session.message_create(
                    MSG_GC_NO_SPACE,
                    MSG_PRIORITY_WARNING,
                    "SR",
                    &self.uuid,
                    &body,
                )?;
                self.session
                    .sr_config_remove(&self.uuid, ConfigMap::Sm, config_keys::GC_NO_SPACE)?;
                self.session
                    .sr_config_set(&self.uuid, ConfigMap::Sm, config_keys::GC_NO_SPACE, &id)?;
                id
            } else {
                msg_id.unwrap()
            };
            for uuid in self.no_space_candidates.clone() {
                self.set_config_vdi(&uuid, config_keys::GC_NO_SPACE, &msg_id)?;
            }
        } else if let Some(id) = msg_id {
            // everything fit this time; withdraw the message
            self.session.message_destroy(&id)?;
            self.session
                .sr_config_remove(&self.uuid, ConfigMap::Sm, config_keys::GC_NO_SPACE)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // control-plane task plumbing

    pub fn task_create(&mut self, label: &str, description: &str) {
        match self.session.task_create(label, description) {
            Ok(h) => self.task.handle = Some(h),
            Err(e) => tracing::warn!("failed to create task: {e}"),
        }
    }

    pub fn task_update(&mut self, coalescable: usize, done: usize) {
        self.task.coalescable = self.task.coalescable.max(coalescable);
        self.task.done = done;
        let total = self.task.coalescable + self.task.done;
        if let (Some(h), true) = (&self.task.handle, total > 0) {
            let progress = self.task.done as f64 / total as f64;
            if let Err(e) = self.session.task_progress(h, progress) {
                tracing::warn!("failed to update task progress: {e}");
            }
        }
    }

    pub(crate) fn task_note_candidates(&mut self, coalescable: usize) {
        self.task_update(coalescable, self.task.done);
    }

    pub fn task_finish(&mut self, success: bool) {
        if let Some(h) = self.task.handle.take() {
            if let Err(e) = self.session.task_status(&h, success) {
                tracing::warn!("failed to set task status: {e}");
            }
        }
    }
}

/// Encode a block bitmap for the per-VDI config cache.
pub fn encode_bitmap(bitmap: &[u8]) -> Result<String> {
    use std::io::Write;
    let mut z = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    z.write_all(bitmap)?;
    let compressed = z.finish()?;
    Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
}

pub fn decode_bitmap(encoded: &str) -> Result<Vec<u8>> {
    use std::io::Read;
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("decoding bitmap cache")?;
    let mut z = flate2::read::ZlibDecoder::new(&compressed[..]);
    let mut out = Vec::new();
    z.read_to_end(&mut out).context("inflating bitmap cache")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_type() {
        assert_eq!(normalize_type("nfs").unwrap(), "file");
        assert_eq!(normalize_type("ext").unwrap(), "file");
        assert_eq!(normalize_type("lvmoiscsi").unwrap(), "lvhd");
        assert_eq!(normalize_type("lvhd").unwrap(), "lvhd");
        assert!(normalize_type("iso").is_err());
    }

    #[test]
    fn test_bitmap_roundtrip() {
        let bitmap = vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0xff];
        let enc = encode_bitmap(&bitmap).unwrap();
        assert_eq!(decode_bitmap(&enc).unwrap(), bitmap);
    }
}
