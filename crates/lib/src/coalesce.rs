//! The coalescer: candidate selection, the journal-guarded inline coalesce,
//! the snapshot-then-pause leaf coalesce, and crash recovery for both.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fn_error_context::context;

use crate::abort::is_abort;
use crate::journal::JournalKind;
use crate::speed::{can_live_coalesce, report_coalesce_error};
use crate::sr::Sr;
use crate::vdi::{config_keys, LIVE_LEAF_TIMEOUT, TMP_RENAME_PREFIX};

/// Automatic online leaf-coalesce. The explicit `leaf-coalesce=force`
/// config overrides this when disabled.
pub const AUTO_ONLINE_LEAF_COALESCE_ENABLED: bool = true;

const TAG_RETRY_ATTEMPTS: u32 = 15;
const TAG_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Watches a snapshot-coalesce sequence for lack of progress. A leaf that
/// keeps growing as fast as we coalesce it must be abandoned for this run.
#[derive(Debug)]
pub struct CoalesceTracker {
    iterations: u32,
    no_progress: u32,
    grace_violations: u32,
    min_size: u64,
    start_size: Option<u64>,
    finish_size: u64,
    history: Vec<String>,
    reason: String,
}

impl CoalesceTracker {
    pub const MAX_ITERATIONS: u32 = 10;
    pub const MAX_ITERATIONS_NO_PROGRESS: u32 = 3;
    pub const GRACE_ITERATIONS: u32 = 2;
    pub const MAX_INCREASE_FROM_MINIMUM: f64 = 1.2;

    pub fn new() -> Self {
        Self {
            iterations: 0,
            no_progress: 0,
            grace_violations: 0,
            min_size: u64::MAX,
            start_size: None,
            finish_size: 0,
            history: Vec::new(),
            reason: String::new(),
        }
    }

    /// Record one iteration; true means give up on this leaf.
    pub fn abort_coalesce(&mut self, prev_size: u64, cur_size: u64) -> bool {
        self.iterations += 1;
        self.history.push(format!(
            "Iteration: {} -- Initial size {prev_size} --> Final size {cur_size}",
            self.iterations
        ));
        self.finish_size = cur_size;
        self.start_size.get_or_insert(prev_size);
        self.min_size = self.min_size.min(cur_size).min(prev_size);

        if cur_size < prev_size {
            // we made progress
            self.no_progress = 0;
        } else {
            self.no_progress += 1;
            tracing::info!("no progress, attempt: {}", self.no_progress);
        }

        if self.iterations > Self::MAX_ITERATIONS {
            self.reason = format!("Max iterations ({}) exceeded", Self::MAX_ITERATIONS);
            return true;
        }
        if self.no_progress >= Self::MAX_ITERATIONS_NO_PROGRESS {
            self.reason = format!(
                "No progress made for {} iterations",
                Self::MAX_ITERATIONS_NO_PROGRESS
            );
            return true;
        }
        let max_from_min = Self::MAX_INCREASE_FROM_MINIMUM * self.min_size as f64;
        if cur_size as f64 > max_from_min {
            self.grace_violations += 1;
            if self.grace_violations >= Self::GRACE_ITERATIONS {
                self.reason =
                    "Unexpected bump in size, compared to minimum achieved".to_string();
                return true;
            }
        } else {
            self.grace_violations = 0;
        }
        false
    }

    fn log_sizes(&self) {
        tracing::info!("starting size was         {:?}", self.start_size);
        tracing::info!("final size was            {}", self.finish_size);
        tracing::info!("minimum size achieved was {}", self.min_size);
    }

    pub fn log_reasoning(&self) {
        tracing::info!("aborted coalesce");
        for h in &self.history {
            tracing::info!("{h}");
        }
        tracing::info!("{}", self.reason);
        self.log_sizes();
    }

    pub fn log_summary(&self) {
        if self.iterations == 0 {
            return;
        }
        if self.reason.is_empty() {
            tracing::info!("coalesce summary");
        } else {
            tracing::info!("aborted coalesce: {}", self.reason);
        }
        tracing::info!("performed {} iterations", self.iterations);
        self.log_sizes();
    }
}

impl Default for CoalesceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a leaf journal payload: `<parentUuid>[.<cnt>.<bcnt>]`.
pub(crate) fn parse_leaf_payload(payload: &str) -> Result<(String, Option<(u64, u64)>)> {
    let mut parts = payload.split('.');
    let parent = parts.next().context("empty leaf journal payload")?.to_string();
    let counts = match (parts.next(), parts.next()) {
        (Some(c), Some(b)) => Some((c.parse()?, b.parse()?)),
        _ => None,
    };
    Ok((parent, counts))
}

impl Sr {
    // ------------------------------------------------------------------
    // candidate selection

    /// The average coalesce throughput, if a usable history exists.
    pub fn storage_speed(&self) -> Option<f64> {
        match self.speed_log().average() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("failed to read speed log: {e}");
                None
            }
        }
    }

    /// Pick one hidden intermediate node to coalesce into its parent, or
    /// None. Interrupted relinks are finished first; fresh candidates are
    /// taken from the tallest tree for which the predicted space fits.
    pub fn find_coalesceable(&mut self) -> Result<Option<String>> {
        if self.forbidden_by_switch(config_keys::COALESCE, "false")? {
            tracing::info!("coalesce disabled for this SR");
            return Ok(None);
        }

        // finish any VDI with a pending relink journal first
        for (uuid, _) in self.journal.entries(JournalKind::Relink)? {
            if self.forest.get(&uuid).is_some() && !self.failed_targets.contains(&uuid) {
                return Ok(Some(uuid));
            }
        }

        let mut candidates: Vec<String> = self
            .forest
            .iter()
            .filter(|v| self.forest.is_coalesceable(&v.uuid))
            .map(|v| v.uuid.clone())
            .filter(|u| !self.failed_targets.contains(u))
            .collect();
        self.task_note_candidates(candidates.len());

        // prefer the candidate in the tallest tree
        candidates.sort_by_key(|u| {
            let root = self.forest.tree_root(u).to_string();
            std::cmp::Reverse(self.forest.height(&root))
        });

        let free_space = self.free_space()?;
        for uuid in candidates {
            let size_data = self.coalesced_size_data(&uuid)?;
            let needed = self
                .driver
                .extra_space_for_coalesce(&self.forest, &uuid, size_data)?;
            if needed <= free_space {
                tracing::info!("coalesce candidate: {uuid}");
                self.clear_no_space_msg(&uuid)?;
                return Ok(Some(uuid));
            }
            tracing::info!("no space to coalesce {uuid} (need {needed}, free {free_space})");
            self.note_no_space(&uuid);
        }
        Ok(None)
    }

    /// Pick one visible leaf for leaf-coalesce, or None.
    pub fn find_leaf_coalesceable(&mut self) -> Result<Option<String>> {
        if self.forbidden_by_switch(config_keys::COALESCE, "false")? {
            tracing::info!("coalesce disabled for this SR");
            return Ok(None);
        }
        if self.forbidden_by_switch(config_keys::LEAF_COALESCE, config_keys::LEAFCLSC_DISABLED)? {
            tracing::info!("leaf-coalesce disabled for this SR");
            return Ok(None);
        }

        let mut candidates = Vec::new();
        let leafs: Vec<String> = self
            .forest
            .iter()
            .filter(|v| self.forest.is_leaf_coalesceable(&v.uuid))
            .map(|v| v.uuid.clone())
            .collect();
        for uuid in leafs {
            if self.failed_targets.contains(&uuid) {
                continue;
            }
            if self.get_config_vdi(&uuid, config_keys::ON_BOOT)?.as_deref()
                == Some(config_keys::ONBOOT_RESET)
            {
                tracing::info!("skipping reset-on-boot {uuid}");
                continue;
            }
            if self.get_config_vdi(&uuid, config_keys::ALLOW_CACHING)?.as_deref() == Some("true") {
                tracing::info!("skipping allow_caching=true {uuid}");
                continue;
            }
            let leafclsc = self.get_config_vdi(&uuid, config_keys::LEAF_COALESCE)?;
            if leafclsc.as_deref() == Some(config_keys::LEAFCLSC_DISABLED) {
                tracing::info!("leaf-coalesce disabled for {uuid}");
                continue;
            }
            if !AUTO_ONLINE_LEAF_COALESCE_ENABLED
                && leafclsc.as_deref() != Some(config_keys::LEAFCLSC_FORCE)
            {
                continue;
            }
            candidates.push(uuid);
        }
        self.task_note_candidates(candidates.len());

        let free_space = self.free_space()?;
        for uuid in candidates {
            let size_data = self.coalesced_size_data(&uuid)?;
            let mut needed = self
                .driver
                .extra_space_for_snapshot_coalesce(&self.forest, &uuid, size_data)?;
            let mut needed_live = needed;
            if needed > free_space {
                needed_live = self
                    .driver
                    .extra_space_for_leaf_coalesce(&self.forest, &uuid, size_data)?;
                if self.can_live_coalesce_vdi(&uuid)? {
                    needed = needed_live;
                }
            }
            if needed <= free_space {
                tracing::info!("leaf-coalesce candidate: {uuid}");
                self.clear_no_space_msg(&uuid)?;
                return Ok(Some(uuid));
            }
            tracing::info!("no space to leaf-coalesce {uuid} (need {needed}, free {free_space})");
            if needed_live <= free_space {
                tracing::info!("...but enough space if skipping the snapshot steps");
                self.set_config_vdi(
                    &uuid,
                    config_keys::LEAF_COALESCE,
                    config_keys::LEAFCLSC_OFFLINE,
                )?;
            }
            self.note_no_space(&uuid);
        }
        Ok(None)
    }

    fn can_live_coalesce_vdi(&mut self, uuid: &str) -> Result<bool> {
        let v = self.forest.get(uuid).context("candidate vanished")?.clone();
        let allocated = match v.size_allocated {
            Some(a) => a,
            None => {
                let a = self.driver.load_allocated_size(&v)?;
                if let Some(v) = self.forest.get_mut(uuid) {
                    v.size_allocated = Some(a);
                }
                a
            }
        };
        let forced = self.get_config_vdi(uuid, config_keys::LEAF_COALESCE)?.as_deref()
            == Some(config_keys::LEAFCLSC_FORCE);
        Ok(can_live_coalesce(allocated, self.storage_speed(), forced))
    }

    /// Coalesced data size: population count of the OR of the child's and
    /// parent's block bitmaps. The child's cached bitmap is dropped first,
    /// since the child was writable all along.
    fn coalesced_size_data(&mut self, uuid: &str) -> Result<u64> {
        self.del_config_vdi(uuid, config_keys::VHD_BLOCKS)?;
        let child_bitmap = self.update_block_info(uuid)?;
        let (parent_raw, parent_uuid) = {
            let p = self.forest.parent(uuid).context("candidate has no parent")?;
            (p.raw, p.uuid.clone())
        };
        let parent_bitmap = if parent_raw {
            Vec::new()
        } else {
            self.update_block_info(&parent_uuid)?
        };
        let blocks = vhdgc_vhd::count_blocks_or(&child_bitmap, &parent_bitmap);
        let size_data = blocks * vhdgc_vhd::VHD_BLOCK_SIZE;
        tracing::debug!("num combined blocks = {blocks}");
        Ok(size_data)
    }

    // ------------------------------------------------------------------
    // inline coalesce

    /// Coalesce `uuid` onto its parent. Failures other than cancellation
    /// park the candidate on the failed-targets list for this run.
    pub fn coalesce(&mut self, uuid: &str, dry_run: bool) -> Result<()> {
        let parent = self.forest.parent(uuid).map(|p| p.to_string()).unwrap_or_default();
        tracing::info!("coalescing {uuid} -> {parent}");
        if dry_run {
            return Ok(());
        }
        let r = self.coalesce_inner(uuid);
        self.cleanup();
        match r {
            Ok(()) => Ok(()),
            Err(e) if is_abort(&e) => Err(e),
            Err(e) => {
                self.failed_targets.insert(uuid.to_string());
                report_coalesce_error(&self.session, &self.uuid, &e);
                tracing::warn!("coalesce failed, skipping: {e:#}");
                Ok(())
            }
        }
    }

    /// The journal-guarded protocol. A pending relink journal means the
    /// data copy already completed in an earlier run and only the relink
    /// remains.
    #[context("Coalescing {uuid}")]
    fn coalesce_inner(&mut self, uuid: &str) -> Result<()> {
        if self.journal.get(JournalKind::Relink, uuid)?.is_some() {
            tracing::info!("==> coalesce apparently already done: skipping");
        } else {
            // the coalesce journal only records which VDI is being worked
            // on, for preemption decisions; it is cleared as soon as the
            // data copy is done
            self.journal.create(JournalKind::Coalesce, uuid, "1")?;
            self.do_coalesce_data(uuid)?;
            self.journal.remove(JournalKind::Coalesce, uuid)?;
            self.journal.create(JournalKind::Relink, uuid, "1")?;
        }

        // lock out snapshot/clone while we re-point the children, and
        // rescan first in case the tree changed while we were copying
        self.lock()?;
        let r = (|| -> Result<()> {
            let parent = self
                .forest
                .parent(uuid)
                .context("coalesced node has no parent")?
                .uuid
                .clone();
            self.tag_children_for_relink(&parent)?;
            self.scan(false)?;
            self.relink_children(uuid)
        })();
        self.unlock();
        // reload the children to leave things consistent even on failure
        if let Some(parent) = self.forest.parent(uuid).map(|p| p.uuid.clone()) {
            self.reload_children(&parent, uuid)?;
        }
        r?;

        self.journal.remove(JournalKind::Relink, uuid)?;
        self.delete_vdi(uuid)
    }

    /// The data-copy phase: validate, grow the parent, run `vhd-coalesce`,
    /// re-validate. The subsequent relink runs separately, after a rescan.
    fn do_coalesce_data(&mut self, uuid: &str) -> Result<()> {
        let size_data = self.coalesced_size_data(uuid)?;
        self.driver
            .prepare_coalesce(&self.forest, uuid, size_data)?;
        let r = (|| -> Result<()> {
            let v = self.forest.get(uuid).context("candidate vanished")?.clone();
            let parent = self.forest.parent(uuid).context("no parent")?.clone();
            self.vhd.check(&v.path, false)?;
            if !parent.raw {
                self.vhd.check(&parent.path, true)?;
            }
            self.increase_size_virt(&parent.uuid, v.size_virt, true)?;
            self.driver.update_slaves_on_resize(&self.forest, &parent.uuid)?;
            self.coalesce_vhd(uuid, None)?;
            if !parent.raw {
                self.vhd.check(&parent.path, true)?;
                let parent_uuid = parent.uuid.clone();
                self.update_block_info(&parent_uuid)?;
            }
            Ok(())
        })();
        let fin = self.driver.finish_coalesce(&mut self.forest, uuid);
        r?;
        fin
    }

    /// Run the actual data copy under the watchdog, recording throughput.
    /// On failure, best-effort `repair` the parent before re-raising, since
    /// an interrupted copy may leave it with a stale footer.
    fn coalesce_vhd(&mut self, uuid: &str, timeout: Option<Duration>) -> Result<()> {
        let v = self.forest.get(uuid).context("candidate vanished")?.clone();
        tracing::info!("running VHD coalesce on {uuid}");
        let start = Instant::now();
        match self.vhd.coalesce(&v.path, &self.abort.clone(), timeout) {
            Ok(bytes) => {
                if let Err(e) = self.speed_log().record(bytes, start.elapsed()) {
                    tracing::warn!("failed to record storage speed: {e}");
                }
                Ok(())
            }
            Err(e) => {
                // the failure may also be a watchdog kill (timeout/abort)
                if let Some(parent) = self.forest.parent(uuid) {
                    let parent = parent.clone();
                    if !parent.raw {
                        tracing::warn!(
                            "coalesce failed on {uuid}, attempting repair on parent {}",
                            parent.uuid
                        );
                        if let Err(re) = self.vhd.repair(&parent.path) {
                            tracing::warn!("(error ignored) failed to repair parent: {re}");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Ensure the virtual size of `uuid` is at least `size`. Resizing a
    /// VHD beyond its headroom must happen offline: with `atomic`, the
    /// whole subtree is paused around the journaled resize.
    fn increase_size_virt(&mut self, uuid: &str, size: u64, atomic: bool) -> Result<()> {
        let v = self.forest.get(uuid).context("VDI vanished")?.clone();
        if v.raw {
            let journal = &*self.journal;
            let new_size =
                self.driver
                    .grow_raw(journal, &v, size, &self.abort.clone())?;
            if let Some(node) = self.forest.get_mut(uuid) {
                node.size_virt = new_size;
                if let Some(lv) = node.lv.as_mut() {
                    lv.size = new_size;
                }
            }
            return Ok(());
        }
        if v.size_virt >= size {
            return Ok(());
        }
        tracing::info!(
            "expanding VHD virt size for VDI {uuid}: {} -> {size}",
            v.size_virt
        );
        if size <= self.vhd.max_resize_size(&v.path)? {
            self.vhd.resize_fast(&v.path, size)?;
        } else if atomic {
            let subtree = self.forest.subtree(uuid);
            self.lock()?;
            let r = (|| -> Result<()> {
                self.pause_vdis(&subtree)?;
                let r = self.driver.resize_journaled(&v, size);
                let up = self.unpause_vdis(&subtree);
                r.and(up)
            })();
            self.unlock();
            r?;
        } else {
            self.driver.resize_journaled(&v, size)?;
        }
        let new_virt = self.vhd.size_virt(&v.path)?;
        if let Some(node) = self.forest.get_mut(uuid) {
            node.size_virt = new_virt;
        }
        Ok(())
    }

    /// Tag every leaf of the subtree as relinking so attach paths know to
    /// wait; a leaf concurrently activating wins and we retry.
    fn tag_children_for_relink(&mut self, uuid: &str) -> Result<()> {
        for leaf in self.forest.leaves(uuid) {
            let mut tagged = false;
            for _ in 0..TAG_RETRY_ATTEMPTS {
                if self.get_config_vdi(&leaf, config_keys::ACTIVATING)?.is_some() {
                    tracing::info!("VDI {leaf} is activating, waiting to relink");
                } else {
                    self.set_config_vdi(&leaf, config_keys::RELINKING, "true")?;
                    if self.get_config_vdi(&leaf, config_keys::ACTIVATING)?.is_some() {
                        self.del_config_vdi(&leaf, config_keys::RELINKING)?;
                        tracing::info!("VDI {leaf} started activating while tagging");
                    } else {
                        tagged = true;
                        break;
                    }
                }
                std::thread::sleep(TAG_RETRY_INTERVAL);
            }
            anyhow::ensure!(tagged, "failed to tag VDI {leaf} for relink");
        }
        Ok(())
    }

    /// Re-point every child of `uuid` at its grandparent, on disk and in
    /// the inventory. Abort is honored between children; the operation is
    /// idempotent across a crash (the journal replays it).
    fn relink_children(&mut self, uuid: &str) -> Result<()> {
        let parent = self
            .forest
            .parent(uuid)
            .context("coalesced node has no parent")?
            .clone();
        let children = self.forest.get(uuid).context("candidate vanished")?.children.clone();
        for child_uuid in children {
            self.abort.checkpoint()?;
            tracing::info!("relinking {child_uuid} from {uuid} to {}", parent.uuid);
            let child = self.forest.get(&child_uuid).context("child vanished")?.clone();
            self.driver.set_parent_on_disk(&child, &parent)?;
            self.forest.set_parent(&child_uuid, &parent.uuid);
            if let Err(e) =
                self.set_config_vdi(&child_uuid, config_keys::VHD_PARENT, &parent.uuid)
            {
                tracing::warn!("failed to update {} for {child_uuid}: {e}", config_keys::VHD_PARENT);
            }
        }
        Ok(())
    }

    /// Refresh every leaf under `parent` except `skip` so attached
    /// tap-disks reload the new chain, clearing the relink tags.
    fn reload_children(&mut self, parent: &str, skip: &str) -> Result<()> {
        for leaf in self.forest.leaves(parent) {
            if leaf == skip {
                continue;
            }
            self.abort.checkpoint()?;
            tracing::info!("reloading VDI {leaf}");
            if let Err(e) = self.del_config_vdi(&leaf, config_keys::RELINKING) {
                tracing::warn!("failed to clear relinking tag on {leaf}: {e}");
            }
            self.refresh_vdi(&leaf)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // leaf coalesce

    /// Leaf-coalesce `uuid` onto its parent: snapshot-coalesce down to a
    /// pauseable remainder, then swap identities inside a bounded pause.
    pub fn coalesce_leaf(&mut self, uuid: &str, dry_run: bool) -> Result<()> {
        let parent = self.forest.parent(uuid).map(|p| p.to_string()).unwrap_or_default();
        tracing::info!("leaf-coalescing {uuid} -> {parent}");
        if dry_run {
            return Ok(());
        }
        let r = self.coalesce_leaf_inner(uuid);
        // the leaf-coalesce hint is consumed either way
        if self.forest.get(uuid).is_some() {
            if let Err(e) = self.del_config_vdi(uuid, config_keys::LEAF_COALESCE) {
                tracing::debug!("failed to clear leaf-coalesce hint: {e}");
            }
        }
        self.cleanup();
        match r {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::info!("leaf-coalesce of {uuid} abandoned due to concurrent changes");
                Ok(())
            }
            Err(e) if is_abort(&e) => Err(e),
            Err(e) => {
                self.failed_targets.insert(uuid.to_string());
                report_coalesce_error(&self.session, &self.uuid, &e);
                tracing::warn!("leaf-coalesce failed on {uuid}, skipping: {e:#}");
                Ok(())
            }
        }
    }

    /// Returns false if concurrent activity (delete/snapshot) made the VDI
    /// ineligible; that is a clean abandon, not a failure.
    fn coalesce_leaf_inner(&mut self, uuid: &str) -> Result<bool> {
        let mut tracker = CoalesceTracker::new();
        while !self.can_live_coalesce_vdi(uuid)? {
            let v = self.forest.get(uuid).context("candidate vanished")?.clone();
            let prev_size = self.driver.load_phys_size(&v)?;
            if !self.snapshot_coalesce(uuid)? {
                return Ok(false);
            }
            let v = self.forest.get(uuid).context("candidate vanished")?.clone();
            let cur_size = self.driver.load_phys_size(&v)?;
            if let Some(node) = self.forest.get_mut(uuid) {
                node.size_phys = Some(cur_size);
                node.size_allocated = None;
            }
            if tracker.abort_coalesce(prev_size, cur_size) {
                tracker.log_reasoning();
                anyhow::bail!("VDI {uuid} could not be coalesced");
            }
        }
        tracker.log_summary();
        self.live_leaf_coalesce(uuid)
    }

    /// One snapshot-coalesce round: interpose a hidden snapshot between the
    /// leaf and its chain, then inline-coalesce that snapshot away. Shrinks
    /// the leaf by one level and (usually) most of its allocated data.
    fn snapshot_coalesce(&mut self, uuid: &str) -> Result<bool> {
        // we hold no locks here: the tree may change under our feet
        tracing::info!("single-snapshotting {uuid}");
        match self.session.snapshot_internal(uuid) {
            Ok(snap) => tracing::info!("single-snapshot returned: {snap}"),
            Err(e) => {
                self.scan_locked(false)?;
                if self.forest.get(uuid).is_none() {
                    tracing::info!("the VDI appears to have been concurrently deleted");
                    return Ok(false);
                }
                return Err(e);
            }
        }
        self.scan_locked(false)?;
        let Some(temp_snap) = self.forest.parent(uuid).map(|p| p.uuid.clone()) else {
            tracing::info!("the VDI appears to have been concurrently deleted");
            return Ok(false);
        };
        if !self.forest.is_coalesceable(&temp_snap) {
            tracing::info!("the VDI appears to have been concurrently snapshotted");
            return Ok(false);
        }
        tracing::info!("coalescing parent {temp_snap}");
        self.coalesce_inner(&temp_snap)?;
        if !self.forest.is_leaf_coalesceable(uuid) {
            tracing::info!("the VDI tree appears to have been altered since");
            return Ok(false);
        }
        Ok(true)
    }

    fn pause_one(&mut self, uuid: &str, failfast: bool) -> Result<()> {
        let v = self.forest.get(uuid).context("VDI vanished")?.clone();
        self.driver.pause_vdi(&v, failfast)?;
        self.set_config_vdi(uuid, config_keys::PAUSED, "true")
    }

    fn unpause_one(&mut self, uuid: &str) -> Result<()> {
        let v = self.forest.get(uuid).context("VDI vanished")?.clone();
        self.driver.unpause_vdi(&v)?;
        self.del_config_vdi(uuid, config_keys::PAUSED)
    }

    fn ensure_unpaused(&mut self, uuid: &str) {
        let paused = self
            .get_config_vdi(uuid, config_keys::PAUSED)
            .ok()
            .flatten()
            .as_deref()
            == Some("true");
        if paused {
            tracing::info!("unpausing VDI {uuid}");
            if let Err(e) = self.unpause_one(uuid) {
                tracing::error!("failed to unpause {uuid}: {e}");
            }
        }
    }

    /// The final paused step: re-verify under the SR lock, pause the leaf,
    /// coalesce the remainder within the downtime bound, swap identities,
    /// and clean up. On error the journal-driven undo runs immediately.
    fn live_leaf_coalesce(&mut self, uuid: &str) -> Result<bool> {
        self.lock()?;
        let r = self.live_leaf_coalesce_locked(uuid);
        self.cleanup();
        self.unlock();
        r
    }

    fn live_leaf_coalesce_locked(&mut self, uuid: &str) -> Result<bool> {
        self.scan(false)?;
        if self.forest.get(uuid).is_none() {
            tracing::info!("the VDI appears to have been deleted meanwhile");
            return Ok(false);
        }
        if !self.forest.is_leaf_coalesceable(uuid) {
            tracing::info!("the VDI is no longer leaf-coalesceable");
            return Ok(false);
        }

        // a raw parent that must grow does so before the pause: extending
        // a raw device zero-fills the extension, which is slow
        let v = self.forest.get(uuid).unwrap().clone();
        let parent = self.forest.parent(uuid).unwrap().clone();
        if parent.raw && v.size_virt > parent.size_virt {
            self.increase_size_virt(&parent.uuid, v.size_virt, true)?;
        }

        // the journal goes in before the pause: a crash from here on is
        // resolved by recovery, which also takes care of unpausing
        let payload = match self.driver.refcounts(&parent.uuid)? {
            Some((c, b)) => format!("{}.{c}.{b}", parent.uuid),
            None => parent.uuid.clone(),
        };
        self.journal.create(JournalKind::Leaf, uuid, &payload)?;

        let r = self
            .pause_one(uuid, true)
            .and_then(|()| self.do_coalesce_leaf(uuid));
        if let Err(e) = &r {
            tracing::warn!("leaf-coalesce of {uuid} failed mid-protocol: {e:#}");
            if let Err(re) = self.handle_interrupted_coalesce_leaf() {
                tracing::error!("leaf-coalesce recovery also failed: {re:#}");
            }
        }
        if self.forest.get(uuid).is_some() {
            self.ensure_unpaused(uuid);
        }
        let old_uuid = format!("{TMP_RENAME_PREFIX}{uuid}");
        if self.forest.get(&old_uuid).is_some() {
            self.delete_vdi(&old_uuid)?;
        }
        r.map(|()| true)
    }

    /// The swap itself. Must be called with the leaf journal written, the
    /// leaf paused and the SR locked.
    fn do_coalesce_leaf(&mut self, uuid: &str) -> Result<()> {
        let v = self.forest.get(uuid).context("candidate vanished")?.clone();
        let parent_uuid = v.parent_uuid.clone().context("leaf has no parent")?;

        let size_data = self.coalesced_size_data(uuid)?;
        self.driver
            .prepare_coalesce_leaf(&self.forest, uuid, size_data)?;

        let parent = self.forest.get(&parent_uuid).context("parent vanished")?.clone();
        self.driver.set_hidden_on_disk(&parent, false)?;
        if let Some(p) = self.forest.get_mut(&parent_uuid) {
            p.hidden = false;
        }
        self.increase_size_virt(&parent_uuid, v.size_virt, false)?;
        if !v.raw {
            self.vhd.check(&v.path, true)?;
        }
        let parent = self.forest.get(&parent_uuid).context("parent vanished")?.clone();
        if !parent.raw {
            self.vhd.check(&parent.path, true)?;
        }

        let forced = self.get_config_vdi(uuid, config_keys::LEAF_COALESCE)?.as_deref()
            == Some(config_keys::LEAFCLSC_FORCE);
        let timeout = if forced {
            tracing::info!("leaf-coalesce forced, will not use timeout");
            None
        } else {
            Some(LIVE_LEAF_TIMEOUT)
        };
        self.coalesce_vhd(uuid, timeout)?;
        if !parent.raw {
            self.vhd.check(&parent.path, true)?;
        }

        // swap identities: the parent becomes the leaf
        let old_uuid = format!("{TMP_RENAME_PREFIX}{uuid}");
        let old_file_name = v.file_name.clone();
        self.rename_node(uuid, &old_uuid)?;
        self.rename_node(&parent_uuid, uuid)?;
        let survivor = self.forest.get(uuid).context("survivor vanished")?.clone();
        self.driver
            .update_slaves_on_rename(&survivor, &old_file_name, &parent_uuid)?;

        // migrate the VDI record to the survivor
        self.del_config_vdi(uuid, config_keys::VHD_PARENT)?;
        if survivor.raw {
            self.set_config_vdi(uuid, config_keys::VDI_TYPE, config_keys::VDI_TYPE_RAW)?;
        }
        self.del_config_vdi(uuid, config_keys::VHD_BLOCKS)?;

        let old_node = self.forest.get(&old_uuid).context("old leaf vanished")?.clone();
        self.driver.update_node_leaf(&old_node, &survivor)?;

        // hide the obsolete leaf and cut it loose
        self.driver.set_hidden_on_disk(&old_node, true)?;
        if let Some(o) = self.forest.get_mut(&old_uuid) {
            o.hidden = true;
            o.parent_uuid = None;
        }

        // deletion contacts the slaves and we are paused: only do it now
        // if the survivor needs the space
        let extra = self
            .driver
            .extra_space_after_leaf(&self.forest, &old_uuid, uuid)?;
        let free = self.free_space()?;
        if free < extra {
            self.delete_vdi(&old_uuid)?;
        }

        self.journal.remove(JournalKind::Leaf, uuid)?;
        self.session.forget_vdi(&parent_uuid)?;
        self.driver.finish_coalesce_leaf(&mut self.forest, uuid)?;
        self.driver.update_slaves_on_resize(&self.forest, uuid)?;
        Ok(())
    }

    /// Rename a node on disk and in the forest, fixing name and path.
    fn rename_node(&mut self, uuid: &str, new_uuid: &str) -> Result<()> {
        let v = self.forest.get(uuid).context("rename source vanished")?.clone();
        let new_name = self.driver.rename_vdi(&v, new_uuid)?;
        self.forest.rename(uuid, new_uuid);
        let new_path = self.driver.vdi_path(new_uuid, v.raw);
        if let Some(n) = self.forest.get_mut(new_uuid) {
            n.file_name = new_name;
            n.path = new_path;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // recovery

    /// Resolve any leaf-coalesce the journal says was interrupted: undo it
    /// while the original parent (or the renamed old leaf) still exists,
    /// finish it when only the swapped survivor remains.
    pub(crate) fn handle_interrupted_coalesce_leaf(&mut self) -> Result<()> {
        for (child_uuid, payload) in self.journal.entries(JournalKind::Leaf)? {
            let (parent_uuid, counts) = parse_leaf_payload(&payload)?;
            let (parent_present, old_child_present) = self
                .driver
                .leaf_parts_present(&child_uuid, &parent_uuid)?;
            if parent_present || old_child_present {
                self.undo_interrupted_leaf(&child_uuid, &parent_uuid, counts)?;
            } else {
                self.finish_interrupted_leaf(&child_uuid, &parent_uuid)?;
            }
            self.journal.remove(JournalKind::Leaf, &child_uuid)?;
            if self.forest.get(&child_uuid).is_some() {
                self.ensure_unpaused(&child_uuid);
            }
        }
        Ok(())
    }

    /// Safe because the child's on-disk parent pointer still names the
    /// original parent until the swap is complete.
    fn undo_interrupted_leaf(
        &mut self,
        child_uuid: &str,
        parent_uuid: &str,
        counts: Option<(u64, u64)>,
    ) -> Result<()> {
        tracing::warn!("*** UNDO LEAF-COALESCE");
        if self.forest.get(parent_uuid).is_none() {
            // the swap got as far as renaming the parent to the child's
            // uuid; rename it back
            anyhow::ensure!(
                self.forest.get(child_uuid).is_some(),
                "neither {parent_uuid} nor {child_uuid} found"
            );
            tracing::info!("renaming parent back: {child_uuid} -> {parent_uuid}");
            self.rename_node(child_uuid, parent_uuid)?;
        }
        let old_uuid = format!("{TMP_RENAME_PREFIX}{child_uuid}");
        if self.forest.get(child_uuid).is_none() {
            anyhow::ensure!(
                self.forest.get(&old_uuid).is_some(),
                "neither {child_uuid} nor {old_uuid} found"
            );
            tracing::info!("renaming child back to {child_uuid}");
            self.rename_node(&old_uuid, child_uuid)?;
            tracing::info!("updating the VDI record");
            self.set_config_vdi(child_uuid, config_keys::VHD_PARENT, parent_uuid)?;
            self.set_config_vdi(child_uuid, config_keys::VDI_TYPE, config_keys::VDI_TYPE_VHD)?;
        }
        // restore tree relationship invariants for the rest of this run
        if let Some(c) = self.forest.get_mut(child_uuid) {
            c.parent_uuid = Some(parent_uuid.to_string());
        }
        if let Some(p) = self.forest.get_mut(parent_uuid) {
            if !p.children.iter().any(|c| c == child_uuid) {
                p.children.push(child_uuid.to_string());
            }
        }

        self.driver
            .undo_leaf_backend(&self.forest, child_uuid, parent_uuid, counts)?;

        let child = self.forest.get(child_uuid).context("child vanished")?.clone();
        if child.hidden {
            self.driver.set_hidden_on_disk(&child, false)?;
            self.forest.get_mut(child_uuid).unwrap().hidden = false;
        }
        let parent = self.forest.get(parent_uuid).context("parent vanished")?.clone();
        if !parent.hidden {
            self.driver.set_hidden_on_disk(&parent, true)?;
            self.forest.get_mut(parent_uuid).unwrap().hidden = true;
        }
        self.driver
            .update_slaves_on_undo_leaf(&self.forest, parent_uuid, child_uuid)?;
        tracing::info!("*** leaf-coalesce undo successful");
        Ok(())
    }

    /// The swap completed but we crashed before clearing the journal.
    fn finish_interrupted_leaf(&mut self, child_uuid: &str, parent_uuid: &str) -> Result<()> {
        tracing::warn!("*** FINISH LEAF-COALESCE");
        anyhow::ensure!(
            self.forest.get(child_uuid).is_some(),
            "VDI {child_uuid} not found"
        );
        self.driver.finish_leaf_backend(&self.forest, child_uuid)?;
        self.session.forget_vdi(parent_uuid)?;
        self.driver.update_slaves_on_resize(&self.forest, child_uuid)?;
        tracing::info!("*** finished leaf-coalesce successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_iteration_budget_binds_even_with_progress() {
        let mut t = CoalesceTracker::new();
        let mut size = 10_000u64;
        for _ in 0..CoalesceTracker::MAX_ITERATIONS {
            assert!(!t.abort_coalesce(size, size - 10));
            size -= 10;
        }
        assert!(t.abort_coalesce(size, size - 10));
        assert!(t.reason.contains("Max iterations"));
    }

    #[test]
    fn test_tracker_no_progress() {
        // a leaf that never shrinks is abandoned after three flat rounds
        let mut t = CoalesceTracker::new();
        assert!(!t.abort_coalesce(1000, 1000));
        assert!(!t.abort_coalesce(1000, 1000));
        assert!(t.abort_coalesce(1000, 1000));
        assert!(t.reason.contains("No progress"));
    }

    #[test]
    fn test_tracker_no_progress_interleaved() {
        let mut t = CoalesceTracker::new();
        assert!(!t.abort_coalesce(1000, 1001));
        // progress resets the counter
        assert!(!t.abort_coalesce(1001, 900));
        assert!(!t.abort_coalesce(900, 901));
        assert!(!t.abort_coalesce(901, 902));
        assert!(t.abort_coalesce(902, 903));
    }

    #[test]
    fn test_tracker_size_bump() {
        let mut t = CoalesceTracker::new();
        assert!(!t.abort_coalesce(1000, 100));
        // two consecutive iterations ending above 1.2x the minimum
        assert!(!t.abort_coalesce(100, 90));
        assert!(!t.abort_coalesce(90, 200));
        assert!(t.abort_coalesce(200, 210));
        assert!(t.reason.contains("bump"));
    }

    #[test]
    fn test_tracker_max_iterations() {
        let mut t = CoalesceTracker::new();
        // alternate progress/no-progress so no other condition trips
        let mut toggle = false;
        for i in 0..CoalesceTracker::MAX_ITERATIONS {
            let (prev, cur) = if toggle { (1000, 1001) } else { (1001, 900) };
            toggle = !toggle;
            assert!(!t.abort_coalesce(prev, cur), "tripped early at {i}");
        }
        assert!(t.abort_coalesce(1000, 1001));
        assert!(t.reason.contains("Max iterations"));
    }

    #[test]
    fn test_parse_leaf_payload() {
        let (p, counts) = parse_leaf_payload("33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e").unwrap();
        assert_eq!(p, "33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e");
        assert_eq!(counts, None);
        let (p, counts) = parse_leaf_payload("33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e.3.1").unwrap();
        assert_eq!(p, "33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e");
        assert_eq!(counts, Some((3, 1)));
    }
}
