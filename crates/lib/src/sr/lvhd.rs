//! The logical-volume back-end: VDIs are LVs in a per-SR volume group,
//! VHD-formatted unless carrying the raw prefix. Coalesce work requires
//! activating volumes and inflating/deflating them around each data copy.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::abort::AbortHandle;
use crate::config::RuntimeDirs;
use crate::control::Session;
use crate::journal::{JournalKind, Journaler};
use crate::refcount::RefCounter;
use crate::sr::SrDriver;
use crate::tree::Forest;
use crate::vdi::{Vdi, TMP_RENAME_PREFIX, UUID_LEN};

pub const VG_PREFIX: &str = "VG_HSM-";
pub const LV_PREFIX_VHD: &str = "VHD-";
pub const LV_PREFIX_RAW: &str = "LV-";

/// Refcount namespace prefix for this back-end.
const NS_PREFIX_LVM: &str = "lvm-";
/// LV tag carrying the hidden bit for raw volumes.
const TAG_HIDDEN: &str = "hidden";
/// The plugin slaves run for deactivate/refresh housekeeping.
const PLUGIN_ON_SLAVE: &str = "on-slave";

pub fn extract_uuid(name: &str) -> Option<String> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let uuid = base
        .strip_prefix(LV_PREFIX_VHD)
        .or_else(|| base.strip_prefix(LV_PREFIX_RAW))?;
    let plain = uuid.strip_prefix(TMP_RENAME_PREFIX).unwrap_or(uuid);
    (plain.len() == UUID_LEN).then(|| uuid.to_string())
}

/// Size of the LV backing a fully-inflated VHD of the given virtual size.
pub fn calc_size_vhd_lv(size_virt: u64) -> u64 {
    vhdgc_lvm::round_size(
        size_virt
            + vhdgc_vhd::calc_overhead_bitmap(size_virt)
            + vhdgc_vhd::calc_overhead_empty(size_virt),
    )
}

#[derive(Debug)]
pub struct LvhdSr {
    session: Session,
    sr_uuid: String,
    vg_name: String,
    path: Utf8PathBuf,
    refcount: RefCounter,
    /// LV names activated by this worker, to be released at cleanup.
    activated: BTreeSet<String>,
}

impl LvhdSr {
    pub fn new(session: Session, sr_uuid: &str, dirs: &RuntimeDirs) -> Self {
        let vg_name = format!("{VG_PREFIX}{sr_uuid}");
        let path = Utf8PathBuf::from(vhdgc_lvm::VG_LOCATION).join(&vg_name);
        Self {
            session,
            sr_uuid: sr_uuid.to_string(),
            refcount: RefCounter::new(&dirs.refcount, &format!("{NS_PREFIX_LVM}{sr_uuid}")),
            vg_name,
            path,
            activated: BTreeSet::new(),
        }
    }

    pub fn vg_name(&self) -> String {
        self.vg_name.clone()
    }

    fn ns(&self) -> String {
        format!("{NS_PREFIX_LVM}{}", self.sr_uuid)
    }

    fn lv_name(&self, uuid: &str, raw: bool) -> String {
        let prefix = if raw { LV_PREFIX_RAW } else { LV_PREFIX_VHD };
        format!("{prefix}{uuid}")
    }

    fn activate(&mut self, lv_name: &str) -> Result<()> {
        if self.activated.contains(lv_name) {
            return Ok(());
        }
        vhdgc_lvm::activate(&self.vg_name, lv_name)?;
        self.activated.insert(lv_name.to_string());
        Ok(())
    }

    fn activate_chain(&mut self, forest: &Forest, uuid: &str) -> Result<()> {
        let mut cur = Some(uuid.to_string());
        while let Some(u) = cur {
            let Some(v) = forest.get(&u) else { break };
            let (name, parent) = (v.file_name.clone(), v.parent_uuid.clone());
            self.activate(&name)?;
            cur = parent;
        }
        Ok(())
    }

    fn set_readonly(&self, lv_name: &str, readonly: bool) -> Result<()> {
        vhdgc_lvm::set_readonly(&self.vg_name, lv_name, readonly)
    }

    /// Grow the LV under a VHD to `size` (never shrinks).
    fn inflate(&mut self, vdi: &Vdi, size: u64) -> Result<()> {
        if vdi.raw {
            return Ok(());
        }
        let target = vhdgc_lvm::round_size(size);
        let current = vdi.lv.as_ref().map(|l| l.size).unwrap_or(0);
        if target <= current {
            return Ok(());
        }
        self.activate(&vdi.file_name)?;
        vhdgc_lvm::resize(&self.vg_name, &vdi.file_name, target)
    }

    /// Shrink the LV back to the VHD's physical utilization.
    fn deflate(&mut self, vdi: &Vdi) -> Result<()> {
        if vdi.raw {
            return Ok(());
        }
        self.activate(&vdi.file_name)?;
        let phys = vhdgc_vhd::get_size_phys(&vdi.path)?;
        let target = vhdgc_lvm::round_size(phys);
        let current = vdi.lv.as_ref().map(|l| l.size).unwrap_or(0);
        if target >= current {
            return Ok(());
        }
        vhdgc_lvm::resize(&self.vg_name, &vdi.file_name, target)
    }

    fn inflate_fully(&mut self, vdi: &Vdi) -> Result<()> {
        self.inflate(vdi, calc_size_vhd_lv(vdi.size_virt))
    }

    /// Administrative entry points for the `debug` subcommand.
    pub fn debug_activate(&mut self, vdi: &Vdi) -> Result<()> {
        self.activate(&vdi.file_name)
    }

    pub fn debug_deactivate(&mut self, vdi: &Vdi) -> Result<()> {
        vhdgc_lvm::deactivate(&self.vg_name, &vdi.file_name)
    }

    pub fn debug_inflate(&mut self, vdi: &Vdi) -> Result<()> {
        self.inflate_fully(vdi)
    }

    pub fn debug_deflate(&mut self, vdi: &Vdi) -> Result<()> {
        self.deflate(vdi)
    }

    /// True if any host currently has the VDI attached read-write.
    fn attached_rw(&self, uuid: &str) -> Result<bool> {
        let Some(rec) = self.session.vdi_record(uuid)? else {
            return Ok(false);
        };
        Ok(rec
            .sm_config
            .iter()
            .any(|(k, v)| k.starts_with("host_") && v == "RW"))
    }

    fn call_slaves(&self, vdi_uuids: &[String], args: &BTreeMap<String, String>, what: &str) -> Result<()> {
        let slaves = self.session.hosts_attached_on(&self.sr_uuid, vdi_uuids)?;
        if slaves.is_empty() {
            tracing::debug!("{what}: not attached on any slave");
            return Ok(());
        }
        for slave in slaves {
            tracing::info!("{what}: updating slave {slave}");
            let text = self
                .session
                .call_plugin(&slave, PLUGIN_ON_SLAVE, "multi", args)?;
            tracing::debug!("call-plugin returned: '{text}'");
        }
        Ok(())
    }
}

impl SrDriver for LvhdSr {
    fn kind(&self) -> &'static str {
        "lvhd"
    }

    fn path(&self) -> &Utf8Path {
        &self.path
    }

    #[context("Scanning LVHD SR")]
    fn scan_once(&mut self) -> Result<(BTreeMap<String, Vdi>, bool)> {
        let lvs = vhdgc_lvm::list_lvs(&self.vg_name)?;
        let mut errors = false;
        let mut nodes = BTreeMap::new();

        // device nodes must exist for the batch VHD scan
        for lv in &lvs {
            if lv.name.starts_with(LV_PREFIX_VHD) && !lv.active {
                self.activate(&lv.name)?;
            }
        }
        let pattern = format!("{}/{LV_PREFIX_VHD}*", self.path);
        let vhds = vhdgc_vhd::scan(&pattern, extract_uuid)?;

        for lv in &lvs {
            let raw = lv.name.starts_with(LV_PREFIX_RAW);
            let Some(uuid) = extract_uuid(&lv.name) else {
                continue;
            };
            let mut node = Vdi {
                uuid: uuid.clone(),
                file_name: lv.name.clone(),
                path: vhdgc_lvm::lv_path(&self.vg_name, &lv.name),
                raw,
                lv: Some(crate::vdi::LvInfo {
                    size: lv.size,
                    active: lv.active || self.activated.contains(&lv.name),
                    open: lv.open,
                    readonly: lv.readonly,
                }),
                ..Default::default()
            };
            if raw {
                node.hidden = lv.has_tag(TAG_HIDDEN);
                node.size_virt = lv.size;
                node.size_phys = Some(lv.size);
            } else {
                match vhds.get(&uuid) {
                    Some(info) if !info.error => {
                        node.hidden = info.hidden;
                        node.size_virt = info.size_virt;
                        node.parent_uuid = info.parent_uuid.clone();
                        // physical/allocated sizes are loaded lazily, only
                        // for nodes involved in coalescing
                    }
                    _ => {
                        tracing::warn!("failed to read VHD metadata of {}", lv.name);
                        node.scan_error = true;
                        errors = true;
                    }
                }
            }
            nodes.insert(uuid, node);
        }
        Ok((nodes, errors))
    }

    fn free_space(&self) -> Result<u64> {
        let (_, free) = vhdgc_lvm::vg_stats(&self.vg_name)?;
        Ok(free)
    }

    fn vdi_file_name(&self, uuid: &str, raw: bool) -> String {
        self.lv_name(uuid, raw)
    }

    fn vdi_path(&self, uuid: &str, raw: bool) -> Utf8PathBuf {
        vhdgc_lvm::lv_path(&self.vg_name, &self.lv_name(uuid, raw))
    }

    fn destroy_vdi(&mut self, vdi: &Vdi, abort: &AbortHandle) -> Result<()> {
        if self.activated.remove(&vdi.file_name) {
            vhdgc_lvm::deactivate(&self.vg_name, &vdi.file_name)?;
        }
        // confirm with every attached host that the LV is unused; failures
        // from hosts believed offline are ignored in case the control plane
        // is wrong about them
        let online = self.session.online_hosts()?;
        let mut args = BTreeMap::new();
        args.insert("vgName".into(), self.vg_name.clone());
        args.insert("action1".into(), "deactivateNoRefcount".into());
        args.insert("lvName1".into(), vdi.file_name.clone());
        args.insert("action2".into(), "cleanupLockAndRefcount".into());
        args.insert("uuid2".into(), vdi.uuid.clone());
        args.insert("ns2".into(), self.ns());
        for binding in self.session.attached_hosts(&self.sr_uuid)? {
            if binding.local {
                continue;
            }
            abort.checkpoint()?;
            tracing::debug!("checking {} with slave {}", vdi.uuid, binding.host);
            if let Err(e) = self
                .session
                .call_plugin(&binding.host, PLUGIN_ON_SLAVE, "multi", &args)
            {
                if online.contains(&binding.host) {
                    return Err(e);
                }
                tracing::warn!("ignoring failure on offline host {}: {e}", binding.host);
            }
        }
        vhdgc_lvm::remove(&self.vg_name, &vdi.file_name)?;
        self.refcount.reset(&vdi.uuid)
    }

    fn rename_vdi(&mut self, vdi: &Vdi, new_uuid: &str) -> Result<String> {
        let new_name = self.lv_name(new_uuid, vdi.raw);
        anyhow::ensure!(
            !vhdgc_lvm::exists(&self.vg_name, &new_name)?,
            "rename target {new_name} exists"
        );
        vhdgc_lvm::rename(&self.vg_name, &vdi.file_name, &new_name)?;
        if self.activated.remove(&vdi.file_name) {
            self.activated.insert(new_name.clone());
        }
        let (cnt, bcnt) = self.refcount.check(&vdi.uuid)?;
        self.refcount.set(new_uuid, cnt, bcnt)?;
        self.refcount.reset(&vdi.uuid)?;
        Ok(new_name)
    }

    fn pause_vdi(&self, vdi: &Vdi, _failfast: bool) -> Result<()> {
        crate::tap::pause(&vdi.path).with_context(|| format!("failed to pause VDI {}", vdi.uuid))
    }

    fn unpause_vdi(&self, vdi: &Vdi) -> Result<()> {
        crate::tap::unpause(&vdi.path, None)
            .with_context(|| format!("failed to unpause VDI {}", vdi.uuid))
    }

    fn refresh_vdi(&self, vdi: &Vdi) -> Result<()> {
        crate::tap::pause(&vdi.path)?;
        crate::tap::unpause(&vdi.path, Some(&vdi.path))
            .with_context(|| format!("failed to refresh VDI {}", vdi.uuid))
    }

    fn activate_vdi(&mut self, vdi: &Vdi) -> Result<()> {
        self.activate(&vdi.file_name)
    }

    fn deactivate_all(&mut self) -> Result<()> {
        let mut failed = false;
        for lv_name in std::mem::take(&mut self.activated) {
            if let Err(e) = vhdgc_lvm::deactivate(&self.vg_name, &lv_name) {
                tracing::error!("failed to deactivate {lv_name}: {e}");
                failed = true;
            }
        }
        anyhow::ensure!(!failed, "failed to deactivate some LVs");
        Ok(())
    }

    fn load_phys_size(&mut self, vdi: &Vdi) -> Result<u64> {
        if vdi.raw {
            return Ok(vdi.lv.as_ref().map(|l| l.size).unwrap_or(0));
        }
        self.activate(&vdi.file_name)?;
        let phys = vhdgc_vhd::get_size_phys(&vdi.path)?;
        anyhow::ensure!(phys > 0, "physical size of {} = {phys}", vdi.uuid);
        Ok(phys)
    }

    fn load_allocated_size(&mut self, vdi: &Vdi) -> Result<u64> {
        if vdi.raw {
            return Ok(vdi.lv.as_ref().map(|l| l.size).unwrap_or(0));
        }
        self.activate(&vdi.file_name)?;
        vhdgc_vhd::get_allocated_size(&vdi.path)
    }

    /// Parents must be activated, made writable and inflated to the
    /// predicted post-coalesce allocation before the data copy.
    fn prepare_coalesce(&mut self, forest: &Forest, child: &str, size_data: u64) -> Result<()> {
        self.activate_chain(forest, child)?;
        let parent = forest.parent(child).context("candidate has no parent")?.clone();
        if parent.raw {
            return Ok(());
        }
        self.set_readonly(&parent.file_name, false)?;
        let inc = self.extra_space_for_coalesce(forest, child, size_data)?;
        if inc > 0 {
            let target = parent.lv.as_ref().map(|l| l.size).unwrap_or(0) + inc;
            self.inflate(&parent, target)?;
        }
        Ok(())
    }

    fn finish_coalesce(&mut self, forest: &mut Forest, child: &str) -> Result<()> {
        let Some(parent) = forest.parent(child).cloned() else {
            return Ok(());
        };
        if parent.raw {
            return Ok(());
        }
        self.deflate(&parent)?;
        self.set_readonly(&parent.file_name, true)
    }

    fn set_parent_on_disk(&mut self, child: &Vdi, parent: &Vdi) -> Result<()> {
        self.activate(&child.file_name)?;
        let was_readonly = child.lv.as_ref().is_some_and(|l| l.readonly);
        if was_readonly {
            self.set_readonly(&child.file_name, false)?;
        }
        let r = vhdgc_vhd::set_parent(&child.path, &parent.path, parent.raw);
        if was_readonly {
            self.set_readonly(&child.file_name, true)?;
        }
        r
    }

    fn set_hidden_on_disk(&mut self, vdi: &Vdi, hidden: bool) -> Result<()> {
        if vdi.raw {
            return vhdgc_lvm::set_tag(&self.vg_name, &vdi.file_name, TAG_HIDDEN, hidden);
        }
        self.activate(&vdi.file_name)?;
        vhdgc_vhd::set_hidden(&vdi.path, hidden)
    }

    fn resize_journaled(&mut self, vdi: &Vdi, size: u64) -> Result<()> {
        self.activate(&vdi.file_name)?;
        // the resize journal is itself a small LV, so it survives with the VG
        let journal_lv = format!("resize_journal_{}", vdi.uuid);
        vhdgc_lvm::create(&self.vg_name, &journal_lv, vhdgc_vhd::VHD_JOURNAL_SIZE, true)?;
        let journal_path = vhdgc_lvm::lv_path(&self.vg_name, &journal_lv);
        let r = vhdgc_vhd::set_size_virt(&vdi.path, size, &journal_path);
        if let Err(e) = vhdgc_lvm::remove(&self.vg_name, &journal_lv) {
            tracing::warn!("failed to remove resize journal {journal_lv}: {e}");
        }
        r
    }

    /// Extending a raw LV exposes stale data, so the extension is zeroed
    /// out; the zero journal makes an interrupted fill restartable.
    fn grow_raw(
        &mut self,
        journal: &dyn Journaler,
        vdi: &Vdi,
        size: u64,
        abort: &AbortHandle,
    ) -> Result<u64> {
        self.activate(&vdi.file_name)?;
        let old_size = vdi.lv.as_ref().map(|l| l.size).unwrap_or(0);
        let mut offset = old_size;
        let mut new_size = old_size;
        if vdi.size_virt < size {
            new_size = vhdgc_lvm::round_size(size);
            tracing::info!("growing {}: {old_size} -> {new_size}", vdi.path);
            vhdgc_lvm::resize(&self.vg_name, &vdi.file_name, new_size)?;
        }
        if let Some(jval) = journal.get(JournalKind::Zero, &vdi.uuid)? {
            tracing::info!("redoing unfinished zeroing out");
            offset = jval.parse().context("parsing zero journal offset")?;
        } else {
            if new_size <= offset {
                return Ok(new_size);
            }
            journal.create(JournalKind::Zero, &vdi.uuid, &offset.to_string())?;
        }
        let length = new_size - offset;
        tracing::info!("zeroing {}: from {offset}, {length}B", vdi.path);
        vhdgc_lvm::zero_out(&vdi.path, offset, length, || abort.checkpoint())?;
        journal.remove(JournalKind::Zero, &vdi.uuid)?;
        Ok(new_size)
    }

    fn extra_space_for_coalesce(
        &mut self,
        forest: &Forest,
        child: &str,
        size_data: u64,
    ) -> Result<u64> {
        let parent = forest.parent(child).context("candidate has no parent")?;
        if parent.raw {
            // raw parents are never deflated in the first place
            return Ok(0);
        }
        let size_coalesced = calc_size_vhd_lv(size_data);
        tracing::debug!("coalesced size = {size_coalesced}");
        let parent_lv = parent.lv.as_ref().map(|l| l.size).unwrap_or(0);
        Ok(size_coalesced.saturating_sub(parent_lv))
    }

    fn extra_space_for_leaf_coalesce(
        &mut self,
        forest: &Forest,
        child: &str,
        size_data: u64,
    ) -> Result<u64> {
        // the leaf can be deflated first, reducing the requirement
        let v = forest.get(child).context("candidate vanished")?.clone();
        let phys = match v.size_phys {
            Some(p) => p,
            None => self.load_phys_size(&v)?,
        };
        let lv_size = v.lv.as_ref().map(|l| l.size).unwrap_or(0);
        let deflate_slack = lv_size.saturating_sub(vhdgc_lvm::round_size(phys));
        Ok(self
            .extra_space_for_coalesce(forest, child, size_data)?
            .saturating_sub(deflate_slack))
    }

    fn extra_space_for_snapshot_coalesce(
        &mut self,
        forest: &Forest,
        child: &str,
        size_data: u64,
    ) -> Result<u64> {
        let v = forest.get(child).context("candidate vanished")?.clone();
        let phys = match v.size_phys {
            Some(p) => p,
            None => self.load_phys_size(&v)?,
        };
        Ok(self.extra_space_for_coalesce(forest, child, size_data)?
            + vhdgc_lvm::round_size(phys))
    }

    fn prepare_coalesce_leaf(&mut self, forest: &Forest, child: &str, size_data: u64) -> Result<()> {
        self.activate_chain(forest, child)?;
        let v = forest.get(child).context("candidate vanished")?.clone();
        let parent = forest.parent(child).context("candidate has no parent")?.clone();
        if !parent.raw {
            self.set_readonly(&parent.file_name, false)?;
        }
        self.deflate(&v)?;
        if !parent.raw {
            let inc = self.extra_space_for_coalesce(forest, child, size_data)?;
            if inc > 0 {
                let target = parent.lv.as_ref().map(|l| l.size).unwrap_or(0) + inc;
                self.inflate(&parent, target)?;
            }
        }
        Ok(())
    }

    /// The survivor keeps serving the leaf's consumers: it inherits the
    /// leaf's binary refcount, and sheds that share from its normal count.
    fn update_node_leaf(&mut self, child: &Vdi, parent: &Vdi) -> Result<()> {
        let (_, c_bcnt) = self.refcount.check(&child.uuid)?;
        let (p_cnt, _) = self.refcount.check(&parent.uuid)?;
        let p_cnt = p_cnt
            .checked_sub(c_bcnt)
            .context("parent refcount below the leaf's binary count")?;
        self.refcount.set(&parent.uuid, p_cnt, c_bcnt)
    }

    fn finish_coalesce_leaf(&mut self, forest: &mut Forest, survivor: &str) -> Result<()> {
        let v = forest.get(survivor).context("survivor vanished")?.clone();
        let is_snapshot = self
            .session
            .vdi_record(survivor)?
            .map(|r| r.is_a_snapshot)
            .unwrap_or(false);
        if !is_snapshot || self.attached_rw(survivor)? {
            self.inflate_fully(&v)?;
        } else {
            self.deflate(&v)?;
        }
        Ok(())
    }

    fn extra_space_after_leaf(&mut self, forest: &Forest, _child: &str, parent: &str) -> Result<u64> {
        let p = forest.get(parent).context("survivor vanished")?;
        let lv_size = p.lv.as_ref().map(|l| l.size).unwrap_or(0);
        Ok(calc_size_vhd_lv(p.size_virt).saturating_sub(lv_size))
    }

    fn leaf_parts_present(&mut self, child_uuid: &str, parent_uuid: &str) -> Result<(bool, bool)> {
        let parent_present = vhdgc_lvm::exists(&self.vg_name, &self.lv_name(parent_uuid, false))?
            || vhdgc_lvm::exists(&self.vg_name, &self.lv_name(parent_uuid, true))?;
        let old_child = vhdgc_lvm::exists(
            &self.vg_name,
            &format!("{LV_PREFIX_VHD}{TMP_RENAME_PREFIX}{child_uuid}"),
        )?;
        Ok((parent_present, old_child))
    }

    fn undo_leaf_backend(
        &mut self,
        forest: &Forest,
        child: &str,
        parent: &str,
        counts: Option<(u64, u64)>,
    ) -> Result<()> {
        // restore the pre-swap refcounts recorded in the leaf journal
        if let Some((cnt, bcnt)) = counts {
            self.refcount.set(parent, cnt, bcnt)?;
        }
        let p = forest.get(parent).context("parent vanished")?.clone();
        let c = forest.get(child).context("child vanished")?.clone();
        self.deflate(&p)?;
        self.inflate_fully(&c)?;
        if !p.lv.as_ref().is_some_and(|l| l.readonly) {
            self.set_readonly(&p.file_name, true)?;
        }
        Ok(())
    }

    fn finish_leaf_backend(&mut self, forest: &Forest, child: &str) -> Result<()> {
        let v = forest.get(child).context("survivor vanished")?.clone();
        self.inflate_fully(&v)
    }

    fn refcounts(&self, uuid: &str) -> Result<Option<(u64, u64)>> {
        Ok(Some(self.refcount.check(uuid)?))
    }

    fn update_slaves_on_rename(&mut self, vdi: &Vdi, old_name: &str, orig_parent: &str) -> Result<()> {
        let mut args = BTreeMap::new();
        args.insert("vgName".into(), self.vg_name.clone());
        args.insert("action1".into(), "deactivateNoRefcount".into());
        args.insert("lvName1".into(), old_name.to_string());
        args.insert("action2".into(), "refresh".into());
        args.insert("lvName2".into(), vdi.file_name.clone());
        args.insert("action3".into(), "cleanupLockAndRefcount".into());
        args.insert("uuid3".into(), orig_parent.to_string());
        args.insert("ns3".into(), self.ns());
        self.call_slaves(&[vdi.uuid.clone()], &args, "update-on-rename")
    }

    fn update_slaves_on_resize(&mut self, forest: &Forest, uuid: &str) -> Result<()> {
        let v = forest.get(uuid).context("VDI vanished")?;
        let leaves = forest.leaves(uuid);
        let mut args = BTreeMap::new();
        args.insert("vgName".into(), self.vg_name.clone());
        args.insert("action1".into(), "refresh".into());
        args.insert("lvName1".into(), v.file_name.clone());
        self.call_slaves(&leaves, &args, "update-on-resize")
    }

    fn update_slaves_on_undo_leaf(&mut self, forest: &Forest, parent: &str, child: &str) -> Result<()> {
        let p = forest.get(parent).context("parent vanished")?;
        let c = forest.get(child).context("child vanished")?;
        let tmp_name = format!("{LV_PREFIX_VHD}{TMP_RENAME_PREFIX}{child}");
        let mut args = BTreeMap::new();
        args.insert("vgName".into(), self.vg_name.clone());
        args.insert("action1".into(), "deactivateNoRefcount".into());
        args.insert("lvName1".into(), tmp_name);
        args.insert("action2".into(), "deactivateNoRefcount".into());
        args.insert("lvName2".into(), c.file_name.clone());
        args.insert("action3".into(), "refresh".into());
        args.insert("lvName3".into(), c.file_name.clone());
        args.insert("action4".into(), "refresh".into());
        args.insert("lvName4".into(), p.file_name.clone());
        self.call_slaves(&[child.to_string()], &args, "update-on-leaf-undo")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_uuid() {
        assert_eq!(
            extract_uuid("VHD-33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e").as_deref(),
            Some("33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e")
        );
        assert_eq!(
            extract_uuid("/dev/VG_HSM-x/LV-33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e").as_deref(),
            Some("33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e")
        );
        assert_eq!(
            extract_uuid("VHD-OLD_33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e").as_deref(),
            Some("OLD_33a1fb37-0d01-4c71-bd1e-7d7a6c0cb00e")
        );
        assert_eq!(extract_uuid("jrn_leaf_abc_def"), None);
        assert_eq!(extract_uuid("VHD-tooshort"), None);
    }

    #[test]
    fn test_calc_size_vhd_lv() {
        let size = calc_size_vhd_lv(10 * 1024 * 1024 * 1024);
        // virtual size + block bitmaps + static metadata, rounded to extents
        assert!(size > 10 * 1024 * 1024 * 1024);
        assert_eq!(size % vhdgc_lvm::LVM_SIZE_INCREMENT, 0);
    }
}
