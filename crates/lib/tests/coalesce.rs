//! End-to-end coalescer scenarios against in-memory implementations of the
//! driver, VHD-tool and control-plane seams.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use vhdgc_lib::abort::AbortHandle;
use vhdgc_lib::config::RuntimeDirs;
use vhdgc_lib::control::{ConfigMap, ControlPlane, HostBinding, SrRecord, VdiRecord};
use vhdgc_lib::journal::{FileJournaler, JournalKind, Journaler};
use vhdgc_lib::sr::{AttachOptions, Sr, SrDriver};
use vhdgc_lib::tree::Forest;
use vhdgc_lib::vdi::Vdi;
use vhdgc_lib::vhdkit::VhdKit;

const SR: &str = "f6ba8a47-4ccb-4a76-9b2b-6ca34d4b9ba9";

fn uuid(n: u32) -> String {
    format!("{n:08x}-0000-4000-8000-0123456789ab")
}

#[derive(Debug, Clone)]
struct Image {
    uuid: String,
    raw: bool,
    hidden: bool,
    parent: Option<String>,
    size_virt: u64,
    size_phys: u64,
    size_allocated: u64,
    bitmap: Vec<u8>,
}

impl Image {
    fn leaf_like(uuid: &str, parent: Option<&str>, hidden: bool) -> Self {
        Self {
            uuid: uuid.to_string(),
            raw: false,
            hidden,
            parent: parent.map(|p| p.to_string()),
            size_virt: 10 * 1024 * 1024 * 1024,
            size_phys: 8 * 1024 * 1024,
            size_allocated: 5 * 1024 * 1024,
            bitmap: vec![0x0f],
        }
    }
}

#[derive(Debug, Default)]
struct World {
    images: BTreeMap<String, Image>,
    free_space: u64,
    /// What every extra-space prediction returns.
    extra_space: u64,
    /// pause:/unpause:/refresh: event log.
    events: Vec<String>,
    forgotten: Vec<String>,
    vdi_config: BTreeMap<(String, String), String>,
    sr_sm_config: BTreeMap<String, String>,
    sr_other_config: BTreeMap<String, String>,
    messages: BTreeMap<String, String>,
    next_id: u32,
}

impl World {
    fn image_by_path(&mut self, path: &Utf8Path) -> Result<&mut Image> {
        let uuid = path
            .file_name()
            .and_then(|n| n.strip_suffix(".vhd"))
            .context("odd fake path")?
            .to_string();
        self.images
            .get_mut(&uuid)
            .with_context(|| format!("no image at {path}"))
    }
}

type Shared = Arc<Mutex<World>>;

#[derive(Debug)]
struct MockControl(Shared);

impl ControlPlane for MockControl {
    fn sr_record(&self, sr_uuid: &str) -> Result<SrRecord> {
        let w = self.0.lock().unwrap();
        Ok(SrRecord {
            uuid: sr_uuid.to_string(),
            name_label: "mock SR".into(),
            ty: "ext".into(),
            shared: false,
            sm_config: w.sr_sm_config.clone(),
            other_config: w.sr_other_config.clone(),
        })
    }

    fn attached_hosts(&self, _sr: &str) -> Result<Vec<HostBinding>> {
        Ok(vec![HostBinding {
            host: "host-local".into(),
            local: true,
        }])
    }

    fn this_host(&self) -> Result<String> {
        Ok("host-local".into())
    }

    fn pool_master(&self) -> Result<String> {
        Ok("host-local".into())
    }

    fn online_hosts(&self) -> Result<Vec<String>> {
        Ok(vec!["host-local".into()])
    }

    fn vdi_record(&self, vdi_uuid: &str) -> Result<Option<VdiRecord>> {
        let w = self.0.lock().unwrap();
        Ok(w.images.get(vdi_uuid).map(|_| VdiRecord {
            uuid: vdi_uuid.to_string(),
            managed: true,
            ..Default::default()
        }))
    }

    fn vdi_config(&self, vdi_uuid: &str, _map: ConfigMap) -> Result<BTreeMap<String, String>> {
        let w = self.0.lock().unwrap();
        Ok(w.vdi_config
            .iter()
            .filter(|((u, _), _)| u == vdi_uuid)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    fn vdi_config_set(&self, vdi_uuid: &str, _map: ConfigMap, key: &str, value: &str) -> Result<()> {
        let mut w = self.0.lock().unwrap();
        w.vdi_config
            .insert((vdi_uuid.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn vdi_config_remove(&self, vdi_uuid: &str, _map: ConfigMap, key: &str) -> Result<()> {
        let mut w = self.0.lock().unwrap();
        w.vdi_config.remove(&(vdi_uuid.to_string(), key.to_string()));
        Ok(())
    }

    /// Interpose a new hidden node between the VDI and its former parent.
    fn snapshot_internal(&self, vdi_uuid: &str) -> Result<String> {
        let mut w = self.0.lock().unwrap();
        w.next_id += 1;
        let snap_uuid = format!("{:08x}-5a9d-4e00-8000-0123456789ab", w.next_id);
        let leaf = w.images.get(vdi_uuid).context("no such VDI")?.clone();
        let snap = Image {
            uuid: snap_uuid.clone(),
            raw: false,
            hidden: true,
            parent: leaf.parent.clone(),
            size_virt: leaf.size_virt,
            size_phys: leaf.size_phys,
            size_allocated: leaf.size_allocated,
            bitmap: leaf.bitmap.clone(),
        };
        w.images.insert(snap_uuid.clone(), snap);
        w.images.get_mut(vdi_uuid).unwrap().parent = Some(snap_uuid.clone());
        Ok(snap_uuid)
    }

    fn forget_vdi(&self, vdi_uuid: &str) -> Result<()> {
        self.0.lock().unwrap().forgotten.push(vdi_uuid.to_string());
        Ok(())
    }

    fn sr_config_set(&self, _sr: &str, map: ConfigMap, key: &str, value: &str) -> Result<()> {
        let mut w = self.0.lock().unwrap();
        let store = match map {
            ConfigMap::Sm => &mut w.sr_sm_config,
            _ => &mut w.sr_other_config,
        };
        store.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn sr_config_remove(&self, _sr: &str, map: ConfigMap, key: &str) -> Result<()> {
        let mut w = self.0.lock().unwrap();
        let store = match map {
            ConfigMap::Sm => &mut w.sr_sm_config,
            _ => &mut w.sr_other_config,
        };
        store.remove(key);
        Ok(())
    }

    fn message_create(
        &self,
        name: &str,
        _priority: &str,
        _cls: &str,
        _obj_uuid: &str,
        _body: &str,
    ) -> Result<String> {
        let mut w = self.0.lock().unwrap();
        w.next_id += 1;
        let id = format!("msg-{}", w.next_id);
        w.messages.insert(id.clone(), name.to_string());
        Ok(id)
    }

    fn message_destroy(&self, msg_id: &str) -> Result<()> {
        self.0.lock().unwrap().messages.remove(msg_id);
        Ok(())
    }

    fn message_exists(&self, msg_id: &str) -> Result<bool> {
        Ok(self.0.lock().unwrap().messages.contains_key(msg_id))
    }

    fn call_plugin(
        &self,
        _host: &str,
        _plugin: &str,
        _func: &str,
        _args: &BTreeMap<String, String>,
    ) -> Result<String> {
        Ok("ok".into())
    }

    fn hosts_attached_on(&self, _sr: &str, _vdis: &[String]) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn mark_cache_srs_dirty(&self) -> Result<()> {
        Ok(())
    }

    fn update_sr_async(&self, _sr: &str) -> Result<()> {
        Ok(())
    }

    fn task_create(&self, _label: &str, _description: &str) -> Result<String> {
        Ok("task-1".into())
    }

    fn task_progress(&self, _task: &str, _progress: f64) -> Result<()> {
        Ok(())
    }

    fn task_status(&self, _task: &str, _success: bool) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct FakeDriver {
    world: Shared,
    base: Utf8PathBuf,
}

impl FakeDriver {
    fn path_of(&self, uuid: &str) -> Utf8PathBuf {
        self.base.join(format!("{uuid}.vhd"))
    }
}

impl SrDriver for FakeDriver {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn path(&self) -> &Utf8Path {
        &self.base
    }

    fn scan_once(&mut self) -> Result<(BTreeMap<String, Vdi>, bool)> {
        let w = self.world.lock().unwrap();
        let mut nodes = BTreeMap::new();
        for (uuid, img) in &w.images {
            nodes.insert(
                uuid.clone(),
                Vdi {
                    uuid: uuid.clone(),
                    file_name: format!("{uuid}.vhd"),
                    path: self.path_of(uuid),
                    raw: img.raw,
                    hidden: img.hidden,
                    scan_error: false,
                    size_virt: img.size_virt,
                    size_phys: Some(img.size_phys),
                    size_allocated: Some(img.size_allocated),
                    parent_uuid: img.parent.clone(),
                    children: Vec::new(),
                    lv: None,
                },
            );
        }
        Ok((nodes, false))
    }

    fn free_space(&self) -> Result<u64> {
        Ok(self.world.lock().unwrap().free_space)
    }

    fn vdi_file_name(&self, uuid: &str, _raw: bool) -> String {
        format!("{uuid}.vhd")
    }

    fn vdi_path(&self, uuid: &str, _raw: bool) -> Utf8PathBuf {
        self.path_of(uuid)
    }

    fn destroy_vdi(&mut self, vdi: &Vdi, _abort: &AbortHandle) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.images.remove(&vdi.uuid).context("destroying unknown image")?;
        Ok(())
    }

    fn rename_vdi(&mut self, vdi: &Vdi, new_uuid: &str) -> Result<String> {
        let mut w = self.world.lock().unwrap();
        anyhow::ensure!(!w.images.contains_key(new_uuid), "rename target exists");
        let mut img = w.images.remove(&vdi.uuid).context("renaming unknown image")?;
        img.uuid = new_uuid.to_string();
        w.images.insert(new_uuid.to_string(), img);
        Ok(format!("{new_uuid}.vhd"))
    }

    fn pause_vdi(&self, vdi: &Vdi, _failfast: bool) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.events.push(format!("pause:{}", vdi.uuid));
        Ok(())
    }

    fn unpause_vdi(&self, vdi: &Vdi) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.events.push(format!("unpause:{}", vdi.uuid));
        Ok(())
    }

    fn refresh_vdi(&self, vdi: &Vdi) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.events.push(format!("refresh:{}", vdi.uuid));
        Ok(())
    }

    fn load_phys_size(&mut self, vdi: &Vdi) -> Result<u64> {
        let mut w = self.world.lock().unwrap();
        Ok(w.image_by_path(&vdi.path)?.size_phys)
    }

    fn load_allocated_size(&mut self, vdi: &Vdi) -> Result<u64> {
        let mut w = self.world.lock().unwrap();
        Ok(w.image_by_path(&vdi.path)?.size_allocated)
    }

    fn prepare_coalesce(&mut self, _forest: &Forest, _child: &str, _size_data: u64) -> Result<()> {
        Ok(())
    }

    fn finish_coalesce(&mut self, _forest: &mut Forest, _child: &str) -> Result<()> {
        Ok(())
    }

    fn set_parent_on_disk(&mut self, child: &Vdi, parent: &Vdi) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.image_by_path(&child.path)?.parent = Some(parent.uuid.clone());
        Ok(())
    }

    fn set_hidden_on_disk(&mut self, vdi: &Vdi, hidden: bool) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.image_by_path(&vdi.path)?.hidden = hidden;
        Ok(())
    }

    fn resize_journaled(&mut self, vdi: &Vdi, size: u64) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.image_by_path(&vdi.path)?.size_virt = size;
        Ok(())
    }

    fn grow_raw(
        &mut self,
        _journal: &dyn Journaler,
        vdi: &Vdi,
        size: u64,
        _abort: &AbortHandle,
    ) -> Result<u64> {
        let mut w = self.world.lock().unwrap();
        let img = w.image_by_path(&vdi.path)?;
        img.size_virt = size;
        Ok(size)
    }

    fn extra_space_for_coalesce(&mut self, _f: &Forest, _c: &str, _s: u64) -> Result<u64> {
        Ok(self.world.lock().unwrap().extra_space)
    }

    fn extra_space_for_leaf_coalesce(&mut self, _f: &Forest, _c: &str, _s: u64) -> Result<u64> {
        Ok(self.world.lock().unwrap().extra_space)
    }

    fn extra_space_for_snapshot_coalesce(&mut self, _f: &Forest, _c: &str, _s: u64) -> Result<u64> {
        Ok(self.world.lock().unwrap().extra_space)
    }

    fn prepare_coalesce_leaf(&mut self, _f: &Forest, _c: &str, _s: u64) -> Result<()> {
        Ok(())
    }

    fn update_node_leaf(&mut self, _child: &Vdi, _parent: &Vdi) -> Result<()> {
        Ok(())
    }

    fn finish_coalesce_leaf(&mut self, _f: &mut Forest, _survivor: &str) -> Result<()> {
        Ok(())
    }

    fn extra_space_after_leaf(&mut self, _f: &Forest, _c: &str, _p: &str) -> Result<u64> {
        Ok(0)
    }

    fn leaf_parts_present(&mut self, child_uuid: &str, parent_uuid: &str) -> Result<(bool, bool)> {
        let w = self.world.lock().unwrap();
        Ok((
            w.images.contains_key(parent_uuid),
            w.images.contains_key(&format!("OLD_{child_uuid}")),
        ))
    }

    fn undo_leaf_backend(
        &mut self,
        _f: &Forest,
        _child: &str,
        _parent: &str,
        _counts: Option<(u64, u64)>,
    ) -> Result<()> {
        Ok(())
    }

    fn finish_leaf_backend(&mut self, _f: &Forest, _child: &str) -> Result<()> {
        Ok(())
    }

    fn update_slaves_on_rename(&mut self, _v: &Vdi, _old: &str, _orig: &str) -> Result<()> {
        Ok(())
    }

    fn update_slaves_on_resize(&mut self, _f: &Forest, _u: &str) -> Result<()> {
        Ok(())
    }

    fn update_slaves_on_undo_leaf(&mut self, _f: &Forest, _p: &str, _c: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct FakeVhd {
    world: Shared,
}

impl VhdKit for FakeVhd {
    fn check(&self, path: &Utf8Path, _fast: bool) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.image_by_path(path).map(|_| ())
    }

    fn repair(&self, _path: &Utf8Path) -> Result<()> {
        Ok(())
    }

    fn coalesce(
        &self,
        path: &Utf8Path,
        _abort: &AbortHandle,
        _timeout: Option<Duration>,
    ) -> Result<u64> {
        let mut w = self.world.lock().unwrap();
        let child = w.image_by_path(path)?.clone();
        let parent_uuid = child.parent.context("coalescing a root")?;
        let parent = w
            .images
            .get_mut(&parent_uuid)
            .context("parent disappeared")?;
        // merge allocated blocks down
        for (i, b) in child.bitmap.iter().enumerate() {
            if parent.bitmap.len() <= i {
                parent.bitmap.resize(i + 1, 0);
            }
            parent.bitmap[i] |= b;
        }
        parent.size_allocated = parent.size_allocated.max(child.size_allocated);
        parent.size_phys = parent.size_phys.max(child.size_phys);
        // report zero bytes so the recorded throughput stays unusable and
        // the fixed size threshold keeps deciding live-coalesce feasibility
        Ok(0)
    }

    fn set_parent(&self, path: &Utf8Path, parent: &Utf8Path, _parent_raw: bool) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        let parent_uuid = w.image_by_path(parent)?.uuid.clone();
        w.image_by_path(path)?.parent = Some(parent_uuid);
        Ok(())
    }

    fn set_hidden(&self, path: &Utf8Path, hidden: bool) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.image_by_path(path)?.hidden = hidden;
        Ok(())
    }

    fn block_bitmap(&self, path: &Utf8Path) -> Result<Vec<u8>> {
        let mut w = self.world.lock().unwrap();
        Ok(w.image_by_path(path)?.bitmap.clone())
    }

    fn size_virt(&self, path: &Utf8Path) -> Result<u64> {
        let mut w = self.world.lock().unwrap();
        Ok(w.image_by_path(path)?.size_virt)
    }

    fn phys_size(&self, path: &Utf8Path) -> Result<u64> {
        let mut w = self.world.lock().unwrap();
        Ok(w.image_by_path(path)?.size_phys)
    }

    fn allocated_size(&self, path: &Utf8Path) -> Result<u64> {
        let mut w = self.world.lock().unwrap();
        Ok(w.image_by_path(path)?.size_allocated)
    }

    fn max_resize_size(&self, _path: &Utf8Path) -> Result<u64> {
        Ok(u64::MAX / 2)
    }

    fn resize_fast(&self, path: &Utf8Path, size: u64) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.image_by_path(path)?.size_virt = size;
        Ok(())
    }

    fn resize_journaled(&self, path: &Utf8Path, size: u64, _journal: &Utf8Path) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        w.image_by_path(path)?.size_virt = size;
        Ok(())
    }
}

struct Harness {
    _td: tempfile::TempDir,
    world: Shared,
    sr: Sr,
}

fn harness(images: Vec<Image>) -> Harness {
    let td = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
    let dirs = RuntimeDirs::under(&base);
    for d in [&dirs.run, &dirs.nonpersistent, &dirs.lock] {
        std::fs::create_dir_all(d).unwrap();
    }
    let world: Shared = Arc::new(Mutex::new(World {
        images: images.into_iter().map(|i| (i.uuid.clone(), i)).collect(),
        free_space: u64::MAX,
        ..Default::default()
    }));
    let session: Arc<dyn ControlPlane> = Arc::new(MockControl(world.clone()));
    let sr_dir = base.join("fake-sr");
    std::fs::create_dir_all(&sr_dir).unwrap();
    let abort = AbortHandle::new(&dirs, SR);
    let sr = Sr::assemble(
        session,
        SR,
        "mock SR",
        false,
        AttachOptions {
            create_lock: true,
            force: false,
            dirs,
        },
        Box::new(FakeDriver {
            world: world.clone(),
            base: sr_dir.clone(),
        }),
        Box::new(FakeVhd {
            world: world.clone(),
        }),
        Box::new(FileJournaler::new(&sr_dir)),
        abort,
    );
    Harness {
        _td: td,
        world,
        sr,
    }
}

fn world_shape(world: &Shared) -> Vec<(String, Option<String>, bool)> {
    let w = world.lock().unwrap();
    w.images
        .values()
        .map(|i| (i.uuid.clone(), i.parent.clone(), i.hidden))
        .collect()
}

#[test]
fn scan_is_idempotent() {
    let mut h = harness(vec![
        Image::leaf_like(&uuid(1), None, true),
        Image::leaf_like(&uuid(2), Some(&uuid(1)), false),
    ]);
    h.sr.scan(false).unwrap();
    let first: Vec<_> = h.sr.forest.iter().map(|v| (v.uuid.clone(), v.children.clone())).collect();
    h.sr.scan(false).unwrap();
    let second: Vec<_> = h.sr.forest.iter().map(|v| (v.uuid.clone(), v.children.clone())).collect();
    assert_eq!(first, second);
}

#[test]
fn empty_sr_has_no_work() {
    let mut h = harness(Vec::new());
    h.sr.scan(false).unwrap();
    assert!(!h.sr.has_work().unwrap());
}

#[test]
fn prune_garbage_subtree() {
    // R (hidden) -> A (hidden) -> B (hidden), none referenced
    let mut h = harness(vec![
        Image::leaf_like(&uuid(1), None, true),
        Image::leaf_like(&uuid(2), Some(&uuid(1)), true),
        Image::leaf_like(&uuid(3), Some(&uuid(2)), true),
    ]);
    h.sr.scan(false).unwrap();
    let garbage = h.sr.find_garbage().unwrap();
    assert_eq!(garbage.len(), 3);
    h.sr.garbage_collect(false).unwrap();
    let w = h.world.lock().unwrap();
    assert!(w.images.is_empty());
    let mut forgotten = w.forgotten.clone();
    forgotten.sort();
    assert_eq!(forgotten, vec![uuid(1), uuid(2), uuid(3)]);
    drop(w);
    for kind in [JournalKind::Coalesce, JournalKind::Relink, JournalKind::Leaf] {
        assert!(h.sr.journal.entries(kind).unwrap().is_empty());
    }
}

#[test]
fn chain_of_one_has_no_candidates() {
    let mut h = harness(vec![Image::leaf_like(&uuid(1), None, false)]);
    h.sr.scan(false).unwrap();
    assert!(h.sr.find_coalesceable().unwrap().is_none());
    assert!(h.sr.find_leaf_coalesceable().unwrap().is_none());
    assert!(h.sr.find_garbage().unwrap().is_empty());
}

#[test]
fn simple_inline_coalesce() {
    // P (hidden) <- C (hidden) <- C' (visible leaf)
    let p = uuid(1);
    let c = uuid(2);
    let grandchild = uuid(3);
    let mut h = harness(vec![
        Image::leaf_like(&p, None, true),
        Image::leaf_like(&c, Some(&p), true),
        Image::leaf_like(&grandchild, Some(&c), false),
    ]);
    h.sr.scan(false).unwrap();
    let candidate = h.sr.find_coalesceable().unwrap().expect("one candidate");
    assert_eq!(candidate, c);
    h.sr.coalesce(&candidate, false).unwrap();

    let w = h.world.lock().unwrap();
    assert!(!w.images.contains_key(&c));
    assert_eq!(w.images[&grandchild].parent.as_deref(), Some(p.as_str()));
    assert!(w.images[&p].size_virt >= 10 * 1024 * 1024 * 1024);
    // exactly one refresh of the surviving leaf
    let refreshes: Vec<_> = w.events.iter().filter(|e| e.starts_with("refresh:")).collect();
    assert_eq!(refreshes, vec![&format!("refresh:{grandchild}")]);
    drop(w);
    assert!(h.sr.journal.entries(JournalKind::Coalesce).unwrap().is_empty());
    assert!(h.sr.journal.entries(JournalKind::Relink).unwrap().is_empty());
}

#[test]
fn enospc_at_selection_posts_one_message() {
    let p = uuid(1);
    let c = uuid(2);
    let grandchild = uuid(3);
    let mut h = harness(vec![
        Image::leaf_like(&p, None, true),
        Image::leaf_like(&c, Some(&p), true),
        Image::leaf_like(&grandchild, Some(&c), false),
    ]);
    {
        let mut w = h.world.lock().unwrap();
        w.free_space = 500;
        w.extra_space = 1000;
    }
    h.sr.scan(false).unwrap();
    assert!(h.sr.find_coalesceable().unwrap().is_none());
    h.sr.check_no_space_candidates().unwrap();
    {
        let w = h.world.lock().unwrap();
        assert_eq!(w.messages.len(), 1);
        assert!(w.sr_sm_config.contains_key("gc_no_space"));
        // no mutation happened
        assert!(w.images.contains_key(&c));
    }
    // second starving pass does not duplicate the message
    assert!(h.sr.find_coalesceable().unwrap().is_none());
    h.sr.check_no_space_candidates().unwrap();
    assert_eq!(h.world.lock().unwrap().messages.len(), 1);

    // more space appears: the candidate goes through and the message is
    // withdrawn
    {
        let mut w = h.world.lock().unwrap();
        w.free_space = 2000;
    }
    let candidate = h.sr.find_coalesceable().unwrap().expect("fits now");
    assert_eq!(candidate, c);
    h.sr.coalesce(&candidate, false).unwrap();
    h.sr.check_no_space_candidates().unwrap();
    let w = h.world.lock().unwrap();
    assert!(w.messages.is_empty());
    assert!(!w.sr_sm_config.contains_key("gc_no_space"));
}

#[test]
fn crash_after_relink_journal_resumes_to_identical_state() {
    let p = uuid(1);
    let c = uuid(2);
    let grandchild = uuid(3);
    let images = vec![
        Image::leaf_like(&p, None, true),
        Image::leaf_like(&c, Some(&p), true),
        Image::leaf_like(&grandchild, Some(&c), false),
    ];

    // reference run: uninterrupted coalesce
    let mut reference = harness(images.clone());
    reference.sr.scan(false).unwrap();
    let candidate = reference.sr.find_coalesceable().unwrap().unwrap();
    reference.sr.coalesce(&candidate, false).unwrap();
    let want = world_shape(&reference.world);

    // crashed run: the data copy finished and the relink journal was
    // written, then the process died
    let mut h = harness(images);
    {
        // the copy's effect on the parent
        let mut w = h.world.lock().unwrap();
        let child_bitmap = w.images[&c].bitmap.clone();
        let parent = w.images.get_mut(&p).unwrap();
        for (i, b) in child_bitmap.iter().enumerate() {
            parent.bitmap[i] |= b;
        }
    }
    h.sr.journal.create(JournalKind::Relink, &c, "1").unwrap();
    h.sr.scan(false).unwrap();
    // the interrupted relink is picked up before fresh candidates
    let candidate = h.sr.find_coalesceable().unwrap().expect("relink pending");
    assert_eq!(candidate, c);
    h.sr.coalesce(&candidate, false).unwrap();

    assert_eq!(world_shape(&h.world), want);
    assert!(h.sr.journal.entries(JournalKind::Relink).unwrap().is_empty());
}

#[test]
fn live_leaf_coalesce_small_leaf() {
    // P (hidden) <- L (visible leaf, 5 MiB allocated, speed unknown)
    let p = uuid(1);
    let l = uuid(2);
    let mut h = harness(vec![
        Image::leaf_like(&p, None, true),
        Image::leaf_like(&l, Some(&p), false),
    ]);
    h.sr.scan(false).unwrap();
    let candidate = h.sr.find_leaf_coalesceable().unwrap().expect("one leaf");
    assert_eq!(candidate, l);
    h.sr.coalesce_leaf(&candidate, false).unwrap();

    let w = h.world.lock().unwrap();
    // exactly one node remains, bearing the leaf's uuid, visible, a root
    assert_eq!(w.images.len(), 1);
    let survivor = &w.images[&l];
    assert!(!survivor.hidden);
    assert_eq!(survivor.parent, None);
    assert!(survivor.size_virt >= 10 * 1024 * 1024 * 1024);
    // the original parent was forgotten from the inventory
    assert!(w.forgotten.contains(&p));
    // one pause window: pause then unpause of the leaf's uuid
    let pauses: Vec<_> = w
        .events
        .iter()
        .filter(|e| e.starts_with("pause:") || e.starts_with("unpause:"))
        .collect();
    assert_eq!(pauses, vec![&format!("pause:{l}"), &format!("unpause:{l}")]);
    drop(w);
    assert!(h.sr.journal.entries(JournalKind::Leaf).unwrap().is_empty());
}

#[test]
fn leaf_coalesce_aborted_by_progress_tracker() {
    // a big leaf that never shrinks: the tracker gives up and the
    // candidate is parked for this run without partial mutation
    let p = uuid(1);
    let l = uuid(2);
    let mut big = Image::leaf_like(&l, Some(&p), false);
    // the fake data copy never shrinks the leaf, so every round is flat
    big.size_allocated = 100 * 1024 * 1024;
    let mut h = harness(vec![Image::leaf_like(&p, None, true), big]);
    h.sr.scan(false).unwrap();
    let candidate = h.sr.find_leaf_coalesceable().unwrap().expect("one leaf");
    // the wrapper swallows the failure and parks the candidate
    h.sr.coalesce_leaf(&candidate, false).unwrap();

    let w = h.world.lock().unwrap();
    let leaf = &w.images[&l];
    assert!(!leaf.hidden);
    assert!(!w.images.contains_key(&format!("OLD_{l}")));
    drop(w);
    assert!(h.sr.journal.entries(JournalKind::Leaf).unwrap().is_empty());
    // the engine moves on to other work for this run
    h.sr.scan(false).unwrap();
    assert!(h.sr.find_leaf_coalesceable().unwrap().is_none());
}

#[test]
fn interrupted_leaf_coalesce_is_undone_on_scan() {
    // crash point: the child was renamed to OLD_<uuid> but the parent
    // still holds its own identity; recovery must undo
    let p = uuid(1);
    let l = uuid(2);
    let old_child = Image::leaf_like(&format!("OLD_{l}"), Some(&p), false);
    let mut h = harness(vec![Image::leaf_like(&p, None, false), old_child]);
    h.sr.journal.create(JournalKind::Leaf, &l, &p).unwrap();
    h.sr.scan(false).unwrap();

    let w = h.world.lock().unwrap();
    // child renamed back and visible; parent hidden again
    assert!(w.images.contains_key(&l));
    assert!(!w.images.contains_key(&format!("OLD_{l}")));
    assert!(!w.images[&l].hidden);
    assert!(w.images[&p].hidden);
    drop(w);
    assert!(h.sr.journal.entries(JournalKind::Leaf).unwrap().is_empty());
}

#[test]
fn interrupted_leaf_coalesce_is_finished_when_swap_completed() {
    // crash point: both renames done, journal not yet cleared; only the
    // survivor (bearing the leaf's uuid) remains
    let p = uuid(1);
    let l = uuid(2);
    let mut h = harness(vec![Image::leaf_like(&l, None, false)]);
    h.sr.journal.create(JournalKind::Leaf, &l, &p).unwrap();
    h.sr.scan(false).unwrap();

    assert!(h.sr.journal.entries(JournalKind::Leaf).unwrap().is_empty());
    let w = h.world.lock().unwrap();
    assert!(w.forgotten.contains(&p));
    assert!(w.images.contains_key(&l));
}
