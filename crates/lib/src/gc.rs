//! The top-level GC scheduler and the public API consumed by the
//! surrounding storage-management subsystem.

use std::time::Duration;

use anyhow::{Context, Result};
use fn_error_context::context;

use crate::abort::{is_abort, AbortHandle, IpcFlags, FLAG_ABORT};
use crate::config::RuntimeDirs;
use crate::control::Session;
use crate::journal::JournalKind;
use crate::locks::{FileLock, GcActiveLock, LOCK_GC_RUNNING, LOCK_RETRY_ATTEMPTS};
use crate::sr::{AttachOptions, LvhdSr, Sr};

/// Quiet period between discovering work and mutating anything, so that a
/// freshly booted pool settles first. Skipped for foreground invocations.
pub const GC_PAUSE: Duration = Duration::from_secs(5 * 60);

/// The two process-level locks of one worker, created once per run and
/// passed explicitly through the call graph.
#[derive(Debug)]
pub struct GcLocks {
    pub running: FileLock,
    pub active: GcActiveLock,
}

/// Initialize the per-SR lock handles.
pub fn init(sr_uuid: &str, dirs: &RuntimeDirs) -> GcLocks {
    let dir = dirs.lock_dir(sr_uuid);
    GcLocks {
        running: FileLock::new(&dir, LOCK_GC_RUNNING),
        active: GcActiveLock::new(&dir),
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcOptions {
    pub dry_run: bool,
    /// Skip the quiet period (foreground / forced invocations).
    pub immediate: bool,
    pub dirs: RuntimeDirs,
}

/// Written once the worker has scanned; callers that want to wait for a
/// live worker poll for this file.
fn create_init_file(sr_uuid: &str, dirs: &RuntimeDirs) {
    let path = dirs.gc_init_file(sr_uuid);
    let r = (|| -> Result<()> {
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(path.as_std_path(), b"1")?;
        Ok(())
    })();
    if let Err(e) = r {
        tracing::warn!("failed to write gc-ready indicator: {e}");
    }
}

fn quiet_period(sr: &Sr, opts: &GcOptions) -> Result<()> {
    if opts.immediate {
        return Ok(());
    }
    if !opts.dirs.gc_init_file(&sr.uuid).exists() {
        return Ok(());
    }
    tracing::info!("GC active, about to go quiet");
    crate::watchdog::abortable_sleep(GC_PAUSE, &sr.abort)?;
    tracing::info!("GC active, quiet period ended");
    Ok(())
}

/// Garbage collect all deleted VDIs in the SR, then coalesce what can be
/// coalesced, one candidate per iteration, rescanning in between.
#[context("GC of SR {sr_uuid}")]
pub fn gc(session: &Session, sr_uuid: &str, opts: &GcOptions) -> Result<()> {
    tracing::info!("=== SR {sr_uuid}: gc ===");
    let mut locks = init(sr_uuid, &opts.dirs);
    let mut sr = Sr::attach(
        session.clone(),
        sr_uuid,
        AttachOptions {
            dirs: opts.dirs.clone(),
            ..Default::default()
        },
    )?;
    if !sr.gc_enabled()? {
        return Ok(());
    }
    let r = gc_loop(&mut sr, &mut locks, opts);
    if let Err(e) = sr.check_no_space_candidates() {
        tracing::warn!("failed to update no-space candidates: {e}");
    }
    sr.cleanup();
    match r {
        Err(e) if is_abort(&e) => {
            tracing::info!("aborted");
            Ok(())
        }
        other => other,
    }
}

fn gc_loop(sr: &mut Sr, locks: &mut GcLocks, opts: &GcOptions) -> Result<()> {
    if !locks.active.try_acquire(&sr.abort)? {
        tracing::info!("another GC instance already active, exiting");
        return Ok(());
    }
    let r = gc_loop_active(sr, locks, opts);
    sr.task_finish(r.is_ok());
    tracing::info!("GC process exiting, no work left");
    create_init_file(&sr.uuid, &opts.dirs);
    locks.active.release();
    r
}

fn gc_loop_active(sr: &mut Sr, locks: &mut GcLocks, opts: &GcOptions) -> Result<()> {
    // sweep stale read caches while we are at it
    if let Err(e) = sr.driver.cleanup_cache(-1) {
        tracing::warn!("cache sweep failed: {e}");
    }

    sr.scan_locked(false)?;
    if !sr.has_work()? {
        tracing::info!("no work, exiting");
        return Ok(());
    }
    sr.task_create(
        "Garbage Collection",
        &format!("Garbage collection for SR {}", sr.uuid),
    );
    quiet_period(sr, opts)?;

    let mut coalesced = 0usize;
    loop {
        if crate::abort::term_requested() {
            tracing::info!("term requested");
            return Ok(());
        }
        sr.scan_locked(false)?;
        if !sr.has_work()? {
            tracing::info!("no work, exiting");
            return Ok(());
        }
        if !locks.running.try_acquire()? {
            tracing::info!("unable to acquire GC running lock");
            return Ok(());
        }
        let r = gc_iteration(sr, opts, &mut coalesced);
        locks.running.release();
        match r? {
            true => continue,
            false => return Ok(()),
        }
    }
}

/// One outer-loop iteration; returns false when the loop should stop.
fn gc_iteration(sr: &mut Sr, opts: &GcOptions, coalesced: &mut usize) -> Result<bool> {
    if !sr.gc_enabled()? {
        return Ok(false);
    }
    sr.task_update(0, *coalesced);
    sr.cleanup_coalesce_journals()?;
    // write the ready indicator here in case startup is waiting on it
    create_init_file(&sr.uuid, &opts.dirs);
    sr.scan_locked(false)?;
    sr.update_all_block_info()?;

    let garbage = sr.find_garbage()?;
    if !garbage.is_empty() {
        tracing::info!("found {} orphaned VDIs", garbage.len());
        sr.lock()?;
        let r = sr.garbage_collect(opts.dry_run);
        sr.unlock();
        r?;
        if let Err(e) = sr.session.update_sr_async(&sr.uuid) {
            tracing::warn!("failed to kick SR update: {e}");
        }
    }

    if let Some(candidate) = sr.find_coalesceable()? {
        sr.coalesce(&candidate, opts.dry_run)?;
        if let Err(e) = sr.session.update_sr_async(&sr.uuid) {
            tracing::warn!("failed to kick SR update: {e}");
        }
        *coalesced += 1;
        return Ok(true);
    }

    if let Some(candidate) = sr.find_leaf_coalesceable()? {
        sr.coalesce_leaf(&candidate, opts.dry_run)?;
        if let Err(e) = sr.session.update_sr_async(&sr.uuid) {
            tracing::warn!("failed to kick SR update: {e}");
        }
        *coalesced += 1;
        return Ok(true);
    }

    Ok(true)
}

/// Unconditional collection with the abort-any-runner semantics: stop a
/// running worker first, then scan (optionally tolerating errors) and
/// delete all garbage.
#[context("Forced GC of SR {sr_uuid}")]
pub fn gc_force(
    session: &Session,
    sr_uuid: &str,
    force: bool,
    dry_run: bool,
    lock_sr: bool,
    dirs: &RuntimeDirs,
) -> Result<()> {
    tracing::info!("=== SR {sr_uuid}: gc_force ===");
    let mut locks = init(sr_uuid, dirs);
    let abort = AbortHandle::new(dirs, sr_uuid);
    let mut sr = Sr::attach(
        session.clone(),
        sr_uuid,
        AttachOptions {
            create_lock: lock_sr,
            force: true,
            dirs: dirs.clone(),
        },
    )?;
    if !locks.active.try_acquire(&abort)? {
        abort_running(sr_uuid, &mut locks, dirs, false)?;
    } else {
        tracing::info!("nothing was running, clear to proceed");
    }

    if force {
        tracing::warn!("FORCED: will continue even if there are VHD errors");
    }
    let r = (|| -> Result<()> {
        sr.scan_locked(force)?;
        sr.cleanup_coalesce_journals()?;
        if let Err(e) = sr.driver.cleanup_cache(-1) {
            tracing::warn!("cache sweep failed: {e}");
        }
        sr.garbage_collect(dry_run)
    })();
    sr.cleanup();
    locks.active.release();
    r
}

/// Ask a running worker (if any) to stop, waiting until it has. With
/// `soft`, refuse (returning false) when an abort is already pending.
/// On success the gc-active lock is held and released again.
pub fn abort(sr_uuid: &str, soft: bool, dirs: &RuntimeDirs) -> Result<bool> {
    tracing::info!("=== SR {sr_uuid}: abort ===");
    let mut locks = init(sr_uuid, dirs);
    if abort_running(sr_uuid, &mut locks, dirs, soft)? {
        locks.active.release();
        Ok(true)
    } else {
        Ok(false)
    }
}

fn abort_running(
    sr_uuid: &str,
    locks: &mut GcLocks,
    dirs: &RuntimeDirs,
    soft: bool,
) -> Result<bool> {
    let abort = AbortHandle::new(dirs, sr_uuid);
    if locks.active.try_acquire(&abort)? {
        return Ok(true);
    }
    tracing::info!("aborting currently-running instance (SR {sr_uuid})");
    let flags = IpcFlags::new(dirs, sr_uuid);
    if !flags.set(FLAG_ABORT, soft)? {
        return Ok(false);
    }
    let mut got_lock = false;
    for _ in 0..LOCK_RETRY_ATTEMPTS {
        if locks.active.try_acquire(&abort)? {
            got_lock = true;
            break;
        }
        std::thread::sleep(crate::locks::LOCK_RETRY_INTERVAL);
    }
    flags.clear(FLAG_ABORT)?;
    anyhow::ensure!(got_lock, "SR {sr_uuid}: error aborting existing process");
    Ok(true)
}

/// Is a worker currently active on this SR?
pub fn get_state(sr_uuid: &str, dirs: &RuntimeDirs) -> bool {
    let mut locks = init(sr_uuid, dirs);
    let abort = AbortHandle::new(dirs, sr_uuid);
    match locks.active.try_acquire(&abort) {
        Ok(true) => {
            locks.active.release();
            false
        }
        Ok(false) => true,
        Err(e) => {
            tracing::warn!("failed to probe GC state: {e}");
            false
        }
    }
}

/// True if the worker is currently coalescing a VDI that is itself
/// garbage, i.e. aborting it would not lose useful work.
pub fn should_preempt(session: &Session, sr_uuid: &str, dirs: &RuntimeDirs) -> Result<bool> {
    let mut sr = Sr::attach(
        session.clone(),
        sr_uuid,
        AttachOptions {
            dirs: dirs.clone(),
            ..Default::default()
        },
    )?;
    let entries = sr.journal.entries(JournalKind::Coalesce)?;
    if entries.is_empty() {
        return Ok(false);
    }
    anyhow::ensure!(
        entries.len() == 1,
        "more than one coalesce entry: {entries:?}"
    );
    sr.scan_locked(false)?;
    let coalesced = entries.into_keys().next().unwrap();
    Ok(sr.find_garbage()?.contains(&coalesced))
}

/// Which of the given VDIs are currently leaf-coalesceable.
pub fn get_coalesceable_leaves(
    session: &Session,
    sr_uuid: &str,
    vdi_uuids: &[String],
    dirs: &RuntimeDirs,
) -> Result<Vec<String>> {
    let mut sr = Sr::attach(
        session.clone(),
        sr_uuid,
        AttachOptions {
            dirs: dirs.clone(),
            ..Default::default()
        },
    )?;
    sr.scan_locked(false)?;
    let mut r = Vec::new();
    for uuid in vdi_uuids {
        anyhow::ensure!(sr.forest.get(uuid).is_some(), "VDI {uuid} not found");
        if sr.forest.is_leaf_coalesceable(uuid) {
            r.push(uuid.clone());
        }
    }
    Ok(r)
}

/// Sweep stale read-cache files; returns the number removed.
pub fn cache_cleanup(
    session: &Session,
    sr_uuid: &str,
    max_age_hours: i64,
    dirs: &RuntimeDirs,
) -> Result<usize> {
    let mut sr = Sr::attach(
        session.clone(),
        sr_uuid,
        AttachOptions {
            dirs: dirs.clone(),
            ..Default::default()
        },
    )?;
    sr.driver.cleanup_cache(max_age_hours)
}

/// Administrative helper for the LV back-end: run one maintenance
/// operation on a single VDI.
pub fn debug(session: &Session, sr_uuid: &str, cmd: &str, vdi_uuid: &str, dirs: &RuntimeDirs) -> Result<()> {
    tracing::info!("debug command: {cmd}");
    let record = session.sr_record(sr_uuid)?;
    anyhow::ensure!(
        crate::sr::normalize_type(&record.ty)? == "lvhd",
        "not an LV-based SR"
    );
    let mut sr = Sr::attach(
        session.clone(),
        sr_uuid,
        AttachOptions {
            dirs: dirs.clone(),
            ..Default::default()
        },
    )?;
    sr.scan_locked(false)?;
    let v = sr
        .forest
        .get(vdi_uuid)
        .with_context(|| format!("VDI {vdi_uuid} not found"))?
        .clone();
    println!("VDI before: {v}");
    let mut lv = LvhdSr::new(session.clone(), sr_uuid, dirs);
    match cmd {
        "activate" => lv.debug_activate(&v)?,
        "deactivate" => lv.debug_deactivate(&v)?,
        "inflate" => lv.debug_inflate(&v)?,
        "deflate" => lv.debug_deflate(&v)?,
        other => anyhow::bail!("unknown debug command {other}"),
    }
    sr.scan_locked(false)?;
    if let Some(v) = sr.forest.get(vdi_uuid) {
        println!("VDI after:  {v}");
    }
    Ok(())
}
