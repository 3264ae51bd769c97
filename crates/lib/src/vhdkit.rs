//! The VHD tool interface the engine consumes. Production shells out to
//! `vhd-util` (in its own process group, under the abort watchdog where the
//! operation is long); tests substitute an in-memory fake.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use camino::Utf8Path;

use crate::abort::AbortHandle;
use crate::watchdog;

pub trait VhdKit: fmt::Debug {
    /// Structural check; `fast` skips the full bitmap walk.
    fn check(&self, path: &Utf8Path, fast: bool) -> Result<()>;
    fn repair(&self, path: &Utf8Path) -> Result<()>;
    /// Copy this image's allocated blocks down into its parent. Returns the
    /// number of bytes written. Runs under the abort watchdog; `timeout`
    /// bounds the live leaf-coalesce pause.
    fn coalesce(&self, path: &Utf8Path, abort: &AbortHandle, timeout: Option<Duration>)
        -> Result<u64>;
    fn set_parent(&self, path: &Utf8Path, parent: &Utf8Path, parent_raw: bool) -> Result<()>;
    fn set_hidden(&self, path: &Utf8Path, hidden: bool) -> Result<()>;
    fn block_bitmap(&self, path: &Utf8Path) -> Result<Vec<u8>>;
    fn size_virt(&self, path: &Utf8Path) -> Result<u64>;
    fn phys_size(&self, path: &Utf8Path) -> Result<u64>;
    fn allocated_size(&self, path: &Utf8Path) -> Result<u64>;
    /// Largest size reachable by the fast in-place resize.
    fn max_resize_size(&self, path: &Utf8Path) -> Result<u64>;
    fn resize_fast(&self, path: &Utf8Path, size: u64) -> Result<()>;
    /// Journaled resize; offline-only.
    fn resize_journaled(&self, path: &Utf8Path, size: u64, journal: &Utf8Path) -> Result<()>;
}

/// The real thing.
#[derive(Debug, Default)]
pub struct VhdUtilKit;

impl VhdKit for VhdUtilKit {
    fn check(&self, path: &Utf8Path, fast: bool) -> Result<()> {
        vhdgc_vhd::check(path, fast)
    }

    fn repair(&self, path: &Utf8Path) -> Result<()> {
        vhdgc_vhd::repair(path)
    }

    fn coalesce(
        &self,
        path: &Utf8Path,
        abort: &AbortHandle,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        let mut cmd = vhdgc_vhd::coalesce_command(path);
        let out = watchdog::run_abortable(&mut cmd, abort, timeout)?;
        vhdgc_vhd::parse_coalesce_output(&out)
    }

    fn set_parent(&self, path: &Utf8Path, parent: &Utf8Path, parent_raw: bool) -> Result<()> {
        vhdgc_vhd::set_parent(path, parent, parent_raw)
    }

    fn set_hidden(&self, path: &Utf8Path, hidden: bool) -> Result<()> {
        vhdgc_vhd::set_hidden(path, hidden)
    }

    fn block_bitmap(&self, path: &Utf8Path) -> Result<Vec<u8>> {
        vhdgc_vhd::get_block_bitmap(path)
    }

    fn size_virt(&self, path: &Utf8Path) -> Result<u64> {
        vhdgc_vhd::get_size_virt(path)
    }

    fn phys_size(&self, path: &Utf8Path) -> Result<u64> {
        vhdgc_vhd::get_size_phys(path)
    }

    fn allocated_size(&self, path: &Utf8Path) -> Result<u64> {
        vhdgc_vhd::get_allocated_size(path)
    }

    fn max_resize_size(&self, path: &Utf8Path) -> Result<u64> {
        vhdgc_vhd::get_max_resize_size(path)
    }

    fn resize_fast(&self, path: &Utf8Path, size: u64) -> Result<()> {
        vhdgc_vhd::set_size_virt_fast(path, size)
    }

    fn resize_journaled(&self, path: &Utf8Path, size: u64, journal: &Utf8Path) -> Result<()> {
        vhdgc_vhd::set_size_virt(path, size, journal)
    }
}
