//! Buffer objects and their cache.
//!
//! A [`Bo`] is a counted handle on a [`BoRecord`]. The count is explicit
//! rather than the `Arc` strong count because cached and zombie BOs stay
//! alive in the manager's lists with zero users.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bitflags::bitflags;
use gpu_protocol::uapi::{MemDomain, MmapMode};

use crate::kernel::CpuMapping;
use crate::vma::{canonical_address, MemZone};
use crate::{lock, Error, Result};

pub mod bucket;
mod bufmgr;
pub mod sync;

pub use bufmgr::BufMgr;
pub use sync::{BoSync, BoSyncState};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct BoFlags: u32 {
        /// Prefer device-local memory.
        const LOCAL = 1 << 0;
        /// Place in system memory visible through the GART.
        const GART = 1 << 1;
        /// Map for CPU access at allocation time.
        const MAP = 1 << 2;
        /// Contents must read as zero.
        const ZEROED = 1 << 3;
        /// CPU mappings must be cache coherent.
        const COHERENT = 1 << 4;
        /// Never exported.
        const NO_SHARE = 1 << 5;
    }
}

/// Seconds source for cache aging.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_secs(&self) -> u64;
}

#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_secs(&self) -> u64 {
        // Start at 1 so the first free always triggers a cache sweep.
        self.origin.elapsed().as_secs() + 1
    }
}

/// Clock driven by the caller.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(secs: u64) -> Self {
        Self(AtomicU64::new(secs))
    }

    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::Relaxed);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Auxiliary-surface translation table kept in sync with BO addresses.
pub trait AuxMap: Send + Sync + fmt::Debug {
    fn unmap_range(&self, addr: u64, size: u64);
}

#[derive(Debug)]
pub(crate) struct BoMeta {
    pub(crate) name: &'static str,
    pub(crate) flags: BoFlags,
    /// 48-bit address; zero while unassigned.
    pub(crate) address: u64,
    pub(crate) map: Option<Arc<dyn CpuMapping>>,
    pub(crate) mmap_mode: MmapMode,
    pub(crate) idle: bool,
    pub(crate) reusable: bool,
    pub(crate) imported: bool,
    pub(crate) exported: bool,
    pub(crate) global_name: u32,
    pub(crate) free_time: u64,
    pub(crate) aux_map_address: u64,
    pub(crate) cache_coherent: bool,
    pub(crate) capture: bool,
    pub(crate) in_zombie_list: bool,
}

impl BoMeta {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            flags: BoFlags::empty(),
            address: 0,
            map: None,
            mmap_mode: MmapMode::Wc,
            idle: true,
            reusable: false,
            imported: false,
            exported: false,
            global_name: 0,
            free_time: 0,
            aux_map_address: 0,
            cache_coherent: false,
            capture: false,
            in_zombie_list: false,
        }
    }

    pub(crate) fn is_external(&self) -> bool {
        self.imported || self.exported
    }
}

/// Kernel BO state shared by every handle and by the cache lists.
pub struct BoRecord {
    pub(crate) handle: u32,
    pub(crate) size: u64,
    pub(crate) refcount: AtomicU32,
    pub(crate) meta: Mutex<BoMeta>,
}

impl BoRecord {
    pub(crate) fn new(handle: u32, size: u64, meta: BoMeta) -> Self {
        Self {
            handle,
            size,
            refcount: AtomicU32::new(0),
            meta: Mutex::new(meta),
        }
    }

    pub(crate) fn meta(&self) -> MutexGuard<'_, BoMeta> {
        lock(&self.meta)
    }
}

impl fmt::Debug for BoRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoRecord")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .finish()
    }
}

/// A referenced buffer object. Dropping the last handle returns the BO to
/// the cache or releases it.
pub struct Bo {
    pub(crate) rec: Arc<BoRecord>,
    pub(crate) mgr: Arc<BufMgr>,
}

impl Bo {
    /// Wrap `rec`, taking one reference. Callers hold the manager lock or own
    /// the only path to `rec`.
    pub(crate) fn adopt(rec: Arc<BoRecord>, mgr: Arc<BufMgr>) -> Self {
        rec.refcount.fetch_add(1, Ordering::AcqRel);
        Self { rec, mgr }
    }

    pub fn handle(&self) -> u32 {
        self.rec.handle
    }

    pub fn size(&self) -> u64 {
        self.rec.size
    }

    pub fn name(&self) -> &'static str {
        self.rec.meta().name
    }

    /// Canonical GPU virtual address.
    pub fn address(&self) -> u64 {
        canonical_address(self.rec.meta().address)
    }

    pub fn zone(&self) -> MemZone {
        MemZone::for_address(self.rec.meta().address)
    }

    pub fn flags(&self) -> BoFlags {
        self.rec.meta().flags
    }

    /// Residency domain for submits.
    pub fn domain(&self) -> MemDomain {
        if self.rec.meta().flags.contains(BoFlags::LOCAL) && self.mgr.has_local_mem() {
            MemDomain::VRAM
        } else {
            MemDomain::GART
        }
    }

    pub fn refcount(&self) -> u32 {
        self.rec.refcount.load(Ordering::Acquire)
    }

    pub fn is_reusable(&self) -> bool {
        self.rec.meta().reusable
    }

    pub fn is_external(&self) -> bool {
        self.rec.meta().is_external()
    }

    pub fn is_imported(&self) -> bool {
        self.rec.meta().imported
    }

    pub fn is_exported(&self) -> bool {
        self.rec.meta().exported
    }

    pub fn is_idle(&self) -> bool {
        self.rec.meta().idle
    }

    pub fn capture(&self) -> bool {
        self.rec.meta().capture
    }

    pub fn mmap_mode(&self) -> MmapMode {
        self.rec.meta().mmap_mode
    }

    pub fn global_name(&self) -> u32 {
        self.rec.meta().global_name
    }

    pub fn aux_map_address(&self) -> u64 {
        self.rec.meta().aux_map_address
    }

    /// Record that the aux-map holds a translation for this BO.
    pub fn set_aux_map_address(&self, addr: u64) {
        self.rec.meta().aux_map_address = addr;
    }

    /// Whether the GPU still uses the BO. Query errors count as busy.
    pub fn busy(&self) -> bool {
        self.mgr.busy(&self.rec)
    }

    /// Wait for the GPU to release the BO. Negative `timeout_ns` waits
    /// forever.
    pub fn wait(&self, timeout_ns: i64) -> Result<()> {
        self.mgr.wait(&self.rec, timeout_ns)
    }

    /// CPU mapping, created on first use. Does not wait for the GPU.
    pub fn map(&self) -> Result<Arc<dyn CpuMapping>> {
        self.mgr.map(&self.rec)
    }

    /// Wait for idle, then map.
    pub fn map_sync(&self) -> Result<Arc<dyn CpuMapping>> {
        self.wait(-1)?;
        self.map()
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.map()?
            .write(offset, data)
            .map_err(|e| Error::from_ioctl("bo_write", e))
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.map()?
            .read(offset, out)
            .map_err(|e| Error::from_ioctl("bo_read", e))
    }

    pub fn export_dmabuf(&self) -> Result<i32> {
        self.mgr.export_dmabuf(&self.rec)
    }

    pub fn export_gem_handle(&self) -> Result<u32> {
        self.mgr.mark_exported(&self.rec)?;
        Ok(self.rec.handle)
    }

    pub fn flink(&self) -> Result<u32> {
        self.mgr.flink(&self.rec)
    }

    /// Called when a submit referencing the BO reached the kernel.
    pub(crate) fn mark_busy(&self) {
        self.rec.meta().idle = false;
    }

    pub fn bufmgr(&self) -> &Arc<BufMgr> {
        &self.mgr
    }

    pub fn same_bo(&self, other: &Bo) -> bool {
        Arc::ptr_eq(&self.rec, &other.rec)
    }
}

impl Clone for Bo {
    fn clone(&self) -> Self {
        self.rec.refcount.fetch_add(1, Ordering::AcqRel);
        Self {
            rec: self.rec.clone(),
            mgr: self.mgr.clone(),
        }
    }
}

impl Drop for Bo {
    fn drop(&mut self) {
        self.mgr.unreference(&self.rec);
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.rec.meta();
        f.debug_struct("Bo")
            .field("handle", &self.rec.handle)
            .field("name", &meta.name)
            .field("size", &self.rec.size)
            .field("address", &format_args!("{:#x}", meta.address))
            .finish()
    }
}
