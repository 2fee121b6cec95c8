use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use gpu_protocol::align_up;
use gpu_protocol::uapi::{Madvise, MemDomain, MmapMode};
use hashbrown::HashMap;
use tracing::{debug, warn};

use super::bucket::{bucket_index, make_buckets, Bucket};
use super::{AuxMap, Bo, BoFlags, BoMeta, BoRecord, Clock, MonotonicClock};
use crate::config::DeviceConfig;
use crate::kernel::{ContextParam, CpuMapping, KernelDevice};
use crate::stats::SubmitStats;
use crate::vma::{address_48b, canonical_address, MemZone, VmaAllocator};
use crate::{lock, Error, Result};

const DRM_CLOEXEC: u32 = 0o2000000;
const DRM_RDWR: u32 = 0o2;

/// Alignment of DMA-buf imports, enough for compressed surfaces.
const DMABUF_IMPORT_ALIGN: u64 = 64 * 1024;

#[derive(Clone, Copy)]
enum ExternalTable {
    Name,
    Handle,
}

struct State {
    buckets: Vec<Bucket>,
    zombies: VecDeque<Arc<BoRecord>>,
    name_table: HashMap<u32, Weak<BoRecord>>,
    handle_table: HashMap<u32, Weak<BoRecord>>,
    vma: VmaAllocator,
    /// Second of the last cache sweep.
    time: u64,
}

type Registry = Mutex<HashMap<u64, Weak<BufMgr>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Per-device BO allocator and cache.
///
/// Every bucket, zombie and external-table operation runs under one mutex.
/// Lock order is manager state, then the BO's own metadata.
pub struct BufMgr {
    kernel: Arc<dyn KernelDevice>,
    key: u64,
    page_size: u64,
    has_llc: bool,
    has_local_mem: bool,
    bo_reuse: bool,
    registered: bool,
    bucket_sizes: Vec<u64>,
    clock: Arc<dyn Clock>,
    aux_map: Option<Arc<dyn AuxMap>>,
    stats: Arc<SubmitStats>,
    state: Mutex<State>,
}

impl fmt::Debug for BufMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufMgr")
            .field("key", &self.key)
            .field("bo_reuse", &self.bo_reuse)
            .finish()
    }
}

impl BufMgr {
    /// A private manager, not shared through the registry.
    pub fn new(kernel: Arc<dyn KernelDevice>, config: &DeviceConfig) -> Arc<Self> {
        Self::with_parts(kernel, config, Arc::new(MonotonicClock::default()), None)
    }

    pub fn with_parts(
        kernel: Arc<dyn KernelDevice>,
        config: &DeviceConfig,
        clock: Arc<dyn Clock>,
        aux_map: Option<Arc<dyn AuxMap>>,
    ) -> Arc<Self> {
        Arc::new(Self::build(kernel, config, clock, aux_map, false))
    }

    /// The live manager for `kernel`'s device, or a new registered one.
    pub fn get_for_fd(kernel: Arc<dyn KernelDevice>, config: &DeviceConfig) -> Arc<Self> {
        let mut reg = lock(registry());
        let key = kernel.device_key();
        if let Some(existing) = reg.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let mgr = Arc::new(Self::build(
            kernel,
            config,
            Arc::new(MonotonicClock::default()),
            None,
            true,
        ));
        reg.insert(key, Arc::downgrade(&mgr));
        debug!(key, "bufmgr registered");
        mgr
    }

    fn build(
        kernel: Arc<dyn KernelDevice>,
        config: &DeviceConfig,
        clock: Arc<dyn Clock>,
        aux_map: Option<Arc<dyn AuxMap>>,
        registered: bool,
    ) -> Self {
        let buckets = make_buckets(config.page_size);
        Self {
            key: kernel.device_key(),
            kernel,
            page_size: config.page_size,
            has_llc: config.has_llc,
            has_local_mem: config.has_local_mem,
            bo_reuse: config.bo_reuse,
            registered,
            bucket_sizes: buckets.iter().map(|b| b.size).collect(),
            clock,
            aux_map,
            stats: Arc::new(SubmitStats::new()),
            state: Mutex::new(State {
                buckets,
                zombies: VecDeque::new(),
                name_table: HashMap::new(),
                handle_table: HashMap::new(),
                vma: VmaAllocator::new(config),
                time: 0,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    pub fn kernel(&self) -> &Arc<dyn KernelDevice> {
        &self.kernel
    }

    pub fn device_key(&self) -> u64 {
        self.key
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn has_llc(&self) -> bool {
        self.has_llc
    }

    pub fn has_local_mem(&self) -> bool {
        self.has_local_mem
    }

    pub fn stats(&self) -> &Arc<SubmitStats> {
        &self.stats
    }

    fn bucket_for(&self, size: u64) -> Option<usize> {
        bucket_index(size, self.page_size, self.bucket_sizes.len())
    }

    /// Size a request of `size` bytes is rounded up to.
    pub fn alloc_size_for(&self, size: u64) -> u64 {
        match self.bucket_for(size) {
            Some(i) => self.bucket_sizes[i],
            None => align_up(size, self.page_size).max(self.page_size),
        }
    }

    pub fn cached_bo_count(&self) -> usize {
        self.lock_state().buckets.iter().map(|b| b.bos.len()).sum()
    }

    pub fn zombie_count(&self) -> usize {
        self.lock_state().zombies.len()
    }

    /// Free bytes left in `zone`'s VA heap.
    pub fn vma_free_size(&self, zone: MemZone) -> Option<u64> {
        self.lock_state().vma.heap(zone).map(|h| h.free_size())
    }

    /// Allocate a BO of at least `size` bytes whose VA lies in `zone`.
    pub fn alloc(
        self: &Arc<Self>,
        name: &'static str,
        size: u64,
        align: u64,
        zone: MemZone,
        flags: BoFlags,
    ) -> Result<Bo> {
        if size == 0 {
            return Err(Error::invalid(format!("{name}: zero-sized BO")));
        }
        let align = align.max(1);
        if !align.is_power_of_two() {
            return Err(Error::invalid(format!("{name}: alignment {align} is not a power of two")));
        }

        let bucket = self.bucket_for(size);
        let bo_size = self.alloc_size_for(size);
        let desired_mode = if self.has_llc || flags.contains(BoFlags::COHERENT) {
            MmapMode::Wb
        } else {
            MmapMode::Wc
        };

        let cached = match bucket {
            Some(b) => {
                let mut st = self.lock_state();
                // Prefer a BO already in the right zone so its VA can stay.
                match self.alloc_from_cache(&mut st, b, align, zone, flags, true) {
                    Some(rec) => Some(rec),
                    None => self.alloc_from_cache(&mut st, b, align, zone, flags, false),
                }
            }
            None => None,
        };

        let rec = match cached {
            Some(rec) => {
                self.stats.inc_bo_cache_hits();
                rec
            }
            None => {
                self.stats.inc_bo_cache_misses();
                self.alloc_fresh(bo_size)?
            }
        };

        let mut st = self.lock_state();
        let mut meta = rec.meta();
        if meta.address == 0 {
            match st.vma.alloc(zone, rec.size, align) {
                Some(addr) => meta.address = address_48b(addr),
                None => {
                    drop(meta);
                    self.bo_free(&mut st, &rec);
                    warn!(name, size, zone = zone.name(), "VA space exhausted");
                    return Err(Error::OutOfDeviceMemory);
                }
            }
        }

        meta.name = name;
        meta.flags = flags;
        meta.reusable = bucket.is_some() && self.bo_reuse;
        meta.cache_coherent = self.has_llc;
        meta.capture = zone < MemZone::Other;
        if meta.mmap_mode != desired_mode {
            meta.map = None;
        }
        meta.mmap_mode = desired_mode;
        if flags.contains(BoFlags::COHERENT) && !meta.cache_coherent {
            meta.cache_coherent = true;
            meta.reusable = false;
        }
        debug!(
            handle = rec.handle,
            name,
            size = rec.size,
            zone = zone.name(),
            "bo_create"
        );
        drop(meta);
        let bo = Bo::adopt(rec, self.clone());
        drop(st);

        if flags.contains(BoFlags::MAP) {
            bo.map()?;
        }
        Ok(bo)
    }

    fn alloc_from_cache(
        &self,
        st: &mut State,
        bucket: usize,
        align: u64,
        zone: MemZone,
        flags: BoFlags,
        match_zone: bool,
    ) -> Option<Arc<BoRecord>> {
        let mut i = 0;
        let found = loop {
            let cur = st.buckets[bucket].bos.get(i)?.clone();
            let addr = cur.meta().address;
            if match_zone && MemZone::for_address(addr) != zone {
                i += 1;
                continue;
            }

            // Later entries were freed more recently, so they are busy too.
            if self.busy(&cur) {
                return None;
            }

            st.buckets[bucket].bos.remove(i);
            match self.kernel.bo_madvise(cur.handle, Madvise::WillNeed) {
                Ok(true) => break cur,
                Ok(false) => {
                    self.stats.inc_bo_purged();
                    debug!(handle = cur.handle, "cached bo was purged");
                }
                Err(err) => warn!(handle = cur.handle, %err, "madvise(WILLNEED) failed"),
            }
            self.bo_free(st, &cur);
        };

        let mut meta = found.meta();
        if meta.aux_map_address != 0 {
            if let Some(aux) = &self.aux_map {
                aux.unmap_range(canonical_address(meta.address), found.size);
            }
            meta.aux_map_address = 0;
        }

        if meta.address != 0
            && (MemZone::for_address(meta.address) != zone || meta.address % align != 0)
        {
            st.vma.free(canonical_address(meta.address), found.size);
            meta.address = 0;
        }
        drop(meta);

        if flags.contains(BoFlags::ZEROED) {
            let cleared = self
                .map(&found)
                .and_then(|m| m.fill(0, found.size, 0).map_err(|e| Error::from_ioctl("bo_clear", e)));
            if let Err(err) = cleared {
                debug!(handle = found.handle, %err, "could not clear cached bo");
                self.bo_free(st, &found);
                return None;
            }
        }

        Some(found)
    }

    fn alloc_fresh(&self, size: u64) -> Result<Arc<BoRecord>> {
        let obj = self
            .kernel
            .bo_create(size)
            .map_err(|e| Error::from_ioctl("bo_create", e))?;
        let rec = Arc::new(BoRecord::new(obj.handle, size, BoMeta::new("fresh")));
        self.stats.inc_bo_fresh_allocs();

        // Populate the pages now rather than on first exec.
        if let Err(err) = self
            .kernel
            .bo_set_domain(obj.handle, MemDomain::CPU, MemDomain::empty())
        {
            warn!(handle = obj.handle, %err, "set_domain failed");
            let mut st = self.lock_state();
            self.bo_free(&mut st, &rec);
            return Err(Error::from_ioctl("bo_set_domain", err));
        }
        Ok(rec)
    }

    /// Query the kernel, caching the answer in the idle flag.
    pub(crate) fn busy(&self, rec: &BoRecord) -> bool {
        match self.kernel.bo_busy(rec.handle) {
            Ok(busy) => {
                rec.meta().idle = !busy;
                busy
            }
            Err(err) => {
                warn!(handle = rec.handle, %err, "busy query failed, assuming busy");
                true
            }
        }
    }

    pub(crate) fn wait(&self, rec: &BoRecord, timeout_ns: i64) -> Result<()> {
        {
            let meta = rec.meta();
            if meta.idle && !meta.is_external() {
                return Ok(());
            }
        }
        self.kernel
            .bo_wait(rec.handle, timeout_ns)
            .map_err(|e| Error::from_ioctl("bo_wait", e))?;
        rec.meta().idle = true;
        Ok(())
    }

    pub(crate) fn map(&self, rec: &BoRecord) -> Result<Arc<dyn CpuMapping>> {
        let mode = {
            let meta = rec.meta();
            if let Some(map) = &meta.map {
                return Ok(map.clone());
            }
            meta.mmap_mode
        };
        let map = if self.kernel.has_mmap_offset() {
            self.kernel.bo_mmap_offset(rec.handle, mode)
        } else {
            self.kernel.bo_mmap(rec.handle)
        }
        .map_err(|e| Error::from_ioctl("bo_mmap", e))?;
        let mut meta = rec.meta();
        // Another thread may have mapped meanwhile; keep the first mapping.
        Ok(meta.map.get_or_insert(map).clone())
    }

    /// Release a BO nobody references: close it if idle, else park it on the
    /// zombie list.
    fn bo_free(&self, st: &mut State, rec: &Arc<BoRecord>) {
        let mut meta = rec.meta();
        meta.map = None;
        if meta.idle {
            drop(meta);
            self.bo_close(st, rec);
        } else {
            meta.in_zombie_list = true;
            drop(meta);
            self.stats.inc_bo_zombies();
            debug!(handle = rec.handle, "bo is busy, deferring close");
            st.zombies.push_back(rec.clone());
        }
    }

    fn bo_close(&self, st: &mut State, rec: &Arc<BoRecord>) {
        let mut meta = rec.meta();
        if meta.is_external() {
            let same = |w: &Weak<BoRecord>| std::ptr::eq(w.as_ptr(), Arc::as_ptr(rec));
            if meta.global_name != 0 && st.name_table.get(&meta.global_name).is_some_and(same) {
                st.name_table.remove(&meta.global_name);
            }
            if st.handle_table.get(&rec.handle).is_some_and(same) {
                st.handle_table.remove(&rec.handle);
            }
        }

        if let Err(err) = self.kernel.gem_close(rec.handle) {
            warn!(handle = rec.handle, name = meta.name, %err, "gem_close failed");
        }

        if meta.aux_map_address != 0 {
            if let Some(aux) = &self.aux_map {
                aux.unmap_range(canonical_address(meta.address), rec.size);
            }
            meta.aux_map_address = 0;
        }

        if meta.address != 0 {
            st.vma.free(canonical_address(meta.address), rec.size);
            meta.address = 0;
        }
        meta.map = None;
        self.stats.inc_bo_closes();
        debug!(handle = rec.handle, name = meta.name, size = rec.size, "bo_close");
    }

    /// Drop one reference. The last one returns the BO to its bucket or
    /// frees it, then runs the periodic sweep.
    pub(crate) fn unreference(&self, rec: &Arc<BoRecord>) {
        let mut cur = rec.refcount.load(Ordering::Acquire);
        while cur > 1 {
            match rec.refcount.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }

        let now = self.clock.now_secs();
        let mut st = self.lock_state();
        if rec.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.unreference_final(&mut st, rec, now);
            self.cleanup_locked(&mut st, now);
        }
    }

    fn unreference_final(&self, st: &mut State, rec: &Arc<BoRecord>, now: u64) {
        let bucket = self
            .bucket_for(rec.size)
            .filter(|&b| st.buckets[b].size == rec.size);
        let mut meta = rec.meta();

        if let (true, Some(b)) = (meta.reusable, bucket) {
            match self.kernel.bo_madvise(rec.handle, Madvise::DontNeed) {
                Ok(true) => {
                    meta.free_time = now;
                    debug!(handle = rec.handle, size = rec.size, "bo cached");
                    drop(meta);
                    st.buckets[b].bos.push_back(rec.clone());
                    return;
                }
                Ok(false) => {}
                Err(err) => warn!(handle = rec.handle, %err, "madvise(DONTNEED) failed"),
            }
        }
        drop(meta);
        self.bo_free(st, rec);
    }

    /// Evict cache entries idle for more than a second and close zombies
    /// that have gone idle. Runs at most once per `now`.
    pub fn cleanup(&self, now: u64) {
        let mut st = self.lock_state();
        self.cleanup_locked(&mut st, now);
    }

    fn cleanup_locked(&self, st: &mut State, now: u64) {
        if st.time == now {
            return;
        }

        for b in 0..st.buckets.len() {
            loop {
                let expired = match st.buckets[b].bos.front() {
                    Some(front) => now.saturating_sub(front.meta().free_time) > 1,
                    None => false,
                };
                if !expired {
                    break;
                }
                if let Some(rec) = st.buckets[b].bos.pop_front() {
                    self.bo_free(st, &rec);
                }
            }
        }

        // Zombies were queued in free order, so the first busy one means
        // the rest are busy as well.
        while let Some(front) = st.zombies.front().cloned() {
            let idle = front.meta().idle;
            if !idle && self.busy(&front) {
                break;
            }
            st.zombies.pop_front();
            front.meta().in_zombie_list = false;
            self.bo_close(st, &front);
        }

        st.time = now;
    }

    fn find_external(
        &self,
        st: &mut State,
        table: ExternalTable,
        key: u32,
    ) -> Option<Arc<BoRecord>> {
        let entry = match table {
            ExternalTable::Name => st.name_table.get(&key),
            ExternalTable::Handle => st.handle_table.get(&key),
        };
        let rec = entry.and_then(Weak::upgrade)?;
        let mut meta = rec.meta();
        debug_assert!(meta.is_external() && !meta.reusable);
        // A re-imported BO may be waiting on the zombie list; revive it.
        if meta.in_zombie_list {
            st.zombies.retain(|z| !Arc::ptr_eq(z, &rec));
            meta.in_zombie_list = false;
        }
        drop(meta);
        Some(rec)
    }

    /// Import a BO shared by global (flink) name.
    pub fn import_by_name(self: &Arc<Self>, name: &'static str, global_name: u32) -> Result<Bo> {
        let mut st = self.lock_state();
        if let Some(rec) = self.find_external(&mut st, ExternalTable::Name, global_name) {
            let bo = Bo::adopt(rec, self.clone());
            drop(st);
            return Ok(bo);
        }

        let obj = self
            .kernel
            .gem_open(global_name)
            .map_err(|e| Error::from_ioctl("gem_open", e))?;

        // The same kernel object may already be wrapped from a DMA-buf.
        if let Some(rec) = self.find_external(&mut st, ExternalTable::Handle, obj.handle) {
            let bo = Bo::adopt(rec, self.clone());
            drop(st);
            return Ok(bo);
        }

        let Some(addr) = st.vma.alloc(MemZone::Other, obj.size, 1) else {
            if let Err(err) = self.kernel.gem_close(obj.handle) {
                warn!(handle = obj.handle, %err, "gem_close failed");
            }
            return Err(Error::OutOfDeviceMemory);
        };

        let mut meta = BoMeta::new(name);
        meta.global_name = global_name;
        meta.imported = true;
        meta.idle = false;
        meta.address = address_48b(addr);
        let rec = Arc::new(BoRecord::new(obj.handle, obj.size, meta));
        st.handle_table.insert(obj.handle, Arc::downgrade(&rec));
        st.name_table.insert(global_name, Arc::downgrade(&rec));
        debug!(handle = obj.handle, global_name, size = obj.size, "bo imported by name");
        let bo = Bo::adopt(rec, self.clone());
        drop(st);
        Ok(bo)
    }

    /// Import a DMA-buf.
    pub fn import_dmabuf(self: &Arc<Self>, fd: i32) -> Result<Bo> {
        let mut st = self.lock_state();
        let handle = self
            .kernel
            .prime_fd_to_handle(fd)
            .map_err(|e| Error::from_ioctl("prime_fd_to_handle", e))?;

        if let Some(rec) = self.find_external(&mut st, ExternalTable::Handle, handle) {
            let bo = Bo::adopt(rec, self.clone());
            drop(st);
            return Ok(bo);
        }

        let size = match self.kernel.dmabuf_size(fd) {
            Ok(size) => size,
            Err(e) => {
                self.close_unadopted(handle);
                return Err(Error::from_ioctl("dmabuf_size", e));
            }
        };
        let Some(addr) = st.vma.alloc(MemZone::Other, size, DMABUF_IMPORT_ALIGN) else {
            self.close_unadopted(handle);
            return Err(Error::OutOfDeviceMemory);
        };

        let mut meta = BoMeta::new("prime");
        meta.imported = true;
        meta.idle = false;
        meta.address = address_48b(addr);
        let rec = Arc::new(BoRecord::new(handle, size, meta));
        st.handle_table.insert(handle, Arc::downgrade(&rec));
        debug!(handle, fd, size, "bo imported from dmabuf");
        let bo = Bo::adopt(rec, self.clone());
        drop(st);
        Ok(bo)
    }

    /// Drop a handle the kernel gave us before any `Bo` owns it.
    fn close_unadopted(&self, handle: u32) {
        if let Err(err) = self.kernel.gem_close(handle) {
            warn!(handle, %err, "gem_close failed");
        }
    }

    fn mark_exported_locked(&self, st: &mut State, rec: &Arc<BoRecord>) -> Result<()> {
        let mut meta = rec.meta();
        if meta.flags.contains(BoFlags::NO_SHARE) {
            return Err(Error::invalid(format!("{} may not be shared", meta.name)));
        }
        if !meta.is_external() {
            st.handle_table.insert(rec.handle, Arc::downgrade(rec));
        }
        if !meta.exported {
            // Scanout lives outside the CPU cache domain.
            meta.cache_coherent = false;
            meta.exported = true;
            meta.reusable = false;
        }
        Ok(())
    }

    pub(crate) fn mark_exported(&self, rec: &Arc<BoRecord>) -> Result<()> {
        if rec.meta().exported {
            return Ok(());
        }
        let mut st = self.lock_state();
        self.mark_exported_locked(&mut st, rec)
    }

    pub(crate) fn export_dmabuf(&self, rec: &Arc<BoRecord>) -> Result<i32> {
        self.mark_exported(rec)?;
        self.kernel
            .prime_handle_to_fd(rec.handle, DRM_CLOEXEC | DRM_RDWR)
            .map_err(|e| Error::from_ioctl("prime_handle_to_fd", e))
    }

    pub(crate) fn flink(&self, rec: &Arc<BoRecord>) -> Result<u32> {
        let existing = rec.meta().global_name;
        if existing != 0 {
            return Ok(existing);
        }
        let name = self
            .kernel
            .gem_flink(rec.handle)
            .map_err(|e| Error::from_ioctl("gem_flink", e))?;

        let mut st = self.lock_state();
        if rec.meta().global_name == 0 {
            self.mark_exported_locked(&mut st, rec)?;
            rec.meta().global_name = name;
            st.name_table.insert(name, Arc::downgrade(rec));
        }
        let global_name = rec.meta().global_name;
        Ok(global_name)
    }

    /// Create a hardware context that reports hangs instead of silently
    /// resetting to default state.
    pub fn create_hw_context(&self) -> Result<u32> {
        let ctx = self
            .kernel
            .context_create()
            .map_err(|e| Error::from_ioctl("context_create", e))?;
        if let Err(err) = self
            .kernel
            .context_setparam(ctx, ContextParam::Recoverable, 0)
        {
            warn!(ctx, %err, "could not make context non-recoverable");
        }
        Ok(ctx)
    }

    pub fn set_hw_context_priority(&self, ctx: u32, priority: i32) -> Result<()> {
        self.kernel
            .context_setparam(ctx, ContextParam::Priority, priority as i64 as u64)
            .map_err(|e| Error::from_ioctl("context_setparam", e))
    }

    fn hw_context_priority(&self, ctx: u32) -> i32 {
        // Errors read as the default priority.
        self.kernel
            .context_getparam(ctx, ContextParam::Priority)
            .map(|v| v as i64 as i32)
            .unwrap_or(0)
    }

    /// New context carrying `ctx`'s priority.
    pub fn clone_hw_context(&self, ctx: u32) -> Result<u32> {
        let new_ctx = self.create_hw_context()?;
        let priority = self.hw_context_priority(ctx);
        if let Err(err) = self.set_hw_context_priority(new_ctx, priority) {
            warn!(ctx = new_ctx, %err, "could not copy context priority");
        }
        Ok(new_ctx)
    }

    pub fn destroy_hw_context(&self, ctx: u32) {
        if ctx == 0 {
            return;
        }
        if let Err(err) = self.kernel.context_destroy(ctx) {
            warn!(ctx, %err, "context_destroy failed");
        }
    }

    pub fn reg_read(&self, offset: u32) -> Result<u64> {
        self.kernel
            .reg_read(offset)
            .map_err(|e| Error::from_ioctl("reg_read", e))
    }
}

impl Drop for BufMgr {
    fn drop(&mut self) {
        {
            let mut st = self.lock_state();
            for b in 0..st.buckets.len() {
                while let Some(rec) = st.buckets[b].bos.pop_front() {
                    self.bo_free(&mut st, &rec);
                }
            }
            while let Some(rec) = st.zombies.pop_front() {
                self.bo_close(&mut st, &rec);
            }
        }

        if self.registered {
            let mut reg = lock(registry());
            let me: *const BufMgr = self;
            if reg.get(&self.key).is_some_and(|w| std::ptr::eq(w.as_ptr(), me)) {
                reg.remove(&self.key);
            }
        }
    }
}
