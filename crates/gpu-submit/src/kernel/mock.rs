//! In-memory kernel used by the tests.
//!
//! BO pages are stored sparsely so large allocations cost nothing until they
//! are written. Busy state, purging and ioctl failures are driven by the test.

use std::sync::{Arc, Mutex, MutexGuard};

use gpu_protocol::uapi::{ExecRequest, Madvise, MemDomain, MmapMode, VmBindRequest};
use hashbrown::HashMap;

use super::{ContextParam, CpuMapping, GemObject, KernelDevice, KernelError, KernelResult};

const PAGE: u64 = 4096;

/// Ioctl selector for fault injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockOp {
    BoCreate,
    SetDomain,
    Madvise,
    Busy,
    Wait,
    MmapOffset,
    Mmap,
    GemClose,
    GemOpen,
    Flink,
    PrimeHandleToFd,
    PrimeFdToHandle,
    DmabufSize,
    ContextCreate,
    ContextSetparam,
    ContextDestroy,
    Exec,
    VmBind,
    RegRead,
    SyncobjCreate,
    SyncobjWait,
}

#[derive(Debug, Default)]
struct PageStore {
    len: u64,
    pages: HashMap<u64, Box<[u8; PAGE as usize]>>,
}

impl PageStore {
    fn check(&self, offset: u64, len: usize) -> KernelResult<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(KernelError::Invalid),
        }
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> KernelResult<()> {
        self.check(offset, out.len())?;
        let mut done = 0usize;
        while done < out.len() {
            let pos = offset + done as u64;
            let page = pos / PAGE;
            let in_page = (pos % PAGE) as usize;
            let n = (out.len() - done).min(PAGE as usize - in_page);
            match self.pages.get(&page) {
                Some(p) => out[done..done + n].copy_from_slice(&p[in_page..in_page + n]),
                None => out[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> KernelResult<()> {
        self.check(offset, data.len())?;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let page = pos / PAGE;
            let in_page = (pos % PAGE) as usize;
            let n = (data.len() - done).min(PAGE as usize - in_page);
            let p = self
                .pages
                .entry(page)
                .or_insert_with(|| Box::new([0u8; PAGE as usize]));
            p[in_page..in_page + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug)]
pub struct MockMapping {
    store: Arc<Mutex<PageStore>>,
    mode: MmapMode,
}

impl CpuMapping for MockMapping {
    fn len(&self) -> u64 {
        lock(&self.store).len
    }

    fn mode(&self) -> MmapMode {
        self.mode
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> KernelResult<()> {
        lock(&self.store).read(offset, out)
    }

    fn write(&self, offset: u64, data: &[u8]) -> KernelResult<()> {
        lock(&self.store).write(offset, data)
    }
}

#[derive(Debug)]
struct MockBo {
    size: u64,
    store: Arc<Mutex<PageStore>>,
    busy: bool,
    dont_need: bool,
    purged: bool,
    name: Option<u32>,
    fd: Option<i32>,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u32,
    next_name: u32,
    next_fd: i32,
    next_ctx: u32,
    next_syncobj: u32,
    bos: HashMap<u32, MockBo>,
    names: HashMap<u32, u32>,
    fds: HashMap<i32, u32>,
    faults: HashMap<MockOp, KernelError>,
    contexts: HashMap<u32, HashMap<ContextParam, u64>>,
    syncobjs: HashMap<u32, bool>,
    regs: HashMap<u32, u64>,
    execs: Vec<ExecRequest>,
    binds: Vec<VmBindRequest>,
    closed: Vec<u32>,
    madvise_log: Vec<(u32, Madvise)>,
    set_domain_log: Vec<u32>,
    creates: u64,
    exec_marks_busy: bool,
    no_mmap_offset: bool,
}

/// In-memory [`KernelDevice`].
#[derive(Debug)]
pub struct MockKernel {
    key: u64,
    state: Mutex<MockState>,
}

impl Default for MockKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKernel {
    pub fn new() -> Self {
        Self::with_key(0x2_0000)
    }

    /// A kernel whose [`KernelDevice::device_key`] is `key`.
    pub fn with_key(key: u64) -> Self {
        Self {
            key,
            state: Mutex::new(MockState {
                next_handle: 1,
                next_name: 1,
                next_fd: 100,
                next_ctx: 1,
                next_syncobj: 1,
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    fn fault(state: &mut MockState, op: MockOp) -> KernelResult<()> {
        match state.faults.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: MockOp, err: KernelError) {
        self.state().faults.insert(op, err);
    }

    pub fn set_busy(&self, handle: u32, busy: bool) {
        if let Some(bo) = self.state().bos.get_mut(&handle) {
            bo.busy = busy;
        }
    }

    /// Mark every BO idle, as if the GPU drained.
    pub fn complete_all(&self) {
        for bo in self.state().bos.values_mut() {
            bo.busy = false;
        }
    }

    /// BOs referenced by an exec become busy until [`Self::complete_all`].
    pub fn set_exec_marks_busy(&self, enabled: bool) {
        self.state().exec_marks_busy = enabled;
    }

    /// Pretend the kernel lacks `MMAP_OFFSET`.
    pub fn disable_mmap_offset(&self) {
        self.state().no_mmap_offset = true;
    }

    /// Reclaim the pages of every BO advised `DONT_NEED`.
    pub fn purge_idle(&self) {
        for bo in self.state().bos.values_mut() {
            if bo.dont_need && !bo.busy {
                bo.purged = true;
                lock(&bo.store).pages.clear();
            }
        }
    }

    pub fn set_reg(&self, offset: u32, value: u64) {
        self.state().regs.insert(offset, value);
    }

    /// Create a BO as if another process had exported it. Returns its flink
    /// name and a DMA-buf fd.
    pub fn create_foreign_bo(&self, size: u64) -> (u32, i32) {
        let mut st = self.state();
        let handle = st.next_handle;
        st.next_handle += 1;
        let name = st.next_name;
        st.next_name += 1;
        let fd = st.next_fd;
        st.next_fd += 1;
        st.bos.insert(
            handle,
            MockBo {
                size,
                store: Arc::new(Mutex::new(PageStore {
                    len: size,
                    ..PageStore::default()
                })),
                busy: false,
                dont_need: false,
                purged: false,
                name: Some(name),
                fd: Some(fd),
            },
        );
        st.names.insert(name, handle);
        st.fds.insert(fd, handle);
        (name, fd)
    }

    pub fn exec_log(&self) -> Vec<ExecRequest> {
        self.state().execs.clone()
    }

    pub fn bind_log(&self) -> Vec<VmBindRequest> {
        self.state().binds.clone()
    }

    pub fn closed_handles(&self) -> Vec<u32> {
        self.state().closed.clone()
    }

    pub fn madvise_log(&self) -> Vec<(u32, Madvise)> {
        self.state().madvise_log.clone()
    }

    pub fn set_domain_calls(&self) -> Vec<u32> {
        self.state().set_domain_log.clone()
    }

    pub fn create_count(&self) -> u64 {
        self.state().creates
    }

    pub fn live_bo_count(&self) -> usize {
        self.state().bos.len()
    }

    pub fn is_live(&self, handle: u32) -> bool {
        self.state().bos.contains_key(&handle)
    }

    pub fn context_param(&self, ctx: u32, param: ContextParam) -> Option<u64> {
        self.state()
            .contexts
            .get(&ctx)
            .and_then(|p| p.get(&param).copied())
    }

    pub fn syncobj_signaled(&self, handle: u32) -> bool {
        self.state().syncobjs.get(&handle).copied().unwrap_or(false)
    }

    pub fn signal_syncobj(&self, handle: u32) {
        self.state().syncobjs.insert(handle, true);
    }

    /// Read BO contents directly, bypassing any mapping.
    pub fn read_bo(&self, handle: u32, offset: u64, len: usize) -> KernelResult<Vec<u8>> {
        let st = self.state();
        let bo = st.bos.get(&handle).ok_or(KernelError::NotFound)?;
        let mut out = vec![0u8; len];
        lock(&bo.store).read(offset, &mut out)?;
        Ok(out)
    }

    pub fn write_bo(&self, handle: u32, offset: u64, data: &[u8]) -> KernelResult<()> {
        let st = self.state();
        let bo = st.bos.get(&handle).ok_or(KernelError::NotFound)?;
        let result = lock(&bo.store).write(offset, data);
        result
    }

    fn mapping(&self, op: MockOp, handle: u32, mode: MmapMode) -> KernelResult<Arc<dyn CpuMapping>> {
        let mut st = self.state();
        Self::fault(&mut st, op)?;
        let bo = st.bos.get(&handle).ok_or(KernelError::NotFound)?;
        Ok(Arc::new(MockMapping {
            store: bo.store.clone(),
            mode,
        }))
    }
}

impl KernelDevice for MockKernel {
    fn device_key(&self) -> u64 {
        self.key
    }

    fn bo_create(&self, size: u64) -> KernelResult<GemObject> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::BoCreate)?;
        if size == 0 {
            return Err(KernelError::Invalid);
        }
        let handle = st.next_handle;
        st.next_handle += 1;
        st.creates += 1;
        st.bos.insert(
            handle,
            MockBo {
                size,
                store: Arc::new(Mutex::new(PageStore {
                    len: size,
                    ..PageStore::default()
                })),
                busy: false,
                dont_need: false,
                purged: false,
                name: None,
                fd: None,
            },
        );
        Ok(GemObject { handle, size })
    }

    fn bo_set_domain(&self, handle: u32, _read: MemDomain, _write: MemDomain) -> KernelResult<()> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::SetDomain)?;
        if !st.bos.contains_key(&handle) {
            return Err(KernelError::NotFound);
        }
        st.set_domain_log.push(handle);
        Ok(())
    }

    fn bo_madvise(&self, handle: u32, advice: Madvise) -> KernelResult<bool> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::Madvise)?;
        st.madvise_log.push((handle, advice));
        let bo = st.bos.get_mut(&handle).ok_or(KernelError::NotFound)?;
        bo.dont_need = advice == Madvise::DontNeed;
        Ok(!bo.purged)
    }

    fn bo_busy(&self, handle: u32) -> KernelResult<bool> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::Busy)?;
        st.bos
            .get(&handle)
            .map(|bo| bo.busy)
            .ok_or(KernelError::NotFound)
    }

    fn bo_wait(&self, handle: u32, timeout_ns: i64) -> KernelResult<()> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::Wait)?;
        let bo = st.bos.get_mut(&handle).ok_or(KernelError::NotFound)?;
        if bo.busy {
            if timeout_ns >= 0 {
                return Err(KernelError::TimedOut);
            }
            bo.busy = false;
        }
        Ok(())
    }

    fn has_mmap_offset(&self) -> bool {
        !self.state().no_mmap_offset
    }

    fn bo_mmap_offset(&self, handle: u32, mode: MmapMode) -> KernelResult<Arc<dyn CpuMapping>> {
        self.mapping(MockOp::MmapOffset, handle, mode)
    }

    fn bo_mmap(&self, handle: u32) -> KernelResult<Arc<dyn CpuMapping>> {
        self.mapping(MockOp::Mmap, handle, MmapMode::Wb)
    }

    fn gem_close(&self, handle: u32) -> KernelResult<()> {
        let mut st = self.state();
        st.closed.push(handle);
        Self::fault(&mut st, MockOp::GemClose)?;
        let bo = st.bos.remove(&handle).ok_or(KernelError::NotFound)?;
        if let Some(name) = bo.name {
            st.names.remove(&name);
        }
        if let Some(fd) = bo.fd {
            st.fds.remove(&fd);
        }
        Ok(())
    }

    fn gem_open(&self, name: u32) -> KernelResult<GemObject> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::GemOpen)?;
        let handle = *st.names.get(&name).ok_or(KernelError::NotFound)?;
        let size = st.bos.get(&handle).map(|bo| bo.size).ok_or(KernelError::NotFound)?;
        Ok(GemObject { handle, size })
    }

    fn gem_flink(&self, handle: u32) -> KernelResult<u32> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::Flink)?;
        let next = st.next_name;
        let bo = st.bos.get_mut(&handle).ok_or(KernelError::NotFound)?;
        if let Some(name) = bo.name {
            return Ok(name);
        }
        bo.name = Some(next);
        st.next_name += 1;
        st.names.insert(next, handle);
        Ok(next)
    }

    fn prime_handle_to_fd(&self, handle: u32, _flags: u32) -> KernelResult<i32> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::PrimeHandleToFd)?;
        let next = st.next_fd;
        let bo = st.bos.get_mut(&handle).ok_or(KernelError::NotFound)?;
        if let Some(fd) = bo.fd {
            return Ok(fd);
        }
        bo.fd = Some(next);
        st.next_fd += 1;
        st.fds.insert(next, handle);
        Ok(next)
    }

    fn prime_fd_to_handle(&self, fd: i32) -> KernelResult<u32> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::PrimeFdToHandle)?;
        st.fds.get(&fd).copied().ok_or(KernelError::Invalid)
    }

    fn dmabuf_size(&self, fd: i32) -> KernelResult<u64> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::DmabufSize)?;
        let handle = st.fds.get(&fd).ok_or(KernelError::Invalid)?;
        st.bos
            .get(handle)
            .map(|bo| bo.size)
            .ok_or(KernelError::Invalid)
    }

    fn context_create(&self) -> KernelResult<u32> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::ContextCreate)?;
        let ctx = st.next_ctx;
        st.next_ctx += 1;
        st.contexts.insert(ctx, HashMap::new());
        Ok(ctx)
    }

    fn context_setparam(&self, ctx: u32, param: ContextParam, value: u64) -> KernelResult<()> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::ContextSetparam)?;
        st.contexts
            .get_mut(&ctx)
            .ok_or(KernelError::NotFound)?
            .insert(param, value);
        Ok(())
    }

    fn context_getparam(&self, ctx: u32, param: ContextParam) -> KernelResult<u64> {
        let st = self.state();
        let params = st.contexts.get(&ctx).ok_or(KernelError::NotFound)?;
        Ok(params.get(&param).copied().unwrap_or(0))
    }

    fn context_destroy(&self, ctx: u32) -> KernelResult<()> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::ContextDestroy)?;
        st.contexts
            .remove(&ctx)
            .map(|_| ())
            .ok_or(KernelError::NotFound)
    }

    fn exec(&self, req: &ExecRequest) -> KernelResult<()> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::Exec)?;
        for bo in &req.bos {
            if !st.bos.contains_key(&bo.handle) {
                return Err(KernelError::NotFound);
            }
        }
        if st.exec_marks_busy {
            for res in &req.bos {
                if let Some(bo) = st.bos.get_mut(&res.handle) {
                    bo.busy = true;
                }
            }
        }
        for signal in &req.signals {
            st.syncobjs.insert(signal.handle, true);
        }
        st.execs.push(req.clone());
        Ok(())
    }

    fn vm_bind(&self, req: &VmBindRequest) -> KernelResult<()> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::VmBind)?;
        for signal in &req.signals {
            st.syncobjs.insert(signal.handle, true);
        }
        st.binds.push(req.clone());
        Ok(())
    }

    fn reg_read(&self, offset: u32) -> KernelResult<u64> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::RegRead)?;
        st.regs.get(&offset).copied().ok_or(KernelError::Invalid)
    }

    fn syncobj_create(&self, signaled: bool) -> KernelResult<u32> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::SyncobjCreate)?;
        let handle = st.next_syncobj;
        st.next_syncobj += 1;
        st.syncobjs.insert(handle, signaled);
        Ok(handle)
    }

    fn syncobj_wait(&self, handles: &[u32], _timeout_ns: i64, wait_all: bool) -> KernelResult<()> {
        let mut st = self.state();
        Self::fault(&mut st, MockOp::SyncobjWait)?;
        let mut signaled = handles
            .iter()
            .map(|h| st.syncobjs.get(h).copied().unwrap_or(false));
        let done = if wait_all {
            signaled.all(|s| s)
        } else {
            signaled.any(|s| s)
        };
        if done {
            Ok(())
        } else {
            Err(KernelError::TimedOut)
        }
    }

    fn syncobj_destroy(&self, handle: u32) -> KernelResult<()> {
        self.state()
            .syncobjs
            .remove(&handle)
            .map(|_| ())
            .ok_or(KernelError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_pages_read_back() {
        let k = MockKernel::new();
        let bo = k.bo_create(3 * PAGE).unwrap();
        let map = k.bo_mmap(bo.handle).unwrap();
        map.write(PAGE - 2, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 6];
        map.read(PAGE - 3, &mut out).unwrap();
        assert_eq!(out, [0, 1, 2, 3, 4, 0]);
        assert_eq!(map.write(3 * PAGE - 1, &[0, 0]), Err(KernelError::Invalid));
    }

    #[test]
    fn purge_only_hits_dont_need() {
        let k = MockKernel::new();
        let a = k.bo_create(PAGE).unwrap().handle;
        let b = k.bo_create(PAGE).unwrap().handle;
        assert!(k.bo_madvise(a, Madvise::DontNeed).unwrap());
        k.purge_idle();
        assert!(!k.bo_madvise(a, Madvise::WillNeed).unwrap());
        assert!(k.bo_madvise(b, Madvise::WillNeed).unwrap());
    }

    #[test]
    fn faults_fire_once() {
        let k = MockKernel::new();
        k.fail_next(MockOp::BoCreate, KernelError::NoMemory);
        assert_eq!(k.bo_create(PAGE), Err(KernelError::NoMemory));
        assert!(k.bo_create(PAGE).is_ok());
    }

    #[test]
    fn busy_wait_semantics() {
        let k = MockKernel::new();
        let h = k.bo_create(PAGE).unwrap().handle;
        k.set_busy(h, true);
        assert_eq!(k.bo_wait(h, 1000), Err(KernelError::TimedOut));
        assert!(k.bo_busy(h).unwrap());
        k.bo_wait(h, -1).unwrap();
        assert!(!k.bo_busy(h).unwrap());
    }
}
