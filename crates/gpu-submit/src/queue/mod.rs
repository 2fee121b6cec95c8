//! Submission queue: turns recorded command buffers into one kernel exec.
//!
//! Each queue owns a hardware context and a small push holding the
//! per-queue state (descriptor pools, scratch). That push is rebuilt only
//! when one of its inputs moved and rides in front of every submit.

use std::sync::{Arc, Mutex};

use gpu_protocol::class::{cl90b5, cl9097, cla0c0};
use gpu_protocol::push::{SUBC_3D, SUBC_COMPUTE, SUBC_COPY};
use gpu_protocol::split_addr;
use gpu_protocol::uapi::{
    BindFlags, BoAccess, BoResidency, ExecRequest, PushRange, SyncRecord, VmBindRequest,
};
use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::bo::{Bo, BoFlags, BoSync};
use crate::caps::LOCAL_MEMORY_WINDOW;
use crate::cmd_buffer::CmdBuffer;
use crate::device::Device;
use crate::kernel::KernelError;
use crate::push::PushBuilder;
use crate::vma::MemZone;
use crate::{lock, Error, Result};

pub mod sparse;

pub use sparse::{
    BindMemory, BufferBindInfo, ImageOpaqueBindInfo, SparseBind, SparsePlane,
};

/// Serializes tiler/fragment pairs across every queue in the process.
static TILER_PAIR_LOCK: Mutex<()> = Mutex::new(());

/// Descriptor-pool methods of one engine.
struct PoolMethods {
    subc: u8,
    header_pool: u32,
    invalidate_headers: u32,
    sampler_pool: u32,
    invalidate_samplers: u32,
}

const COMPUTE_POOLS: PoolMethods = PoolMethods {
    subc: SUBC_COMPUTE,
    header_pool: cla0c0::SET_TEX_HEADER_POOL_A,
    invalidate_headers: cla0c0::INVALIDATE_TEXTURE_HEADER_CACHE_NO_WFI,
    sampler_pool: cla0c0::SET_TEX_SAMPLER_POOL_A,
    invalidate_samplers: cla0c0::INVALIDATE_SAMPLER_CACHE_NO_WFI,
};

const GRAPHICS_POOLS: PoolMethods = PoolMethods {
    subc: SUBC_3D,
    header_pool: cl9097::SET_TEX_HEADER_POOL_A,
    invalidate_headers: cl9097::INVALIDATE_TEXTURE_HEADER_CACHE_NO_WFI,
    sampler_pool: cl9097::SET_TEX_SAMPLER_POOL_A,
    invalidate_samplers: cl9097::INVALIDATE_SAMPLER_CACHE_NO_WFI,
};

/// What the queue-state push was last built from.
#[derive(Debug, Default)]
struct QueueState {
    images: Option<(Bo, u32)>,
    samplers: Option<(Bo, u32)>,
    slm: Option<(Bo, u32, u32)>,
    push: Option<(Bo, u64)>,
}

fn same_table(a: &Option<(Bo, u32)>, b: &(Bo, u32)) -> bool {
    matches!(a, Some((bo, alloc)) if bo.same_bo(&b.0) && *alloc == b.1)
}

#[derive(Debug, Default)]
struct QueueInner {
    state: QueueState,
    /// Set once the kernel reports the device gone.
    lost: bool,
}

/// One kernel submit's worth of work.
#[derive(Default)]
pub struct SubmitInfo<'a> {
    pub cmd_buffers: &'a [&'a CmdBuffer],
    pub waits: &'a [SyncRecord],
    pub signals: &'a [SyncRecord],
    /// Waited on the host before the exec.
    pub bo_waits: &'a [&'a BoSync],
    /// Ride in the submit and become submitted once the exec succeeds.
    pub bo_signals: &'a [&'a BoSync],
}

/// Residency list with one entry per BO.
#[derive(Debug, Default)]
struct ExecBuilder {
    req: ExecRequest,
    index: HashMap<u32, usize>,
    /// Parallel to `req.bos`; marked busy once the kernel took the exec.
    bos: Vec<Bo>,
}

impl ExecBuilder {
    fn new(channel: u32) -> Self {
        Self {
            req: ExecRequest {
                channel,
                ..ExecRequest::default()
            },
            index: HashMap::new(),
            bos: Vec::new(),
        }
    }

    fn add_bo(&mut self, bo: &Bo, access: BoAccess) {
        match self.index.get(&bo.handle()) {
            Some(&i) => self.req.bos[i].access |= access,
            None => {
                self.index.insert(bo.handle(), self.req.bos.len());
                self.req.bos.push(BoResidency {
                    handle: bo.handle(),
                    access,
                    domain: bo.domain(),
                });
                self.bos.push(bo.clone());
            }
        }
    }

    fn add_push(&mut self, push: PushRange) {
        if push.len > 0 {
            self.req.pushes.push(push);
        }
    }

    fn add_cmd_buffer(&mut self, cmd: &CmdBuffer) {
        for r in cmd.bo_refs() {
            self.add_bo(&r.bo, r.access);
        }
        for push in cmd.pushes() {
            self.add_push(*push);
        }
    }
}

#[derive(Debug)]
pub struct Queue {
    device: Arc<Device>,
    channel: u32,
    /// A lone copy-engine NOP for submits without command buffers.
    empty_push: (Bo, u64),
    inner: Mutex<QueueInner>,
}

impl Queue {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let mgr = device.bufmgr();
        let channel = mgr.create_hw_context()?;

        let mut p = PushBuilder::new();
        p.mthd(SUBC_COPY, cl90b5::NOP).inline_data(0);
        let empty_push = match upload_push(&device, "empty push", p.dwords()) {
            Ok(push) => push,
            Err(err) => {
                mgr.destroy_hw_context(channel);
                return Err(err);
            }
        };
        debug!(channel, "queue created");
        Ok(Self {
            device,
            channel,
            empty_push,
            inner: Mutex::new(QueueInner::default()),
        })
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn is_lost(&self) -> bool {
        lock(&self.inner).lost
    }

    /// Rebuild the queue-state push if the descriptor tables or the SLM
    /// area moved since the last submit.
    fn update_state(&self, qs: &mut QueueState) -> Result<()> {
        let dev = &self.device;
        let images = dev.images().snapshot();
        let samplers = dev.samplers().snapshot();
        let (slm_bo, bytes_per_warp, bytes_per_mp) = dev.slm().get_bo_ref();

        let slm_same = match (&qs.slm, &slm_bo) {
            (Some((bo, bpw, bpm)), Some(new)) => {
                bo.same_bo(new) && *bpw == bytes_per_warp && *bpm == bytes_per_mp
            }
            (None, None) => true,
            _ => false,
        };
        if qs.push.is_some()
            && same_table(&qs.images, &images)
            && same_table(&qs.samplers, &samplers)
            && slm_same
        {
            return Ok(());
        }

        let mut p = PushBuilder::new();
        for pools in [&COMPUTE_POOLS, &GRAPHICS_POOLS] {
            let (hi, lo) = split_addr(images.0.address());
            p.mthd(pools.subc, pools.header_pool)
                .inline_data(hi)
                .inline_data(lo)
                .inline_data(images.1 - 1);
            p.immd(pools.subc, pools.invalidate_headers, 0);

            let (hi, lo) = split_addr(samplers.0.address());
            p.mthd(pools.subc, pools.sampler_pool)
                .inline_data(hi)
                .inline_data(lo)
                .inline_data(samplers.1 - 1);
            p.immd(pools.subc, pools.invalidate_samplers, 0);
        }

        if let Some(bo) = &slm_bo {
            let slm_addr = bo.address();
            let slm_size = bo.size();
            p.mthd(SUBC_COMPUTE, cla0c0::SET_SHADER_LOCAL_MEMORY_A)
                .inline_addr(slm_addr);
            p.mthd(SUBC_COMPUTE, cla0c0::SET_SHADER_LOCAL_MEMORY_NON_THROTTLED_A)
                .inline_addr(bytes_per_mp as u64)
                .inline_data(0xff);
            if dev.gen().has_throttled_slm {
                p.mthd(SUBC_COMPUTE, cla0c0::SET_SHADER_LOCAL_MEMORY_THROTTLED_A)
                    .inline_addr(bytes_per_mp as u64)
                    .inline_data(0xff);
            }

            p.mthd(SUBC_3D, cl9097::SET_SHADER_LOCAL_MEMORY_A)
                .inline_addr(slm_addr)
                .inline_addr(slm_size)
                .inline_data(bytes_per_warp);
        }

        (dev.gen().emit_memory_windows)(&mut p);
        p.immd(
            SUBC_3D,
            cl9097::SET_SHADER_LOCAL_MEMORY_WINDOW,
            LOCAL_MEMORY_WINDOW as u32,
        );

        let push = upload_push(dev, "queue state", p.dwords())?;
        trace!(
            channel = self.channel,
            dwords = p.len(),
            slm = slm_bo.is_some(),
            "queue state rebuilt"
        );
        qs.images = Some(images);
        qs.samplers = Some(samplers);
        qs.slm = slm_bo.map(|bo| (bo, bytes_per_warp, bytes_per_mp));
        qs.push = Some(push);
        Ok(())
    }

    fn add_queue_state(qs: &QueueState, exec: &mut ExecBuilder) -> Result<()> {
        if let Some((bo, _)) = &qs.images {
            exec.add_bo(bo, BoAccess::RD);
        }
        if let Some((bo, _)) = &qs.samplers {
            exec.add_bo(bo, BoAccess::RD);
        }
        if let Some((bo, _, _)) = &qs.slm {
            exec.add_bo(bo, BoAccess::RDWR);
        }
        if let Some((bo, len)) = &qs.push {
            exec.add_bo(bo, BoAccess::RD);
            exec.add_push(PushRange::new(bo.address(), *len, false)?);
        }
        Ok(())
    }

    fn build_exec(&self, inner: &mut QueueInner, info: &SubmitInfo<'_>) -> Result<ExecBuilder> {
        for cmd in info.cmd_buffers {
            if let Some(err) = cmd.error() {
                return Err(err.clone());
            }
            self.device.slm().ensure(cmd.slm_bytes_per_thread())?;
        }
        self.update_state(&mut inner.state)?;

        let mut exec = ExecBuilder::new(self.channel);
        for sync in info.bo_signals {
            exec.add_bo(sync.bo(), BoAccess::RDWR);
        }
        if info.cmd_buffers.is_empty() {
            let (bo, len) = &self.empty_push;
            exec.add_bo(bo, BoAccess::RD);
            exec.add_push(PushRange::new(bo.address(), *len, false)?);
        }
        Self::add_queue_state(&inner.state, &mut exec)?;
        for bo in self.device.shader_heap().bos() {
            exec.add_bo(&bo, BoAccess::RDWR);
        }
        for cmd in info.cmd_buffers {
            exec.add_cmd_buffer(cmd);
        }
        exec.req.waits.extend_from_slice(info.waits);
        exec.req.signals.extend_from_slice(info.signals);
        Ok(exec)
    }

    /// Hand `req` to the kernel, with a host wait when submits are
    /// synchronous.
    fn exec(&self, inner: &mut QueueInner, exec: ExecBuilder) -> Result<()> {
        let ExecBuilder { mut req, bos, .. } = exec;
        let kernel = self.device.bufmgr().kernel().clone();
        let stats = self.device.bufmgr().stats().clone();
        let host_sync = if self.device.config().sync_submit {
            let handle = kernel
                .syncobj_create(false)
                .map_err(|e| Error::from_ioctl("syncobj_create", e))?;
            req.signals.push(SyncRecord::syncobj(handle));
            Some(handle)
        } else {
            None
        };

        trace!(
            channel = req.channel,
            pushes = req.pushes.len(),
            bos = req.bos.len(),
            waits = req.waits.len(),
            signals = req.signals.len(),
            "exec"
        );
        let result = kernel.exec(&req).map_err(|err| {
            stats.inc_failed_submits();
            if err == KernelError::NoDevice {
                inner.lost = true;
                warn!(channel = req.channel, "device lost during submit");
            }
            Error::from_ioctl("exec", err)
        });
        let result = result.and_then(|()| {
            stats.inc_submits();
            for bo in &bos {
                bo.mark_busy();
            }
            match host_sync {
                Some(handle) => kernel
                    .syncobj_wait(&[handle], -1, true)
                    .map_err(|e| Error::from_ioctl("syncobj_wait", e)),
                None => Ok(()),
            }
        });
        if let Some(handle) = host_sync {
            if let Err(err) = kernel.syncobj_destroy(handle) {
                debug!(handle, %err, "failed to destroy submit syncobj");
            }
        }
        result
    }

    pub fn submit(&self, info: &SubmitInfo<'_>) -> Result<()> {
        BoSync::wait_many(info.bo_waits, Default::default(), None)?;

        let mut inner = lock(&self.inner);
        if inner.lost {
            return Err(Error::DeviceLost);
        }
        let exec = self.build_exec(&mut inner, info)?;
        self.exec(&mut inner, exec)?;
        for sync in info.bo_signals {
            sync.mark_submitted();
        }
        Ok(())
    }

    /// Submit tiler work and its fragment follow-up back to back; the
    /// fragment submit waits on a syncobj the tiler submit signals.
    pub fn submit_tiler_pair(&self, tiler: &SubmitInfo<'_>, fragment: &SubmitInfo<'_>) -> Result<()> {
        BoSync::wait_many(tiler.bo_waits, Default::default(), None)?;
        BoSync::wait_many(fragment.bo_waits, Default::default(), None)?;

        let kernel = self.device.bufmgr().kernel().clone();
        let mut inner = lock(&self.inner);
        if inner.lost {
            return Err(Error::DeviceLost);
        }
        let link = kernel
            .syncobj_create(false)
            .map_err(|e| Error::from_ioctl("syncobj_create", e))?;

        let result = (|| -> Result<()> {
            let mut first = self.build_exec(&mut inner, tiler)?;
            first.req.signals.push(SyncRecord::syncobj(link));
            let mut second = self.build_exec(&mut inner, fragment)?;
            second.req.waits.push(SyncRecord::syncobj(link));

            let _pair = self
                .device
                .config()
                .serialize_tiler_pairs
                .then(|| lock(&TILER_PAIR_LOCK));
            self.exec(&mut inner, first)?;
            for sync in tiler.bo_signals {
                sync.mark_submitted();
            }
            self.exec(&mut inner, second)?;
            for sync in fragment.bo_signals {
                sync.mark_submitted();
            }
            Ok(())
        })();

        if let Err(err) = kernel.syncobj_destroy(link) {
            debug!(link, %err, "failed to destroy tiler link syncobj");
        }
        result
    }

    /// Apply sparse binds through the VM-bind ioctl.
    pub fn bind(
        &self,
        buffers: &[BufferBindInfo],
        images: &[ImageOpaqueBindInfo],
        waits: &[SyncRecord],
        signals: &[SyncRecord],
    ) -> Result<()> {
        let mut req = VmBindRequest {
            waits: waits.to_vec(),
            signals: signals.to_vec(),
            flags: BindFlags::RUN_ASYNC,
            ..VmBindRequest::default()
        };
        for info in buffers {
            sparse::buffer_bind_ops(info, &mut req.ops);
        }
        for info in images {
            sparse::image_opaque_bind_ops(info, &mut req.ops);
        }

        let inner = lock(&self.inner);
        if inner.lost {
            return Err(Error::DeviceLost);
        }
        let mgr = self.device.bufmgr();
        trace!(ops = req.ops.len(), "vm bind");
        mgr.kernel()
            .vm_bind(&req)
            .map_err(|e| Error::from_ioctl("vm_bind", e))?;
        mgr.stats().inc_binds();
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.device.bufmgr().destroy_hw_context(self.channel);
    }
}

/// Copy `dwords` into a fresh mapped BO.
fn upload_push(device: &Device, name: &'static str, dwords: &[u32]) -> Result<(Bo, u64)> {
    let bytes: &[u8] = bytemuck::cast_slice(dwords);
    let bo = device.bufmgr().alloc(
        name,
        bytes.len() as u64,
        0,
        MemZone::Other,
        BoFlags::GART | BoFlags::MAP,
    )?;
    bo.write(0, bytes)?;
    Ok((bo, bytes.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::kernel::mock::{MockKernel, MockOp};
    use gpu_protocol::push::{decode, MethodWrite};
    use pretty_assertions::assert_eq;

    fn queue(config: DeviceConfig) -> (Arc<MockKernel>, Queue) {
        let kernel = Arc::new(MockKernel::new());
        let dev = Device::new(kernel.clone(), config).unwrap();
        let q = dev.create_queue().unwrap();
        (kernel, q)
    }

    fn state_push(kernel: &MockKernel, q: &Queue, exec: &ExecRequest) -> Vec<MethodWrite> {
        let inner = lock(&q.inner);
        let (bo, len) = inner.state.push.as_ref().unwrap();
        assert!(exec.pushes.iter().any(|p| p.va == bo.address()));
        let bytes = kernel.read_bo(bo.handle(), 0, *len as usize).unwrap();
        decode(bytemuck::cast_slice(&bytes)).unwrap()
    }

    #[test]
    fn empty_submit_carries_a_nop() {
        let (kernel, q) = queue(DeviceConfig::default());
        q.submit(&SubmitInfo::default()).unwrap();
        let execs = kernel.exec_log();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].channel, q.channel());
        assert_eq!(execs[0].pushes[0].va, q.empty_push.0.address());
        assert_eq!(execs[0].pushes.len(), 2);
    }

    #[test]
    fn residency_merges_access() {
        let (kernel, q) = queue(DeviceConfig::default());
        let dev = q.device().clone();
        let mut cmd = dev.create_cmd_buffer();
        cmd.begin().unwrap();
        let shared = dev
            .bufmgr()
            .alloc("shared", 4096, 0, MemZone::Other, BoFlags::LOCAL)
            .unwrap();
        cmd.ref_bo(&shared, BoAccess::RD);
        let mut other = dev.create_cmd_buffer();
        other.begin().unwrap();
        other.ref_bo(&shared, BoAccess::WR);
        cmd.end().unwrap();
        other.end().unwrap();

        q.submit(&SubmitInfo {
            cmd_buffers: &[&cmd, &other],
            ..SubmitInfo::default()
        })
        .unwrap();
        let exec = &kernel.exec_log()[0];
        let entries: Vec<_> = exec
            .bos
            .iter()
            .filter(|b| b.handle == shared.handle())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].access, BoAccess::RDWR);
        // State push, then one range per command buffer.
        assert_eq!(exec.pushes.len(), 3);
        assert!(exec.pushes.iter().all(|p| p.len % 4 == 0 && p.va % 4 == 0));
    }

    #[test]
    fn queue_state_is_rebuilt_only_on_change() {
        let (kernel, q) = queue(DeviceConfig::default());
        q.submit(&SubmitInfo::default()).unwrap();
        let first = lock(&q.inner).state.push.as_ref().unwrap().0.handle();
        let writes = state_push(&kernel, &q, &kernel.exec_log()[0]);
        let (images_hi, images_lo) = split_addr(q.device().images().address());
        assert!(images_hi <= 0xffff);
        assert_eq!(
            &writes[0..3],
            &[
                MethodWrite::new(SUBC_COMPUTE, cla0c0::SET_TEX_HEADER_POOL_A, images_hi),
                MethodWrite::new(SUBC_COMPUTE, cla0c0::SET_TEX_HEADER_POOL_B, images_lo),
                MethodWrite::new(SUBC_COMPUTE, cla0c0::SET_TEX_HEADER_POOL_C, 1023),
            ]
        );
        assert_eq!(
            writes.last(),
            Some(&MethodWrite::new(
                SUBC_3D,
                cl9097::SET_SHADER_LOCAL_MEMORY_WINDOW,
                0xff00_0000
            ))
        );

        q.submit(&SubmitInfo::default()).unwrap();
        assert_eq!(lock(&q.inner).state.push.as_ref().unwrap().0.handle(), first);

        q.device().slm().ensure(16).unwrap();
        q.submit(&SubmitInfo::default()).unwrap();
        let writes = state_push(&kernel, &q, &kernel.exec_log()[2]);
        assert!(writes
            .iter()
            .any(|w| w.subc == SUBC_3D && w.mthd == cl9097::SET_SHADER_LOCAL_MEMORY_E
                && w.data == 0x200));
        let exec = &kernel.exec_log()[2];
        let slm = q.device().slm().get_bo_ref().0.unwrap();
        assert!(exec
            .bos
            .iter()
            .any(|b| b.handle == slm.handle() && b.access == BoAccess::RDWR));
    }

    #[test]
    fn bo_signals_advance_only_after_exec() {
        let (kernel, q) = queue(DeviceConfig::default());
        let sync = BoSync::new(q.device().bufmgr(), false).unwrap();
        kernel.fail_next(MockOp::Exec, KernelError::Invalid);
        let info = SubmitInfo {
            bo_signals: &[&sync],
            ..SubmitInfo::default()
        };
        assert!(q.submit(&info).is_err());
        assert_eq!(sync.state(), crate::bo::BoSyncState::Reset);

        q.submit(&info).unwrap();
        assert_eq!(sync.state(), crate::bo::BoSyncState::Submitted);
        let stats = q.device().bufmgr().stats().snapshot();
        assert_eq!((stats.submits, stats.failed_submits), (1, 1));
    }

    #[test]
    fn exec_marks_resident_bos_busy() {
        let (kernel, q) = queue(DeviceConfig::default());
        let dev = q.device().clone();
        let target = dev
            .bufmgr()
            .alloc("target", 4096, 0, MemZone::Other, BoFlags::LOCAL)
            .unwrap();
        let mut cmd = dev.create_cmd_buffer();
        cmd.begin().unwrap();
        cmd.ref_bo(&target, BoAccess::WR);
        cmd.end().unwrap();
        let info = SubmitInfo {
            cmd_buffers: &[&cmd],
            ..SubmitInfo::default()
        };

        kernel.fail_next(MockOp::Exec, KernelError::Invalid);
        assert!(q.submit(&info).is_err());
        assert!(target.is_idle());

        q.submit(&info).unwrap();
        assert!(!target.is_idle());
        for bo in dev.shader_heap().bos() {
            assert!(!bo.is_idle());
        }

        // Only the kernel can make it idle again.
        assert!(!target.busy());
        assert!(target.is_idle());
    }

    #[test]
    fn device_loss_is_sticky() {
        let (kernel, q) = queue(DeviceConfig::default());
        kernel.fail_next(MockOp::Exec, KernelError::NoDevice);
        assert_eq!(q.submit(&SubmitInfo::default()), Err(Error::DeviceLost));
        assert!(q.is_lost());
        assert_eq!(q.submit(&SubmitInfo::default()), Err(Error::DeviceLost));
        assert_eq!(kernel.exec_log().len(), 0);
    }

    #[test]
    fn sync_submit_waits_on_a_driver_syncobj() {
        let (kernel, q) = queue(DeviceConfig::default().with_sync_submit(true));
        q.submit(&SubmitInfo::default()).unwrap();
        let exec = &kernel.exec_log()[0];
        assert_eq!(exec.signals.len(), 1);
        // Destroyed once the host wait returned.
        assert!(!kernel.syncobj_signaled(exec.signals[0].handle));
    }

    #[test]
    fn tiler_pair_links_through_a_syncobj() {
        let (kernel, q) = queue(DeviceConfig::default().with_serialize_tiler_pairs(true));
        q.submit_tiler_pair(&SubmitInfo::default(), &SubmitInfo::default())
            .unwrap();
        let execs = kernel.exec_log();
        assert_eq!(execs.len(), 2);
        assert_eq!(execs[0].signals.len(), 1);
        assert_eq!(execs[1].waits, execs[0].signals);
    }
}
