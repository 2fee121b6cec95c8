//! Command buffer recording.
//!
//! Method streams are built in a [`PushBuilder`] and copied into mapped
//! push-chunk BOs when a range is closed. Transient data (root tables, QMDs,
//! inline uploads) lives in a separate upload arena. Every BO either of them
//! touches is referenced so the submit carries it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use gpu_protocol::class::{cl90b5, ClassSet};
use gpu_protocol::push::SUBC_COPY;
use gpu_protocol::uapi::{BoAccess, PushRange};
use gpu_protocol::align_up;
use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::bo::{Bo, BoFlags, BufMgr};
use crate::caps::GenOps;
use crate::compute::calc_tls_size;
use crate::config::DeviceConfig;
use crate::kernel::CpuMapping;
use crate::push::PushBuilder;
use crate::vma::MemZone;
use crate::{Error, Result};

const UPLOAD_MIN_SIZE: u64 = 16 * 1024;
/// Uploads that span this many bytes start on a line boundary.
const UPLOAD_LINE_SIZE: u64 = 256;

pub const MAX_SETS: usize = 32;
pub const MAX_PUSH_SIZE: usize = 128;
pub const MAX_DYNAMIC_BUFFERS: usize = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BufferAddress {
    pub base_addr: u64,
    pub size: u32,
    pub zero: u32,
}

/// Dispatch dimensions as seen by compute shaders.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ComputeRoot {
    pub block_size: [u32; 3],
    pub grid_size: [u32; 3],
    pub base_group: [u32; 3],
    pub _pad: [u32; 3],
}

/// Table bound as constant buffers 0 and 1 of every dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RootTable {
    pub cs: ComputeRoot,
    pub push: [u8; MAX_PUSH_SIZE],
    pub sets: [u64; MAX_SETS],
    pub dynamic_buffers: [BufferAddress; MAX_DYNAMIC_BUFFERS],
}

impl Default for RootTable {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindPoint {
    Graphics,
    Compute,
}

#[derive(Clone, Debug, Default)]
pub struct DescriptorState {
    pub root: RootTable,
    pub sets_dirty: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct DirtyState: u32 {
        const VIEWPORT = 1 << 0;
        const SCISSOR = 1 << 1;
        const PIPELINE = 1 << 2;
    }
}

/// Graphics state that meta operations save and restore.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetaState {
    pub viewport: Viewport,
    pub scissor: Rect2D,
    pub pipeline_id: Option<u64>,
}

#[derive(Debug)]
pub struct BoRef {
    pub bo: Bo,
    pub access: BoAccess,
}

#[derive(Debug)]
struct PushChunk {
    bo: Bo,
    map: Arc<dyn CpuMapping>,
    /// Bytes already closed into push ranges.
    used: u64,
}

#[derive(Debug)]
struct UploadBuf {
    bo: Bo,
    map: Arc<dyn CpuMapping>,
    offset: u64,
}

/// A CPU-writable slice of the upload arena.
#[derive(Debug, Clone)]
pub struct UploadSlice {
    pub va: u64,
    map: Arc<dyn CpuMapping>,
    offset: u64,
    len: u64,
}

impl UploadSlice {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write(&self, at: u64, data: &[u8]) -> Result<()> {
        if at + data.len() as u64 > self.len {
            return Err(Error::invalid("upload write past the end of its slice"));
        }
        self.map
            .write(self.offset + at, data)
            .map_err(|e| Error::from_ioctl("upload_write", e))
    }
}

pub struct CmdBuffer {
    pub(crate) mgr: Arc<BufMgr>,
    pub(crate) classes: ClassSet,
    pub(crate) gen: GenOps,
    mp_count: u32,
    chunk_size: u64,

    push: PushBuilder,
    chunk: Option<PushChunk>,
    retired_chunks: Vec<Bo>,
    pushes: Vec<PushRange>,

    bo_refs: Vec<BoRef>,
    bo_ref_index: HashMap<u32, usize>,

    upload: Option<UploadBuf>,
    upload_size: u64,
    retired_uploads: Vec<Bo>,

    private_objects: Vec<Box<dyn Any + Send>>,

    pub(crate) gfx: DescriptorState,
    pub(crate) cs: DescriptorState,
    pub(crate) compute_pipeline: Option<Arc<crate::compute::ComputePipeline>>,
    pub(crate) gfx_pipeline: Option<Arc<crate::pipeline::GraphicsPipeline>>,
    pub(crate) meta: MetaState,
    /// Saved state and the dirty bits at the time it was saved.
    meta_stack: Vec<(MetaState, DirtyState)>,
    pub(crate) dirty: DirtyState,

    tls_space_needed: u64,
    slm_bytes_per_thread: u32,
    error: Option<Error>,
}

impl fmt::Debug for CmdBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdBuffer")
            .field("pushes", &self.pushes.len())
            .field("bo_refs", &self.bo_refs.len())
            .field("error", &self.error)
            .finish()
    }
}

impl CmdBuffer {
    pub fn new(mgr: Arc<BufMgr>, config: &DeviceConfig) -> Self {
        Self {
            mgr,
            classes: config.classes,
            gen: GenOps::for_classes(&config.classes),
            mp_count: config.mp_count,
            chunk_size: config.push_chunk_size.max(64),
            push: PushBuilder::with_limit(0),
            chunk: None,
            retired_chunks: Vec::new(),
            pushes: Vec::new(),
            bo_refs: Vec::new(),
            bo_ref_index: HashMap::new(),
            upload: None,
            upload_size: 0,
            retired_uploads: Vec::new(),
            private_objects: Vec::new(),
            gfx: DescriptorState::default(),
            cs: DescriptorState::default(),
            compute_pipeline: None,
            gfx_pipeline: None,
            meta: MetaState::default(),
            meta_stack: Vec::new(),
            dirty: DirtyState::empty(),
            tls_space_needed: 0,
            slm_bytes_per_thread: 0,
            error: None,
        }
    }

    pub fn bufmgr(&self) -> &Arc<BufMgr> {
        &self.mgr
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    pub fn gen(&self) -> &GenOps {
        &self.gen
    }

    /// Drop everything recorded. The first push chunk is kept for reuse.
    pub fn reset(&mut self) {
        self.private_objects.clear();
        self.pushes.clear();
        self.bo_refs.clear();
        self.bo_ref_index.clear();
        self.retired_chunks.clear();
        self.retired_uploads.clear();
        self.upload = None;
        self.upload_size = 0;
        self.push = PushBuilder::with_limit(0);
        if let Some(chunk) = &mut self.chunk {
            chunk.used = 0;
        }
        self.gfx = DescriptorState::default();
        self.cs = DescriptorState::default();
        self.compute_pipeline = None;
        self.gfx_pipeline = None;
        self.meta = MetaState::default();
        self.meta_stack.clear();
        self.dirty = DirtyState::empty();
        self.tls_space_needed = 0;
        self.slm_bytes_per_thread = 0;
        self.error = None;

        if let Some(chunk) = &self.chunk {
            let bo = chunk.bo.clone();
            self.ref_bo(&bo, BoAccess::RD);
            self.push.set_limit((self.chunk_size / 4) as usize);
        }
    }

    /// Start recording. The stream opens with a copy-engine NOP so every
    /// recorded buffer has something to submit.
    pub fn begin(&mut self) -> Result<()> {
        self.reset();
        self.push(2)?
            .mthd(SUBC_COPY, cl90b5::NOP)
            .inline_data(0);
        self.begin_compute();
        Ok(())
    }

    fn begin_compute(&mut self) {
        if !self.gen.has_compute_tls {
            return;
        }
        self.tls_space_needed = calc_tls_size(self.mp_count, 128 * 16, 0, 0x200);
    }

    /// Close the open push range and report the first recording error.
    pub fn end(&mut self) -> Result<()> {
        self.flush_push()?;
        match self.error.take() {
            Some(err) => {
                self.error = Some(err.clone());
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Remember a failure; recording continues and [`end`](Self::end)
    /// reports it.
    pub fn set_error(&mut self, err: Error) {
        debug!(%err, "command buffer recording error");
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Builder with room for at least `dwords` more dwords.
    pub fn push(&mut self, dwords: usize) -> Result<&mut PushBuilder> {
        if !self.push.fits(dwords) {
            self.flush_push()?;
            let chunk_room = self
                .chunk
                .as_ref()
                .map_or(0, |c| ((c.map.len() - c.used) / 4) as usize);
            if chunk_room < dwords {
                self.new_chunk(dwords)?;
            }
        }
        Ok(&mut self.push)
    }

    /// Append a pre-encoded stream.
    pub fn push_raw(&mut self, dwords: &[u32]) -> Result<()> {
        self.push(dwords.len())?.append_raw(dwords);
        Ok(())
    }

    fn new_chunk(&mut self, min_dwords: usize) -> Result<()> {
        let size = self.chunk_size.max(align_up(min_dwords as u64 * 4, 4));
        let bo = self
            .mgr
            .alloc("push", size, 0, MemZone::Other, BoFlags::GART | BoFlags::MAP)?;
        let map = bo.map()?;
        self.ref_bo(&bo, BoAccess::RD);
        let dwords = (map.len() / 4) as usize;
        if let Some(old) = self.chunk.replace(PushChunk { bo, map, used: 0 }) {
            self.retired_chunks.push(old.bo);
        }
        self.push.set_limit(dwords);
        trace!(size, "new push chunk");
        Ok(())
    }

    /// Copy the open stream into the current chunk and close it into a
    /// push range.
    pub fn flush_push(&mut self) -> Result<()> {
        if self.push.is_empty() {
            return Ok(());
        }
        self.push.check_fits()?;
        let dwords = self.push.take();
        let Some(chunk) = self.chunk.as_mut() else {
            return Err(Error::invalid("push recorded without a chunk"));
        };
        let bytes: &[u8] = bytemuck::cast_slice(&dwords);
        chunk
            .map
            .write(chunk.used, bytes)
            .map_err(|e| Error::from_ioctl("push_write", e))?;
        let range = PushRange::new(chunk.bo.address() + chunk.used, bytes.len() as u64, false)?;
        chunk.used += bytes.len() as u64;
        let left = ((chunk.map.len() - chunk.used) / 4) as usize;
        self.pushes.push(range);
        self.push.set_limit(left);
        Ok(())
    }

    /// Record a push range that lives outside the command buffer's chunks.
    /// The caller references the BO holding it.
    pub fn add_push(&mut self, va: u64, len: u64, no_prefetch: bool) -> Result<()> {
        self.flush_push()?;
        if len == 0 {
            return Ok(());
        }
        self.pushes.push(PushRange::new(va, len, no_prefetch)?);
        Ok(())
    }

    pub fn pushes(&self) -> &[PushRange] {
        &self.pushes
    }

    /// Reference `bo` for the submit. Repeated references merge their
    /// access masks.
    pub fn ref_bo(&mut self, bo: &Bo, access: BoAccess) {
        match self.bo_ref_index.get(&bo.handle()) {
            Some(&i) => self.bo_refs[i].access |= access,
            None => {
                self.bo_ref_index.insert(bo.handle(), self.bo_refs.len());
                self.bo_refs.push(BoRef {
                    bo: bo.clone(),
                    access,
                });
            }
        }
    }

    pub fn bo_refs(&self) -> &[BoRef] {
        &self.bo_refs
    }

    fn resize_upload(&mut self, min_needed: u64) -> Result<()> {
        let new_size = min_needed.max(UPLOAD_MIN_SIZE).max(2 * self.upload_size);
        let bo = self.mgr.alloc(
            "upload",
            new_size,
            0,
            MemZone::Other,
            BoFlags::GART | BoFlags::MAP,
        )?;
        let map = bo.map()?;
        self.ref_bo(&bo, BoAccess::RD);
        if let Some(old) = self.upload.replace(UploadBuf { bo, map, offset: 0 }) {
            self.retired_uploads.push(old.bo);
        }
        self.upload_size = new_size;
        Ok(())
    }

    /// Bump-allocate `size` bytes of GPU-visible scratch.
    pub fn upload_alloc(&mut self, size: u64, alignment: u64) -> Result<UploadSlice> {
        let alignment = alignment.max(4);
        if !alignment.is_power_of_two() {
            return Err(Error::invalid(format!("upload alignment {alignment}")));
        }

        let mut offset = match &self.upload {
            Some(up) => align_up(up.offset, alignment),
            None => 0,
        };
        // Avoid straddling more lines than the size requires.
        let gap = align_up(offset, UPLOAD_LINE_SIZE) - offset;
        if (size & !(UPLOAD_LINE_SIZE - 1)) > gap {
            offset = align_up(offset, UPLOAD_LINE_SIZE);
        }

        if self.upload.is_none() || offset + size > self.upload_size {
            self.resize_upload(size)?;
            offset = 0;
        }

        let Some(up) = self.upload.as_mut() else {
            return Err(Error::OutOfDeviceMemory);
        };
        up.offset = offset + size;
        Ok(UploadSlice {
            va: up.bo.address() + offset,
            map: up.map.clone(),
            offset,
            len: size,
        })
    }

    /// Copy `data` into the upload arena, returning its GPU address.
    pub fn upload_data(&mut self, data: &[u8], alignment: u64) -> Result<u64> {
        let slice = self.upload_alloc(data.len() as u64, alignment)?;
        slice.write(0, data)?;
        Ok(slice.va)
    }

    /// Keep `obj` alive until the next reset.
    pub fn add_private(&mut self, obj: impl Any + Send) {
        self.private_objects.push(Box::new(obj));
    }

    pub fn private_object_count(&self) -> usize {
        self.private_objects.len()
    }

    pub fn descriptors(&mut self, bind_point: BindPoint) -> &mut DescriptorState {
        match bind_point {
            BindPoint::Graphics => &mut self.gfx,
            BindPoint::Compute => &mut self.cs,
        }
    }

    /// Bind descriptor set addresses starting at `first_set`.
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: BindPoint,
        first_set: usize,
        set_addrs: &[u64],
    ) -> Result<()> {
        if first_set + set_addrs.len() > MAX_SETS {
            return Err(Error::invalid(format!(
                "descriptor sets {first_set}..{} exceed {MAX_SETS}",
                first_set + set_addrs.len()
            )));
        }
        let desc = self.descriptors(bind_point);
        for (i, &addr) in set_addrs.iter().enumerate() {
            let idx = first_set + i;
            if desc.root.sets[idx] != addr {
                desc.root.sets[idx] = addr;
                desc.sets_dirty |= 1 << idx;
            }
        }
        Ok(())
    }

    pub fn push_constants(&mut self, bind_point: BindPoint, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > MAX_PUSH_SIZE {
            return Err(Error::invalid("push constants out of range"));
        }
        self.descriptors(bind_point).root.push[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.meta.viewport = viewport;
        self.dirty |= DirtyState::VIEWPORT;
    }

    pub fn set_scissor(&mut self, scissor: Rect2D) {
        self.meta.scissor = scissor;
        self.dirty |= DirtyState::SCISSOR;
    }

    pub fn dirty(&self) -> DirtyState {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = DirtyState::empty();
    }

    /// Save graphics state before a meta operation.
    pub fn meta_begin(&mut self) {
        self.meta_stack.push((self.meta.clone(), self.dirty));
    }

    /// Restore saved state. Viewport and scissor are re-emitted only if the
    /// meta operation succeeded.
    pub fn meta_end(&mut self, success: bool) {
        if let Some((saved, dirty)) = self.meta_stack.pop() {
            self.meta = saved;
            if !success {
                self.dirty = dirty;
            }
        }
        if success {
            self.dirty |= DirtyState::VIEWPORT | DirtyState::SCISSOR;
        }
    }

    pub fn meta_depth(&self) -> usize {
        self.meta_stack.len()
    }

    pub fn tls_space_needed(&self) -> u64 {
        self.tls_space_needed
    }

    pub(crate) fn require_slm(&mut self, bytes_per_thread: u32) {
        self.slm_bytes_per_thread = self.slm_bytes_per_thread.max(bytes_per_thread);
    }

    /// Largest per-thread scratch size any bound shader asked for.
    pub fn slm_bytes_per_thread(&self) -> u32 {
        self.slm_bytes_per_thread
    }
}
