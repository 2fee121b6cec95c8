//! Compute-based primitive culling ahead of indexed draws.
//!
//! For each eligible draw an async compute dispatch runs a position-only
//! vertex shader over every triangle, drops the ones that cannot produce
//! samples and appends the survivors to a ring of index buffers. The
//! graphics stream draws from that ring. It stalls on a `REWIND` packet
//! until the compute stream's `CS_DONE` release writes
//! [`REWIND_SIGNAL_VALUE`] over the packet's payload, and the draw's index
//! count is patched in place by the kernel's atomic counter.
//!
//! One `REWIND`/`CS_DONE` pair covers a batch of up to
//! [`PrimCullConfig::prims_per_batch`] primitives. An IB carries at most
//! [`PrimCullConfig::prims_per_ib`] primitives. The ring holds one IB's
//! worth of output per half; flushing the IB switches halves.

use std::sync::Arc;

use gpu_protocol::pm4::{
    self, pkt3, PKT3_DISPATCH_DIRECT, PKT3_DRAW_INDEX_2, PKT3_RELEASE_MEM, PKT3_REWIND,
    PKT3_SET_SH_REG, R_00B810_COMPUTE_START_X, R_00B81C_COMPUTE_NUM_THREAD_X,
    R_00B900_COMPUTE_USER_DATA_0, REWIND_SIGNAL_VALUE, V_028A90_CS_DONE,
};
use gpu_protocol::uapi::{BoAccess, BoResidency, ExecRequest, PushRange};
use gpu_protocol::{align_up, split_addr};
use tracing::{debug, trace};

use crate::bo::{Bo, BoFlags, BufMgr};
use crate::config::PrimCullConfig;
use crate::pipeline::{GraphicsPipeline, ProvokingVertex};
use crate::vma::{MemZone, DYNAMIC_START};
use crate::{Error, Result};

pub mod kernel;
pub mod udiv;

pub use kernel::{CullKey, KernelArgs, PrimCullKernel, VertexSource, THREADGROUP_SIZE};
pub use udiv::FastUdivInfo;

/// Number of user SGPRs the kernel reads.
pub const NUM_USER_SGPRS: usize = 10;
/// Dwords of the per-dispatch index/constant descriptor block.
pub const DESC_DWORDS: usize = 12;
/// Bytes of output per surviving triangle.
pub const OUTPUT_PRIM_SIZE: u64 = 12;
pub const MAX_INSTANCES: u32 = 1 << 16;

/// High dword shared by every 32-bit pointer the kernel receives; all
/// prim-cull memory lives in the dynamic zone.
pub const ADDRESS32_HI: u32 = (DYNAMIC_START >> 32) as u32;

const IB_DWORDS: usize = 64 * 1024;
const DATA_DWORDS: usize = 16 * 1024;
/// Worst case of one sub-draw in either stream, batch release included.
const SUBDRAW_MAX_DWORDS: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimType {
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    TriangleFan,
    PatchList,
}

impl Topology {
    pub fn prim_type(self) -> Option<PrimType> {
        match self {
            Topology::TriangleList => Some(PrimType::TriangleList),
            Topology::TriangleStrip => Some(PrimType::TriangleStrip),
            _ => None,
        }
    }
}

impl PrimType {
    /// Whole primitives in `count` vertices.
    pub fn prims_for_vertices(self, count: u32) -> u32 {
        match self {
            PrimType::TriangleList => count / 3,
            PrimType::TriangleStrip => count.saturating_sub(2),
        }
    }

    /// Vertices per sub-draw so that a sub-draw holds `prims` primitives.
    fn vertices_per_subdraw(self, prims: u32) -> u32 {
        match self {
            PrimType::TriangleList => prims * 3,
            PrimType::TriangleStrip => prims,
        }
    }
}

/// One draw of a (multi-)draw call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawRange {
    /// First index (indexed) or first vertex.
    pub start: u32,
    pub count: u32,
    pub index_bias: i32,
}

/// Draw-call state that does not vary between the draws of a multi-draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawInfo {
    pub topology: Topology,
    /// Bytes per index, 0 for non-indexed draws.
    pub index_size: u32,
    pub index_va: u64,
    pub instance_count: u32,
    pub start_instance: u32,
    pub primitive_restart: bool,
}

impl Default for DrawInfo {
    fn default() -> Self {
        Self {
            topology: Topology::TriangleList,
            index_size: 4,
            index_va: 0,
            instance_count: 1,
            start_instance: 0,
            primitive_restart: false,
        }
    }
}

/// What the bound shaders allow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderState {
    pub has_tess: bool,
    pub has_geometry: bool,
    pub vs_writes_memory: bool,
    pub vs_uses_bindless: bool,
    pub trivial_divisors: bool,
    pub has_divisor_buffer: bool,
    pub provoking_vertex: ProvokingVertex,
}

impl ShaderState {
    pub fn from_pipeline(pipeline: &GraphicsPipeline) -> Self {
        Self {
            has_tess: pipeline.has_tess(),
            has_geometry: pipeline.has_geometry(),
            vs_writes_memory: pipeline.writes_memory(),
            vs_uses_bindless: false,
            trivial_divisors: pipeline.vertex_input().trivial_divisors(),
            has_divisor_buffer: false,
            provoking_vertex: pipeline.provoking_vertex(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisableReason {
    Disabled,
    Generation,
    Topology,
    PrimitiveRestart,
    Tessellation,
    Geometry,
    SideEffects,
    Bindless,
    TooManyInstances,
    Divisors,
    OutputTooLarge,
}

/// Result of [`PrimCullContext::prepare`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrimCullOutcome {
    /// Draw through the plain graphics path.
    Disabled(DisableReason),
    /// Dispatch each draw with [`PrimCullContext::dispatch`].
    Enabled,
    /// Re-issue the single draw as these sub-draws.
    DrawSplit(Vec<DrawRange>),
    /// Re-issue the multi-draw as these groups.
    MultiDrawSplit(Vec<Vec<DrawRange>>),
}

/// 32-bit descriptor-table pointers of the bound vertex shader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VsDescriptors {
    pub vertex_buffers: u32,
    pub const_and_shader_buffers: u32,
    pub samplers_and_images: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportXform {
    pub scale: [f32; 2],
    pub translate: [f32; 2],
}

/// Where one sub-draw's dispatch put things.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubDispatch {
    pub start_prim: u32,
    pub num_prims: u32,
    pub output_va: u64,
    /// Address of the draw packet's index count, patched by the kernel.
    pub count_va: u64,
    pub desc_va: u64,
}

/// A finished IB pair plus everything it references.
#[derive(Debug)]
pub struct PrimCullIbs {
    pub gfx: Bo,
    pub gfx_dwords: usize,
    pub compute: Bo,
    pub compute_dwords: usize,
    pub data: Bo,
    pub ring: Bo,
}

impl PrimCullIbs {
    /// Compute first so the release can overtake the waiting graphics IB.
    pub fn exec_requests(&self, gfx_channel: u32, compute_channel: u32) -> Result<[ExecRequest; 2]> {
        let residency = |bo: &Bo, access| BoResidency {
            handle: bo.handle(),
            access,
            domain: bo.domain(),
        };
        let compute = ExecRequest {
            channel: compute_channel,
            pushes: vec![PushRange::new(
                self.compute.address(),
                self.compute_dwords as u64 * 4,
                false,
            )?],
            bos: vec![
                residency(&self.compute, BoAccess::RD),
                residency(&self.data, BoAccess::RD),
                residency(&self.ring, BoAccess::WR),
                // The kernel patches draw packets inside the graphics IB.
                residency(&self.gfx, BoAccess::RDWR),
            ],
            ..ExecRequest::default()
        };
        let gfx = ExecRequest {
            channel: gfx_channel,
            pushes: vec![PushRange::new(
                self.gfx.address(),
                self.gfx_dwords as u64 * 4,
                false,
            )?],
            bos: vec![
                residency(&self.gfx, BoAccess::RD),
                residency(&self.ring, BoAccess::RD),
            ],
            ..ExecRequest::default()
        };
        Ok([compute, gfx])
    }
}

/// A PM4 stream recorded on the host and copied into its BO at flush.
#[derive(Debug)]
struct Stream {
    bo: Bo,
    dwords: Vec<u32>,
    max_dwords: usize,
}

impl Stream {
    fn new(mgr: &Arc<BufMgr>, name: &'static str, max_dwords: usize) -> Result<Self> {
        let bo = mgr.alloc(
            name,
            max_dwords as u64 * 4,
            256,
            MemZone::Dynamic,
            BoFlags::GART | BoFlags::MAP,
        )?;
        Ok(Self {
            bo,
            dwords: Vec::with_capacity(max_dwords.min(4096)),
            max_dwords,
        })
    }

    fn cdw(&self) -> usize {
        self.dwords.len()
    }

    fn va_of(&self, dw: usize) -> u64 {
        self.bo.address() + dw as u64 * 4
    }

    fn remaining(&self) -> usize {
        self.max_dwords - self.dwords.len()
    }

    fn emit(&mut self, dw: u32) {
        self.dwords.push(dw);
    }

    fn emit_slice(&mut self, dws: &[u32]) {
        self.dwords.extend_from_slice(dws);
    }

    fn set_sh_reg_seq(&mut self, reg: u32, values: &[u32]) {
        self.emit(pkt3(PKT3_SET_SH_REG, values.len() as u32, false));
        self.emit(pm4::sh_reg_index(reg));
        self.emit_slice(values);
    }

    fn upload(&self) -> Result<()> {
        self.bo.write(0, bytemuck::cast_slice(&self.dwords))
    }
}

fn lo32(va: u64) -> u32 {
    split_addr(va).1
}

/// Prim-cull state of one graphics context.
#[derive(Debug)]
pub struct PrimCullContext {
    mgr: Arc<BufMgr>,
    config: PrimCullConfig,
    ring: Bo,
    /// Byte offset of the half the current IB writes.
    ring_base: u64,
    ring_offset: u64,
    gfx: Stream,
    compute: Stream,
    data: Stream,
    prims_in_batch: u32,
    prims_in_ib: u64,
    /// Payload address of the open batch's REWIND.
    rewind_va: Option<u64>,
    finished: Vec<PrimCullIbs>,
}

impl PrimCullContext {
    pub fn new(mgr: Arc<BufMgr>, config: &PrimCullConfig) -> Result<Self> {
        if config.prims_per_batch == 0 || config.prims_per_batch % THREADGROUP_SIZE != 0 {
            return Err(Error::invalid(format!(
                "prims per batch {} is not a multiple of {THREADGROUP_SIZE}",
                config.prims_per_batch
            )));
        }
        if config.prims_per_ib < config.prims_per_batch {
            return Err(Error::invalid(format!(
                "prims per IB {} is below the batch size {}",
                config.prims_per_ib, config.prims_per_batch
            )));
        }
        if !config.l2_cache_line_size.is_power_of_two() {
            return Err(Error::invalid("L2 cache line size"));
        }
        let ring = mgr.alloc(
            "prim-cull index ring",
            config.ring_size * 2,
            config.l2_cache_line_size as u64,
            MemZone::Dynamic,
            BoFlags::LOCAL,
        )?;
        Ok(Self {
            gfx: Stream::new(&mgr, "prim-cull gfx ib", IB_DWORDS)?,
            compute: Stream::new(&mgr, "prim-cull compute ib", IB_DWORDS)?,
            data: Stream::new(&mgr, "prim-cull descriptors", DATA_DWORDS)?,
            mgr,
            config: config.clone(),
            ring,
            ring_base: 0,
            ring_offset: 0,
            prims_in_batch: 0,
            prims_in_ib: 0,
            rewind_va: None,
            finished: Vec::new(),
        })
    }

    pub fn config(&self) -> &PrimCullConfig {
        &self.config
    }

    pub fn ring(&self) -> &Bo {
        &self.ring
    }

    pub fn ring_offset(&self) -> u64 {
        self.ring_offset
    }

    pub fn prims_in_batch(&self) -> u32 {
        self.prims_in_batch
    }

    /// Primitives dispatched into the open IB.
    pub fn prims_in_ib(&self) -> u64 {
        self.prims_in_ib
    }

    pub fn gfx_dwords(&self) -> &[u32] {
        &self.gfx.dwords
    }

    pub fn compute_dwords(&self) -> &[u32] {
        &self.compute.dwords
    }

    pub fn data_dwords(&self) -> &[u32] {
        &self.data.dwords
    }

    /// GPU address of the current data stream, for decoding descriptor
    /// pointers back into [`Self::data_dwords`].
    pub fn data_va(&self) -> u64 {
        self.data.bo.address()
    }

    pub fn gfx_va(&self) -> u64 {
        self.gfx.bo.address()
    }

    /// IBs closed by [`Self::flush`], oldest first.
    pub fn take_finished(&mut self) -> Vec<PrimCullIbs> {
        std::mem::take(&mut self.finished)
    }

    fn disabled(&self, reason: DisableReason) -> PrimCullOutcome {
        trace!(?reason, "prim cull disabled for draw");
        self.mgr.stats().inc_prim_cull_fallbacks();
        PrimCullOutcome::Disabled(reason)
    }

    /// Ring bytes one draw claims. Every draw claims at least a cache line,
    /// so a draw without a whole primitive still moves the ring.
    fn ring_bytes(&self, num_prims: u64) -> u64 {
        align_up(
            (num_prims * OUTPUT_PRIM_SIZE).max(1),
            self.config.l2_cache_line_size as u64,
        )
    }

    /// Decide how `draws` go through culling. May close the current IB
    /// when the ring half is full.
    pub fn prepare(
        &mut self,
        info: &DrawInfo,
        draws: &[DrawRange],
        shaders: &ShaderState,
    ) -> Result<PrimCullOutcome> {
        let cfg = &self.config;
        if !cfg.enabled {
            return Ok(self.disabled(DisableReason::Disabled));
        }
        if cfg.gfx_level < cfg.min_gfx_level {
            return Ok(self.disabled(DisableReason::Generation));
        }
        let Some(prim_type) = info.topology.prim_type() else {
            return Ok(self.disabled(DisableReason::Topology));
        };
        if info.primitive_restart {
            return Ok(self.disabled(DisableReason::PrimitiveRestart));
        }
        if shaders.has_tess {
            return Ok(self.disabled(DisableReason::Tessellation));
        }
        if shaders.has_geometry {
            return Ok(self.disabled(DisableReason::Geometry));
        }
        if shaders.vs_writes_memory {
            return Ok(self.disabled(DisableReason::SideEffects));
        }
        if shaders.vs_uses_bindless {
            return Ok(self.disabled(DisableReason::Bindless));
        }
        if info.instance_count > MAX_INSTANCES {
            return Ok(self.disabled(DisableReason::TooManyInstances));
        }
        if info.instance_count > 1 && !shaders.trivial_divisors && !shaders.has_divisor_buffer {
            return Ok(self.disabled(DisableReason::Divisors));
        }

        let instances = info.instance_count as u64;
        let prims_per_instance: u64 = draws
            .iter()
            .map(|d| prim_type.prims_for_vertices(d.count) as u64)
            .sum();
        let num_prims = prims_per_instance * instances;
        let out_size: u64 = draws
            .iter()
            .map(|d| self.ring_bytes(prim_type.prims_for_vertices(d.count) as u64 * instances))
            .sum();
        let ring_size = cfg.ring_size;
        let batch = cfg.prims_per_batch as u64;
        let prims_per_ib = cfg.prims_per_ib as u64;
        let ring_full = self.ring_offset + out_size > ring_size;
        let ib_full = self.prims_in_ib + num_prims > prims_per_ib;
        let full = ring_full || ib_full;

        if full && num_prims > batch && info.instance_count == 1 {
            let limit = prim_type.vertices_per_subdraw(cfg.prims_per_batch);
            if draws.len() > 1 {
                let groups = split_multi_draw(draws, limit);
                trace!(groups = groups.len(), "prim cull multi-draw split");
                return Ok(PrimCullOutcome::MultiDrawSplit(groups));
            }
            if let Some(draw) = draws.first() {
                let parts = split_draw(prim_type, draw, limit);
                trace!(parts = parts.len(), "prim cull draw split");
                return Ok(PrimCullOutcome::DrawSplit(parts));
            }
        }

        if out_size > ring_size || num_prims > prims_per_ib {
            return Ok(self.disabled(DisableReason::OutputTooLarge));
        }
        if full {
            debug!(
                ring_offset = self.ring_offset,
                prims_in_ib = self.prims_in_ib,
                "prim cull IB full, flushing"
            );
            self.flush()?;
        }
        Ok(PrimCullOutcome::Enabled)
    }

    /// Emit the culling dispatch and the patched draw for one draw that
    /// [`Self::prepare`] enabled. A draw without a whole primitive still
    /// goes out, as an empty draw behind an empty dispatch.
    pub fn dispatch(
        &mut self,
        info: &DrawInfo,
        draw: &DrawRange,
        prim_type: PrimType,
        vs: &VsDescriptors,
        viewport: &ViewportXform,
    ) -> Result<Vec<SubDispatch>> {
        let prims_per_instance = prim_type.prims_for_vertices(draw.count);
        if prims_per_instance >= 1 << 27 {
            return Err(Error::invalid(format!(
                "{prims_per_instance} primitives per instance"
            )));
        }
        let instance_count = info.instance_count.max(1);
        let num_prims = prims_per_instance * instance_count;
        let batch_limit = self.config.prims_per_batch;
        // Room for every sub-draw up front: a flush moves to the other ring half.
        self.reserve(num_prims.div_ceil(batch_limit).max(1) as usize)?;

        let out_size = self.ring_bytes(num_prims as u64);
        if self.ring_offset + out_size > self.config.ring_size
            || self.prims_in_ib + num_prims as u64 > self.config.prims_per_ib as u64
        {
            return Err(Error::invalid("prim cull IB overflow; prepare the draw first"));
        }
        let out_va = self.ring.address() + self.ring_base + self.ring_offset;
        self.ring_offset += out_size;
        self.prims_in_ib += num_prims as u64;

        let (multiplier, terms) = if instance_count > 1 && prims_per_instance > 0 {
            let udiv = FastUdivInfo::new(prims_per_instance, 31);
            debug_assert!(udiv.post_shift < 32);
            (
                udiv.multiplier,
                udiv::packed_terms(udiv.post_shift, prims_per_instance),
            )
        } else {
            (0, 0)
        };

        let (input_va, base_vertex) = if info.index_size != 0 {
            (
                info.index_va + draw.start as u64 * info.index_size as u64,
                draw.index_bias as u32,
            )
        } else {
            (0, draw.start)
        };

        let mut subs = Vec::new();
        let mut start_prim = 0;
        loop {
            let sub_prims = (num_prims - start_prim).min(batch_limit);
            if self.prims_in_batch + sub_prims > batch_limit {
                self.release_batch();
            }
            if self.rewind_va.is_none() {
                self.gfx.emit(pkt3(PKT3_REWIND, 0, false));
                self.rewind_va = Some(self.gfx.va_of(self.gfx.cdw()));
                self.gfx.emit(0);
                self.mgr.stats().inc_prim_cull_batches();
            }
            self.prims_in_batch += sub_prims;

            let sub_out_va = out_va + start_prim as u64 * OUTPUT_PRIM_SIZE;
            let (out_hi, out_lo) = split_addr(sub_out_va);
            let count_va = self.gfx.va_of(self.gfx.cdw() + 4);
            self.gfx.emit_slice(&[
                pkt3(PKT3_DRAW_INDEX_2, 4, false),
                sub_prims * 3,
                out_lo,
                out_hi,
                0,
                pm4::V_0287F0_DI_SRC_SEL_DMA,
            ]);

            let (in_hi, in_lo) = split_addr(input_va);
            let desc: [u32; DESC_DWORDS] = [
                in_lo,
                in_hi,
                draw.count,
                info.index_size,
                out_lo,
                out_hi,
                sub_prims * OUTPUT_PRIM_SIZE as u32,
                0,
                viewport.scale[0].to_bits(),
                viewport.scale[1].to_bits(),
                viewport.translate[0].to_bits(),
                viewport.translate[1].to_bits(),
            ];
            let desc_va = self.data.va_of(self.data.cdw());
            self.data.emit_slice(&desc);

            if start_prim == 0 {
                let sgprs: [u32; NUM_USER_SGPRS] = [
                    lo32(desc_va),
                    lo32(count_va),
                    vs.vertex_buffers,
                    vs.const_and_shader_buffers,
                    vs.samplers_and_images,
                    base_vertex,
                    info.start_instance,
                    multiplier,
                    terms,
                    self.config.small_prim_precision.to_bits(),
                ];
                self.compute
                    .set_sh_reg_seq(R_00B900_COMPUTE_USER_DATA_0, &sgprs);
            } else {
                // Later sub-draws only move their descriptor and counter.
                self.compute.set_sh_reg_seq(
                    R_00B900_COMPUTE_USER_DATA_0,
                    &[lo32(desc_va), lo32(count_va)],
                );
            }

            let start_block = start_prim / THREADGROUP_SIZE;
            let full_blocks = sub_prims / THREADGROUP_SIZE;
            let partial = sub_prims % THREADGROUP_SIZE;
            self.compute
                .set_sh_reg_seq(R_00B810_COMPUTE_START_X, &[start_block, 0, 0]);
            self.compute.set_sh_reg_seq(
                R_00B81C_COMPUTE_NUM_THREAD_X,
                &[pm4::s_00b81c_num_thread_full(THREADGROUP_SIZE)
                    | pm4::s_00b81c_num_thread_partial(partial)],
            );
            let mut initiator = pm4::COMPUTE_SHADER_EN | pm4::ORDER_MODE;
            if partial != 0 {
                initiator |= pm4::PARTIAL_TG_EN;
            }
            self.compute.emit_slice(&[
                pkt3(PKT3_DISPATCH_DIRECT, 3, false),
                start_block + full_blocks + (partial != 0) as u32,
                1,
                1,
                initiator,
            ]);
            self.mgr.stats().inc_prim_cull_dispatches();

            trace!(start_prim, sub_prims, batch = self.prims_in_batch, "prim cull dispatch");
            subs.push(SubDispatch {
                start_prim,
                num_prims: sub_prims,
                output_va: sub_out_va,
                count_va,
                desc_va,
            });
            start_prim += sub_prims;
            if start_prim >= num_prims {
                break;
            }
        }
        Ok(subs)
    }

    /// Close the open batch: the compute stream releases its REWIND.
    fn release_batch(&mut self) {
        if let Some(rewind_va) = self.rewind_va.take() {
            let (hi, lo) = split_addr(rewind_va);
            self.compute.emit_slice(&[
                pkt3(PKT3_RELEASE_MEM, 5, false),
                pm4::release_mem_event_type(V_028A90_CS_DONE)
                    | pm4::release_mem_event_index(pm4::EVENT_INDEX_EOP),
                pm4::release_mem_data_sel(pm4::RELEASE_MEM_DATA_SEL_VALUE_32BIT),
                lo,
                hi,
                REWIND_SIGNAL_VALUE,
                0,
            ]);
        }
        self.prims_in_batch = 0;
    }

    /// Flush unless `subdraws` more sub-draws fit in the open streams.
    fn reserve(&mut self, subdraws: usize) -> Result<()> {
        let dwords = subdraws * SUBDRAW_MAX_DWORDS;
        let data = subdraws * DESC_DWORDS;
        if dwords > IB_DWORDS || data > DATA_DWORDS {
            return Err(Error::invalid(format!("{subdraws} prim cull sub-draws in one draw")));
        }
        if self.gfx.remaining() < dwords
            || self.compute.remaining() < dwords
            || self.data.remaining() < data
        {
            self.flush()?;
        }
        Ok(())
    }

    /// Close the current IB pair and start new ones on the other ring half.
    pub fn flush(&mut self) -> Result<()> {
        if self.gfx.dwords.is_empty() && self.compute.dwords.is_empty() {
            return Ok(());
        }
        self.release_batch();
        let gfx = std::mem::replace(
            &mut self.gfx,
            Stream::new(&self.mgr, "prim-cull gfx ib", IB_DWORDS)?,
        );
        let compute = std::mem::replace(
            &mut self.compute,
            Stream::new(&self.mgr, "prim-cull compute ib", IB_DWORDS)?,
        );
        let data = std::mem::replace(
            &mut self.data,
            Stream::new(&self.mgr, "prim-cull descriptors", DATA_DWORDS)?,
        );
        gfx.upload()?;
        compute.upload()?;
        data.upload()?;

        debug!(
            gfx_dwords = gfx.dwords.len(),
            compute_dwords = compute.dwords.len(),
            ring_used = self.ring_offset,
            "prim cull IB flushed"
        );
        self.finished.push(PrimCullIbs {
            gfx_dwords: gfx.dwords.len(),
            gfx: gfx.bo,
            compute_dwords: compute.dwords.len(),
            compute: compute.bo,
            data: data.bo,
            ring: self.ring.clone(),
        });
        self.ring_base = if self.ring_base == 0 {
            self.config.ring_size
        } else {
            0
        };
        self.ring_offset = 0;
        self.prims_in_ib = 0;
        Ok(())
    }
}

/// Group draws so each group's vertex count stays within `limit`. A draw
/// that alone exceeds the limit goes in a group of its own and is split
/// again when that group is re-issued.
pub fn split_multi_draw(draws: &[DrawRange], limit: u32) -> Vec<Vec<DrawRange>> {
    let mut groups = Vec::new();
    let mut current: Vec<DrawRange> = Vec::new();
    let mut count = 0u64;
    for draw in draws {
        if !current.is_empty() && count + draw.count as u64 > limit as u64 {
            groups.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(*draw);
        count += draw.count as u64;
        if count > limit as u64 {
            groups.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Cut one draw into sub-draws of `limit` vertices along primitive
/// boundaries. Strip pieces overlap by two vertices and start on even
/// primitives so winding is preserved.
pub fn split_draw(prim_type: PrimType, draw: &DrawRange, limit: u32) -> Vec<DrawRange> {
    let mut parts = Vec::new();
    match prim_type {
        PrimType::TriangleList => {
            let limit = limit - limit % 3;
            let mut start = 0;
            while start < draw.count {
                parts.push(DrawRange {
                    start: draw.start + start,
                    count: (draw.count - start).min(limit),
                    index_bias: draw.index_bias,
                });
                start += limit;
            }
        }
        PrimType::TriangleStrip => {
            let limit = limit & !1;
            let mut start = 0;
            while start < draw.count.saturating_sub(2) {
                parts.push(DrawRange {
                    start: draw.start + start,
                    count: (draw.count - start).min(limit + 2),
                    index_bias: draw.index_bias,
                });
                start += limit;
            }
        }
    }
    parts
}

impl KernelArgs {
    /// Rebuild the kernel's view from the SGPRs and descriptor block a
    /// dispatch was recorded with.
    pub fn from_user_data(sgprs: &[u32; NUM_USER_SGPRS], desc: &[u32; DESC_DWORDS]) -> Self {
        Self {
            base_vertex: sgprs[5],
            start_instance: sgprs[6],
            udiv_multiplier: sgprs[7],
            udiv_terms: sgprs[8],
            small_prim_precision: f32::from_bits(sgprs[9]),
            vp_scale: [f32::from_bits(desc[8]), f32::from_bits(desc[9])],
            vp_translate: [f32::from_bits(desc[10]), f32::from_bits(desc[11])],
        }
    }
}
