//! Compute dispatch: QMD templates, root-table upload and PCAS launch.

use std::sync::Arc;

use gpu_protocol::class::cla0c0;
use gpu_protocol::push::SUBC_COMPUTE;
use gpu_protocol::qmd::{self, Qmd, QMD_ALIGN, QMD_SIZE};
use gpu_protocol::uapi::BoAccess;
use gpu_protocol::{align_up, align_up_u32};
use tracing::trace;

use crate::bo::Bo;
use crate::cmd_buffer::{CmdBuffer, RootTable};
use crate::{Error, Result};

/// Alignment of uploaded root tables.
const ROOT_TABLE_ALIGN: u64 = 0x100;

/// Thread-local storage for a whole chip: `lpos`/`lneg` are per-thread
/// local memory words, `cstack` the call stack bytes per warp.
pub fn calc_tls_size(mp_count: u32, lpos: u32, lneg: u32, cstack: u32) -> u64 {
    let mut size = (lpos as u64 + lneg as u64) * 32 + cstack as u64;
    debug_assert!(size < (1 << 20));
    // Max resident warps per MP.
    size *= 64;
    size = align_up(size, 0x8000);
    size *= mp_count as u64;
    align_up(size, 1 << 17)
}

/// Compiled compute shader metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputeShaderInfo {
    pub code_addr: u64,
    pub num_gprs: u8,
    pub num_barriers: u8,
    /// Shared memory bytes per block.
    pub smem_size: u32,
    /// Local memory bytes per thread beyond what the header declares.
    pub lmem_size: u32,
    /// Shader program header.
    pub hdr: [u32; 32],
    pub block_size: [u32; 3],
    /// Scratch bytes per thread.
    pub slm_size: u32,
}

impl Default for ComputeShaderInfo {
    fn default() -> Self {
        Self {
            code_addr: 0,
            num_gprs: 0,
            num_barriers: 0,
            smem_size: 0,
            lmem_size: 0,
            hdr: [0; 32],
            block_size: [1, 1, 1],
            slm_size: 0,
        }
    }
}

/// QMD fields that do not depend on the dispatch.
pub fn build_qmd_template(info: &ComputeShaderInfo) -> Qmd {
    let mut q = Qmd::default();
    q.set(qmd::SM_GLOBAL_CACHING_ENABLE, 1);
    q.set(qmd::API_VISIBLE_CALL_LIMIT, qmd::API_VISIBLE_CALL_LIMIT_NO_CHECK);
    q.set(qmd::SAMPLER_INDEX, qmd::SAMPLER_INDEX_INDEPENDENTLY);
    q.set(
        qmd::SHARED_MEMORY_SIZE,
        align_up_u32(info.smem_size, 0x100) as u64,
    );
    q.set(
        qmd::SHADER_LOCAL_MEMORY_LOW_SIZE,
        ((info.hdr[1] & 0xff_fff0) + align_up_u32(info.lmem_size, 0x10)) as u64,
    );
    q.set(qmd::SHADER_LOCAL_MEMORY_HIGH_SIZE, 0);
    q.set(
        qmd::MIN_SM_CONFIG_SHARED_MEM_SIZE,
        qmd::sm_config_shared_mem_size(8 * 1024),
    );
    q.set(
        qmd::MAX_SM_CONFIG_SHARED_MEM_SIZE,
        qmd::sm_config_shared_mem_size(96 * 1024),
    );
    q.set(qmd::QMD_VERSION, 2);
    q.set(qmd::QMD_MAJOR_VERSION, 2);
    q.set(
        qmd::TARGET_SM_CONFIG_SHARED_MEM_SIZE,
        qmd::sm_config_shared_mem_size(info.smem_size),
    );
    q.set(qmd::CTA_THREAD_DIMENSION0, info.block_size[0] as u64);
    q.set(qmd::CTA_THREAD_DIMENSION1, info.block_size[1] as u64);
    q.set(qmd::CTA_THREAD_DIMENSION2, info.block_size[2] as u64);
    q.set(qmd::REGISTER_COUNT_V, info.num_gprs as u64);
    q.set(qmd::BARRIER_COUNT, info.num_barriers as u64);
    q.set_program_address(info.code_addr);
    q
}

#[derive(Debug)]
pub struct ComputePipeline {
    qmd_template: Qmd,
    block_size: [u32; 3],
    slm_size: u32,
    /// Keeps the code alive and resident; `None` for heap-resident code.
    shader_bo: Option<Bo>,
}

impl ComputePipeline {
    pub fn new(info: &ComputeShaderInfo, shader_bo: Option<Bo>) -> Self {
        Self {
            qmd_template: build_qmd_template(info),
            block_size: info.block_size,
            slm_size: info.slm_size,
            shader_bo,
        }
    }

    pub fn qmd_template(&self) -> &Qmd {
        &self.qmd_template
    }

    pub fn block_size(&self) -> [u32; 3] {
        self.block_size
    }
}

impl CmdBuffer {
    pub fn bind_compute_pipeline(&mut self, pipeline: Arc<ComputePipeline>) {
        if let Some(bo) = &pipeline.shader_bo {
            self.ref_bo(bo, BoAccess::RD);
        }
        if pipeline.slm_size != 0 {
            self.require_slm(pipeline.slm_size);
        }
        self.compute_pipeline = Some(pipeline);
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.dispatch_base([0; 3], [x, y, z])
    }

    /// Launch `groups` workgroups starting at `base`. Empty grids are still
    /// emitted.
    pub fn dispatch_base(&mut self, base: [u32; 3], groups: [u32; 3]) -> Result<()> {
        let Some(pipeline) = self.compute_pipeline.clone() else {
            return Err(Error::invalid("dispatch without a compute pipeline"));
        };

        let root = {
            let cs = &mut self.cs.root.cs;
            cs.block_size = pipeline.block_size;
            cs.grid_size = groups;
            cs.base_group = base;
            self.cs.root
        };
        let root_size = std::mem::size_of::<RootTable>() as u32;
        let root_addr = self
            .upload_alloc(root_size as u64, ROOT_TABLE_ALIGN)
            .map(|s| s.va)?;

        let root_words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(&root));
        let p = self.push(root_words.len() + 16)?;
        p.mthd(SUBC_COMPUTE, cla0c0::OFFSET_OUT_UPPER)
            .inline_addr(root_addr);
        p.mthd(SUBC_COMPUTE, cla0c0::LINE_LENGTH_IN)
            .inline_data(root_size)
            .inline_data(1);
        p.one_inc(SUBC_COMPUTE, cla0c0::LAUNCH_DMA)
            .inline_data(cla0c0::launch_dma_pitch(true))
            .inline_array(root_words);

        let mut q = *pipeline.qmd_template();
        q.set_raster_dims(groups[0], groups[1], groups[2]);
        q.set_constant_buffer(0, root_addr, root_size);
        q.set_constant_buffer(1, root_addr, root_size);
        let qmd_slice = self.upload_alloc(QMD_SIZE as u64, QMD_ALIGN)?;
        qmd_slice.write(0, q.as_bytes())?;
        let qmd_addr = qmd_slice.va;

        let p = self.push(8)?;
        p.mthd(SUBC_COMPUTE, cla0c0::INVALIDATE_SHADER_CACHES_NO_WFI)
            .inline_data(cla0c0::INVALIDATE_SHADER_CACHES_CONSTANT);
        p.mthd(SUBC_COMPUTE, cla0c0::SEND_PCAS_A)
            .inline_data(cla0c0::send_pcas_a(qmd_addr));
        p.immd(
            SUBC_COMPUTE,
            cla0c0::SEND_SIGNALING_PCAS_B,
            cla0c0::send_signaling_pcas_b(true, true),
        );
        trace!(?groups, qmd_addr, "dispatch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::BufMgr;
    use crate::config::DeviceConfig;
    use crate::kernel::mock::MockKernel;
    use crate::vma::address_48b;
    use gpu_protocol::push::{decode, MethodWrite};
    use pretty_assertions::assert_eq;

    #[test]
    fn tls_size() {
        // ((2048 * 32) + 0x200) * 64 rounded to 32K, times 16 MPs.
        let per_mp = align_up((2048 * 32 + 0x200) * 64, 0x8000);
        assert_eq!(calc_tls_size(16, 128 * 16, 0, 0x200), align_up(per_mp * 16, 1 << 17));
        assert_eq!(calc_tls_size(1, 0, 0, 0), 0);
        assert_eq!(calc_tls_size(1, 1, 0, 0), 1 << 17);
    }

    #[test]
    fn template_fields() {
        let mut info = ComputeShaderInfo {
            code_addr: 0x1_2345_6700,
            num_gprs: 24,
            num_barriers: 1,
            smem_size: 1000,
            lmem_size: 20,
            block_size: [64, 2, 1],
            ..ComputeShaderInfo::default()
        };
        info.hdr[1] = 0x0000_0125;
        let q = build_qmd_template(&info);
        assert_eq!(q.get(qmd::SHARED_MEMORY_SIZE), 1024);
        assert_eq!(q.get(qmd::SHADER_LOCAL_MEMORY_LOW_SIZE), 0x120 + 0x20);
        assert_eq!(q.get(qmd::TARGET_SM_CONFIG_SHARED_MEM_SIZE), 3);
        assert_eq!(q.get(qmd::MAX_SM_CONFIG_SHARED_MEM_SIZE), 25);
        assert_eq!(q.get(qmd::CTA_THREAD_DIMENSION0), 64);
        assert_eq!(q.get(qmd::REGISTER_COUNT_V), 24);
        assert_eq!(q.program_address(), 0x1_2345_6700);
    }

    #[test]
    fn dispatch_uploads_root_and_qmd() {
        let kernel = Arc::new(MockKernel::new());
        let config = DeviceConfig::default();
        let mgr = BufMgr::new(kernel.clone(), &config);
        let mut cmd = CmdBuffer::new(mgr, &config);
        cmd.begin().unwrap();
        assert!(cmd.dispatch(1, 1, 1).is_err());

        let info = ComputeShaderInfo {
            code_addr: 0x4000,
            block_size: [32, 1, 1],
            ..ComputeShaderInfo::default()
        };
        cmd.bind_compute_pipeline(Arc::new(ComputePipeline::new(&info, None)));
        cmd.dispatch(0, 3, 1).unwrap();
        cmd.end().unwrap();

        let range = cmd.pushes()[0];
        let chunk = cmd.bo_refs().iter().find(|r| r.bo.name() == "push").unwrap();
        let bytes = kernel
            .read_bo(chunk.bo.handle(), range.va - chunk.bo.address(), range.len as usize)
            .unwrap();
        let dwords: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
        let writes = decode(&dwords).unwrap();

        let pcas = writes
            .iter()
            .find(|w| w.mthd == cla0c0::SEND_PCAS_A)
            .unwrap();
        let qmd_addr = (pcas.data as u64) << 8;
        assert_eq!(
            *writes.last().unwrap(),
            MethodWrite::new(SUBC_COMPUTE, cla0c0::SEND_SIGNALING_PCAS_B, 3)
        );
        let root_len = writes
            .iter()
            .find(|w| w.mthd == cla0c0::LINE_LENGTH_IN)
            .unwrap();
        assert_eq!(root_len.data, 944);
        let inline = writes
            .iter()
            .filter(|w| w.mthd == cla0c0::LOAD_INLINE_DATA)
            .count();
        assert_eq!(inline, 944 / 4);

        let upload = cmd.bo_refs().iter().find(|r| r.bo.name() == "upload").unwrap();
        // Upload memory sits high in the VA space, where the canonical form
        // is sign-extended.
        let upload_va = address_48b(upload.bo.address());
        assert_ne!(upload_va, upload.bo.address());
        let qmd_bytes = kernel
            .read_bo(upload.bo.handle(), qmd_addr - upload_va, QMD_SIZE)
            .unwrap();
        let q: Qmd = bytemuck::pod_read_unaligned(&qmd_bytes);
        assert_eq!(q.get(qmd::CTA_RASTER_WIDTH), 0);
        assert_eq!(q.get(qmd::CTA_RASTER_HEIGHT), 3);
        assert_eq!(q.get(qmd::constant_buffer_valid(1)), 1);
        assert_eq!(q.get(qmd::constant_buffer_size_shifted4(0)), 59);
        assert_eq!(q.program_address(), 0x4000);

        let root = writes
            .iter()
            .position(|w| w.mthd == cla0c0::OFFSET_OUT_UPPER)
            .unwrap();
        let root_va = (writes[root].data as u64) << 32 | writes[root + 1].data as u64;
        assert!(root_va >> 32 <= 0xffff);
        assert_eq!(
            q.get(qmd::constant_buffer_addr_upper(0)) << 32
                | q.get(qmd::constant_buffer_addr_lower(0)),
            root_va
        );
    }
}
