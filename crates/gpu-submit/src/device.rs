//! Per-device state shared by every queue and command buffer.

use std::sync::Arc;

use tracing::info;

use crate::bo::{BoFlags, BufMgr};
use crate::caps::GenOps;
use crate::cmd_buffer::CmdBuffer;
use crate::config::DeviceConfig;
use crate::desc_table::{
    DescriptorTable, IMAGE_DESCRIPTOR_SIZE, MAX_IMAGE_DESCRIPTORS, MAX_SAMPLER_DESCRIPTORS,
    MIN_DESCRIPTORS, SAMPLER_DESCRIPTOR_SIZE,
};
use crate::heap::ShaderHeap;
use crate::kernel::KernelDevice;
use crate::prim_cull::PrimCullContext;
use crate::queue::Queue;
use crate::slm::SlmArea;
use crate::Result;

/// Bytes past the end of each shader-heap BO the instruction prefetcher
/// may touch.
const SHADER_HEAP_OVERALLOC: u64 = 2048;

#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    mgr: Arc<BufMgr>,
    gen: GenOps,
    images: DescriptorTable,
    samplers: DescriptorTable,
    shader_heap: ShaderHeap,
    slm: SlmArea,
}

impl Device {
    pub fn new(kernel: Arc<dyn KernelDevice>, config: DeviceConfig) -> Result<Arc<Self>> {
        let mgr = BufMgr::get_for_fd(kernel, &config);
        let gen = GenOps::for_classes(&config.classes);
        let images = DescriptorTable::new(
            mgr.clone(),
            "image descriptors",
            IMAGE_DESCRIPTOR_SIZE,
            MIN_DESCRIPTORS,
            MAX_IMAGE_DESCRIPTORS,
        )?;
        let samplers = DescriptorTable::new(
            mgr.clone(),
            "sampler descriptors",
            SAMPLER_DESCRIPTOR_SIZE,
            MIN_DESCRIPTORS,
            MAX_SAMPLER_DESCRIPTORS,
        )?;
        let shader_heap = ShaderHeap::new(mgr.clone(), BoFlags::LOCAL, SHADER_HEAP_OVERALLOC);
        let slm = SlmArea::new(mgr.clone(), config.mp_count);

        info!(
            gen = gen.name,
            device_key = mgr.device_key(),
            prim_cull = config.prim_cull.enabled,
            "device created"
        );
        Ok(Arc::new(Self {
            config,
            mgr,
            gen,
            images,
            samplers,
            shader_heap,
            slm,
        }))
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn bufmgr(&self) -> &Arc<BufMgr> {
        &self.mgr
    }

    pub fn gen(&self) -> &GenOps {
        &self.gen
    }

    pub fn images(&self) -> &DescriptorTable {
        &self.images
    }

    pub fn samplers(&self) -> &DescriptorTable {
        &self.samplers
    }

    pub fn shader_heap(&self) -> &ShaderHeap {
        &self.shader_heap
    }

    pub fn slm(&self) -> &SlmArea {
        &self.slm
    }

    pub fn create_cmd_buffer(&self) -> CmdBuffer {
        CmdBuffer::new(self.mgr.clone(), &self.config)
    }

    pub fn create_queue(self: &Arc<Self>) -> Result<Queue> {
        Queue::new(self.clone())
    }

    pub fn create_prim_cull_context(&self) -> Result<PrimCullContext> {
        PrimCullContext::new(self.mgr.clone(), &self.config.prim_cull)
    }

    /// Copy shader code into the heap and return its GPU address.
    pub fn upload_shader(&self, code: &[u8]) -> Result<u64> {
        self.shader_heap.upload(code, 256)
    }
}
