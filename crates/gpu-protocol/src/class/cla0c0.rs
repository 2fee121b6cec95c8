//! Kepler compute class methods: inline upload, PCAS launch, pools and
//! shader-local memory.

pub const LINE_LENGTH_IN: u32 = 0x0180;
pub const LINE_COUNT: u32 = 0x0184;
pub const OFFSET_OUT_UPPER: u32 = 0x0188;
pub const OFFSET_OUT: u32 = 0x018c;
pub const LAUNCH_DMA: u32 = 0x01b0;
pub const LOAD_INLINE_DATA: u32 = 0x01b4;

pub const SET_SHADER_SHARED_MEMORY_WINDOW: u32 = 0x0214;
pub const INVALIDATE_SHADER_CACHES_NO_WFI: u32 = 0x021c;
pub const SEND_PCAS_A: u32 = 0x02b4;
pub const SEND_SIGNALING_PCAS_B: u32 = 0x02bc;
pub const SET_SHADER_LOCAL_MEMORY_NON_THROTTLED_A: u32 = 0x02e4;
pub const SET_SHADER_LOCAL_MEMORY_NON_THROTTLED_B: u32 = 0x02e8;
pub const SET_SHADER_LOCAL_MEMORY_NON_THROTTLED_C: u32 = 0x02ec;
pub const SET_SHADER_LOCAL_MEMORY_THROTTLED_A: u32 = 0x02f0;
pub const SET_SHADER_LOCAL_MEMORY_THROTTLED_B: u32 = 0x02f4;
pub const SET_SHADER_LOCAL_MEMORY_THROTTLED_C: u32 = 0x02f8;
pub const SET_SHADER_LOCAL_MEMORY_WINDOW: u32 = 0x077c;
pub const SET_SHADER_LOCAL_MEMORY_A: u32 = 0x0790;
pub const SET_SHADER_LOCAL_MEMORY_B: u32 = 0x0794;
pub const INVALIDATE_SAMPLER_CACHE_NO_WFI: u32 = 0x1424;
pub const INVALIDATE_TEXTURE_HEADER_CACHE_NO_WFI: u32 = 0x1428;
pub const SET_TEX_SAMPLER_POOL_A: u32 = 0x155c;
pub const SET_TEX_SAMPLER_POOL_B: u32 = 0x1560;
pub const SET_TEX_SAMPLER_POOL_C: u32 = 0x1564;
pub const SET_TEX_HEADER_POOL_A: u32 = 0x1574;
pub const SET_TEX_HEADER_POOL_B: u32 = 0x1578;
pub const SET_TEX_HEADER_POOL_C: u32 = 0x157c;

/// `LAUNCH_DMA` payload for inline uploads to pitch memory.
pub const fn launch_dma_pitch(sysmembar_disable: bool) -> u32 {
    const DST_MEMORY_LAYOUT_PITCH: u32 = 1;
    DST_MEMORY_LAYOUT_PITCH | ((sysmembar_disable as u32) << 6)
}

pub const INVALIDATE_SHADER_CACHES_INSTRUCTION: u32 = 1 << 0;
pub const INVALIDATE_SHADER_CACHES_GLOBAL_DATA: u32 = 1 << 4;
pub const INVALIDATE_SHADER_CACHES_CONSTANT: u32 = 1 << 12;

pub const fn send_signaling_pcas_b(invalidate: bool, schedule: bool) -> u32 {
    (invalidate as u32) | ((schedule as u32) << 1)
}

/// `SEND_PCAS_A` payload: the QMD address in 256-byte units.
pub const fn send_pcas_a(qmd_addr: u64) -> u32 {
    (crate::gpu_va(qmd_addr) >> 8) as u32
}
