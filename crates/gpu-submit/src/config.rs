//! Device and prim-cull configuration.
//!
//! Defaults describe a discrete Turing-class part with a 48-bit VA space.
//! [`DeviceConfig::from_env`] layers the boolean debug switches on top.

use gpu_protocol::class::ClassSet;

/// Disables the BO cache (every free closes the BO).
pub const NO_BO_REUSE_ENV: &str = "GPU_SUBMIT_NO_BO_REUSE";
/// Forces every draw down the graphics-only path.
pub const NO_PRIM_CULL_ENV: &str = "GPU_SUBMIT_NO_PRIM_CULL";
/// Makes every submit block until the GPU has finished it.
pub const SYNC_SUBMIT_ENV: &str = "GPU_SUBMIT_SYNC_SUBMIT";

pub(crate) fn truthy(raw: &str) -> bool {
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub bo_reuse: bool,
    pub page_size: u64,
    pub has_local_mem: bool,
    pub has_llc: bool,
    /// Size of the GPU VA space.
    pub gtt_size: u64,
    /// Halves the dynamic-state heap (newer parts reserve the upper half).
    pub compact_dynamic_zone: bool,
    pub push_chunk_size: u64,
    /// Streaming multiprocessor count, used for scratch sizing.
    pub mp_count: u32,
    pub classes: ClassSet,
    /// Take a process-wide lock around tiler/fragment submit pairs.
    pub serialize_tiler_pairs: bool,
    pub sync_submit: bool,
    pub prim_cull: PrimCullConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bo_reuse: true,
            page_size: 4096,
            has_local_mem: true,
            has_llc: false,
            gtt_size: 1 << 48,
            compact_dynamic_zone: false,
            push_chunk_size: 64 * 1024,
            mp_count: 16,
            classes: ClassSet::default(),
            serialize_tiler_pairs: false,
            sync_submit: false,
            prim_cull: PrimCullConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Apply the boolean overrides using `lookup` to read variables.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let set = |name: &str| lookup(name).is_some_and(|v| truthy(&v));
        if set(NO_BO_REUSE_ENV) {
            self.bo_reuse = false;
        }
        if set(NO_PRIM_CULL_ENV) {
            self.prim_cull.enabled = false;
        }
        if set(SYNC_SUBMIT_ENV) {
            self.sync_submit = true;
        }
        self
    }

    pub fn with_bo_reuse(mut self, enabled: bool) -> Self {
        self.bo_reuse = enabled;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_local_mem(mut self, has_local_mem: bool) -> Self {
        self.has_local_mem = has_local_mem;
        self
    }

    pub fn with_llc(mut self, has_llc: bool) -> Self {
        self.has_llc = has_llc;
        self
    }

    pub fn with_gtt_size(mut self, gtt_size: u64) -> Self {
        self.gtt_size = gtt_size;
        self
    }

    pub fn with_compact_dynamic_zone(mut self, compact: bool) -> Self {
        self.compact_dynamic_zone = compact;
        self
    }

    pub fn with_push_chunk_size(mut self, size: u64) -> Self {
        self.push_chunk_size = size;
        self
    }

    pub fn with_mp_count(mut self, mp_count: u32) -> Self {
        self.mp_count = mp_count;
        self
    }

    pub fn with_classes(mut self, classes: ClassSet) -> Self {
        self.classes = classes;
        self
    }

    pub fn with_serialize_tiler_pairs(mut self, serialize: bool) -> Self {
        self.serialize_tiler_pairs = serialize;
        self
    }

    pub fn with_sync_submit(mut self, sync: bool) -> Self {
        self.sync_submit = sync;
        self
    }

    pub fn with_prim_cull(mut self, prim_cull: PrimCullConfig) -> Self {
        self.prim_cull = prim_cull;
        self
    }

    /// Minimum VA alignment: 64 KiB on parts with local memory.
    pub fn vma_min_align(&self) -> u64 {
        if self.has_local_mem {
            64 * 1024
        } else {
            self.page_size
        }
    }
}

/// Prim-cull tuning. Generation numbers follow the graphics IP level.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimCullConfig {
    pub enabled: bool,
    pub gfx_level: u32,
    /// Lowest generation the culling pass runs on.
    pub min_gfx_level: u32,
    pub wave_size: u32,
    pub l2_cache_line_size: u32,
    pub prims_per_batch: u32,
    /// Primitives one IB carries before it is closed.
    pub prims_per_ib: u32,
    /// Bytes of culled-index ring shared by all batches of one IB.
    pub ring_size: u64,
    /// Small-primitive rounding precision in pixels (e.g. 1/256 for 8-bit
    /// subpixel precision).
    pub small_prim_precision: f32,
}

pub const PRIMS_PER_BATCH: u32 = 128 * 1024;
pub const PRIMS_PER_IB: u32 = 1024 * 1024;

impl Default for PrimCullConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gfx_level: 10,
            min_gfx_level: 9,
            wave_size: 64,
            l2_cache_line_size: 128,
            prims_per_batch: PRIMS_PER_BATCH,
            prims_per_ib: PRIMS_PER_IB,
            ring_size: PRIMS_PER_IB as u64 * 12,
            small_prim_precision: 1.0 / 256.0,
        }
    }
}

impl PrimCullConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_gfx_level(mut self, level: u32) -> Self {
        self.gfx_level = level;
        self
    }

    pub fn with_wave_size(mut self, wave_size: u32) -> Self {
        self.wave_size = wave_size;
        self
    }

    pub fn with_prims_per_batch(mut self, prims: u32) -> Self {
        self.prims_per_batch = prims;
        self
    }

    pub fn with_prims_per_ib(mut self, prims: u32) -> Self {
        self.prims_per_ib = prims;
        self
    }

    pub fn with_ring_size(mut self, bytes: u64) -> Self {
        self.ring_size = bytes;
        self
    }
}
