//! Queue metadata descriptor (QMD), version 2.2.
//!
//! A QMD is a 64-dword little-endian blob describing one compute grid. Fields
//! are addressed by absolute bit range, mirroring the hardware headers'
//! `MW(hi:lo)` notation.

use bytemuck::{Pod, Zeroable};

pub const QMD_DWORDS: usize = 64;
pub const QMD_SIZE: usize = QMD_DWORDS * 4;
/// QMDs are fetched through `SEND_PCAS_A(addr >> 8)`.
pub const QMD_ALIGN: u64 = 0x100;

/// Inclusive bit range inside the blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QmdField {
    pub lo: u32,
    pub hi: u32,
}

const fn mw(hi: u32, lo: u32) -> QmdField {
    QmdField { lo, hi }
}

impl QmdField {
    pub const fn width(self) -> u32 {
        self.hi - self.lo + 1
    }

    pub const fn max_value(self) -> u64 {
        if self.width() >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width()) - 1
        }
    }
}

pub const SM_GLOBAL_CACHING_ENABLE: QmdField = mw(134, 134);
pub const API_VISIBLE_CALL_LIMIT: QmdField = mw(378, 378);
pub const SAMPLER_INDEX: QmdField = mw(382, 382);
pub const CTA_RASTER_WIDTH: QmdField = mw(415, 384);
pub const CTA_RASTER_HEIGHT: QmdField = mw(447, 416);
pub const CTA_RASTER_DEPTH: QmdField = mw(479, 448);
pub const SHARED_MEMORY_SIZE: QmdField = mw(561, 544);
pub const QMD_VERSION: QmdField = mw(579, 576);
pub const QMD_MAJOR_VERSION: QmdField = mw(583, 580);
pub const CTA_THREAD_DIMENSION0: QmdField = mw(607, 592);
pub const CTA_THREAD_DIMENSION1: QmdField = mw(623, 608);
pub const CTA_THREAD_DIMENSION2: QmdField = mw(639, 624);
pub const SHADER_LOCAL_MEMORY_LOW_SIZE: QmdField = mw(1463, 1440);
pub const BARRIER_COUNT: QmdField = mw(1471, 1464);
pub const SHADER_LOCAL_MEMORY_HIGH_SIZE: QmdField = mw(1495, 1472);
pub const REGISTER_COUNT_V: QmdField = mw(1503, 1496);
pub const MIN_SM_CONFIG_SHARED_MEM_SIZE: QmdField = mw(1541, 1536);
pub const MAX_SM_CONFIG_SHARED_MEM_SIZE: QmdField = mw(1547, 1542);
pub const TARGET_SM_CONFIG_SHARED_MEM_SIZE: QmdField = mw(1553, 1548);
pub const PROGRAM_ADDRESS_LOWER: QmdField = mw(1919, 1888);
pub const PROGRAM_ADDRESS_UPPER: QmdField = mw(1951, 1920);

pub const MAX_CONSTANT_BUFFERS: u32 = 8;

pub const fn constant_buffer_valid(i: u32) -> QmdField {
    mw(640 + i, 640 + i)
}

pub const fn constant_buffer_addr_lower(i: u32) -> QmdField {
    mw(959 + i * 64, 928 + i * 64)
}

pub const fn constant_buffer_addr_upper(i: u32) -> QmdField {
    mw(976 + i * 64, 960 + i * 64)
}

pub const fn constant_buffer_invalidate(i: u32) -> QmdField {
    mw(977 + i * 64, 977 + i * 64)
}

pub const fn constant_buffer_size_shifted4(i: u32) -> QmdField {
    mw(991 + i * 64, 978 + i * 64)
}

pub const API_VISIBLE_CALL_LIMIT_NO_CHECK: u64 = 1;
pub const SAMPLER_INDEX_INDEPENDENTLY: u64 = 0;

/// Encode a shared-memory size for the `*_SM_CONFIG_SHARED_MEM_SIZE` fields.
///
/// The size is first rounded up to one of the carve-outs the SM supports
/// (8, 16, 32, 64 or 96 KiB).
pub const fn sm_config_shared_mem_size(size: u32) -> u64 {
    let size = if size > 64 * 1024 {
        96 * 1024
    } else if size > 32 * 1024 {
        64 * 1024
    } else if size > 16 * 1024 {
        32 * 1024
    } else if size > 8 * 1024 {
        16 * 1024
    } else {
        8 * 1024
    };
    (size / 4096 + 1) as u64
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Qmd {
    pub dw: [u32; QMD_DWORDS],
}

impl Default for Qmd {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Qmd {
    /// Store `value` into `field`. Bits above the field width are dropped.
    pub fn set(&mut self, field: QmdField, value: u64) {
        let value = value & field.max_value();
        let mut bit = field.lo;
        let mut remaining = field.width();
        let mut v = value;
        while remaining > 0 {
            let dw = (bit / 32) as usize;
            let shift = bit % 32;
            let take = remaining.min(32 - shift);
            let mask = if take == 32 {
                u32::MAX
            } else {
                ((1u32 << take) - 1) << shift
            };
            self.dw[dw] = (self.dw[dw] & !mask) | (((v as u32) << shift) & mask);
            v = if take == 64 { 0 } else { v >> take };
            bit += take;
            remaining -= take;
        }
    }

    pub fn get(&self, field: QmdField) -> u64 {
        let mut out = 0u64;
        let mut bit = field.lo;
        let mut remaining = field.width();
        let mut out_shift = 0;
        while remaining > 0 {
            let dw = (bit / 32) as usize;
            let shift = bit % 32;
            let take = remaining.min(32 - shift);
            let mask = if take == 32 {
                u32::MAX
            } else {
                (1u32 << take) - 1
            };
            out |= (((self.dw[dw] >> shift) & mask) as u64) << out_shift;
            out_shift += take;
            bit += take;
            remaining -= take;
        }
        out
    }

    pub fn set_program_address(&mut self, addr: u64) {
        let addr = crate::gpu_va(addr);
        self.set(PROGRAM_ADDRESS_LOWER, addr & 0xffff_ffff);
        self.set(PROGRAM_ADDRESS_UPPER, addr >> 32);
    }

    pub fn program_address(&self) -> u64 {
        self.get(PROGRAM_ADDRESS_LOWER) | (self.get(PROGRAM_ADDRESS_UPPER) << 32)
    }

    pub fn set_raster_dims(&mut self, x: u32, y: u32, z: u32) {
        self.set(CTA_RASTER_WIDTH, x as u64);
        self.set(CTA_RASTER_HEIGHT, y as u64);
        self.set(CTA_RASTER_DEPTH, z as u64);
    }

    /// Install constant buffer `index` at `addr` covering `size` bytes.
    pub fn set_constant_buffer(&mut self, index: u32, addr: u64, size: u32) {
        debug_assert!(index < MAX_CONSTANT_BUFFERS);
        let addr = crate::gpu_va(addr);
        self.set(constant_buffer_addr_lower(index), addr & 0xffff_ffff);
        self.set(constant_buffer_addr_upper(index), addr >> 32);
        self.set(
            constant_buffer_size_shifted4(index),
            crate::align_up_u32(size, 16) as u64 >> 4,
        );
        self.set(constant_buffer_valid(index), 1);
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fields_do_not_overlap() {
        let mut fields = vec![
            SM_GLOBAL_CACHING_ENABLE,
            API_VISIBLE_CALL_LIMIT,
            SAMPLER_INDEX,
            CTA_RASTER_WIDTH,
            CTA_RASTER_HEIGHT,
            CTA_RASTER_DEPTH,
            SHARED_MEMORY_SIZE,
            QMD_VERSION,
            QMD_MAJOR_VERSION,
            CTA_THREAD_DIMENSION0,
            CTA_THREAD_DIMENSION1,
            CTA_THREAD_DIMENSION2,
            SHADER_LOCAL_MEMORY_LOW_SIZE,
            BARRIER_COUNT,
            SHADER_LOCAL_MEMORY_HIGH_SIZE,
            REGISTER_COUNT_V,
            MIN_SM_CONFIG_SHARED_MEM_SIZE,
            MAX_SM_CONFIG_SHARED_MEM_SIZE,
            TARGET_SM_CONFIG_SHARED_MEM_SIZE,
            PROGRAM_ADDRESS_LOWER,
            PROGRAM_ADDRESS_UPPER,
        ];
        for i in 0..MAX_CONSTANT_BUFFERS {
            fields.push(constant_buffer_valid(i));
            fields.push(constant_buffer_addr_lower(i));
            fields.push(constant_buffer_addr_upper(i));
            fields.push(constant_buffer_invalidate(i));
            fields.push(constant_buffer_size_shifted4(i));
        }
        fields.sort_by_key(|f| f.lo);
        for pair in fields.windows(2) {
            assert!(pair[0].hi < pair[1].lo, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
        assert!(fields.last().unwrap().hi < (QMD_DWORDS as u32) * 32);
    }

    #[test]
    fn set_get_round_trip_and_masking() {
        let mut qmd = Qmd::default();
        qmd.set(REGISTER_COUNT_V, 0x1ff);
        assert_eq!(qmd.get(REGISTER_COUNT_V), 0xff);
        qmd.set_program_address(0x0000_7fff_1234_5600);
        assert_eq!(qmd.program_address(), 0x0000_7fff_1234_5600);
        qmd.set_raster_dims(7, 8, 9);
        assert_eq!(qmd.get(CTA_RASTER_WIDTH), 7);
        assert_eq!(qmd.get(CTA_RASTER_HEIGHT), 8);
        assert_eq!(qmd.get(CTA_RASTER_DEPTH), 9);
        // Neighbouring fields stay untouched.
        assert_eq!(qmd.get(BARRIER_COUNT), 0);
    }

    #[test]
    fn constant_buffer_install() {
        let mut qmd = Qmd::default();
        qmd.set_constant_buffer(1, 0x1_0000_0100, 944);
        assert_eq!(qmd.get(constant_buffer_valid(1)), 1);
        assert_eq!(qmd.get(constant_buffer_valid(0)), 0);
        assert_eq!(qmd.get(constant_buffer_addr_lower(1)), 0x100);
        assert_eq!(qmd.get(constant_buffer_addr_upper(1)), 1);
        assert_eq!(qmd.get(constant_buffer_size_shifted4(1)), 59);

        qmd.set_constant_buffer(2, 0xffff_ffff_ff00_0200, 16);
        assert_eq!(qmd.get(constant_buffer_addr_lower(2)), 0xff00_0200);
        assert_eq!(qmd.get(constant_buffer_addr_upper(2)), 0xffff);
    }

    #[test]
    fn sm_config_ladder() {
        assert_eq!(sm_config_shared_mem_size(0), 3);
        assert_eq!(sm_config_shared_mem_size(8 * 1024), 3);
        assert_eq!(sm_config_shared_mem_size(8 * 1024 + 1), 5);
        assert_eq!(sm_config_shared_mem_size(48 * 1024), 17);
        assert_eq!(sm_config_shared_mem_size(96 * 1024), 25);
    }
}
