//! Hardware class ids and per-class method tables.
//!
//! Each submodule is named after the class revision that introduced the
//! methods it lists. Method constants are byte offsets as written into a
//! push header; indexed methods are `const fn`s of the index.

pub mod cl902d;
pub mod cl9097;
pub mod cl90b5;
pub mod cla0c0;
pub mod clb197;
pub mod clc1b5;
pub mod clc397;
pub mod clc3c0;

/// Class-independent NOP, valid on every subchannel.
pub const NV_NOP: u32 = 0x0100;

pub const FERMI_TWOD_A: u32 = 0x902d;

pub const FERMI_A: u32 = 0x9097;
pub const KEPLER_A: u32 = 0xa097;
pub const MAXWELL_A: u32 = 0xb097;
pub const MAXWELL_B: u32 = 0xb197;
pub const PASCAL_A: u32 = 0xc097;
pub const VOLTA_A: u32 = 0xc397;
pub const TURING_A: u32 = 0xc597;

pub const FERMI_COMPUTE_A: u32 = 0x90c0;
pub const KEPLER_COMPUTE_A: u32 = 0xa0c0;
pub const MAXWELL_COMPUTE_B: u32 = 0xb1c0;
pub const PASCAL_COMPUTE_A: u32 = 0xc0c0;
pub const VOLTA_COMPUTE_A: u32 = 0xc3c0;
pub const TURING_COMPUTE_A: u32 = 0xc5c0;

pub const FERMI_DMA: u32 = 0x90b5;
pub const KEPLER_DMA_COPY_A: u32 = 0xa0b5;
pub const MAXWELL_DMA_COPY_A: u32 = 0xb0b5;
pub const PASCAL_DMA_COPY_A: u32 = 0xc0b5;
pub const PASCAL_DMA_COPY_B: u32 = 0xc1b5;
pub const VOLTA_DMA_COPY_A: u32 = 0xc3b5;

/// Class ids bound to the channel's subchannels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassSet {
    pub eng3d: u32,
    pub compute: u32,
    pub copy: u32,
    pub eng2d: u32,
}

impl ClassSet {
    pub const TURING: Self = Self {
        eng3d: TURING_A,
        compute: TURING_COMPUTE_A,
        copy: VOLTA_DMA_COPY_A,
        eng2d: FERMI_TWOD_A,
    };

    pub const PASCAL: Self = Self {
        eng3d: PASCAL_A,
        compute: PASCAL_COMPUTE_A,
        copy: PASCAL_DMA_COPY_A,
        eng2d: FERMI_TWOD_A,
    };

    pub const KEPLER: Self = Self {
        eng3d: KEPLER_A,
        compute: KEPLER_COMPUTE_A,
        copy: KEPLER_DMA_COPY_A,
        eng2d: FERMI_TWOD_A,
    };
}

impl Default for ClassSet {
    fn default() -> Self {
        Self::TURING
    }
}
