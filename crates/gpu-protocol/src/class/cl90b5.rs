//! Fermi copy engine (DMA) methods.

pub const NOP: u32 = 0x0100;
pub const LAUNCH_DMA: u32 = 0x0300;
pub const OFFSET_IN_UPPER: u32 = 0x0400;
pub const OFFSET_IN_LOWER: u32 = 0x0404;
pub const OFFSET_OUT_UPPER: u32 = 0x0408;
pub const OFFSET_OUT_LOWER: u32 = 0x040c;
pub const PITCH_IN: u32 = 0x0410;
pub const PITCH_OUT: u32 = 0x0414;
pub const LINE_LENGTH_IN: u32 = 0x0418;
pub const LINE_COUNT: u32 = 0x041c;

pub const SET_DST_BLOCK_SIZE: u32 = 0x070c;
pub const SET_DST_WIDTH: u32 = 0x0710;
pub const SET_DST_HEIGHT: u32 = 0x0714;
pub const SET_DST_DEPTH: u32 = 0x0718;
pub const SET_DST_LAYER: u32 = 0x071c;
pub const SET_DST_ORIGIN: u32 = 0x0720;

pub const SET_SRC_BLOCK_SIZE: u32 = 0x0728;
pub const SET_SRC_WIDTH: u32 = 0x072c;
pub const SET_SRC_HEIGHT: u32 = 0x0730;
pub const SET_SRC_DEPTH: u32 = 0x0734;
pub const SET_SRC_LAYER: u32 = 0x0738;
pub const SET_SRC_ORIGIN: u32 = 0x073c;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DataTransferType {
    None = 0,
    Pipelined = 1,
    NonPipelined = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryLayout {
    BlockLinear = 0,
    Pitch = 1,
}

/// `LAUNCH_DMA` payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchDma {
    pub data_transfer_type: DataTransferType,
    pub flush_enable: bool,
    pub src_memory_layout: MemoryLayout,
    pub dst_memory_layout: MemoryLayout,
    pub multi_line_enable: bool,
}

impl LaunchDma {
    /// Non-pipelined, flushed, multi-line transfer between the given layouts.
    pub const fn copy(src: MemoryLayout, dst: MemoryLayout) -> Self {
        Self {
            data_transfer_type: DataTransferType::NonPipelined,
            flush_enable: true,
            src_memory_layout: src,
            dst_memory_layout: dst,
            multi_line_enable: true,
        }
    }

    pub const fn bits(self) -> u32 {
        (self.data_transfer_type as u32)
            | ((self.flush_enable as u32) << 2)
            | ((self.src_memory_layout as u32) << 7)
            | ((self.dst_memory_layout as u32) << 8)
            | ((self.multi_line_enable as u32) << 9)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self {
            data_transfer_type: match bits & 3 {
                1 => DataTransferType::Pipelined,
                2 => DataTransferType::NonPipelined,
                _ => DataTransferType::None,
            },
            flush_enable: bits & (1 << 2) != 0,
            src_memory_layout: if bits & (1 << 7) != 0 {
                MemoryLayout::Pitch
            } else {
                MemoryLayout::BlockLinear
            },
            dst_memory_layout: if bits & (1 << 8) != 0 {
                MemoryLayout::Pitch
            } else {
                MemoryLayout::BlockLinear
            },
            multi_line_enable: bits & (1 << 9) != 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum GobHeight {
    Tesla4 = 0,
    Fermi8 = 1,
}

/// `SET_{SRC,DST}_BLOCK_SIZE` payload; all dimensions are log2 GOB counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockSize {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub gob_height: GobHeight,
}

impl BlockSize {
    pub const fn bits(self) -> u32 {
        (self.width & 0xf)
            | ((self.height & 0xf) << 4)
            | ((self.depth & 0xf) << 8)
            | ((self.gob_height as u32) << 12)
    }
}

/// `SET_{SRC,DST}_ORIGIN` payload: `x` in bytes, `y` in rows.
pub const fn origin(x: u32, y: u32) -> u32 {
    (x & 0xffff) | ((y & 0xffff) << 16)
}
