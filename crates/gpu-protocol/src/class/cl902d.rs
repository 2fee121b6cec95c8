//! Fermi 2D engine methods used for fills, small uploads and solid clears.

pub const SET_DST_FORMAT: u32 = 0x0200;
pub const SET_DST_MEMORY_LAYOUT: u32 = 0x0204;
pub const SET_DST_BLOCK_SIZE: u32 = 0x0208;
pub const SET_DST_DEPTH: u32 = 0x020c;
pub const SET_DST_LAYER: u32 = 0x0210;
pub const SET_DST_PITCH: u32 = 0x0214;
pub const SET_DST_WIDTH: u32 = 0x0218;
pub const SET_DST_HEIGHT: u32 = 0x021c;
pub const SET_DST_OFFSET_UPPER: u32 = 0x0220;
pub const SET_DST_OFFSET_LOWER: u32 = 0x0224;

pub const SET_RENDER_ENABLE_C: u32 = 0x0238;
pub const SET_CLIP_ENABLE: u32 = 0x0290;
pub const SET_COLOR_KEY_ENABLE: u32 = 0x029c;
pub const SET_OPERATION: u32 = 0x02ac;

pub const SET_RENDER_SOLID_PRIM_COLOR0: u32 = 0x0540;
pub const SET_RENDER_SOLID_PRIM_COLOR1: u32 = 0x0544;
pub const SET_RENDER_SOLID_PRIM_COLOR2: u32 = 0x0548;
pub const SET_RENDER_SOLID_PRIM_COLOR3: u32 = 0x054c;

pub const RENDER_SOLID_PRIM_MODE: u32 = 0x0580;
pub const SET_RENDER_SOLID_PRIM_COLOR_FORMAT: u32 = 0x0584;
pub const SET_RENDER_SOLID_PRIM_COLOR: u32 = 0x0588;

pub const fn render_solid_prim_point_set_x(j: u32) -> u32 {
    0x0600 + j * 8
}

pub const fn render_solid_prim_point_y(j: u32) -> u32 {
    0x0604 + j * 8
}

pub const SET_PIXELS_FROM_CPU_DATA_TYPE: u32 = 0x0800;
pub const SET_PIXELS_FROM_CPU_COLOR_FORMAT: u32 = 0x0804;
pub const SET_PIXELS_FROM_CPU_SRC_WIDTH: u32 = 0x0838;
pub const SET_PIXELS_FROM_CPU_SRC_HEIGHT: u32 = 0x083c;
pub const SET_PIXELS_FROM_CPU_DX_DU_FRAC: u32 = 0x0840;
pub const SET_PIXELS_FROM_CPU_DX_DU_INT: u32 = 0x0844;
pub const SET_PIXELS_FROM_CPU_DY_DV_FRAC: u32 = 0x0848;
pub const SET_PIXELS_FROM_CPU_DY_DV_INT: u32 = 0x084c;
pub const SET_PIXELS_FROM_CPU_DST_X0_FRAC: u32 = 0x0850;
pub const SET_PIXELS_FROM_CPU_DST_X0_INT: u32 = 0x0854;
pub const SET_PIXELS_FROM_CPU_DST_Y0_FRAC: u32 = 0x0858;
pub const SET_PIXELS_FROM_CPU_DST_Y0_INT: u32 = 0x085c;
pub const PIXELS_FROM_CPU_DATA: u32 = 0x0860;

pub const OPERATION_SRCCOPY: u32 = 3;
pub const RENDER_ENABLE_C_MODE_TRUE: u32 = 1;

pub const MEMORY_LAYOUT_BLOCKLINEAR: u32 = 0;
pub const MEMORY_LAYOUT_PITCH: u32 = 1;

pub const PIXELS_FROM_CPU_DATA_TYPE_COLOR: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ColorFormat {
    A8R8G8B8 = 0xcf,
    A8B8G8R8 = 0xd5,
    Y16 = 0xee,
    Y8 = 0xf3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SolidPrimMode {
    Points = 0,
    Lines = 1,
    Polyline = 2,
    Triangles = 3,
    Rects = 4,
}

/// `SET_DST_BLOCK_SIZE` payload (log2 GOBs; width is always one GOB).
pub const fn block_size(height_log2: u32, depth_log2: u32) -> u32 {
    ((height_log2 & 7) << 4) | ((depth_log2 & 7) << 8)
}
