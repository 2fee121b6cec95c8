//! Fermi 3D class methods.

pub const SET_SHADER_LOCAL_MEMORY_WINDOW: u32 = 0x077c;
pub const SET_SHADER_LOCAL_MEMORY_A: u32 = 0x0790;
pub const SET_SHADER_LOCAL_MEMORY_B: u32 = 0x0794;
pub const SET_SHADER_LOCAL_MEMORY_C: u32 = 0x0798;
pub const SET_SHADER_LOCAL_MEMORY_D: u32 = 0x079c;
pub const SET_SHADER_LOCAL_MEMORY_E: u32 = 0x07a0;

pub const SET_ZCULL_BOUNDS: u32 = 0x0860;
pub const SET_LINE_STIPPLE: u32 = 0x0d80;
pub const SET_FRONT_POLYGON_MODE: u32 = 0x0dac;
pub const SET_BACK_POLYGON_MODE: u32 = 0x0db0;
pub const SET_RT_LAYER: u32 = 0x0e20;
pub const SET_VIEWPORT_CLIP_CONTROL: u32 = 0x0f4c;
pub const SET_ANTI_ALIASED_LINE: u32 = 0x1018;
pub const SET_VIEWPORT_Z_CLIP: u32 = 0x10a4;
pub const SET_BLEND_STATE_PER_TARGET: u32 = 0x12e4;
pub const SET_BLEND_BASE: u32 = 0x1360;
pub const INVALIDATE_SAMPLER_CACHE_NO_WFI: u32 = 0x1424;
pub const INVALIDATE_TEXTURE_HEADER_CACHE_NO_WFI: u32 = 0x1428;
pub const SET_USER_CLIP_ENABLE: u32 = 0x1510;
pub const SET_TEX_SAMPLER_POOL_A: u32 = 0x155c;
pub const SET_TEX_SAMPLER_POOL_B: u32 = 0x1560;
pub const SET_TEX_SAMPLER_POOL_C: u32 = 0x1564;
pub const SET_TEX_HEADER_POOL_A: u32 = 0x1574;
pub const SET_TEX_HEADER_POOL_B: u32 = 0x1578;
pub const SET_TEX_HEADER_POOL_C: u32 = 0x157c;
pub const SET_PROVOKING_VERTEX: u32 = 0x1684;
pub const SET_USER_CLIP_OP: u32 = 0x1940;
pub const SET_LOGIC_OP: u32 = 0x19c4;
pub const SET_SUBTILING_PERF_KNOB_A: u32 = 0x1b0c;
pub const SET_SUBTILING_PERF_KNOB_B: u32 = 0x1b10;
pub const SET_API_MANDATED_EARLY_Z: u32 = 0x1b14;
pub const SET_ANTI_ALIAS_ENABLE: u32 = 0x1d24;
pub const SET_ANTI_ALIAS_ALPHA_CONTROL: u32 = 0x1d6c;
pub const SET_ANTI_ALIAS: u32 = 0x1d70;

pub const fn set_blend(target: u32) -> u32 {
    SET_BLEND_BASE + target * 4
}

pub const fn set_blend_per_target_separate_for_alpha(target: u32) -> u32 {
    0x1780 + target * 0x20
}

pub const fn set_ct_write(target: u32) -> u32 {
    0x1a00 + target * 4
}

pub const fn set_pipeline_shader(index: u32) -> u32 {
    0x2000 + index * 0x40
}

pub const fn set_pipeline_register_count(index: u32) -> u32 {
    0x200c + index * 0x40
}

/// `SET_PIPELINE_SHADER` type field, also used as the pipeline slot index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ShaderType {
    Vertex = 1,
    TessellationInit = 2,
    Tessellation = 3,
    Geometry = 4,
    Pixel = 5,
}

pub const fn pipeline_shader(enable: bool, ty: ShaderType) -> u32 {
    (enable as u32) | ((ty as u32) << 4)
}

pub const VIEWPORT_Z_CLIP_NEGATIVE_W_TO_POSITIVE_W: u32 = 0;
pub const VIEWPORT_Z_CLIP_ZERO_TO_POSITIVE_W: u32 = 1;

/// `SET_VIEWPORT_CLIP_CONTROL` with the fixed policy used by every pipeline:
/// clamp-to-[0,1] min Z, clip max Z, 256x guardbands, W-zero clip, Z
/// guardband tied to XY.
pub const fn viewport_clip_control_default() -> u32 {
    const MIN_Z_ZERO_MAX_Z_ONE_TRUE: u32 = 1;
    const PIXEL_MIN_Z_CLAMP: u32 = 1 << 1;
    const PIXEL_MAX_Z_CLIP: u32 = 0 << 2;
    const GEOMETRY_GUARDBAND_SCALE_256: u32 = 1 << 3;
    const LINE_POINT_CULL_GUARDBAND_SCALE_256: u32 = 1 << 7;
    const GEOMETRY_CLIP_WZERO_CLIP: u32 = 0 << 11;
    const GEOMETRY_GUARDBAND_Z_SAME_AS_XY: u32 = 0 << 15;
    MIN_Z_ZERO_MAX_Z_ONE_TRUE
        | PIXEL_MIN_Z_CLAMP
        | PIXEL_MAX_Z_CLIP
        | GEOMETRY_GUARDBAND_SCALE_256
        | LINE_POINT_CULL_GUARDBAND_SCALE_256
        | GEOMETRY_CLIP_WZERO_CLIP
        | GEOMETRY_GUARDBAND_Z_SAME_AS_XY
}

pub const POLYGON_MODE_POINT: u32 = 0x1b00;
pub const POLYGON_MODE_LINE: u32 = 0x1b01;
pub const POLYGON_MODE_FILL: u32 = 0x1b02;

pub const PROVOKING_VERTEX_FIRST: u32 = 0;
pub const PROVOKING_VERTEX_LAST: u32 = 1;

pub const fn anti_alias_alpha_control(alpha_to_coverage: bool, alpha_to_one: bool) -> u32 {
    (alpha_to_coverage as u32) | ((alpha_to_one as u32) << 4)
}

pub const fn ct_write(r: bool, g: bool, b: bool, a: bool) -> u32 {
    (r as u32) | ((g as u32) << 4) | ((b as u32) << 8) | ((a as u32) << 12)
}

pub const RT_LAYER_CONTROL_V_SELECTS_LAYER: u32 = 0;
pub const RT_LAYER_CONTROL_GEOMETRY_SHADER_SELECTS_LAYER: u32 = 1;

pub const fn rt_layer(v: u32, control: u32) -> u32 {
    (v & 0xffff) | ((control & 1) << 16)
}

pub const fn subtiling_perf_knob_a(
    register_file: u32,
    pixel_output_buffer: u32,
    triangle_ram: u32,
    max_quads: u32,
) -> u32 {
    (register_file & 0xff)
        | ((pixel_output_buffer & 0xff) << 8)
        | ((triangle_ram & 0xff) << 16)
        | ((max_quads & 0xff) << 24)
}

pub const BLEND_OP_OGL_FUNC_ADD: u32 = 0x8006;
pub const BLEND_OP_OGL_MIN: u32 = 0x8007;
pub const BLEND_OP_OGL_MAX: u32 = 0x8008;
pub const BLEND_OP_OGL_FUNC_SUBTRACT: u32 = 0x800a;
pub const BLEND_OP_OGL_FUNC_REVERSE_SUBTRACT: u32 = 0x800b;

pub const BLEND_COEFF_OGL_ZERO: u32 = 0x4000;
pub const BLEND_COEFF_OGL_ONE: u32 = 0x4001;
pub const BLEND_COEFF_OGL_SRC_COLOR: u32 = 0x4300;
pub const BLEND_COEFF_OGL_ONE_MINUS_SRC_COLOR: u32 = 0x4301;
pub const BLEND_COEFF_OGL_SRC_ALPHA: u32 = 0x4302;
pub const BLEND_COEFF_OGL_ONE_MINUS_SRC_ALPHA: u32 = 0x4303;
pub const BLEND_COEFF_OGL_DST_ALPHA: u32 = 0x4304;
pub const BLEND_COEFF_OGL_ONE_MINUS_DST_ALPHA: u32 = 0x4305;
pub const BLEND_COEFF_OGL_DST_COLOR: u32 = 0x4306;
pub const BLEND_COEFF_OGL_ONE_MINUS_DST_COLOR: u32 = 0x4307;
pub const BLEND_COEFF_OGL_SRC_ALPHA_SATURATE: u32 = 0x4308;
pub const BLEND_COEFF_OGL_CONSTANT_COLOR: u32 = 0xc001;
pub const BLEND_COEFF_OGL_ONE_MINUS_CONSTANT_COLOR: u32 = 0xc002;
pub const BLEND_COEFF_OGL_CONSTANT_ALPHA: u32 = 0xc003;
pub const BLEND_COEFF_OGL_ONE_MINUS_CONSTANT_ALPHA: u32 = 0xc004;
pub const BLEND_COEFF_OGL_SRC1COLOR: u32 = 0xc900;
pub const BLEND_COEFF_OGL_INVSRC1COLOR: u32 = 0xc901;
pub const BLEND_COEFF_OGL_SRC1ALPHA: u32 = 0xc902;
pub const BLEND_COEFF_OGL_INVSRC1ALPHA: u32 = 0xc903;

/// `INVALIDATE_*_CACHE_NO_WFI` payload invalidating every line.
pub const INVALIDATE_CACHE_LINES_ALL: u32 = 0;
