//! Graphics pipelines.
//!
//! Everything static about a pipeline is encoded once into a preamble method
//! stream at creation. Binding copies that stream into the command buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use gpu_protocol::class::{cl9097, clb197, clc397, ClassSet, VOLTA_A};
use gpu_protocol::push::SUBC_3D;
use gpu_protocol::uapi::BoAccess;
use tracing::debug;

use crate::bo::Bo;
use crate::caps::GenOps;
use crate::cmd_buffer::{CmdBuffer, DirtyState};
use crate::push::PushBuilder;
use crate::zs_clear::ColorMask;
use crate::{Error, Result};

pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// Header word carrying the "shader writes the layer" bit.
const HDR_LAYER_WORD: usize = 13;
const HDR_LAYER_BIT: u32 = 1 << 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessCtrl,
    TessEval,
    Geometry,
    Fragment,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 5] = [
        ShaderStage::Vertex,
        ShaderStage::TessCtrl,
        ShaderStage::TessEval,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
    ];

    fn hw_type(self) -> cl9097::ShaderType {
        match self {
            ShaderStage::Vertex => cl9097::ShaderType::Vertex,
            ShaderStage::TessCtrl => cl9097::ShaderType::TessellationInit,
            ShaderStage::TessEval => cl9097::ShaderType::Tessellation,
            ShaderStage::Geometry => cl9097::ShaderType::Geometry,
            ShaderStage::Fragment => cl9097::ShaderType::Pixel,
        }
    }
}

/// A compiled graphics stage as produced by the shader compiler.
#[derive(Clone, Debug, Default)]
pub struct GraphicsShader {
    pub code_addr: u64,
    /// Backing BO, when the code does not live in the device shader heap.
    pub bo: Option<Bo>,
    pub num_gprs: u8,
    pub slm_size: u32,
    pub hdr: [u32; 32],
    /// Vertex stages: user clip/cull plane masks.
    pub clip_enable: u8,
    pub cull_enable: u8,
    /// Fragment stage toggles.
    pub early_z: bool,
    pub post_depth_coverage: bool,
    pub zcull_flags: u32,
    /// The shader stores to memory or uses bindless textures.
    pub writes_memory: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

impl PolygonMode {
    fn hw(self) -> u32 {
        match self {
            PolygonMode::Fill => cl9097::POLYGON_MODE_FILL,
            PolygonMode::Line => cl9097::POLYGON_MODE_LINE,
            PolygonMode::Point => cl9097::POLYGON_MODE_POINT,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProvokingVertex {
    #[default]
    First,
    Last,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewportState {
    pub depth_clip_negative_one_to_one: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RasterizationState {
    pub polygon_mode: PolygonMode,
    pub provoking_vertex: ProvokingVertex,
    pub line_stipple_enable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MultisampleState {
    pub rasterization_samples: u32,
    pub sample_shading_enable: bool,
    pub alpha_to_coverage_enable: bool,
    pub alpha_to_one_enable: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            rasterization_samples: 1,
            sample_shading_enable: false,
            alpha_to_coverage_enable: false,
            alpha_to_one_enable: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendOp {
    fn hw(self) -> u32 {
        match self {
            BlendOp::Add => cl9097::BLEND_OP_OGL_FUNC_ADD,
            BlendOp::Subtract => cl9097::BLEND_OP_OGL_FUNC_SUBTRACT,
            BlendOp::ReverseSubtract => cl9097::BLEND_OP_OGL_FUNC_REVERSE_SUBTRACT,
            BlendOp::Min => cl9097::BLEND_OP_OGL_MIN,
            BlendOp::Max => cl9097::BLEND_OP_OGL_MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    #[default]
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
    SrcAlphaSaturate,
    Src1Color,
    OneMinusSrc1Color,
    Src1Alpha,
    OneMinusSrc1Alpha,
}

impl BlendFactor {
    fn hw(self) -> u32 {
        use cl9097::*;
        match self {
            BlendFactor::Zero => BLEND_COEFF_OGL_ZERO,
            BlendFactor::One => BLEND_COEFF_OGL_ONE,
            BlendFactor::SrcColor => BLEND_COEFF_OGL_SRC_COLOR,
            BlendFactor::OneMinusSrcColor => BLEND_COEFF_OGL_ONE_MINUS_SRC_COLOR,
            BlendFactor::DstColor => BLEND_COEFF_OGL_DST_COLOR,
            BlendFactor::OneMinusDstColor => BLEND_COEFF_OGL_ONE_MINUS_DST_COLOR,
            BlendFactor::SrcAlpha => BLEND_COEFF_OGL_SRC_ALPHA,
            BlendFactor::OneMinusSrcAlpha => BLEND_COEFF_OGL_ONE_MINUS_SRC_ALPHA,
            BlendFactor::DstAlpha => BLEND_COEFF_OGL_DST_ALPHA,
            BlendFactor::OneMinusDstAlpha => BLEND_COEFF_OGL_ONE_MINUS_DST_ALPHA,
            BlendFactor::ConstantColor => BLEND_COEFF_OGL_CONSTANT_COLOR,
            BlendFactor::OneMinusConstantColor => BLEND_COEFF_OGL_ONE_MINUS_CONSTANT_COLOR,
            BlendFactor::ConstantAlpha => BLEND_COEFF_OGL_CONSTANT_ALPHA,
            BlendFactor::OneMinusConstantAlpha => BLEND_COEFF_OGL_ONE_MINUS_CONSTANT_ALPHA,
            BlendFactor::SrcAlphaSaturate => BLEND_COEFF_OGL_SRC_ALPHA_SATURATE,
            BlendFactor::Src1Color => BLEND_COEFF_OGL_SRC1COLOR,
            BlendFactor::OneMinusSrc1Color => BLEND_COEFF_OGL_INVSRC1COLOR,
            BlendFactor::Src1Alpha => BLEND_COEFF_OGL_SRC1ALPHA,
            BlendFactor::OneMinusSrc1Alpha => BLEND_COEFF_OGL_INVSRC1ALPHA,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: BlendFactor,
    pub dst_color_blend_factor: BlendFactor,
    pub color_blend_op: BlendOp,
    pub src_alpha_blend_factor: BlendFactor,
    pub dst_alpha_blend_factor: BlendFactor,
    pub alpha_blend_op: BlendOp,
    pub write_mask: ColorMask,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: BlendFactor::One,
            dst_color_blend_factor: BlendFactor::Zero,
            color_blend_op: BlendOp::Add,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::Zero,
            alpha_blend_op: BlendOp::Add,
            write_mask: ColorMask::all(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorBlendState {
    /// The logic op itself is dynamic.
    pub logic_op_enable: bool,
    pub attachments: Vec<ColorBlendAttachment>,
}

bitflags! {
    /// State left to be set at record time.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DynamicState: u32 {
        const VIEWPORT = 1 << 0;
        const SCISSOR = 1 << 1;
        const LINE_WIDTH = 1 << 2;
        const DEPTH_BIAS = 1 << 3;
        const BLEND_CONSTANTS = 1 << 4;
        const LOGIC_OP = 1 << 5;
        const CULL_MODE = 1 << 6;
        const FRONT_FACE = 1 << 7;
        const PRIMITIVE_RESTART = 1 << 8;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
    /// Instance step rate; only meaningful for per-instance bindings.
    pub divisor: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub offset: u32,
    pub format: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VertexInputState {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexInputState {
    /// Every per-instance divisor is 0 or 1.
    pub fn trivial_divisors(&self) -> bool {
        self.bindings
            .iter()
            .all(|b| !b.per_instance || b.divisor <= 1)
    }
}

/// Creation parameters. Absent state blocks emit nothing.
#[derive(Clone, Debug, Default)]
pub struct GraphicsPipelineInfo {
    pub vertex: Option<GraphicsShader>,
    pub tess_ctrl: Option<GraphicsShader>,
    pub tess_eval: Option<GraphicsShader>,
    pub geometry: Option<GraphicsShader>,
    pub fragment: Option<GraphicsShader>,
    pub vertex_input: VertexInputState,
    pub viewport: Option<ViewportState>,
    pub rasterization: Option<RasterizationState>,
    pub multisample: Option<MultisampleState>,
    pub color_blend: Option<ColorBlendState>,
    pub dynamic: DynamicState,
}

impl GraphicsPipelineInfo {
    pub fn stage(&self, stage: ShaderStage) -> Option<&GraphicsShader> {
        match stage {
            ShaderStage::Vertex => self.vertex.as_ref(),
            ShaderStage::TessCtrl => self.tess_ctrl.as_ref(),
            ShaderStage::TessEval => self.tess_eval.as_ref(),
            ShaderStage::Geometry => self.geometry.as_ref(),
            ShaderStage::Fragment => self.fragment.as_ref(),
        }
    }
}

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct GraphicsPipeline {
    id: u64,
    preamble: Vec<u32>,
    shader_bos: Vec<Bo>,
    slm_size: u32,
    vertex_input: VertexInputState,
    dynamic: DynamicState,
    has_tess: bool,
    has_geometry: bool,
    writes_memory: bool,
    provoking_vertex: ProvokingVertex,
}

impl GraphicsPipeline {
    pub fn new(classes: &ClassSet, info: &GraphicsPipelineInfo) -> Result<Self> {
        if classes.eng3d < VOLTA_A {
            return Err(Error::invalid(format!(
                "graphics pipelines need 64-bit program addresses (3D class {:#x})",
                classes.eng3d
            )));
        }
        let gen = GenOps::for_classes(classes);
        let mut p = PushBuilder::new();

        let mut last_geom: Option<&GraphicsShader> = None;
        let mut shader_bos = Vec::new();
        let mut slm_size = 0;
        let mut writes_memory = false;
        for stage in ShaderStage::ALL {
            let shader = info.stage(stage);
            emit_stage(&mut p, &gen, stage, shader)?;
            let Some(shader) = shader else {
                continue;
            };
            if stage != ShaderStage::Fragment {
                last_geom = Some(shader);
                writes_memory |= shader.writes_memory;
            }
            if let Some(bo) = &shader.bo {
                shader_bos.push(bo.clone());
            }
            slm_size = slm_size.max(shader.slm_size);
        }

        let gs_selects_layer =
            last_geom.is_some_and(|s| s.hdr[HDR_LAYER_WORD] & HDR_LAYER_BIT != 0);
        p.immd(
            SUBC_3D,
            cl9097::SET_RT_LAYER,
            cl9097::rt_layer(
                0,
                if gs_selects_layer {
                    cl9097::RT_LAYER_CONTROL_GEOMETRY_SHADER_SELECTS_LAYER
                } else {
                    cl9097::RT_LAYER_CONTROL_V_SELECTS_LAYER
                },
            ),
        );

        if let Some(vp) = &info.viewport {
            emit_viewport_state(&mut p, vp);
        }
        if let Some(rs) = &info.rasterization {
            emit_rasterization_state(&mut p, rs);
        }
        if let Some(ms) = &info.multisample {
            emit_multisample_state(&mut p, ms)?;
        }
        if let Some(cb) = &info.color_blend {
            emit_color_blend_state(&mut p, cb)?;
        }

        let id = NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, dwords = p.len(), "graphics pipeline preamble built");
        Ok(Self {
            id,
            preamble: p.finish(),
            shader_bos,
            slm_size,
            vertex_input: info.vertex_input.clone(),
            dynamic: info.dynamic,
            has_tess: info.tess_eval.is_some() || info.tess_ctrl.is_some(),
            has_geometry: info.geometry.is_some(),
            writes_memory,
            provoking_vertex: info
                .rasterization
                .map_or(ProvokingVertex::First, |rs| rs.provoking_vertex),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn preamble(&self) -> &[u32] {
        &self.preamble
    }

    pub fn slm_size(&self) -> u32 {
        self.slm_size
    }

    pub fn vertex_input(&self) -> &VertexInputState {
        &self.vertex_input
    }

    pub fn dynamic(&self) -> DynamicState {
        self.dynamic
    }

    pub fn has_tess(&self) -> bool {
        self.has_tess
    }

    pub fn has_geometry(&self) -> bool {
        self.has_geometry
    }

    /// Some pre-raster stage stores to memory.
    pub fn writes_memory(&self) -> bool {
        self.writes_memory
    }

    pub fn provoking_vertex(&self) -> ProvokingVertex {
        self.provoking_vertex
    }
}

fn emit_stage(
    p: &mut PushBuilder,
    gen: &GenOps,
    stage: ShaderStage,
    shader: Option<&GraphicsShader>,
) -> Result<()> {
    let ty = stage.hw_type();
    let idx = ty as u32;
    p.immd(
        SUBC_3D,
        cl9097::set_pipeline_shader(idx),
        cl9097::pipeline_shader(shader.is_some(), ty),
    );
    let Some(shader) = shader else {
        return Ok(());
    };

    p.mthd(SUBC_3D, clc397::set_pipeline_program_address_a(idx))
        .inline_addr(shader.code_addr);
    p.immd(
        SUBC_3D,
        cl9097::set_pipeline_register_count(idx),
        shader.num_gprs as u32,
    );

    match stage {
        ShaderStage::Vertex => {
            let clip_cull = (shader.clip_enable | shader.cull_enable) as u32;
            p.immd(SUBC_3D, cl9097::SET_USER_CLIP_ENABLE, clip_cull);
            p.immd(SUBC_3D, cl9097::SET_USER_CLIP_OP, shader.cull_enable as u32);
        }
        ShaderStage::Fragment => {
            p.mthd(SUBC_3D, cl9097::SET_SUBTILING_PERF_KNOB_A)
                .inline_data(cl9097::subtiling_perf_knob_a(0x10, 0x40, 0x16, 0x20))
                .inline_data(0x20);
            p.immd(SUBC_3D, cl9097::SET_API_MANDATED_EARLY_Z, shader.early_z as u32);
            if gen.has_post_z_ps_imask {
                p.immd(
                    SUBC_3D,
                    clb197::SET_POST_Z_PS_IMASK,
                    shader.post_depth_coverage as u32,
                );
            } else if shader.post_depth_coverage {
                return Err(Error::invalid("post-depth coverage needs Maxwell-B or later"));
            }
            p.mthd(SUBC_3D, cl9097::SET_ZCULL_BOUNDS)
                .inline_data(shader.zcull_flags);
        }
        // Tessellation and geometry stages have no extra static state.
        _ => {}
    }
    Ok(())
}

fn emit_viewport_state(p: &mut PushBuilder, vp: &ViewportState) {
    p.immd(
        SUBC_3D,
        cl9097::SET_VIEWPORT_Z_CLIP,
        if vp.depth_clip_negative_one_to_one {
            cl9097::VIEWPORT_Z_CLIP_NEGATIVE_W_TO_POSITIVE_W
        } else {
            cl9097::VIEWPORT_Z_CLIP_ZERO_TO_POSITIVE_W
        },
    );
}

fn emit_rasterization_state(p: &mut PushBuilder, rs: &RasterizationState) {
    p.immd(
        SUBC_3D,
        cl9097::SET_VIEWPORT_CLIP_CONTROL,
        cl9097::viewport_clip_control_default(),
    );
    let mode = rs.polygon_mode.hw();
    p.mthd(SUBC_3D, cl9097::SET_FRONT_POLYGON_MODE)
        .inline_data(mode)
        .inline_data(mode);
    p.immd(
        SUBC_3D,
        cl9097::SET_PROVOKING_VERTEX,
        match rs.provoking_vertex {
            ProvokingVertex::First => cl9097::PROVOKING_VERTEX_FIRST,
            ProvokingVertex::Last => cl9097::PROVOKING_VERTEX_LAST,
        },
    );
    p.immd(SUBC_3D, cl9097::SET_LINE_STIPPLE, rs.line_stipple_enable as u32);
}

fn emit_multisample_state(p: &mut PushBuilder, ms: &MultisampleState) -> Result<()> {
    let samples = ms.rasterization_samples;
    if !samples.is_power_of_two() || samples > 16 {
        return Err(Error::invalid(format!("{samples} rasterization samples")));
    }
    p.immd(SUBC_3D, cl9097::SET_ANTI_ALIAS, samples.trailing_zeros());
    p.immd(
        SUBC_3D,
        cl9097::SET_ANTI_ALIAS_ENABLE,
        ms.sample_shading_enable as u32,
    );
    p.immd(
        SUBC_3D,
        cl9097::SET_ANTI_ALIAS_ALPHA_CONTROL,
        cl9097::anti_alias_alpha_control(ms.alpha_to_coverage_enable, ms.alpha_to_one_enable),
    );
    p.immd(SUBC_3D, cl9097::SET_ANTI_ALIASED_LINE, 0);
    Ok(())
}

fn emit_color_blend_state(p: &mut PushBuilder, cb: &ColorBlendState) -> Result<()> {
    if cb.attachments.len() > MAX_COLOR_ATTACHMENTS {
        return Err(Error::invalid(format!(
            "{} color attachments",
            cb.attachments.len()
        )));
    }
    p.immd(SUBC_3D, cl9097::SET_BLEND_STATE_PER_TARGET, 1);
    p.immd(SUBC_3D, cl9097::SET_LOGIC_OP, cb.logic_op_enable as u32);

    for (a, att) in cb.attachments.iter().enumerate() {
        let a = a as u32;
        p.immd(SUBC_3D, cl9097::set_blend(a), att.blend_enable as u32);
        p.mthd(SUBC_3D, cl9097::set_blend_per_target_separate_for_alpha(a))
            .inline_data(1)
            .inline_data(att.color_blend_op.hw())
            .inline_data(att.src_color_blend_factor.hw())
            .inline_data(att.dst_color_blend_factor.hw())
            .inline_data(att.alpha_blend_op.hw())
            .inline_data(att.src_alpha_blend_factor.hw())
            .inline_data(att.dst_alpha_blend_factor.hw());
        let m = att.write_mask;
        p.immd(
            SUBC_3D,
            cl9097::set_ct_write(a),
            cl9097::ct_write(
                m.contains(ColorMask::R),
                m.contains(ColorMask::G),
                m.contains(ColorMask::B),
                m.contains(ColorMask::A),
            ),
        );
    }
    Ok(())
}

impl CmdBuffer {
    /// Replay the pipeline's preamble and make it the current pipeline.
    pub fn bind_graphics_pipeline(&mut self, pipeline: Arc<GraphicsPipeline>) -> Result<()> {
        self.push_raw(pipeline.preamble())?;
        for bo in &pipeline.shader_bos {
            self.ref_bo(bo, BoAccess::RD);
        }
        self.require_slm(pipeline.slm_size());
        self.meta.pipeline_id = Some(pipeline.id());
        self.dirty |= DirtyState::PIPELINE;
        self.gfx_pipeline = Some(pipeline);
        Ok(())
    }

    pub fn graphics_pipeline(&self) -> Option<&Arc<GraphicsPipeline>> {
        self.gfx_pipeline.as_ref()
    }
}
