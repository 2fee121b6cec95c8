//! Depth/stencil clears rendered through a compatible colour format.
//!
//! Used when a clear covers layers the fast path cannot reach. Each layer
//! gets its own single-attachment view and framebuffer, created through
//! [`MetaClearOps`] and parked on the command buffer until it is reset.

use bitflags::bitflags;
use tracing::debug;

use crate::cmd_buffer::{BindPoint, CmdBuffer, Rect2D, Viewport};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DsFormat {
    D16Unorm,
    D32Sfloat,
    X8D24Unorm,
    D24UnormS8Uint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    R16Uint,
    R32Sfloat,
    R8G8B8A8Uint,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ImageAspects: u32 {
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ColorMask: u32 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
    }
}

impl DsFormat {
    pub fn aspects(self) -> ImageAspects {
        match self {
            DsFormat::D24UnormS8Uint => ImageAspects::DEPTH | ImageAspects::STENCIL,
            _ => ImageAspects::DEPTH,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            DsFormat::D16Unorm => 2,
            _ => 4,
        }
    }
}

/// Packing and colour-format selection for depth/stencil values.
pub struct ZsClear;

impl ZsClear {
    /// Colour format sharing the depth/stencil format's memory layout.
    /// Combined formats map to four channels so aspects can be masked.
    pub fn color_format(format: DsFormat) -> ColorFormat {
        match format {
            DsFormat::D16Unorm => ColorFormat::R16Uint,
            DsFormat::D32Sfloat => ColorFormat::R32Sfloat,
            DsFormat::X8D24Unorm | DsFormat::D24UnormS8Uint => ColorFormat::R8G8B8A8Uint,
        }
    }

    /// The in-memory word for `(depth, stencil)`. D24 keeps depth in the low
    /// 24 bits and stencil in the top byte.
    pub fn pack(format: DsFormat, depth: f32, stencil: u8) -> u32 {
        match format {
            DsFormat::D16Unorm => unorm(depth, 0xffff),
            DsFormat::D32Sfloat => depth.to_bits(),
            DsFormat::X8D24Unorm => unorm(depth, 0xff_ffff),
            DsFormat::D24UnormS8Uint => unorm(depth, 0xff_ffff) | ((stencil as u32) << 24),
        }
    }

    /// Clear colour and channel mask that reproduce the requested aspects.
    pub fn color_value(
        format: DsFormat,
        aspects: ImageAspects,
        depth: f32,
        stencil: u8,
    ) -> ([u32; 4], ColorMask) {
        let zs = Self::pack(format, depth, stencil);
        let mut color = [0u32; 4];
        if Self::color_format(format) != ColorFormat::R8G8B8A8Uint {
            color[0] = zs;
            return (color, ColorMask::R);
        }

        // The hardware keeps D24 in the most significant channels.
        let mut mask = ColorMask::empty();
        if aspects.contains(ImageAspects::STENCIL) {
            mask |= ColorMask::R;
            color[0] = zs >> 24;
        }
        if aspects.contains(ImageAspects::DEPTH) {
            mask |= ColorMask::G | ColorMask::B | ColorMask::A;
            color[1] = zs & 0xff;
            color[2] = (zs >> 8) & 0xff;
            color[3] = (zs >> 16) & 0xff;
        }
        (color, mask)
    }
}

fn unorm(v: f32, max: u32) -> u32 {
    let v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
    (v as f64 * max as f64).round() as u32
}

/// The depth/stencil attachment being cleared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZsAttachment {
    pub format: DsFormat,
    pub base_layer: u32,
    pub layer_count: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClearRect {
    pub rect: Rect2D,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

/// Object creation and drawing for meta clears. Views and framebuffers are
/// kept alive by the command buffer until its next reset.
pub trait MetaClearOps {
    type View: Send + 'static;
    type Framebuffer: Send + 'static;

    fn create_layer_view(&mut self, format: ColorFormat, layer: u32) -> Result<Self::View>;

    fn create_framebuffer(
        &mut self,
        view: &Self::View,
        width: u32,
        height: u32,
    ) -> Result<Self::Framebuffer>;

    /// Record a full-rect quad into `cmd` using the pushed clear colour.
    fn draw_clear(
        &mut self,
        cmd: &mut CmdBuffer,
        framebuffer: &Self::Framebuffer,
        write_mask: ColorMask,
        rect: Rect2D,
    ) -> Result<()>;
}

impl CmdBuffer {
    /// Clear `aspects` of `rect`'s layers by rendering the packed value as a
    /// colour, one layer at a time. Recording state is restored whether or
    /// not the clear succeeds.
    pub fn clear_zs_slow<O: MetaClearOps>(
        &mut self,
        ops: &mut O,
        attachment: &ZsAttachment,
        aspects: ImageAspects,
        depth: f32,
        stencil: u8,
        rect: &ClearRect,
    ) -> Result<()> {
        if !attachment.format.aspects().contains(aspects) {
            return Err(Error::invalid(format!(
                "{aspects:?} not present in {:?}",
                attachment.format
            )));
        }
        let format = ZsClear::color_format(attachment.format);
        let (color, mask) = ZsClear::color_value(attachment.format, aspects, depth, stencil);

        self.meta_begin();
        let result = self.clear_zs_layers(ops, attachment, format, color, mask, rect);
        self.meta_end(result.is_ok());
        if let Err(err) = &result {
            debug!(%err, "slow depth/stencil clear failed");
            self.set_error(err.clone());
        }
        result
    }

    fn clear_zs_layers<O: MetaClearOps>(
        &mut self,
        ops: &mut O,
        attachment: &ZsAttachment,
        format: ColorFormat,
        color: [u32; 4],
        mask: ColorMask,
        rect: &ClearRect,
    ) -> Result<()> {
        let color_bytes: &[u8] = bytemuck::cast_slice(&color);
        for i in 0..rect.layer_count {
            let layer = attachment.base_layer + rect.base_array_layer + i;
            if layer >= attachment.base_layer + attachment.layer_count {
                return Err(Error::invalid(format!("clear of layer {layer} out of range")));
            }
            let view = ops.create_layer_view(format, layer)?;
            let fb = ops.create_framebuffer(&view, attachment.width, attachment.height)?;
            self.add_private(view);

            self.push_constants(BindPoint::Graphics, 0, color_bytes)?;
            self.set_viewport(Viewport {
                x: rect.rect.x as f32,
                y: rect.rect.y as f32,
                width: rect.rect.width as f32,
                height: rect.rect.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            });
            self.set_scissor(rect.rect);
            let drawn = ops.draw_clear(self, &fb, mask, rect.rect);
            self.add_private(fb);
            drawn?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn format_map() {
        assert_eq!(ZsClear::color_format(DsFormat::D16Unorm), ColorFormat::R16Uint);
        assert_eq!(ZsClear::color_format(DsFormat::D32Sfloat), ColorFormat::R32Sfloat);
        assert_eq!(
            ZsClear::color_format(DsFormat::X8D24Unorm),
            ColorFormat::R8G8B8A8Uint
        );
        assert_eq!(
            ZsClear::color_format(DsFormat::D24UnormS8Uint),
            ColorFormat::R8G8B8A8Uint
        );
    }

    #[test]
    fn d24s8_channels() {
        let zs = ZsClear::pack(DsFormat::D24UnormS8Uint, 0.5, 0xab);
        assert_eq!(zs >> 24, 0xab);
        assert_eq!(zs & 0xff_ffff, 0x80_0000);

        let (color, mask) = ZsClear::color_value(
            DsFormat::D24UnormS8Uint,
            ImageAspects::DEPTH | ImageAspects::STENCIL,
            0.5,
            0xab,
        );
        assert_eq!(color, [0xab, zs & 0xff, (zs >> 8) & 0xff, (zs >> 16) & 0xff]);
        assert_eq!(mask, ColorMask::all());
    }

    #[test]
    fn stencil_only_masks_depth_channels() {
        let (color, mask) =
            ZsClear::color_value(DsFormat::D24UnormS8Uint, ImageAspects::STENCIL, 1.0, 3);
        assert_eq!(mask, ColorMask::R);
        assert_eq!(color, [3, 0, 0, 0]);
    }

    #[test]
    fn single_channel_formats() {
        let (color, mask) = ZsClear::color_value(DsFormat::D16Unorm, ImageAspects::DEPTH, 1.0, 0);
        assert_eq!((color[0], mask), (0xffff, ColorMask::R));
        let (color, _) = ZsClear::color_value(DsFormat::D32Sfloat, ImageAspects::DEPTH, 0.25, 0);
        assert_eq!(color[0], 0.25f32.to_bits());
        assert_eq!(ZsClear::pack(DsFormat::D16Unorm, -3.0, 0), 0);
    }
}
