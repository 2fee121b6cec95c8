//! Copy-engine and 2D-engine transfers.
//!
//! Buffer copies split into single-line DMAs. Rectangular copies walk the
//! layers and depth slices of a region, programming the tiled side of each
//! transfer with its block shape and surface extent. Fills, small updates and
//! image clears go through the 2D engine's solid-primitive and
//! pixels-from-CPU paths.

use gpu_protocol::class::cl902d::{self, ColorFormat, SolidPrimMode};
use gpu_protocol::class::cl90b5::{self, BlockSize, GobHeight, LaunchDma, MemoryLayout};
use gpu_protocol::push::{SUBC_2D, SUBC_COPY};
use gpu_protocol::uapi::BoAccess;
use tracing::trace;

use crate::bo::Bo;
use crate::caps::CopySide;
use crate::cmd_buffer::CmdBuffer;
use crate::{Error, Result};

/// Largest single-line DMA.
pub const MAX_LINEAR_COPY: u64 = 1 << 17;
/// Fill pitch; the 2D engine rejects anything wider.
const FILL_PITCH: u32 = 1 << 19;
/// `update_buffer` pitch and size limit.
pub const MAX_UPDATE_SIZE: u64 = 65536;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Offset3D {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3D {
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }
}

/// Block-linear shape of one mip level. Tiles are one GOB wide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tiling {
    pub is_tiled: bool,
    pub gob_height_8: bool,
    pub y_log2: u8,
    pub z_log2: u8,
}

impl Tiling {
    pub const LINEAR: Tiling = Tiling {
        is_tiled: false,
        gob_height_8: false,
        y_log2: 0,
        z_log2: 0,
    };

    pub const fn tiled(y_log2: u8, z_log2: u8) -> Self {
        Self {
            is_tiled: true,
            gob_height_8: true,
            y_log2,
            z_log2,
        }
    }

    fn block_size(&self) -> BlockSize {
        BlockSize {
            width: 0,
            height: self.y_log2 as u32,
            depth: self.z_log2 as u32,
            gob_height: if self.gob_height_8 {
                GobHeight::Fermi8
            } else {
                GobHeight::Tesla4
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageLevel {
    /// Byte offset of the level from the image base.
    pub offset: u64,
    pub row_stride: u32,
    /// Level extent in elements.
    pub extent: Extent3D,
    pub tiling: Tiling,
}

/// An image as the transfer engines see it.
#[derive(Clone, Debug)]
pub struct ImageSurface {
    pub bo: Bo,
    /// Offset of the image inside `bo`.
    pub offset: u64,
    pub array_stride: u64,
    pub layer_count: u32,
    /// Bytes per element.
    pub bpp: u32,
    pub levels: Vec<ImageLevel>,
}

impl ImageSurface {
    pub fn base_address(&self) -> u64 {
        self.bo.address() + self.offset
    }

    pub fn level(&self, level: u32) -> Result<&ImageLevel> {
        self.levels
            .get(level as usize)
            .ok_or_else(|| Error::invalid(format!("image has no level {level}")))
    }
}

/// One side of a rectangular copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopySurface {
    pub base_addr: u64,
    pub offset_el: Offset3D,
    pub base_array_layer: u32,
    /// Full surface extent; only consulted for tiled sides.
    pub extent_el: Extent3D,
    pub row_stride: u32,
    pub array_stride: u64,
    pub tiling: Tiling,
}

impl CopySurface {
    /// Tightly described linear memory at `base_addr`.
    pub fn buffer(base_addr: u64, row_stride: u32, array_stride: u64) -> Self {
        Self {
            base_addr,
            row_stride,
            array_stride,
            ..Self::default()
        }
    }

    pub fn image(
        image: &ImageSurface,
        level: u32,
        offset_el: Offset3D,
        base_array_layer: u32,
    ) -> Result<Self> {
        let lvl = image.level(level)?;
        Ok(Self {
            base_addr: image.base_address() + lvl.offset,
            offset_el,
            base_array_layer,
            extent_el: lvl.extent,
            row_stride: lvl.row_stride,
            array_stride: image.array_stride,
            tiling: lvl.tiling,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyRect {
    pub src: CopySurface,
    pub dst: CopySurface,
    pub bpp: u32,
    pub extent_el: Extent3D,
    pub layer_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubresourceRange {
    pub base_level: u32,
    pub level_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl CmdBuffer {
    /// Byte copy between two GPU addresses in chunks of at most
    /// [`MAX_LINEAR_COPY`].
    pub fn copy_linear(&mut self, mut src: u64, mut dst: u64, mut size: u64) -> Result<()> {
        let launch = LaunchDma::copy(MemoryLayout::Pitch, MemoryLayout::Pitch).bits();
        while size > 0 {
            let bytes = size.min(MAX_LINEAR_COPY);
            let p = self.push(10)?;
            p.mthd(SUBC_COPY, cl90b5::OFFSET_IN_UPPER)
                .inline_addr(src)
                .inline_addr(dst);
            p.mthd(SUBC_COPY, cl90b5::LINE_LENGTH_IN)
                .inline_data(bytes as u32)
                .inline_data(1);
            p.immd(SUBC_COPY, cl90b5::LAUNCH_DMA, launch);
            src += bytes;
            dst += bytes;
            size -= bytes;
        }
        Ok(())
    }

    pub fn copy_buffer(
        &mut self,
        src: &Bo,
        src_offset: u64,
        dst: &Bo,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.ref_bo(src, BoAccess::RD);
        self.ref_bo(dst, BoAccess::WR);
        self.copy_linear(src.address() + src_offset, dst.address() + dst_offset, size)
    }

    /// Rectangular copy, one DMA per layer and depth slice.
    pub fn copy_rect(&mut self, copy: &CopyRect) -> Result<()> {
        let emit_origin = self.gen.emit_copy_origin;
        for w in 0..copy.layer_count {
            let mut src_addr = copy.src.base_addr
                + (w + copy.src.base_array_layer) as u64 * copy.src.array_stride;
            let mut dst_addr = copy.dst.base_addr
                + (w + copy.dst.base_array_layer) as u64 * copy.dst.array_stride;
            if !copy.src.tiling.is_tiled {
                src_addr += linear_offset(&copy.src, copy.bpp);
            }
            if !copy.dst.tiling.is_tiled {
                dst_addr += linear_offset(&copy.dst, copy.bpp);
            }

            for z in 0..copy.extent_el.depth {
                let p = self.push(32)?;
                p.mthd(SUBC_COPY, cl90b5::OFFSET_IN_UPPER)
                    .inline_addr(src_addr)
                    .inline_addr(dst_addr)
                    .inline_data(copy.src.row_stride)
                    .inline_data(copy.dst.row_stride)
                    .inline_data(copy.extent_el.width * copy.bpp)
                    .inline_data(copy.extent_el.height);

                let src_layout = if copy.src.tiling.is_tiled {
                    p.mthd(SUBC_COPY, cl90b5::SET_SRC_BLOCK_SIZE)
                        .inline_data(copy.src.tiling.block_size().bits())
                        .inline_data(copy.src.extent_el.width * copy.bpp)
                        .inline_data(copy.src.extent_el.height)
                        .inline_data(copy.src.extent_el.depth)
                        .inline_data(z + copy.src.offset_el.z);
                    emit_origin(
                        p,
                        CopySide::Src,
                        copy.src.offset_el.x * copy.bpp,
                        copy.src.offset_el.y,
                    );
                    MemoryLayout::BlockLinear
                } else {
                    src_addr += copy.src.array_stride;
                    MemoryLayout::Pitch
                };

                let dst_layout = if copy.dst.tiling.is_tiled {
                    p.mthd(SUBC_COPY, cl90b5::SET_DST_BLOCK_SIZE)
                        .inline_data(copy.dst.tiling.block_size().bits())
                        .inline_data(copy.dst.extent_el.width * copy.bpp)
                        .inline_data(copy.dst.extent_el.height)
                        .inline_data(copy.dst.extent_el.depth)
                        .inline_data(z + copy.dst.offset_el.z);
                    emit_origin(
                        p,
                        CopySide::Dst,
                        copy.dst.offset_el.x * copy.bpp,
                        copy.dst.offset_el.y,
                    );
                    MemoryLayout::BlockLinear
                } else {
                    dst_addr += copy.dst.array_stride;
                    MemoryLayout::Pitch
                };

                p.immd(
                    SUBC_COPY,
                    cl90b5::LAUNCH_DMA,
                    LaunchDma::copy(src_layout, dst_layout).bits(),
                );
            }
        }
        trace!(
            layers = copy.layer_count,
            depth = copy.extent_el.depth,
            "copy rect"
        );
        Ok(())
    }

    /// Buffer rows to an image region.
    pub fn copy_buffer_to_image(
        &mut self,
        src: &Bo,
        src_offset: u64,
        row_stride: u32,
        image_stride: u64,
        dst: &ImageSurface,
        level: u32,
        offset_el: Offset3D,
        base_layer: u32,
        layer_count: u32,
        extent_el: Extent3D,
    ) -> Result<()> {
        self.ref_bo(src, BoAccess::RD);
        self.ref_bo(&dst.bo, BoAccess::WR);
        let copy = CopyRect {
            src: CopySurface::buffer(src.address() + src_offset, row_stride, image_stride),
            dst: CopySurface::image(dst, level, offset_el, base_layer)?,
            bpp: dst.bpp,
            extent_el,
            layer_count,
        };
        self.copy_rect(&copy)
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: &ImageSurface,
        level: u32,
        offset_el: Offset3D,
        base_layer: u32,
        layer_count: u32,
        extent_el: Extent3D,
        dst: &Bo,
        dst_offset: u64,
        row_stride: u32,
        image_stride: u64,
    ) -> Result<()> {
        self.ref_bo(&src.bo, BoAccess::RD);
        self.ref_bo(dst, BoAccess::WR);
        let copy = CopyRect {
            src: CopySurface::image(src, level, offset_el, base_layer)?,
            dst: CopySurface::buffer(dst.address() + dst_offset, row_stride, image_stride),
            bpp: src.bpp,
            extent_el,
            layer_count,
        };
        self.copy_rect(&copy)
    }

    /// Image to image; both sides must share an element size.
    pub fn copy_image(
        &mut self,
        src: &ImageSurface,
        src_level: u32,
        src_offset: Offset3D,
        src_layer: u32,
        dst: &ImageSurface,
        dst_level: u32,
        dst_offset: Offset3D,
        dst_layer: u32,
        layer_count: u32,
        extent_el: Extent3D,
    ) -> Result<()> {
        if src.bpp != dst.bpp {
            return Err(Error::invalid(format!(
                "image copy between {} and {} byte elements",
                src.bpp, dst.bpp
            )));
        }
        self.ref_bo(&src.bo, BoAccess::RD);
        self.ref_bo(&dst.bo, BoAccess::WR);
        let copy = CopyRect {
            src: CopySurface::image(src, src_level, src_offset, src_layer)?,
            dst: CopySurface::image(dst, dst_level, dst_offset, dst_layer)?,
            bpp: src.bpp,
            extent_el,
            layer_count,
        };
        self.copy_rect(&copy)
    }

    /// Fill `range` bytes at `offset` with `value`. Offsets and sizes are in
    /// whole dwords.
    ///
    /// The buffer is viewed as rows of [`FILL_PITCH`] bytes: the tail of the
    /// first row and the head of the last are drawn as lines, anything in
    /// between as one rect.
    pub fn fill_buffer(&mut self, dst: &Bo, offset: u64, range: u64, value: u32) -> Result<()> {
        if offset % 4 != 0 || range % 4 != 0 {
            return Err(Error::invalid("fill offset and size must be dword aligned"));
        }
        self.ref_bo(dst, BoAccess::WR);

        let start = offset / 4;
        let end = start + range / 4;
        let line = (FILL_PITCH / 4) as u64;
        let (y0, x0) = ((start / line) as u32, (start % line) as u32);
        let (y1, x1) = ((end / line) as u32, (end % line) as u32);
        let line = line as u32;

        let p = self.push(40)?;
        p.immd(SUBC_2D, cl902d::SET_OPERATION, cl902d::OPERATION_SRCCOPY);
        p.mthd(SUBC_2D, cl902d::SET_DST_FORMAT)
            .inline_data(ColorFormat::A8B8G8R8 as u32)
            .inline_data(cl902d::MEMORY_LAYOUT_PITCH);
        p.mthd(SUBC_2D, cl902d::SET_DST_PITCH).inline_data(FILL_PITCH);
        p.mthd(SUBC_2D, cl902d::SET_DST_OFFSET_UPPER)
            .inline_addr(dst.address());
        p.mthd(SUBC_2D, cl902d::RENDER_SOLID_PRIM_MODE)
            .inline_data(SolidPrimMode::Lines as u32)
            .inline_data(ColorFormat::A8B8G8R8 as u32)
            .inline_data(value);

        p.mthd(SUBC_2D, cl902d::render_solid_prim_point_set_x(0))
            .inline_data(x0)
            .inline_data(y0)
            .inline_data(if y0 == y1 { x1 } else { line })
            .inline_data(y0);

        if y0 + 1 < y1 {
            p.immd(
                SUBC_2D,
                cl902d::RENDER_SOLID_PRIM_MODE,
                SolidPrimMode::Rects as u32,
            );
            p.mthd(SUBC_2D, cl902d::render_solid_prim_point_set_x(0))
                .inline_data(0)
                .inline_data(y0 + 1)
                .inline_data(line)
                .inline_data(y1);
            p.immd(
                SUBC_2D,
                cl902d::RENDER_SOLID_PRIM_MODE,
                SolidPrimMode::Lines as u32,
            );
        }

        if y0 < y1 {
            p.mthd(SUBC_2D, cl902d::render_solid_prim_point_set_x(0))
                .inline_data(0)
                .inline_data(y1)
                .inline_data(x1)
                .inline_data(y1);
        }
        Ok(())
    }

    /// Write `data` inline through the 2D engine. At most
    /// [`MAX_UPDATE_SIZE`] bytes, dword sized.
    pub fn update_buffer(&mut self, dst: &Bo, offset: u64, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        if size > MAX_UPDATE_SIZE || size % 4 != 0 || offset % 4 != 0 {
            return Err(Error::invalid(format!(
                "update of {size} bytes at {offset:#x}"
            )));
        }
        self.ref_bo(dst, BoAccess::WR);

        let pitch = MAX_UPDATE_SIZE as u32;
        let words: Vec<u32> = data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let p = self.push(32 + words.len() + words.len() / 0x1fff + 1)?;
        p.immd(SUBC_2D, cl902d::SET_OPERATION, cl902d::OPERATION_SRCCOPY);
        p.mthd(SUBC_2D, cl902d::SET_DST_OFFSET_UPPER)
            .inline_addr(dst.address());
        p.mthd(SUBC_2D, cl902d::SET_DST_FORMAT)
            .inline_data(ColorFormat::A8B8G8R8 as u32)
            .inline_data(cl902d::MEMORY_LAYOUT_PITCH);
        p.mthd(SUBC_2D, cl902d::SET_DST_PITCH).inline_data(pitch);
        p.immd(
            SUBC_2D,
            cl902d::SET_PIXELS_FROM_CPU_DATA_TYPE,
            cl902d::PIXELS_FROM_CPU_DATA_TYPE_COLOR,
        );
        p.immd(
            SUBC_2D,
            cl902d::SET_PIXELS_FROM_CPU_COLOR_FORMAT,
            ColorFormat::A8B8G8R8 as u32,
        );
        p.mthd(SUBC_2D, cl902d::SET_PIXELS_FROM_CPU_SRC_WIDTH)
            .inline_data((size / 4) as u32)
            .inline_data(1)
            .inline_data(0)
            .inline_data(1)
            .inline_data(0)
            .inline_data(1)
            .inline_data(0)
            .inline_data(((offset % pitch as u64) / 4) as u32)
            .inline_data(0)
            .inline_data((offset / pitch as u64) as u32);
        p.ninc(SUBC_2D, cl902d::PIXELS_FROM_CPU_DATA)
            .inline_array(&words);
        Ok(())
    }

    /// Solid clear of every level, layer and depth slice in `ranges` with a
    /// colour already packed to the image's format.
    pub fn clear_color_image(
        &mut self,
        image: &ImageSurface,
        packed: [u32; 4],
        ranges: &[SubresourceRange],
    ) -> Result<()> {
        let format = match image.bpp {
            1 => ColorFormat::Y8,
            2 => ColorFormat::Y16,
            4 => ColorFormat::A8B8G8R8,
            bpp => {
                return Err(Error::invalid(format!(
                    "2D clear of {bpp} byte elements"
                )))
            }
        };
        self.ref_bo(&image.bo, BoAccess::WR);

        let p = self.push(16)?;
        p.immd(SUBC_2D, cl902d::SET_OPERATION, cl902d::OPERATION_SRCCOPY);
        p.immd(SUBC_2D, cl902d::SET_CLIP_ENABLE, 0);
        p.immd(SUBC_2D, cl902d::SET_COLOR_KEY_ENABLE, 0);
        p.immd(
            SUBC_2D,
            cl902d::SET_RENDER_ENABLE_C,
            cl902d::RENDER_ENABLE_C_MODE_TRUE,
        );
        p.immd(SUBC_2D, cl902d::SET_DST_FORMAT, format as u32);
        p.immd(
            SUBC_2D,
            cl902d::SET_RENDER_SOLID_PRIM_COLOR_FORMAT,
            format as u32,
        );
        p.mthd_data(SUBC_2D, cl902d::SET_RENDER_SOLID_PRIM_COLOR0, &packed);
        p.immd(
            SUBC_2D,
            cl902d::RENDER_SOLID_PRIM_MODE,
            SolidPrimMode::Rects as u32,
        );

        for range in ranges {
            for w in 0..range.layer_count {
                let layer = range.base_layer + w;
                for l in 0..range.level_count {
                    let lvl = image.level(range.base_level + l)?;
                    let addr = image.base_address()
                        + layer as u64 * image.array_stride
                        + lvl.offset;

                    let p = self.push(20)?;
                    p.mthd(SUBC_2D, cl902d::SET_DST_OFFSET_UPPER)
                        .inline_addr(addr);
                    if lvl.tiling.is_tiled {
                        p.mthd(SUBC_2D, cl902d::SET_DST_MEMORY_LAYOUT)
                            .inline_data(cl902d::MEMORY_LAYOUT_BLOCKLINEAR)
                            .inline_data(cl902d::block_size(
                                lvl.tiling.y_log2 as u32,
                                lvl.tiling.z_log2 as u32,
                            ));
                    } else {
                        p.immd(
                            SUBC_2D,
                            cl902d::SET_DST_MEMORY_LAYOUT,
                            cl902d::MEMORY_LAYOUT_PITCH,
                        );
                    }
                    p.mthd(SUBC_2D, cl902d::SET_DST_DEPTH)
                        .inline_data(lvl.extent.depth);
                    p.mthd(SUBC_2D, cl902d::SET_DST_PITCH)
                        .inline_data(lvl.row_stride)
                        .inline_data(lvl.extent.width)
                        .inline_data(lvl.extent.height);

                    for z in 0..lvl.extent.depth {
                        let p = self.push(8)?;
                        p.mthd(SUBC_2D, cl902d::SET_DST_LAYER).inline_data(z);
                        p.mthd(SUBC_2D, cl902d::render_solid_prim_point_set_x(0))
                            .inline_data(0)
                            .inline_data(0)
                            .inline_data(lvl.extent.width + 1)
                            .inline_data(lvl.extent.height + 1);
                    }
                }
            }
        }
        Ok(())
    }
}

fn linear_offset(side: &CopySurface, bpp: u32) -> u64 {
    side.offset_el.x as u64 * bpp as u64 + side.offset_el.y as u64 * side.row_stride as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::{BoFlags, BufMgr};
    use crate::config::DeviceConfig;
    use crate::kernel::mock::MockKernel;
    use crate::vma::MemZone;
    use gpu_protocol::class::{clc1b5, ClassSet};
    use gpu_protocol::push::{decode, MethodWrite};
    use gpu_protocol::uapi::PushRange;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn setup(classes: ClassSet) -> (Arc<MockKernel>, CmdBuffer) {
        let kernel = Arc::new(MockKernel::new());
        let config = DeviceConfig::default().with_classes(classes);
        let mgr = BufMgr::new(kernel.clone(), &config);
        let mut cmd = CmdBuffer::new(mgr, &config);
        cmd.begin().unwrap();
        (kernel, cmd)
    }

    fn recorded(kernel: &MockKernel, cmd: &CmdBuffer) -> Vec<MethodWrite> {
        let mut out = Vec::new();
        for range in cmd.pushes() {
            out.extend(decode(&range_dwords(kernel, cmd, range)).unwrap());
        }
        // Drop the begin NOP.
        out.remove(0);
        out
    }

    fn range_dwords(kernel: &MockKernel, cmd: &CmdBuffer, range: &PushRange) -> Vec<u32> {
        let chunk = cmd
            .bo_refs()
            .iter()
            .find(|r| range.va >= r.bo.address() && range.va < r.bo.address() + r.bo.size())
            .unwrap();
        let bytes = kernel
            .read_bo(chunk.bo.handle(), range.va - chunk.bo.address(), range.len as usize)
            .unwrap();
        bytemuck::pod_collect_to_vec(&bytes)
    }

    fn data_bo(cmd: &CmdBuffer, size: u64) -> Bo {
        cmd.bufmgr()
            .alloc("data", size, 0, MemZone::Other, BoFlags::empty())
            .unwrap()
    }

    #[test]
    fn linear_copy_splits_at_128k() {
        let (kernel, mut cmd) = setup(ClassSet::TURING);
        let size = MAX_LINEAR_COPY * 2 + 100;
        cmd.copy_linear(0x10_0000, 0x80_0000, size).unwrap();
        cmd.end().unwrap();
        let writes = recorded(&kernel, &cmd);
        let lengths: Vec<u32> = writes
            .iter()
            .filter(|w| w.mthd == cl90b5::LINE_LENGTH_IN)
            .map(|w| w.data)
            .collect();
        assert_eq!(lengths, vec![1 << 17, 1 << 17, 100]);
        let src_lows: Vec<u32> = writes
            .iter()
            .filter(|w| w.mthd == cl90b5::OFFSET_IN_LOWER)
            .map(|w| w.data)
            .collect();
        assert_eq!(src_lows, vec![0x10_0000, 0x12_0000, 0x14_0000]);
        assert_eq!(
            *writes.last().unwrap(),
            MethodWrite::new(SUBC_COPY, cl90b5::LAUNCH_DMA, 0x386)
        );
    }

    #[test]
    fn copy_buffer_refs_both_sides() {
        let (_kernel, mut cmd) = setup(ClassSet::TURING);
        let a = data_bo(&cmd, 4096);
        let b = data_bo(&cmd, 4096);
        cmd.copy_buffer(&a, 0, &b, 16, 64).unwrap();
        let access = |bo: &Bo| {
            cmd.bo_refs()
                .iter()
                .find(|r| r.bo.same_bo(bo))
                .map(|r| r.access)
        };
        assert_eq!(access(&a), Some(BoAccess::RD));
        assert_eq!(access(&b), Some(BoAccess::WR));
    }

    #[test]
    fn zero_size_copy_emits_nothing_but_succeeds() {
        let (kernel, mut cmd) = setup(ClassSet::TURING);
        cmd.copy_linear(0, 0, 0).unwrap();
        cmd.end().unwrap();
        assert!(recorded(&kernel, &cmd).is_empty());
    }

    fn rect(src_tiled: bool) -> CopyRect {
        let tiled = CopySurface {
            base_addr: 0x1_0000_0000,
            offset_el: Offset3D { x: 2, y: 3, z: 1 },
            base_array_layer: 0,
            extent_el: Extent3D::new(64, 64, 4),
            row_stride: 256,
            array_stride: 0x10_0000,
            tiling: Tiling::tiled(4, 1),
        };
        let linear = CopySurface::buffer(0x2000_0000, 64, 64 * 16);
        let (src, dst) = if src_tiled {
            (tiled, linear)
        } else {
            (linear, tiled)
        };
        CopyRect {
            src,
            dst,
            bpp: 4,
            extent_el: Extent3D::new(16, 16, 2),
            layer_count: 1,
        }
    }

    #[test]
    fn rect_programs_tiled_side_per_slice() {
        let (kernel, mut cmd) = setup(ClassSet::TURING);
        cmd.copy_rect(&rect(true)).unwrap();
        cmd.end().unwrap();
        let writes = recorded(&kernel, &cmd);

        let layers: Vec<u32> = writes
            .iter()
            .filter(|w| w.mthd == cl90b5::SET_SRC_LAYER)
            .map(|w| w.data)
            .collect();
        assert_eq!(layers, vec![1, 2]);
        let dst_lows: Vec<u32> = writes
            .iter()
            .filter(|w| w.mthd == cl90b5::OFFSET_OUT_LOWER)
            .map(|w| w.data)
            .collect();
        assert_eq!(dst_lows, vec![0x2000_0000, 0x2000_0400]);
        assert!(writes.contains(&MethodWrite::new(SUBC_COPY, clc1b5::SRC_ORIGIN_X, 8)));
        assert!(writes.contains(&MethodWrite::new(SUBC_COPY, clc1b5::SRC_ORIGIN_Y, 3)));
        assert!(writes.contains(&MethodWrite::new(SUBC_COPY, cl90b5::SET_SRC_WIDTH, 256)));
        let launches: Vec<u32> = writes
            .iter()
            .filter(|w| w.mthd == cl90b5::LAUNCH_DMA)
            .map(|w| w.data)
            .collect();
        assert_eq!(launches, vec![0x306, 0x306]);
    }

    #[test]
    fn packed_origin_on_older_engines() {
        let (kernel, mut cmd) = setup(ClassSet::KEPLER);
        cmd.copy_rect(&rect(false)).unwrap();
        cmd.end().unwrap();
        let writes = recorded(&kernel, &cmd);
        assert!(writes.contains(&MethodWrite::new(
            SUBC_COPY,
            cl90b5::SET_DST_ORIGIN,
            cl90b5::origin(8, 3)
        )));
        assert!(writes.iter().all(|w| w.mthd != clc1b5::DST_ORIGIN_X));
        let launch = writes.iter().find(|w| w.mthd == cl90b5::LAUNCH_DMA).unwrap();
        assert_eq!(
            LaunchDma::from_bits(launch.data).dst_memory_layout,
            MemoryLayout::BlockLinear
        );
    }

    #[test]
    fn fill_spanning_rows_uses_rect() {
        let (kernel, mut cmd) = setup(ClassSet::TURING);
        let bo = data_bo(&cmd, 4 << 20);
        let line_bytes = FILL_PITCH as u64;
        cmd.fill_buffer(&bo, 16, line_bytes * 3, 0xdead_beef).unwrap();
        cmd.end().unwrap();
        let writes = recorded(&kernel, &cmd);
        let modes: Vec<u32> = writes
            .iter()
            .filter(|w| w.mthd == cl902d::RENDER_SOLID_PRIM_MODE)
            .map(|w| w.data)
            .collect();
        assert_eq!(
            modes,
            vec![
                SolidPrimMode::Lines as u32,
                SolidPrimMode::Rects as u32,
                SolidPrimMode::Lines as u32
            ]
        );
        let ys: Vec<u32> = writes
            .iter()
            .filter(|w| w.mthd == cl902d::render_solid_prim_point_y(1))
            .map(|w| w.data)
            .collect();
        assert_eq!(ys, vec![0, 3, 3]);
        assert!(writes.contains(&MethodWrite::new(
            SUBC_2D,
            cl902d::SET_RENDER_SOLID_PRIM_COLOR,
            0xdead_beef
        )));
    }

    #[test]
    fn fill_within_one_row_is_a_single_line() {
        let (kernel, mut cmd) = setup(ClassSet::TURING);
        let bo = data_bo(&cmd, 4096);
        cmd.fill_buffer(&bo, 8, 64, 7).unwrap();
        cmd.end().unwrap();
        let writes = recorded(&kernel, &cmd);
        let xs: Vec<u32> = writes
            .iter()
            .filter(|w| {
                w.mthd == cl902d::render_solid_prim_point_set_x(0)
                    || w.mthd == cl902d::render_solid_prim_point_set_x(1)
            })
            .map(|w| w.data)
            .collect();
        assert_eq!(xs, vec![2, 18]);
        assert!(cmd.fill_buffer(&bo, 2, 4, 0).is_err());
    }

    #[test]
    fn update_inlines_payload() {
        let (kernel, mut cmd) = setup(ClassSet::TURING);
        let bo = data_bo(&cmd, 4096);
        let data: Vec<u8> = (0..32u8).collect();
        cmd.update_buffer(&bo, 64, &data).unwrap();
        assert!(cmd.update_buffer(&bo, 0, &[0; 3]).is_err());
        assert!(cmd
            .update_buffer(&bo, 0, &vec![0; MAX_UPDATE_SIZE as usize + 4])
            .is_err());
        cmd.end().unwrap();
        let writes = recorded(&kernel, &cmd);
        let payload: Vec<u32> = writes
            .iter()
            .filter(|w| w.mthd == cl902d::PIXELS_FROM_CPU_DATA)
            .map(|w| w.data)
            .collect();
        assert_eq!(payload.len(), 8);
        assert_eq!(payload[0], 0x0302_0100);
        assert!(writes.contains(&MethodWrite::new(
            SUBC_2D,
            cl902d::SET_PIXELS_FROM_CPU_DST_X0_INT,
            16
        )));
    }

    #[test]
    fn clear_walks_layers_levels_and_slices() {
        let (kernel, mut cmd) = setup(ClassSet::TURING);
        let bo = data_bo(&cmd, 1 << 20);
        let image = ImageSurface {
            bo,
            offset: 0,
            array_stride: 0x4_0000,
            layer_count: 2,
            bpp: 4,
            levels: vec![
                ImageLevel {
                    offset: 0,
                    row_stride: 256,
                    extent: Extent3D::new(64, 64, 1),
                    tiling: Tiling::tiled(3, 0),
                },
                ImageLevel {
                    offset: 0x1_0000,
                    row_stride: 128,
                    extent: Extent3D::new(32, 32, 1),
                    tiling: Tiling::LINEAR,
                },
            ],
        };
        let range = SubresourceRange {
            base_level: 0,
            level_count: 2,
            base_layer: 0,
            layer_count: 2,
        };
        cmd.clear_color_image(&image, [0x11, 0x22, 0x33, 0x44], &[range])
            .unwrap();
        cmd.end().unwrap();
        let writes = recorded(&kernel, &cmd);
        let rect_ends: Vec<u32> = writes
            .iter()
            .filter(|w| w.mthd == cl902d::render_solid_prim_point_set_x(1))
            .map(|w| w.data)
            .collect();
        assert_eq!(rect_ends, vec![65, 33, 65, 33]);
        assert!(writes.contains(&MethodWrite::new(
            SUBC_2D,
            cl902d::SET_RENDER_SOLID_PRIM_COLOR3,
            0x44
        )));

        let mut bad = image.clone();
        bad.bpp = 8;
        assert!(cmd.clear_color_image(&bad, [0; 4], &[range]).is_err());
    }
}
