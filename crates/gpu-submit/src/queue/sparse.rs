//! Page-table updates for sparse buffers and images.

use gpu_protocol::align_up;
use gpu_protocol::uapi::{BindOp, BindOpKind};

use crate::bo::Bo;

/// Backing for a bound range: a BO and the byte offset into it.
#[derive(Debug, Clone)]
pub struct BindMemory {
    pub bo: Bo,
    pub offset: u64,
}

/// One range of a sparse resource. `memory: None` unbinds it.
#[derive(Debug, Clone)]
pub struct SparseBind {
    pub resource_offset: u64,
    pub size: u64,
    pub memory: Option<BindMemory>,
}

/// One plane of a sparse image, in bind order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparsePlane {
    /// GPU address of the plane's first byte.
    pub va: u64,
    pub size: u64,
    pub align: u64,
    pub pte_kind: u32,
}

#[derive(Debug, Clone)]
pub struct BufferBindInfo {
    pub buffer_va: u64,
    pub binds: Vec<SparseBind>,
}

#[derive(Debug, Clone)]
pub struct ImageOpaqueBindInfo {
    pub planes: Vec<SparsePlane>,
    pub binds: Vec<SparseBind>,
}

fn bind_op(addr: u64, range: u64, memory: Option<(&Bo, u64)>, flags: u32) -> BindOp {
    match memory {
        Some((bo, bo_offset)) => BindOp {
            op: BindOpKind::Map,
            handle: bo.handle(),
            addr,
            bo_offset,
            range,
            flags,
        },
        None => BindOp {
            op: BindOpKind::Unmap,
            handle: 0,
            addr,
            bo_offset: 0,
            range,
            flags,
        },
    }
}

pub fn buffer_bind_ops(info: &BufferBindInfo, ops: &mut Vec<BindOp>) {
    for bind in &info.binds {
        ops.push(bind_op(
            info.buffer_va + bind.resource_offset,
            bind.size,
            bind.memory.as_ref().map(|m| (&m.bo, m.offset)),
            0,
        ));
    }
}

/// Split each bind across the planes it overlaps. Planes are laid out back
/// to back in resource space, each starting at its own alignment.
pub fn image_opaque_bind_ops(info: &ImageOpaqueBindInfo, ops: &mut Vec<BindOp>) {
    for bind in &info.binds {
        let bind_end = bind.resource_offset + bind.size;
        let mut plane_offset = 0;
        for plane in &info.planes {
            plane_offset = align_up(plane_offset, plane.align.max(1));
            let plane_end = plane_offset + plane.size;

            let start = bind.resource_offset.max(plane_offset);
            let end = bind_end.min(plane_end);
            if start < end {
                let memory = bind
                    .memory
                    .as_ref()
                    .map(|m| (&m.bo, m.offset + (start - bind.resource_offset)));
                ops.push(bind_op(
                    plane.va + (start - plane_offset),
                    end - start,
                    memory,
                    plane.pte_kind,
                ));
            }
            plane_offset = plane_end;
        }
    }
}
