//! CPU model of the culling compute kernel.
//!
//! Runs one dispatch the way the hardware does: threadgroups of
//! [`THREADGROUP_SIZE`] threads split into waves, a ballot of the accept
//! bits per wave, one atomic reservation by the first lane and a scatter
//! of the accepted triangles. The inputs mirror the user SGPRs the host
//! emits, so the host-side parameters can be checked against it.

use super::udiv::{unpack_terms, FastUdivInfo};
use super::PrimType;
use crate::pipeline::ProvokingVertex;

pub const THREADGROUP_SIZE: u32 = 256;

/// Culling knobs baked into the kernel variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CullKey {
    pub prim_type: PrimType,
    pub provoking_vertex: ProvokingVertex,
    pub indexed: bool,
    pub instancing: bool,
    pub cull_front: bool,
    pub cull_back: bool,
    pub cull_view_xy: bool,
    pub cull_small_prims: bool,
}

impl Default for CullKey {
    fn default() -> Self {
        Self {
            prim_type: PrimType::TriangleList,
            provoking_vertex: ProvokingVertex::First,
            indexed: true,
            instancing: false,
            cull_front: false,
            cull_back: true,
            cull_view_xy: true,
            cull_small_prims: true,
        }
    }
}

/// Per-dispatch SGPR values the kernel reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelArgs {
    pub base_vertex: u32,
    pub start_instance: u32,
    pub udiv_multiplier: u32,
    /// `post_shift | prims_per_instance << 5`.
    pub udiv_terms: u32,
    pub small_prim_precision: f32,
    pub vp_scale: [f32; 2],
    pub vp_translate: [f32; 2],
}

impl Default for KernelArgs {
    fn default() -> Self {
        Self {
            base_vertex: 0,
            start_instance: 0,
            udiv_multiplier: 0,
            udiv_terms: 0,
            small_prim_precision: 1.0 / 256.0,
            vp_scale: [1.0, 1.0],
            vp_translate: [0.0, 0.0],
        }
    }
}

/// Where the vertex data comes from.
pub trait VertexSource {
    /// Index-buffer element `i`. Only called for indexed draws.
    fn index(&self, i: u32) -> u32;

    /// Clip-space position for one vertex.
    fn position(&self, vertex_id: u32, instance_id: u32) -> [f32; 4];
}

/// Output of one dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelOutput {
    /// Index counter after the dispatch, three per accepted primitive.
    pub counter: u32,
    pub triangles: Vec<[u32; 3]>,
    /// Accept mask of every wave, in execution order.
    pub ballots: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimCullKernel {
    pub key: CullKey,
    pub wave_size: u32,
}

impl PrimCullKernel {
    pub fn new(key: CullKey, wave_size: u32) -> Self {
        debug_assert!(wave_size == 32 || wave_size == 64);
        Self { key, wave_size }
    }

    /// Vertex indices of a primitive before the index fetch.
    pub fn prim_indices(&self, prim_id: u32) -> [u32; 3] {
        match self.key.prim_type {
            PrimType::TriangleList => [prim_id * 3, prim_id * 3 + 1, prim_id * 3 + 2],
            PrimType::TriangleStrip => {
                let [i0, i1, i2] = [prim_id, prim_id + 1, prim_id + 2];
                if prim_id & 1 == 0 {
                    [i0, i1, i2]
                } else {
                    match self.key.provoking_vertex {
                        ProvokingVertex::First => [i0, i2, i1],
                        ProvokingVertex::Last => [i1, i0, i2],
                    }
                }
            }
        }
    }

    /// Whether the triangle survives culling.
    pub fn accept(&self, args: &KernelArgs, pos: &[[f32; 4]; 3]) -> bool {
        let key = &self.key;
        let negative_w = pos.iter().filter(|p| p[3] <= 0.0).count();
        if negative_w == 3 {
            return false;
        }

        let ndc: [[f32; 2]; 3] = pos.map(|p| [p[0] / p[3], p[1] / p[3]]);

        let mut det = (ndc[1][0] - ndc[0][0]) * (ndc[2][1] - ndc[0][1])
            - (ndc[2][0] - ndc[0][0]) * (ndc[1][1] - ndc[0][1]);
        // An odd number of vertices behind the eye mirrors the projection.
        if negative_w & 1 == 1 {
            det = -det;
        }
        if key.cull_front && !(det < 0.0) {
            return false;
        }
        if key.cull_back && !(det > 0.0) {
            return false;
        }
        if !(key.cull_front || key.cull_back) && det == 0.0 {
            return false;
        }

        // Crossing the near plane makes the projected bbox meaningless.
        if negative_w != 0 {
            return true;
        }

        let mut min = [f32::INFINITY; 2];
        let mut max = [f32::NEG_INFINITY; 2];
        for v in &ndc {
            for c in 0..2 {
                min[c] = min[c].min(v[c]);
                max[c] = max[c].max(v[c]);
            }
        }

        if key.cull_view_xy && (0..2).any(|c| max[c] < -1.0 || min[c] > 1.0) {
            return false;
        }

        if key.cull_small_prims {
            for c in 0..2 {
                let a = min[c] * args.vp_scale[c] + args.vp_translate[c];
                let b = max[c] * args.vp_scale[c] + args.vp_translate[c];
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                let lo = (lo - args.small_prim_precision).round_ties_even();
                let hi = (hi + args.small_prim_precision).round_ties_even();
                // No sample center between the rounded edges.
                if lo == hi {
                    return false;
                }
            }
        }
        true
    }

    /// Run primitives `[first_prim, first_prim + num_prims)`. `first_prim`
    /// is a multiple of [`THREADGROUP_SIZE`]; the last group may be partial.
    ///
    /// `counter` is the index counter before the dispatch; output slots
    /// are relative to the output base, so `triangles` grows as needed.
    pub fn run(
        &self,
        args: &KernelArgs,
        src: &dyn VertexSource,
        first_prim: u32,
        num_prims: u32,
        counter: u32,
    ) -> KernelOutput {
        debug_assert_eq!(first_prim % THREADGROUP_SIZE, 0);
        let mut out = KernelOutput {
            counter,
            triangles: vec![[0; 3]; (counter / 3) as usize],
            ballots: Vec::new(),
        };
        let end = first_prim + num_prims;
        let wave = self.wave_size;

        let mut wave_base = first_prim;
        while wave_base < end {
            let lanes = (end - wave_base).min(wave);
            let mut mask = 0u64;
            let mut tris = [[0u32; 3]; 64];
            for lane in 0..lanes {
                if let Some(tri) = self.thread(args, src, wave_base + lane) {
                    mask |= 1 << lane;
                    tris[lane as usize] = tri;
                }
            }
            out.ballots.push(mask);

            // Thread-0 section: one reservation for the whole wave.
            let accepted = mask.count_ones();
            let mut start = out.counter;
            if accepted != 0 {
                out.counter += accepted * 3;
            }
            start /= 3;

            for lane in 0..lanes {
                if mask & (1 << lane) == 0 {
                    continue;
                }
                let below = (mask & ((1u64 << lane) - 1)).count_ones();
                let slot = (start + below) as usize;
                if out.triangles.len() <= slot {
                    out.triangles.resize(slot + 1, [0; 3]);
                }
                out.triangles[slot] = tris[lane as usize];
            }
            wave_base += wave;
        }
        out
    }

    fn thread(&self, args: &KernelArgs, src: &dyn VertexSource, prim_id: u32) -> Option<[u32; 3]> {
        let mut prim_id = prim_id;
        let mut instance_id = 0;
        if self.key.instancing {
            let (post_shift, prims_per_instance) = unpack_terms(args.udiv_terms);
            instance_id = if prims_per_instance == 1 {
                prim_id
            } else {
                FastUdivInfo::eval_u31_d_not_one(args.udiv_multiplier, post_shift, prim_id)
            };
            prim_id -= instance_id * prims_per_instance;
        }

        let mut index = self.prim_indices(prim_id);
        if self.key.indexed {
            index = index.map(|i| src.index(i));
        }

        let instance = args.start_instance.wrapping_add(instance_id);
        let pos = index.map(|i| src.position(i.wrapping_add(args.base_vertex), instance));
        if !self.accept(args, &pos) {
            return None;
        }

        if self.key.instancing {
            index = index.map(|i| i | instance_id << 16);
        }
        Some(index)
    }
}
