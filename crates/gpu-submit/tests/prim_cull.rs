use std::sync::Arc;

use gpu_protocol::pm4::{
    pkt3_opcode, pkt3_payload_len, sh_reg_index, PKT3_DISPATCH_DIRECT, PKT3_DRAW_INDEX_2,
    PKT3_RELEASE_MEM, PKT3_REWIND, PKT3_SET_SH_REG, R_00B900_COMPUTE_USER_DATA_0,
};
use gpu_submit::kernel::mock::MockKernel;
use gpu_submit::pipeline::ProvokingVertex;
use gpu_submit::prim_cull::udiv::packed_terms;
use gpu_submit::prim_cull::{
    CullKey, DrawInfo, DrawRange, FastUdivInfo, KernelArgs, PrimCullContext, PrimCullKernel,
    PrimCullOutcome, PrimType, ShaderState, Topology, VertexSource, ViewportXform,
    VsDescriptors, DESC_DWORDS, NUM_USER_SGPRS,
};
use gpu_submit::{BufMgr, DeviceConfig, PrimCullConfig};
use pretty_assertions::assert_eq;

/// A zig-zag strip over vertex ids 10..16.
struct ZigZag;

impl VertexSource for ZigZag {
    fn index(&self, i: u32) -> u32 {
        10 + i
    }

    fn position(&self, vertex_id: u32, _instance_id: u32) -> [f32; 4] {
        let x = (vertex_id as f32 - 10.0) * 0.2 - 0.5;
        let y = if vertex_id % 2 == 0 { -0.5 } else { 0.5 };
        [x, y, 0.0, 1.0]
    }
}

fn viewport_args() -> KernelArgs {
    KernelArgs {
        vp_scale: [64.0, 64.0],
        vp_translate: [64.0, 64.0],
        ..KernelArgs::default()
    }
}

fn strip_kernel(provoking_vertex: ProvokingVertex, cull_front: bool, cull_back: bool) -> PrimCullKernel {
    PrimCullKernel::new(
        CullKey {
            prim_type: PrimType::TriangleStrip,
            provoking_vertex,
            indexed: true,
            instancing: false,
            cull_front,
            cull_back,
            cull_view_xy: true,
            cull_small_prims: true,
        },
        64,
    )
}

#[test]
fn strip_with_last_provoking_vertex_keeps_winding() {
    let kernel = strip_kernel(ProvokingVertex::Last, true, false);
    let out = kernel.run(&viewport_args(), &ZigZag, 0, 4, 0);
    assert_eq!(
        out.triangles,
        vec![[10, 11, 12], [12, 11, 13], [12, 13, 14], [14, 13, 15]]
    );
    assert_eq!(out.counter, 12);
    assert_eq!(out.ballots, vec![0b1111]);

    // Every primitive faces the same way, so culling that side drops all.
    let kernel = strip_kernel(ProvokingVertex::Last, false, true);
    let out = kernel.run(&viewport_args(), &ZigZag, 0, 4, 0);
    assert_eq!(out.counter, 0);
    assert!(out.triangles.is_empty());
}

#[test]
fn strip_with_first_provoking_vertex_swaps_the_tail() {
    let kernel = strip_kernel(ProvokingVertex::First, true, false);
    let out = kernel.run(&viewport_args(), &ZigZag, 0, 4, 0);
    assert_eq!(
        out.triangles,
        vec![[10, 11, 12], [11, 13, 12], [12, 13, 14], [13, 15, 14]]
    );
}

#[test]
fn sub_pixel_strip_is_culled_as_small() {
    let kernel = strip_kernel(ProvokingVertex::Last, true, false);
    let args = KernelArgs {
        vp_scale: [0.25, 0.25],
        vp_translate: [10.0, 10.0],
        ..KernelArgs::default()
    };
    let out = kernel.run(&args, &ZigZag, 0, 4, 0);
    assert_eq!(out.ballots, vec![0]);
}

fn context(cfg: PrimCullConfig) -> (Arc<BufMgr>, PrimCullContext) {
    let mgr = BufMgr::new(Arc::new(MockKernel::new()), &DeviceConfig::default());
    let ctx = PrimCullContext::new(mgr.clone(), &cfg).unwrap();
    (mgr, ctx)
}

fn opcodes(dwords: &[u32]) -> Vec<u32> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < dwords.len() {
        out.push(pkt3_opcode(dwords[i]));
        i += 1 + pkt3_payload_len(dwords[i]) as usize;
    }
    out
}

fn shaders() -> ShaderState {
    ShaderState {
        trivial_divisors: true,
        ..ShaderState::default()
    }
}

fn viewport() -> ViewportXform {
    ViewportXform {
        scale: [960.0, 540.0],
        translate: [960.0, 540.0],
    }
}

fn list_draw(ctx: &mut PrimCullContext, info: &DrawInfo, prims: u32) {
    let draw = DrawRange {
        start: 0,
        count: prims * 3,
        index_bias: 0,
    };
    let outcome = ctx.prepare(info, &[draw], &shaders()).unwrap();
    assert_eq!(outcome, PrimCullOutcome::Enabled);
    ctx.dispatch(
        info,
        &draw,
        PrimType::TriangleList,
        &VsDescriptors::default(),
        &viewport(),
    )
    .unwrap();
}

#[test]
fn draws_share_a_rewind_until_the_batch_fills() {
    let (mgr, mut ctx) = context(PrimCullConfig::default());
    let info = DrawInfo {
        index_va: 0x10_0000,
        ..DrawInfo::default()
    };
    for prims in [40_000, 50_000, 60_000] {
        list_draw(&mut ctx, &info, prims);
    }

    assert_eq!(
        opcodes(ctx.gfx_dwords()),
        vec![
            PKT3_REWIND,
            PKT3_DRAW_INDEX_2,
            PKT3_DRAW_INDEX_2,
            PKT3_REWIND,
            PKT3_DRAW_INDEX_2,
        ]
    );
    let compute: Vec<_> = opcodes(ctx.compute_dwords())
        .into_iter()
        .filter(|&op| op == PKT3_DISPATCH_DIRECT || op == PKT3_RELEASE_MEM)
        .collect();
    assert_eq!(
        compute,
        vec![
            PKT3_DISPATCH_DIRECT,
            PKT3_DISPATCH_DIRECT,
            PKT3_RELEASE_MEM,
            PKT3_DISPATCH_DIRECT,
        ]
    );
    assert_eq!(ctx.prims_in_batch(), 60_000);

    ctx.flush().unwrap();
    let ibs = ctx.take_finished();
    assert_eq!(ibs.len(), 1);
    let mut compute = vec![0u8; ibs[0].compute_dwords * 4];
    ibs[0].compute.read(0, &mut compute).unwrap();
    let compute: Vec<u32> = bytemuck::pod_collect_to_vec(&compute);
    assert_eq!(opcodes(&compute).last(), Some(&PKT3_RELEASE_MEM));

    let stats = mgr.stats().snapshot();
    assert_eq!(stats.prim_cull_batches, 2);
    assert_eq!(stats.prim_cull_dispatches, 3);
}

/// Pull the full user-data block out of the compute stream.
fn recorded_sgprs(compute: &[u32]) -> [u32; NUM_USER_SGPRS] {
    let mut i = 0;
    while i < compute.len() {
        let len = pkt3_payload_len(compute[i]) as usize;
        if pkt3_opcode(compute[i]) == PKT3_SET_SH_REG
            && compute[i + 1] == sh_reg_index(R_00B900_COMPUTE_USER_DATA_0)
            && len == NUM_USER_SGPRS + 1
        {
            let mut out = [0; NUM_USER_SGPRS];
            out.copy_from_slice(&compute[i + 2..i + 2 + NUM_USER_SGPRS]);
            return out;
        }
        i += 1 + len;
    }
    panic!("no user data in compute stream");
}

#[test]
fn recorded_arguments_drive_the_kernel() {
    let (_mgr, mut ctx) = context(PrimCullConfig::default());
    let info = DrawInfo {
        index_va: 0x20_0000,
        instance_count: 3,
        start_instance: 5,
        ..DrawInfo::default()
    };
    let draw = DrawRange {
        start: 6,
        count: 30,
        index_bias: 100,
    };
    assert_eq!(
        ctx.prepare(&info, &[draw], &shaders()).unwrap(),
        PrimCullOutcome::Enabled
    );
    let subs = ctx
        .dispatch(
            &info,
            &draw,
            PrimType::TriangleList,
            &VsDescriptors::default(),
            &viewport(),
        )
        .unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].num_prims, 30);

    let sgprs = recorded_sgprs(ctx.compute_dwords());
    let desc_index = ((subs[0].desc_va - ctx.data_va()) / 4) as usize;
    let mut desc = [0; DESC_DWORDS];
    desc.copy_from_slice(&ctx.data_dwords()[desc_index..desc_index + DESC_DWORDS]);
    assert_eq!(sgprs[0], subs[0].desc_va as u32);
    assert_eq!(sgprs[1], subs[0].count_va as u32);
    // Index input starts at the draw's first index.
    assert_eq!(desc[0], 0x20_0000 + 6 * 4);

    let args = KernelArgs::from_user_data(&sgprs, &desc);
    let udiv = FastUdivInfo::new(10, 31);
    assert_eq!(args.base_vertex, 100);
    assert_eq!(args.start_instance, 5);
    assert_eq!(args.udiv_multiplier, udiv.multiplier);
    assert_eq!(args.udiv_terms, packed_terms(udiv.post_shift, 10));
    assert_eq!(args.small_prim_precision, 1.0 / 256.0);
    assert_eq!(args.vp_scale, [960.0, 540.0]);

    struct Tiles;
    impl VertexSource for Tiles {
        fn index(&self, i: u32) -> u32 {
            i
        }
        fn position(&self, vertex_id: u32, _instance_id: u32) -> [f32; 4] {
            match vertex_id % 3 {
                0 => [-0.5, -0.5, 0.0, 1.0],
                1 => [0.5, -0.5, 0.0, 1.0],
                _ => [0.0, 0.5, 0.0, 1.0],
            }
        }
    }
    let kernel = PrimCullKernel::new(
        CullKey {
            instancing: true,
            ..CullKey::default()
        },
        64,
    );
    let out = kernel.run(&args, &Tiles, 0, subs[0].num_prims, 0);
    assert_eq!(out.counter, 90);
    // Primitive 25 is the sixth triangle of the third instance.
    assert_eq!(out.triangles[25], [15 | 2 << 16, 16 | 2 << 16, 17 | 2 << 16]);
}

#[test]
fn zero_primitive_strip_still_takes_a_ring_slot() {
    let cfg = PrimCullConfig::default();
    let line = cfg.l2_cache_line_size as u64;
    let (_mgr, mut ctx) = context(cfg);
    let info = DrawInfo {
        topology: Topology::TriangleStrip,
        ..DrawInfo::default()
    };
    let draw = DrawRange {
        start: 0,
        count: 2,
        index_bias: 0,
    };
    let before = ctx.ring_offset();
    let subs = ctx
        .dispatch(
            &info,
            &draw,
            PrimType::TriangleStrip,
            &VsDescriptors::default(),
            &viewport(),
        )
        .unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].num_prims, 0);
    assert_eq!(ctx.ring_offset(), before + line);
    assert_eq!(
        opcodes(ctx.gfx_dwords()),
        vec![PKT3_REWIND, PKT3_DRAW_INDEX_2]
    );
    assert_eq!(ctx.gfx_dwords()[3], 0);
}
