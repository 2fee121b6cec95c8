use std::sync::Arc;
use std::time::{Duration, Instant};

use gpu_protocol::push::MAX_PUSH_BYTES;
use gpu_protocol::uapi::{BindFlags, BindOp, BindOpKind, BoAccess, SyncRecord};
use gpu_submit::bo::sync::{BoSync, BoSyncState, BoSyncWaitFlags};
use gpu_submit::compute::{ComputePipeline, ComputeShaderInfo};
use gpu_submit::kernel::mock::MockKernel;
use gpu_submit::queue::{
    BindMemory, ImageOpaqueBindInfo, SparseBind, SparsePlane, SubmitInfo,
};
use gpu_submit::vma::MemZone;
use gpu_submit::{BoFlags, Device, DeviceConfig, Error};
use pretty_assertions::assert_eq;

const KIB: u64 = 1024;

fn device() -> (Arc<MockKernel>, Arc<Device>) {
    let kernel = Arc::new(MockKernel::new());
    let dev = Device::new(kernel.clone(), DeviceConfig::default()).unwrap();
    (kernel, dev)
}

#[test]
fn recorded_work_reaches_the_kernel() {
    let (kernel, dev) = device();
    let queue = dev.create_queue().unwrap();

    let src = dev
        .bufmgr()
        .alloc("src", 64 * KIB, 0, MemZone::Other, BoFlags::GART)
        .unwrap();
    let dst = dev
        .bufmgr()
        .alloc("dst", 64 * KIB, 0, MemZone::Other, BoFlags::LOCAL)
        .unwrap();
    let code_addr = dev.upload_shader(&[0u8; 512]).unwrap();
    let pipeline = Arc::new(ComputePipeline::new(
        &ComputeShaderInfo {
            code_addr,
            num_gprs: 16,
            block_size: [64, 1, 1],
            slm_size: 64,
            ..ComputeShaderInfo::default()
        },
        None,
    ));

    let mut cmd = dev.create_cmd_buffer();
    cmd.begin().unwrap();
    cmd.copy_buffer(&src, 0, &dst, 0, 64 * KIB).unwrap();
    cmd.bind_compute_pipeline(pipeline);
    cmd.dispatch(4, 1, 1).unwrap();
    cmd.end().unwrap();

    queue
        .submit(&SubmitInfo {
            cmd_buffers: &[&cmd],
            ..SubmitInfo::default()
        })
        .unwrap();

    let execs = kernel.exec_log();
    assert_eq!(execs.len(), 1);
    let exec = &execs[0];
    assert_eq!(exec.channel, queue.channel());
    for push in &exec.pushes {
        assert!(push.len as u64 <= MAX_PUSH_BYTES);
        assert_eq!(push.va % 4, 0);
        assert_eq!(push.len % 4, 0);
    }
    assert_eq!(&exec.pushes[exec.pushes.len() - cmd.pushes().len()..], cmd.pushes());

    let access = |handle: u32| {
        exec.bos
            .iter()
            .find(|b| b.handle == handle)
            .map(|b| b.access)
    };
    assert_eq!(access(src.handle()), Some(BoAccess::RD));
    assert_eq!(access(dst.handle()), Some(BoAccess::WR));
    for bo in dev.shader_heap().bos() {
        assert_eq!(access(bo.handle()), Some(BoAccess::RDWR));
    }
    let (slm, bytes_per_warp, _) = dev.slm().get_bo_ref();
    assert_eq!(bytes_per_warp, 64 * 32);
    assert_eq!(access(slm.unwrap().handle()), Some(BoAccess::RDWR));

    let mut handles: Vec<u32> = exec.bos.iter().map(|b| b.handle).collect();
    handles.sort_unstable();
    handles.dedup();
    assert_eq!(handles.len(), exec.bos.len());
    assert_eq!(dev.bufmgr().stats().snapshot().submits, 1);
}

#[test]
fn opaque_image_bind_splits_across_planes() {
    let (kernel, dev) = device();
    let queue = dev.create_queue().unwrap();
    let memory = dev
        .bufmgr()
        .alloc("sparse memory", 512 * KIB, 0, MemZone::Other, BoFlags::LOCAL)
        .unwrap();
    let plane_a = 0x40_0000_0000;
    let plane_b = 0x50_0000_0000;
    let info = ImageOpaqueBindInfo {
        planes: vec![
            SparsePlane {
                va: plane_a,
                size: 1024 * KIB,
                align: 64 * KIB,
                pte_kind: 0xdb,
            },
            SparsePlane {
                va: plane_b,
                size: 512 * KIB,
                align: 64 * KIB,
                pte_kind: 0xfe,
            },
        ],
        binds: vec![SparseBind {
            resource_offset: 900 * KIB,
            size: 400 * KIB,
            memory: Some(BindMemory {
                bo: memory.clone(),
                offset: 0,
            }),
        }],
    };
    let signal = SyncRecord::timeline(7, 3);
    queue.bind(&[], &[info], &[], &[signal]).unwrap();

    let binds = kernel.bind_log();
    assert_eq!(binds.len(), 1);
    assert_eq!(binds[0].flags, BindFlags::RUN_ASYNC);
    assert_eq!(binds[0].signals, vec![signal]);
    assert_eq!(
        binds[0].ops,
        vec![
            BindOp {
                op: BindOpKind::Map,
                handle: memory.handle(),
                addr: plane_a + 900 * KIB,
                bo_offset: 0,
                range: 124 * KIB,
                flags: 0xdb,
            },
            BindOp {
                op: BindOpKind::Map,
                handle: memory.handle(),
                addr: plane_b,
                bo_offset: 124 * KIB,
                range: 276 * KIB,
                flags: 0xfe,
            },
        ]
    );
    assert_eq!(dev.bufmgr().stats().snapshot().binds, 1);
}

#[test]
fn bo_sync_round_trip_through_a_submit() {
    let (kernel, dev) = device();
    let queue = dev.create_queue().unwrap();
    let ready = BoSync::new(dev.bufmgr(), true).unwrap();
    let done = BoSync::new(dev.bufmgr(), false).unwrap();

    queue
        .submit(&SubmitInfo {
            bo_waits: &[&ready],
            bo_signals: &[&done],
            ..SubmitInfo::default()
        })
        .unwrap();
    assert_eq!(done.state(), BoSyncState::Submitted);

    let exec = &kernel.exec_log()[0];
    let entry = exec
        .bos
        .iter()
        .find(|b| b.handle == done.bo().handle())
        .unwrap();
    assert_eq!(entry.access, BoAccess::RDWR);
}

#[test]
fn busy_bo_waits_on_the_zombie_list_until_idle() {
    let kernel = Arc::new(MockKernel::new());
    let dev = Device::new(kernel.clone(), DeviceConfig::default().with_bo_reuse(false)).unwrap();
    let queue = dev.create_queue().unwrap();
    let vertices = dev
        .bufmgr()
        .alloc("vertices", 64 * KIB, 0, MemZone::Other, BoFlags::GART)
        .unwrap();
    let handle = vertices.handle();

    let mut cmd = dev.create_cmd_buffer();
    cmd.begin().unwrap();
    cmd.ref_bo(&vertices, BoAccess::RD);
    cmd.end().unwrap();
    queue
        .submit(&SubmitInfo {
            cmd_buffers: &[&cmd],
            ..SubmitInfo::default()
        })
        .unwrap();

    kernel.set_busy(handle, true);
    drop(cmd);
    drop(vertices);
    assert!(kernel.is_live(handle));
    assert!(!kernel.closed_handles().contains(&handle));
    assert!(dev.bufmgr().zombie_count() >= 1);
    assert!(dev.bufmgr().stats().snapshot().bo_zombies >= 1);

    dev.bufmgr().cleanup(1_000_000);
    assert!(kernel.is_live(handle));

    kernel.complete_all();
    dev.bufmgr().cleanup(1_000_001);
    assert!(!kernel.is_live(handle));
    assert_eq!(dev.bufmgr().zombie_count(), 0);
}

#[test]
fn submitted_bo_sync_waits_for_the_gpu() {
    let (kernel, dev) = device();
    let queue = dev.create_queue().unwrap();
    let done = BoSync::new(dev.bufmgr(), false).unwrap();
    queue
        .submit(&SubmitInfo {
            bo_signals: &[&done],
            ..SubmitInfo::default()
        })
        .unwrap();
    kernel.set_busy(done.bo().handle(), true);

    let soon = Instant::now() + Duration::from_millis(5);
    assert_eq!(
        BoSync::wait_many(&[&done], BoSyncWaitFlags::empty(), Some(soon)),
        Err(Error::Timeout)
    );
    assert_eq!(done.state(), BoSyncState::Submitted);

    kernel.complete_all();
    BoSync::wait_many(&[&done], BoSyncWaitFlags::empty(), None).unwrap();
    assert_eq!(done.state(), BoSyncState::Signaled);
}
