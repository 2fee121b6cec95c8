use std::sync::Arc;

use gpu_submit::bo::bucket::{bucket_index, bucket_sizes};
use gpu_submit::kernel::mock::{MockKernel, MockOp};
use gpu_submit::kernel::KernelError;
use gpu_submit::vma::MemZone;
use gpu_submit::{BoFlags, BufMgr, DeviceConfig, Error};
use pretty_assertions::assert_eq;

const PAGE: u64 = 4096;

#[test]
fn bucket_lookup_follows_the_progression() {
    let sizes = bucket_sizes(PAGE);
    let pages = |size: u64| sizes[bucket_index(size, PAGE, sizes.len()).unwrap()] / PAGE;
    assert_eq!(pages(PAGE), 1);
    assert_eq!(pages(17 * PAGE), 20);
    assert_eq!(pages(64 * PAGE), 64);
    assert_eq!(pages(65 * PAGE), 80);
    assert_eq!(pages(1), 1);
}

#[test]
fn cached_bo_moves_to_the_requested_zone() {
    let kernel = Arc::new(MockKernel::new());
    let mgr = BufMgr::new(kernel.clone(), &DeviceConfig::default());

    let first = mgr
        .alloc("staging", 8 * 1024, 0, MemZone::Other, BoFlags::GART)
        .unwrap();
    let handle = first.handle();
    assert_eq!(first.zone(), MemZone::Other);
    drop(first);
    assert_eq!(mgr.cached_bo_count(), 1);

    let second = mgr
        .alloc("surface", 8 * 1024, 0, MemZone::Surface, BoFlags::LOCAL)
        .unwrap();
    assert_eq!(second.handle(), handle);
    assert_eq!(second.zone(), MemZone::Surface);
    assert_eq!(MemZone::for_address(second.address()), MemZone::Surface);
    assert_eq!(mgr.cached_bo_count(), 0);

    let stats = mgr.stats().snapshot();
    assert_eq!(stats.bo_cache_hits, 1);
    assert_eq!(stats.bo_fresh_allocs, 1);
    assert_eq!(kernel.create_count(), 1);
}

#[test]
fn busy_cached_bo_is_not_reused() {
    let kernel = Arc::new(MockKernel::new());
    let mgr = BufMgr::new(kernel.clone(), &DeviceConfig::default());

    let first = mgr
        .alloc("vertices", 8 * 1024, 0, MemZone::Other, BoFlags::GART)
        .unwrap();
    let handle = first.handle();
    kernel.set_busy(handle, true);
    drop(first);

    let second = mgr
        .alloc("vertices", 8 * 1024, 0, MemZone::Other, BoFlags::GART)
        .unwrap();
    assert_ne!(second.handle(), handle);
    assert_eq!(kernel.create_count(), 2);

    kernel.set_busy(handle, false);
    let third = mgr
        .alloc("vertices", 8 * 1024, 0, MemZone::Other, BoFlags::GART)
        .unwrap();
    assert_eq!(third.handle(), handle);
}

#[test]
fn failed_dmabuf_import_closes_its_handle() {
    const GIB: u64 = 1 << 30;
    let kernel = Arc::new(MockKernel::new());
    let mgr = BufMgr::new(kernel.clone(), &DeviceConfig::default().with_gtt_size(32 * GIB));

    let (_, fd) = kernel.create_foreign_bo(64 * 1024);
    assert!(kernel.closed_handles().is_empty());
    kernel.fail_next(MockOp::DmabufSize, KernelError::Invalid);
    assert!(matches!(
        mgr.import_dmabuf(fd),
        Err(Error::IoctlFailed { op: "dmabuf_size", .. })
    ));
    assert_eq!(kernel.closed_handles().len(), 1);
    assert!(!kernel.is_live(kernel.closed_handles()[0]));

    // Larger than the whole external zone.
    let (_, fd) = kernel.create_foreign_bo(32 * GIB);
    assert!(matches!(mgr.import_dmabuf(fd), Err(Error::OutOfDeviceMemory)));
    let closed = kernel.closed_handles();
    assert_eq!(closed.len(), 2);
    assert!(!kernel.is_live(closed[1]));
}
