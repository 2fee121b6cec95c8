//! Shader local memory (scratch) shared by every queue of a device.

use std::sync::{Arc, Mutex};

use gpu_protocol::align_up;
use tracing::debug;

use crate::bo::{Bo, BoFlags, BufMgr};
use crate::vma::MemZone;
use crate::{lock, Result};

const WARP_SIZE: u64 = 32;
const WARPS_PER_MP: u64 = 64;
const BYTES_PER_WARP_ALIGN: u64 = 0x200;

#[derive(Debug, Default)]
struct SlmState {
    bo: Option<Bo>,
    bytes_per_warp: u32,
    bytes_per_mp: u32,
}

#[derive(Debug)]
pub struct SlmArea {
    mgr: Arc<BufMgr>,
    mp_count: u32,
    state: Mutex<SlmState>,
}

/// Per-warp and per-MP footprint for `bytes_per_thread` of scratch.
pub fn slm_sizes(bytes_per_thread: u32) -> (u64, u64) {
    let per_warp = align_up(bytes_per_thread as u64 * WARP_SIZE, BYTES_PER_WARP_ALIGN);
    (per_warp, per_warp * WARPS_PER_MP)
}

impl SlmArea {
    pub fn new(mgr: Arc<BufMgr>, mp_count: u32) -> Self {
        Self {
            mgr,
            mp_count,
            state: Mutex::new(SlmState::default()),
        }
    }

    /// Current backing, if any, with its per-warp and per-MP sizes.
    pub fn get_bo_ref(&self) -> (Option<Bo>, u32, u32) {
        let state = lock(&self.state);
        (state.bo.clone(), state.bytes_per_warp, state.bytes_per_mp)
    }

    pub fn size(&self) -> u64 {
        let state = lock(&self.state);
        state.bytes_per_mp as u64 * self.mp_count as u64
    }

    /// Make room for `bytes_per_thread` of scratch per thread. Never shrinks.
    pub fn ensure(&self, bytes_per_thread: u32) -> Result<()> {
        if bytes_per_thread == 0 {
            return Ok(());
        }
        let (bytes_per_warp, bytes_per_mp) = slm_sizes(bytes_per_thread);
        if bytes_per_mp <= lock(&self.state).bytes_per_mp as u64 {
            return Ok(());
        }

        let size = bytes_per_mp * self.mp_count.max(1) as u64;
        let bo = self
            .mgr
            .alloc("slm", size, 0, MemZone::Other, BoFlags::LOCAL)?;

        let mut state = lock(&self.state);
        // Another thread may have grown it while the lock was dropped.
        if bytes_per_mp > state.bytes_per_mp as u64 {
            debug!(bytes_per_warp, bytes_per_mp, size, "slm area grown");
            state.bo = Some(bo);
            state.bytes_per_warp = bytes_per_warp as u32;
            state.bytes_per_mp = bytes_per_mp as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::kernel::mock::MockKernel;
    use pretty_assertions::assert_eq;

    fn area(mp_count: u32) -> SlmArea {
        let kernel = Arc::new(MockKernel::new());
        SlmArea::new(BufMgr::new(kernel, &DeviceConfig::default()), mp_count)
    }

    #[test]
    fn sizes() {
        assert_eq!(slm_sizes(1), (0x200, 0x200 * 64));
        assert_eq!(slm_sizes(16), (0x200, 0x8000));
        assert_eq!(slm_sizes(17), (0x400, 0x10000));
    }

    #[test]
    fn only_grows() {
        let slm = area(4);
        assert!(slm.get_bo_ref().0.is_none());

        slm.ensure(64).unwrap();
        let (bo, per_warp, per_mp) = slm.get_bo_ref();
        let bo = bo.unwrap();
        assert_eq!((per_warp, per_mp), (0x800, 0x20000));
        assert!(bo.size() >= 4 * 0x20000);

        slm.ensure(16).unwrap();
        let (same, per_warp, _) = slm.get_bo_ref();
        assert!(same.unwrap().same_bo(&bo));
        assert_eq!(per_warp, 0x800);

        slm.ensure(128).unwrap();
        assert_eq!(slm.get_bo_ref().1, 0x1000);
        assert_eq!(slm.size(), 4 * 0x1000 * 64);
    }

    #[test]
    fn zero_is_a_no_op() {
        let slm = area(2);
        slm.ensure(0).unwrap();
        assert!(slm.get_bo_ref().0.is_none());
        assert_eq!(slm.size(), 0);
    }
}
