//! Shader heap: a growable set of mapped BOs sub-allocated through one VA
//! heap.
//!
//! Heap offsets encode the BO as `((bo_index + 1) << 48) | offset`, so a
//! single hole list covers every BO without their GPU addresses needing to
//! be contiguous.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::bo::{Bo, BoFlags, BufMgr};
use crate::kernel::CpuMapping;
use crate::vma::{MemZone, VmaHeap};
use crate::{lock, Error, Result};

pub const HEAP_MIN_SIZE_LOG2: u32 = 16;
pub const HEAP_MAX_SIZE_LOG2: u32 = 32;
pub const HEAP_MIN_SIZE: u64 = 1 << HEAP_MIN_SIZE_LOG2;
pub const HEAP_MAX_BO_COUNT: usize = (HEAP_MAX_SIZE_LOG2 - HEAP_MIN_SIZE_LOG2 + 1) as usize;

const BO_OFFSET_BITS: u32 = 48;

fn encode_vma(bo_idx: usize, offset: u64) -> u64 {
    debug_assert!(offset < (1 << BO_OFFSET_BITS));
    ((bo_idx as u64 + 1) << BO_OFFSET_BITS) | offset
}

fn vma_bo_idx(vma: u64) -> usize {
    ((vma >> BO_OFFSET_BITS) - 1) as usize
}

fn vma_bo_offset(vma: u64) -> u64 {
    vma & ((1 << BO_OFFSET_BITS) - 1)
}

#[derive(Debug)]
struct HeapBo {
    bo: Bo,
    map: Arc<dyn CpuMapping>,
}

#[derive(Debug)]
struct HeapState {
    bos: Vec<HeapBo>,
    vma: VmaHeap,
    total_size: u64,
}

/// A CPU-visible allocation from the heap.
#[derive(Debug, Clone)]
pub struct HeapAlloc {
    pub addr: u64,
    map: Arc<dyn CpuMapping>,
    offset: u64,
}

impl HeapAlloc {
    pub fn write(&self, at: u64, data: &[u8]) -> Result<()> {
        self.map
            .write(self.offset + at, data)
            .map_err(|e| Error::from_ioctl("heap_write", e))
    }
}

#[derive(Debug)]
pub struct ShaderHeap {
    mgr: Arc<BufMgr>,
    flags: BoFlags,
    /// Slack past the end of each BO for prefetching.
    overalloc: u64,
    state: Mutex<HeapState>,
}

impl ShaderHeap {
    pub fn new(mgr: Arc<BufMgr>, flags: BoFlags, overalloc: u64) -> Self {
        Self {
            mgr,
            flags: flags | BoFlags::MAP,
            overalloc,
            state: Mutex::new(HeapState {
                bos: Vec::new(),
                vma: VmaHeap::new_empty(
                    1 << BO_OFFSET_BITS,
                    (HEAP_MAX_BO_COUNT as u64) << BO_OFFSET_BITS,
                ),
                total_size: 0,
            }),
        }
    }

    pub fn bo_count(&self) -> usize {
        lock(&self.state).bos.len()
    }

    pub fn total_size(&self) -> u64 {
        lock(&self.state).total_size
    }

    pub fn free_size(&self) -> u64 {
        lock(&self.state).vma.free_size()
    }

    /// Every BO backing the heap, for submit residency.
    pub fn bos(&self) -> Vec<Bo> {
        lock(&self.state).bos.iter().map(|b| b.bo.clone()).collect()
    }

    fn grow_locked(&self, state: &mut HeapState) -> Result<()> {
        let idx = state.bos.len();
        if idx >= HEAP_MAX_BO_COUNT {
            return Err(Error::OutOfDeviceMemory);
        }
        // The first two BOs are the minimum size, then each doubles.
        let size = HEAP_MIN_SIZE << (idx.max(1) - 1);
        let bo = self.mgr.alloc(
            "shader heap",
            size + self.overalloc,
            0,
            MemZone::Shader,
            self.flags,
        )?;
        let map = bo.map()?;
        state
            .vma
            .free(encode_vma(idx, 0), size)
            .map_err(|_| Error::OutOfDeviceMemory)?;
        state.bos.push(HeapBo { bo, map });
        state.total_size += size;
        debug!(bo = idx, size, "shader heap grown");
        Ok(())
    }

    /// Returns the encoded heap offset alongside the allocation.
    fn alloc_locked(
        &self,
        state: &mut HeapState,
        size: u64,
        alignment: u64,
    ) -> Result<(u64, HeapAlloc)> {
        if size == 0 || size > HEAP_MIN_SIZE << (HEAP_MAX_BO_COUNT - 2) {
            return Err(Error::invalid(format!("shader heap allocation of {size} bytes")));
        }
        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            return Err(Error::invalid(format!("heap alignment {alignment}")));
        }
        loop {
            if let Some(vma) = state.vma.alloc(size, alignment) {
                let heap_bo = &state.bos[vma_bo_idx(vma)];
                let offset = vma_bo_offset(vma);
                let alloc = HeapAlloc {
                    addr: heap_bo.bo.address() + offset,
                    map: heap_bo.map.clone(),
                    offset,
                };
                return Ok((vma, alloc));
            }
            self.grow_locked(state)?;
        }
    }

    pub fn alloc(&self, size: u64, alignment: u64) -> Result<HeapAlloc> {
        let mut state = lock(&self.state);
        self.alloc_locked(&mut state, size, alignment)
            .map(|(_, alloc)| alloc)
    }

    /// Copy `data` into the heap and return its GPU address.
    pub fn upload(&self, data: &[u8], alignment: u64) -> Result<u64> {
        let mut state = lock(&self.state);
        let (vma, alloc) = self.alloc_locked(&mut state, data.len() as u64, alignment)?;
        if let Err(err) = alloc.write(0, data) {
            let _ = state.vma.free(vma, data.len() as u64);
            return Err(err);
        }
        Ok(alloc.addr)
    }

    /// Return `[addr, addr + size)`, found by GPU address.
    pub fn free(&self, addr: u64, size: u64) {
        let mut state = lock(&self.state);
        let Some((idx, offset)) = state.bos.iter().enumerate().find_map(|(i, b)| {
            let start = b.bo.address();
            (addr >= start && addr - start < b.bo.size()).then(|| (i, addr - start))
        }) else {
            debug_assert!(false, "free of {addr:#x} outside the shader heap");
            return;
        };
        if let Err(err) = state.vma.free(encode_vma(idx, offset), size) {
            debug_assert!(false, "shader heap free: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::kernel::mock::MockKernel;
    use pretty_assertions::assert_eq;

    fn heap() -> (Arc<MockKernel>, ShaderHeap) {
        let kernel = Arc::new(MockKernel::new());
        let mgr = BufMgr::new(kernel.clone(), &DeviceConfig::default());
        (kernel, ShaderHeap::new(mgr, BoFlags::LOCAL, 0))
    }

    #[test]
    fn encoding() {
        assert_eq!(encode_vma(0, 0x40), (1 << 48) | 0x40);
        assert_eq!(vma_bo_idx(encode_vma(3, 7)), 3);
        assert_eq!(vma_bo_offset(encode_vma(3, 7)), 7);
    }

    #[test]
    fn upload_lands_in_shader_zone() {
        let (kernel, heap) = heap();
        let addr = heap.upload(&[1, 2, 3, 4], 0x80).unwrap();
        assert_eq!(addr % 0x80, 0);
        assert_eq!(MemZone::for_address(addr), MemZone::Shader);
        let bo = &heap.bos()[0];
        assert_eq!(
            kernel.read_bo(bo.handle(), addr - bo.address(), 4).unwrap(),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn grows_min_min_then_doubling() {
        let (_kernel, heap) = heap();
        heap.alloc(HEAP_MIN_SIZE, 0x100).unwrap();
        heap.alloc(HEAP_MIN_SIZE, 0x100).unwrap();
        heap.alloc(HEAP_MIN_SIZE * 2, 0x100).unwrap();
        assert_eq!(heap.bo_count(), 3);
        assert_eq!(heap.total_size(), HEAP_MIN_SIZE * 4);
        assert_eq!(heap.free_size(), 0);
    }

    #[test]
    fn free_returns_space() {
        let (_kernel, heap) = heap();
        let a = heap.alloc(0x1000, 0x100).unwrap();
        let before = heap.free_size();
        heap.free(a.addr, 0x1000);
        assert_eq!(heap.free_size(), before + 0x1000);
        let b = heap.alloc(0x1000, 0x100).unwrap();
        assert_eq!(b.addr, a.addr);
    }
}
