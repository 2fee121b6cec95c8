//! GPU virtual-address allocation.
//!
//! The 48-bit VA space is split into fixed zones. Each general zone owns a
//! [`VmaHeap`]: a hole list allocated top-down, first fit, with neighbouring
//! holes merged on free.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

use crate::config::DeviceConfig;

const GIB: u64 = 1 << 30;
const KIB_64: u64 = 64 * 1024;

pub const SHADER_START: u64 = 0;
pub const BINDER_START: u64 = 4 * GIB;
/// Room for 100 binder blocks of 64 KiB.
pub const BINDER_SIZE: u64 = 100 * KIB_64;
pub const SURFACE_START: u64 = BINDER_START + BINDER_SIZE;
pub const DYNAMIC_START: u64 = 8 * GIB;
pub const OTHER_START: u64 = 12 * GIB;
pub const BORDER_COLOR_POOL_ADDRESS: u64 = DYNAMIC_START;
pub const BORDER_COLOR_POOL_SIZE: u64 = KIB_64;

/// A fixed partition of the VA space, in ascending address order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemZone {
    Shader,
    Binder,
    Surface,
    Dynamic,
    BorderColorPool,
    Other,
}

impl MemZone {
    pub fn name(self) -> &'static str {
        match self {
            MemZone::Shader => "shader",
            MemZone::Binder => "binder",
            MemZone::Surface => "surface",
            MemZone::Dynamic => "dynamic",
            MemZone::BorderColorPool => "border-color",
            MemZone::Other => "other",
        }
    }

    /// Zone containing `addr` (48-bit, not canonicalized).
    pub fn for_address(addr: u64) -> Self {
        if addr >= OTHER_START {
            MemZone::Other
        } else if addr == DYNAMIC_START {
            MemZone::BorderColorPool
        } else if addr > DYNAMIC_START {
            MemZone::Dynamic
        } else if addr >= SURFACE_START {
            MemZone::Surface
        } else if addr >= BINDER_START {
            MemZone::Binder
        } else {
            MemZone::Shader
        }
    }
}

/// Sign-extend from bit 47.
#[inline]
pub const fn canonical_address(addr: u64) -> u64 {
    (((addr << 16) as i64) >> 16) as u64
}

/// Strip a canonical address back to its low 48 bits.
#[inline]
pub const fn address_48b(addr: u64) -> u64 {
    addr & ((1 << 48) - 1)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VmaError {
    #[error("range {addr:#x}+{size:#x} is outside the heap")]
    OutOfRange { addr: u64, size: u64 },
    #[error("range {addr:#x}+{size:#x} overlaps a free hole")]
    DoubleFree { addr: u64, size: u64 },
}

/// Hole-list VA heap.
#[derive(Debug, Clone)]
pub struct VmaHeap {
    start: u64,
    size: u64,
    /// hole start -> hole size
    holes: BTreeMap<u64, u64>,
    free_size: u64,
}

impl VmaHeap {
    pub fn new(start: u64, size: u64) -> Self {
        let mut holes = BTreeMap::new();
        if size > 0 {
            holes.insert(start, size);
        }
        Self {
            start,
            size,
            holes,
            free_size: size,
        }
    }

    /// Heap spanning `[start, start + size)` with nothing free yet. Ranges
    /// become allocatable as they are freed into it.
    pub fn new_empty(start: u64, size: u64) -> Self {
        Self {
            start,
            size,
            holes: BTreeMap::new(),
            free_size: 0,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes not currently allocated.
    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    pub fn hole_count(&self) -> usize {
        self.holes.len()
    }

    /// Allocate `size` bytes aligned to `align` from the highest hole that
    /// fits.
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        debug_assert!(align.is_power_of_two());
        if size == 0 {
            return None;
        }
        let (hole_start, hole_size, addr) = self.holes.iter().rev().find_map(|(&start, &len)| {
            if len < size {
                return None;
            }
            let addr = (start + len - size) & !(align - 1);
            (addr >= start).then_some((start, len, addr))
        })?;

        self.holes.remove(&hole_start);
        if addr > hole_start {
            self.holes.insert(hole_start, addr - hole_start);
        }
        let hole_end = hole_start + hole_size;
        let alloc_end = addr + size;
        if hole_end > alloc_end {
            self.holes.insert(alloc_end, hole_end - alloc_end);
        }
        self.free_size -= size;
        Some(addr)
    }

    /// Return `[addr, addr + size)` to the heap.
    pub fn free(&mut self, addr: u64, size: u64) -> Result<(), VmaError> {
        let end = addr
            .checked_add(size)
            .ok_or(VmaError::OutOfRange { addr, size })?;
        if size == 0 || addr < self.start || end > self.start + self.size {
            return Err(VmaError::OutOfRange { addr, size });
        }

        let prev = self
            .holes
            .range(..=addr)
            .next_back()
            .map(|(&s, &l)| (s, l));
        let next = self.holes.range(addr..).next().map(|(&s, &l)| (s, l));
        if prev.is_some_and(|(s, l)| s + l > addr) || next.is_some_and(|(s, _)| s < end) {
            return Err(VmaError::DoubleFree { addr, size });
        }

        let mut hole_start = addr;
        let mut hole_size = size;
        if let Some((s, l)) = prev {
            if s + l == addr {
                self.holes.remove(&s);
                hole_start = s;
                hole_size += l;
            }
        }
        if let Some((s, l)) = next {
            if s == end {
                self.holes.remove(&s);
                hole_size += l;
            }
        }
        self.holes.insert(hole_start, hole_size);
        self.free_size += size;
        Ok(())
    }
}

/// Per-zone VA allocator.
#[derive(Debug, Clone)]
pub struct VmaAllocator {
    shader: VmaHeap,
    surface: VmaHeap,
    dynamic: VmaHeap,
    other: VmaHeap,
    min_align: u64,
}

impl VmaAllocator {
    pub fn new(config: &DeviceConfig) -> Self {
        let page = config.page_size;
        // Never hand out the top page of a 4 GiB zone, so base + size fits
        // in 32 bits for state base address programming.
        let zone_4g = 4 * GIB - page;
        let dynamic_size = if config.compact_dynamic_zone {
            2 * GIB - BORDER_COLOR_POOL_SIZE
        } else {
            zone_4g - BORDER_COLOR_POOL_SIZE
        };
        let other_size = config
            .gtt_size
            .min(1 << 48)
            .saturating_sub(4 * GIB)
            .saturating_sub(OTHER_START);
        Self {
            // Address zero stays unmapped.
            shader: VmaHeap::new(SHADER_START + page, zone_4g - page),
            surface: VmaHeap::new(SURFACE_START, zone_4g - BINDER_SIZE),
            dynamic: VmaHeap::new(DYNAMIC_START + BORDER_COLOR_POOL_SIZE, dynamic_size),
            other: VmaHeap::new(OTHER_START, other_size),
            min_align: config.vma_min_align(),
        }
    }

    pub fn min_align(&self) -> u64 {
        self.min_align
    }

    pub fn heap(&self, zone: MemZone) -> Option<&VmaHeap> {
        match zone {
            MemZone::Shader => Some(&self.shader),
            MemZone::Surface => Some(&self.surface),
            MemZone::Dynamic => Some(&self.dynamic),
            MemZone::Other => Some(&self.other),
            MemZone::Binder | MemZone::BorderColorPool => None,
        }
    }

    fn heap_mut(&mut self, zone: MemZone) -> Option<&mut VmaHeap> {
        match zone {
            MemZone::Shader => Some(&mut self.shader),
            MemZone::Surface => Some(&mut self.surface),
            MemZone::Dynamic => Some(&mut self.dynamic),
            MemZone::Other => Some(&mut self.other),
            MemZone::Binder | MemZone::BorderColorPool => None,
        }
    }

    /// Allocate a canonical VA in `zone`. `None` when the zone is exhausted.
    pub fn alloc(&mut self, zone: MemZone, size: u64, align: u64) -> Option<u64> {
        let align = align.max(self.min_align).next_power_of_two();
        let addr = match zone {
            MemZone::BorderColorPool => BORDER_COLOR_POOL_ADDRESS,
            MemZone::Binder => BINDER_START,
            _ => self.heap_mut(zone)?.alloc(size, align)?,
        };
        debug_assert_eq!(addr >> 48, 0);
        Some(canonical_address(addr))
    }

    /// Release a VA obtained from [`Self::alloc`].
    pub fn free(&mut self, addr: u64, size: u64) {
        if addr == BORDER_COLOR_POOL_ADDRESS {
            return;
        }
        let addr = address_48b(addr);
        let zone = MemZone::for_address(addr);
        let Some(heap) = self.heap_mut(zone) else {
            return;
        };
        if let Err(err) = heap.free(addr, size) {
            warn!(zone = zone.name(), %err, "vma free rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn heap_allocates_top_down_and_merges() {
        let mut heap = VmaHeap::new(0x1000, 0x10000);
        let a = heap.alloc(0x1000, 0x1000).unwrap();
        assert_eq!(a, 0x10000);
        let b = heap.alloc(0x1000, 0x1000).unwrap();
        assert_eq!(b, 0xf000);
        assert_eq!(heap.free_size(), 0xe000);
        heap.free(a, 0x1000).unwrap();
        heap.free(b, 0x1000).unwrap();
        assert_eq!(heap.hole_count(), 1);
        assert_eq!(heap.free_size(), 0x10000);
    }

    #[test]
    fn heap_alignment_leaves_tail_hole() {
        let mut heap = VmaHeap::new(0, 0x30000);
        let a = heap.alloc(0x100, 0x10000).unwrap();
        assert_eq!(a, 0x20000);
        // Tail above the allocation stays free.
        assert_eq!(heap.alloc(0xff00, 1).unwrap(), 0x20100);
    }

    #[test]
    fn heap_rejects_double_free() {
        let mut heap = VmaHeap::new(0, 0x4000);
        let a = heap.alloc(0x1000, 0x1000).unwrap();
        heap.free(a, 0x1000).unwrap();
        assert_eq!(
            heap.free(a, 0x1000),
            Err(VmaError::DoubleFree { addr: a, size: 0x1000 })
        );
        assert!(matches!(
            heap.free(0x8000, 0x1000),
            Err(VmaError::OutOfRange { .. })
        ));
    }

    #[test]
    fn zones_classify_addresses() {
        assert_eq!(MemZone::for_address(0x1000), MemZone::Shader);
        assert_eq!(MemZone::for_address(BINDER_START), MemZone::Binder);
        assert_eq!(MemZone::for_address(SURFACE_START), MemZone::Surface);
        assert_eq!(MemZone::for_address(DYNAMIC_START), MemZone::BorderColorPool);
        assert_eq!(MemZone::for_address(DYNAMIC_START + 1), MemZone::Dynamic);
        assert_eq!(MemZone::for_address(OTHER_START), MemZone::Other);
    }

    #[test]
    fn canonical_round_trip() {
        assert_eq!(canonical_address(0x0000_8000_0000_0000), 0xffff_8000_0000_0000);
        assert_eq!(canonical_address(0x0000_7fff_0000_0000), 0x0000_7fff_0000_0000);
        assert_eq!(address_48b(0xffff_8000_0000_1000), 0x0000_8000_0000_1000);
    }

    #[test]
    fn fixed_zones_and_other_top() {
        let mut vma = VmaAllocator::new(&DeviceConfig::default());
        assert_eq!(
            vma.alloc(MemZone::BorderColorPool, 4096, 4096),
            Some(BORDER_COLOR_POOL_ADDRESS)
        );
        assert_eq!(vma.alloc(MemZone::Binder, 4096, 4096), Some(BINDER_START));
        vma.free(BORDER_COLOR_POOL_ADDRESS, 4096);

        let other = vma.alloc(MemZone::Other, 1 << 20, 1).unwrap();
        // The top of OTHER sits above bit 47, so the address comes back
        // sign-extended.
        assert_eq!(other >> 48, 0xffff);
        assert_eq!(address_48b(other) + (1 << 20), (1u64 << 48) - 4 * GIB);
        assert_eq!(address_48b(other) % (64 * 1024), 0);
        let before = vma.heap(MemZone::Other).unwrap().free_size();
        vma.free(other, 1 << 20);
        assert_eq!(vma.heap(MemZone::Other).unwrap().free_size(), before + (1 << 20));
    }
}
