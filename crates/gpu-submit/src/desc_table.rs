//! Flat, BO-backed tables of fixed-size descriptors.
//!
//! Image and sampler descriptors are addressed by index from shaders, so an
//! index stays valid until it is freed. Growing the table moves it to a new
//! BO; the revision counter lets consumers notice and re-emit the pool
//! address.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::bo::{Bo, BoFlags, BufMgr};
use crate::kernel::CpuMapping;
use crate::vma::MemZone;
use crate::{lock, Error, Result};

pub const IMAGE_DESCRIPTOR_SIZE: u32 = 32;
pub const SAMPLER_DESCRIPTOR_SIZE: u32 = 32;
pub const MAX_IMAGE_DESCRIPTORS: u32 = 1 << 20;
pub const MAX_SAMPLER_DESCRIPTORS: u32 = 1 << 12;
pub const MIN_DESCRIPTORS: u32 = 1024;
const TABLE_ALIGN: u64 = 256;

#[derive(Debug)]
struct TableState {
    bo: Bo,
    map: Arc<dyn CpuMapping>,
    /// Capacity in descriptors.
    alloc: u32,
    /// Everything at or past this index has never been handed out.
    next_desc: u32,
    free: BTreeSet<u32>,
    revision: u64,
}

#[derive(Debug)]
pub struct DescriptorTable {
    mgr: Arc<BufMgr>,
    name: &'static str,
    desc_size: u32,
    max_count: u32,
    state: Mutex<TableState>,
}

impl DescriptorTable {
    pub fn new(
        mgr: Arc<BufMgr>,
        name: &'static str,
        desc_size: u32,
        min_count: u32,
        max_count: u32,
    ) -> Result<Self> {
        if desc_size == 0 || min_count == 0 || min_count > max_count {
            return Err(Error::invalid(format!(
                "descriptor table {name}: {min_count}..{max_count} x {desc_size}"
            )));
        }
        let (bo, map) = Self::new_bo(&mgr, name, desc_size, min_count)?;
        Ok(Self {
            mgr,
            name,
            desc_size,
            max_count,
            state: Mutex::new(TableState {
                bo,
                map,
                alloc: min_count,
                next_desc: 0,
                free: BTreeSet::new(),
                revision: 0,
            }),
        })
    }

    fn new_bo(
        mgr: &Arc<BufMgr>,
        name: &'static str,
        desc_size: u32,
        count: u32,
    ) -> Result<(Bo, Arc<dyn CpuMapping>)> {
        let size = count as u64 * desc_size as u64;
        let bo = mgr
            .alloc(
                name,
                size,
                TABLE_ALIGN,
                MemZone::Other,
                BoFlags::LOCAL | BoFlags::MAP,
            )
            .map_err(|_| Error::OutOfDeviceMemory)?;
        let map = bo.map().map_err(|_| Error::OutOfDeviceMemory)?;
        Ok((bo, map))
    }

    pub fn desc_size(&self) -> u32 {
        self.desc_size
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// Current backing BO and capacity.
    pub fn snapshot(&self) -> (Bo, u32) {
        let state = lock(&self.state);
        (state.bo.clone(), state.alloc)
    }

    pub fn revision(&self) -> u64 {
        lock(&self.state).revision
    }

    pub fn address(&self) -> u64 {
        lock(&self.state).bo.address()
    }

    pub fn free_count(&self) -> usize {
        lock(&self.state).free.len()
    }

    /// Indices handed out so far, freed ones included.
    pub fn high_water(&self) -> u32 {
        lock(&self.state).next_desc
    }

    /// Reserve a slot; the lowest free index wins.
    pub fn alloc(&self) -> Result<u32> {
        let mut state = lock(&self.state);
        if let Some(index) = state.free.pop_first() {
            return Ok(index);
        }
        if state.next_desc == state.alloc {
            self.grow_locked(&mut state)?;
        }
        let index = state.next_desc;
        state.next_desc += 1;
        Ok(index)
    }

    /// Reserve a slot and fill it.
    pub fn add(&self, desc: &[u8]) -> Result<u32> {
        let index = self.alloc()?;
        if let Err(err) = self.write(index, desc) {
            self.free(index);
            return Err(err);
        }
        Ok(index)
    }

    /// Return `index`. Trailing slots fold back into the never-used range.
    pub fn free(&self, index: u32) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if index >= state.next_desc || state.free.contains(&index) {
            debug_assert!(false, "{}: double free of descriptor {index}", self.name);
            return;
        }
        state.free.insert(index);
        while state.next_desc > 0 && state.free.remove(&(state.next_desc - 1)) {
            state.next_desc -= 1;
        }
    }

    pub fn write(&self, index: u32, desc: &[u8]) -> Result<()> {
        if desc.len() > self.desc_size as usize {
            return Err(Error::invalid(format!(
                "{} byte descriptor in a {} byte table",
                desc.len(),
                self.desc_size
            )));
        }
        let state = lock(&self.state);
        if index >= state.next_desc {
            return Err(Error::invalid(format!("descriptor {index} not allocated")));
        }
        state
            .map
            .write(index as u64 * self.desc_size as u64, desc)
            .map_err(|e| Error::from_ioctl("descriptor_write", e))
    }

    pub fn read(&self, index: u32) -> Result<Vec<u8>> {
        let state = lock(&self.state);
        let mut out = vec![0u8; self.desc_size as usize];
        state
            .map
            .read(index as u64 * self.desc_size as u64, &mut out)
            .map_err(|e| Error::from_ioctl("descriptor_read", e))?;
        Ok(out)
    }

    fn grow_locked(&self, state: &mut TableState) -> Result<()> {
        if state.alloc >= self.max_count {
            return Err(Error::OutOfDeviceMemory);
        }
        let new_alloc = state.alloc.saturating_mul(2).min(self.max_count);
        let (bo, map) = Self::new_bo(&self.mgr, self.name, self.desc_size, new_alloc)?;

        let used = state.next_desc as usize * self.desc_size as usize;
        let mut contents = vec![0u8; used];
        state
            .map
            .read(0, &mut contents)
            .and_then(|()| map.write(0, &contents))
            .map_err(|_| Error::OutOfDeviceMemory)?;

        debug!(
            table = self.name,
            from = state.alloc,
            to = new_alloc,
            "descriptor table grown"
        );
        state.bo = bo;
        state.map = map;
        state.alloc = new_alloc;
        state.revision += 1;
        Ok(())
    }
}
