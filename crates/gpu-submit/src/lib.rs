//! GPU command-submission core.
//!
//! Buffer objects come from a per-device [`bo::BufMgr`] that caches them in
//! size buckets and hands out VA from fixed [`vma`] zones. Command buffers
//! record method streams through [`push::PushBuilder`] into push chunks,
//! and a [`queue::Queue`] turns them into one kernel exec. Compute dispatch,
//! the copy engine and graphics preambles are method-stream emitters on top
//! of the builder; [`prim_cull`] drives the async compute pre-pass that
//! patches draws through a REWIND token.
//!
//! Everything that blocks goes through the [`kernel::KernelDevice`] trait.

use std::sync::{Mutex, MutexGuard};

pub mod bo;
pub mod caps;
pub mod cmd_buffer;
pub mod compute;
pub mod config;
pub mod copy;
pub mod desc_table;
pub mod device;
mod error;
pub mod heap;
pub mod kernel;
pub mod pipeline;
pub mod prim_cull;
pub mod push;
pub mod queue;
pub mod slm;
pub mod stats;
pub mod vma;
pub mod zs_clear;

pub use bo::{Bo, BoFlags, BufMgr};
pub use config::{DeviceConfig, PrimCullConfig};
pub use device::Device;
pub use error::{Error, Result};

/// Lock `m`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
