//! BO-backed completion objects for kernels without syncobjs.
//!
//! The BO rides along in every submit that signals the sync; the kernel's
//! busy tracking of that BO is the completion signal.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::trace;

use super::{Bo, BoFlags, BufMgr};
use crate::vma::MemZone;
use crate::{lock, Error, Result};

const BO_SYNC_SIZE: u64 = 4096;
const ANY_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoSyncState {
    Reset,
    Submitted,
    Signaled,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct BoSyncWaitFlags: u32 {
        /// Return once any one object completes.
        const ANY = 1 << 0;
        /// Being submitted is enough; do not wait for the GPU.
        const PENDING = 1 << 1;
    }
}

#[derive(Debug)]
pub struct BoSync {
    bo: Bo,
    state: Mutex<BoSyncState>,
    cond: Condvar,
}

/// Relative kernel timeout left until `deadline`; negative means forever.
fn remaining_ns(deadline: Option<Instant>) -> i64 {
    match deadline {
        None => -1,
        Some(d) => d
            .saturating_duration_since(Instant::now())
            .as_nanos()
            .min(i64::MAX as u128) as i64,
    }
}

impl BoSync {
    pub fn new(mgr: &Arc<BufMgr>, signaled: bool) -> Result<Self> {
        let bo = mgr.alloc("bo-sync", BO_SYNC_SIZE, 0, MemZone::Other, BoFlags::GART)?;
        let state = if signaled {
            BoSyncState::Signaled
        } else {
            BoSyncState::Reset
        };
        Ok(Self {
            bo,
            state: Mutex::new(state),
            cond: Condvar::new(),
        })
    }

    pub fn bo(&self) -> &Bo {
        &self.bo
    }

    pub fn state(&self) -> BoSyncState {
        *lock(&self.state)
    }

    pub fn reset(&self) {
        *lock(&self.state) = BoSyncState::Reset;
    }

    /// Host-side signal.
    pub fn signal(&self) {
        *lock(&self.state) = BoSyncState::Signaled;
        self.cond.notify_all();
    }

    /// A submit carrying this BO made it to the kernel.
    pub(crate) fn mark_submitted(&self) {
        *lock(&self.state) = BoSyncState::Submitted;
        self.cond.notify_all();
    }

    /// Wait for every object in `syncs`, or any one with
    /// [`BoSyncWaitFlags::ANY`]. `None` waits forever.
    pub fn wait_many(
        syncs: &[&BoSync],
        flags: BoSyncWaitFlags,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if syncs.is_empty() {
            return Ok(());
        }
        if flags.contains(BoSyncWaitFlags::ANY) && syncs.len() > 1 {
            return Self::wait_any(syncs, flags, deadline);
        }
        for sync in syncs {
            sync.wait_one(flags, deadline)?;
        }
        Ok(())
    }

    fn wait_any(
        syncs: &[&BoSync],
        flags: BoSyncWaitFlags,
        deadline: Option<Instant>,
    ) -> Result<()> {
        loop {
            for sync in syncs {
                if sync.poll(flags)? {
                    return Ok(());
                }
            }
            let slice = match deadline {
                None => ANY_POLL_INTERVAL,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::Timeout);
                    }
                    left.min(ANY_POLL_INTERVAL)
                }
            };
            std::thread::sleep(slice);
        }
    }

    /// Non-blocking completion check.
    fn poll(&self, flags: BoSyncWaitFlags) -> Result<bool> {
        match self.state() {
            BoSyncState::Signaled => Ok(true),
            BoSyncState::Reset => Ok(false),
            BoSyncState::Submitted if flags.contains(BoSyncWaitFlags::PENDING) => Ok(true),
            BoSyncState::Submitted => match self.bo.wait(0) {
                Ok(()) => {
                    self.complete();
                    Ok(true)
                }
                Err(Error::Timeout) => Ok(false),
                Err(err) => Err(err),
            },
        }
    }

    fn wait_one(&self, flags: BoSyncWaitFlags, deadline: Option<Instant>) -> Result<()> {
        let mut state = lock(&self.state);
        while *state == BoSyncState::Reset {
            state = self.wait_submitted(state, deadline)?;
        }
        if *state == BoSyncState::Signaled || flags.contains(BoSyncWaitFlags::PENDING) {
            return Ok(());
        }
        drop(state);

        let timeout_ns = remaining_ns(deadline);
        trace!(handle = self.bo.handle(), timeout_ns, "waiting on bo sync");
        self.bo.wait(timeout_ns)?;
        self.complete();
        Ok(())
    }

    fn complete(&self) {
        let mut state = lock(&self.state);
        // A concurrent reset wins.
        if *state == BoSyncState::Submitted {
            *state = BoSyncState::Signaled;
        }
    }

    fn wait_submitted<'a>(
        &'a self,
        guard: MutexGuard<'a, BoSyncState>,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, BoSyncState>> {
        match deadline {
            None => Ok(match self.cond.wait(guard) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            }),
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(Error::Timeout);
                }
                let (guard, _) = match self.cond.wait_timeout(guard, left) {
                    Ok(r) => r,
                    Err(poisoned) => poisoned.into_inner(),
                };
                Ok(guard)
            }
        }
    }
}
