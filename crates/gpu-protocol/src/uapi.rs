//! Abstract kernel submit records.
//!
//! These mirror the payloads of the exec and VM-bind ioctls without fixing a
//! wire format: a kernel backend translates them into whatever its uAPI
//! expects.

use bitflags::bitflags;
use thiserror::Error;

use crate::push::MAX_PUSH_BYTES;

bitflags! {
    /// Access the GPU performs on a BO during a submit.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct BoAccess: u32 {
        const RD = 1 << 0;
        const WR = 1 << 1;
        const RDWR = Self::RD.bits() | Self::WR.bits();
    }
}

bitflags! {
    /// Memory domains, shared by residency hints and `BO_SET_DOMAIN`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct MemDomain: u32 {
        const CPU = 1 << 0;
        const VRAM = 1 << 1;
        const GART = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct BindFlags: u32 {
        /// Return before the page-table update is applied.
        const RUN_ASYNC = 1 << 0;
    }
}

/// CPU caching mode requested for a BO mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MmapMode {
    Wb,
    Wc,
    Uc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Madvise {
    WillNeed,
    DontNeed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncKind {
    Syncobj,
    TimelineSyncobj,
}

/// One wait or signal attached to a submit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncRecord {
    pub kind: SyncKind,
    pub handle: u32,
    /// Ignored for [`SyncKind::Syncobj`].
    pub timeline_value: u64,
}

impl SyncRecord {
    pub const fn syncobj(handle: u32) -> Self {
        Self {
            kind: SyncKind::Syncobj,
            handle,
            timeline_value: 0,
        }
    }

    pub const fn timeline(handle: u32, value: u64) -> Self {
        Self {
            kind: SyncKind::TimelineSyncobj,
            handle,
            timeline_value: value,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("push range of {len} bytes exceeds the {max} byte limit")]
    PushTooLarge { len: u64, max: u64 },

    #[error("push range va={va:#x} len={len} is not dword aligned")]
    PushMisaligned { va: u64, len: u64 },
}

/// A byte range of method stream handed to the kernel verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PushRange {
    pub va: u64,
    pub len: u32,
    pub no_prefetch: bool,
}

impl PushRange {
    pub fn new(va: u64, len: u64, no_prefetch: bool) -> Result<Self, RecordError> {
        if len > MAX_PUSH_BYTES {
            return Err(RecordError::PushTooLarge {
                len,
                max: MAX_PUSH_BYTES,
            });
        }
        if va % 4 != 0 || len % 4 != 0 {
            return Err(RecordError::PushMisaligned { va, len });
        }
        Ok(Self {
            va,
            len: len as u32,
            no_prefetch,
        })
    }
}

/// Residency hint for one BO in a submit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoResidency {
    pub handle: u32,
    pub access: BoAccess,
    pub domain: MemDomain,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub channel: u32,
    pub pushes: Vec<PushRange>,
    pub bos: Vec<BoResidency>,
    pub waits: Vec<SyncRecord>,
    pub signals: Vec<SyncRecord>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindOpKind {
    Map,
    Unmap,
}

/// One page-table update of a sparse bind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindOp {
    pub op: BindOpKind,
    /// Zero for unmaps.
    pub handle: u32,
    pub addr: u64,
    pub bo_offset: u64,
    pub range: u64,
    /// Page-table kind for tiled planes.
    pub flags: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmBindRequest {
    pub ops: Vec<BindOp>,
    pub waits: Vec<SyncRecord>,
    pub signals: Vec<SyncRecord>,
    pub flags: BindFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_range_limits() {
        assert!(PushRange::new(0x1000, MAX_PUSH_BYTES, false).is_ok());
        assert_eq!(
            PushRange::new(0x1000, MAX_PUSH_BYTES + 4, false),
            Err(RecordError::PushTooLarge {
                len: MAX_PUSH_BYTES + 4,
                max: MAX_PUSH_BYTES
            })
        );
        assert!(matches!(
            PushRange::new(0x1002, 8, false),
            Err(RecordError::PushMisaligned { .. })
        ));
        assert!(matches!(
            PushRange::new(0x1000, 6, false),
            Err(RecordError::PushMisaligned { .. })
        ));
    }

    #[test]
    fn access_union() {
        assert_eq!(BoAccess::RD | BoAccess::WR, BoAccess::RDWR);
        assert_eq!(SyncRecord::syncobj(3).timeline_value, 0);
        assert_eq!(SyncRecord::timeline(3, 9).kind, SyncKind::TimelineSyncobj);
    }
}
