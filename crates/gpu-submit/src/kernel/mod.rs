//! Abstract kernel surface.
//!
//! Every blocking operation the core performs goes through [`KernelDevice`].
//! Implementations translate to a concrete DRM uAPI; [`mock::MockKernel`] is
//! an in-memory one used by the tests.

use std::fmt;
use std::sync::Arc;

use gpu_protocol::uapi::{ExecRequest, Madvise, MemDomain, MmapMode, VmBindRequest};
use thiserror::Error;

pub mod mock;

/// errno-shaped kernel failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    #[error("no such device")]
    NoDevice,
    #[error("out of memory")]
    NoMemory,
    #[error("timer expired")]
    TimedOut,
    #[error("device or resource busy")]
    Busy,
    #[error("invalid argument")]
    Invalid,
    #[error("no such entry")]
    NotFound,
    #[error("errno {0}")]
    Other(i32),
}

impl KernelError {
    pub fn errno(self) -> i32 {
        match self {
            KernelError::NoDevice => 19,
            KernelError::NoMemory => 12,
            KernelError::TimedOut => 62,
            KernelError::Busy => 16,
            KernelError::Invalid => 22,
            KernelError::NotFound => 2,
            KernelError::Other(errno) => errno,
        }
    }
}

pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// A CPU view of a BO's pages.
pub trait CpuMapping: Send + Sync + fmt::Debug {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mode(&self) -> MmapMode;

    fn read(&self, offset: u64, out: &mut [u8]) -> KernelResult<()>;

    fn write(&self, offset: u64, data: &[u8]) -> KernelResult<()>;

    /// Fill `len` bytes at `offset` with `value`.
    fn fill(&self, offset: u64, len: u64, value: u8) -> KernelResult<()> {
        const CHUNK: u64 = 4096;
        let buf = [value; CHUNK as usize];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(CHUNK);
            self.write(offset + done, &buf[..n as usize])?;
            done += n;
        }
        Ok(())
    }
}

/// Result of `BO_CREATE` and `GEM_OPEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemObject {
    pub handle: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextParam {
    Recoverable,
    Priority,
}

pub trait KernelDevice: Send + Sync {
    /// Identity of the device node. Two handles opened on the same node
    /// return the same key.
    fn device_key(&self) -> u64;

    fn bo_create(&self, size: u64) -> KernelResult<GemObject>;
    fn bo_set_domain(&self, handle: u32, read: MemDomain, write: MemDomain) -> KernelResult<()>;
    /// Returns whether the pages are still retained.
    fn bo_madvise(&self, handle: u32, advice: Madvise) -> KernelResult<bool>;
    fn bo_busy(&self, handle: u32) -> KernelResult<bool>;
    /// Negative `timeout_ns` waits forever.
    fn bo_wait(&self, handle: u32, timeout_ns: i64) -> KernelResult<()>;
    fn has_mmap_offset(&self) -> bool;
    fn bo_mmap_offset(&self, handle: u32, mode: MmapMode) -> KernelResult<Arc<dyn CpuMapping>>;
    /// Legacy one-shot mapping, always write-back.
    fn bo_mmap(&self, handle: u32) -> KernelResult<Arc<dyn CpuMapping>>;
    fn gem_close(&self, handle: u32) -> KernelResult<()>;
    fn gem_open(&self, name: u32) -> KernelResult<GemObject>;
    fn gem_flink(&self, handle: u32) -> KernelResult<u32>;
    fn prime_handle_to_fd(&self, handle: u32, flags: u32) -> KernelResult<i32>;
    fn prime_fd_to_handle(&self, fd: i32) -> KernelResult<u32>;
    /// Size of a DMA-buf, as reported by seeking to its end.
    fn dmabuf_size(&self, fd: i32) -> KernelResult<u64>;

    fn context_create(&self) -> KernelResult<u32>;
    fn context_setparam(&self, ctx: u32, param: ContextParam, value: u64) -> KernelResult<()>;
    fn context_getparam(&self, ctx: u32, param: ContextParam) -> KernelResult<u64>;
    fn context_destroy(&self, ctx: u32) -> KernelResult<()>;

    fn exec(&self, req: &ExecRequest) -> KernelResult<()>;
    fn vm_bind(&self, req: &VmBindRequest) -> KernelResult<()>;
    fn reg_read(&self, offset: u32) -> KernelResult<u64>;

    fn syncobj_create(&self, signaled: bool) -> KernelResult<u32>;
    fn syncobj_wait(&self, handles: &[u32], timeout_ns: i64, wait_all: bool) -> KernelResult<()>;
    fn syncobj_destroy(&self, handle: u32) -> KernelResult<()>;
}

impl fmt::Debug for dyn KernelDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDevice")
            .field("device_key", &self.device_key())
            .finish()
    }
}
