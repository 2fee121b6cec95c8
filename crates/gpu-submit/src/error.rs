use gpu_protocol::uapi::RecordError;
use thiserror::Error;

use crate::kernel::KernelError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the submission core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("out of host memory")]
    OutOfHostMemory,

    /// VA exhaustion, descriptor-table growth failure or a kernel `ENOMEM`.
    #[error("out of device memory")]
    OutOfDeviceMemory,

    /// The kernel reported the device gone. Sticky per queue.
    #[error("device lost")]
    DeviceLost,

    #[error("{op} failed: errno {errno}")]
    IoctlFailed { op: &'static str, errno: i32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timed out")]
    Timeout,
}

impl Error {
    /// Classify a kernel error returned by `op`.
    pub fn from_ioctl(op: &'static str, err: KernelError) -> Self {
        match err {
            KernelError::NoDevice => Error::DeviceLost,
            KernelError::NoMemory => Error::OutOfDeviceMemory,
            KernelError::TimedOut => Error::Timeout,
            other => Error::IoctlFailed {
                op,
                errno: other.errno(),
            },
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

impl From<RecordError> for Error {
    fn from(err: RecordError) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_errors_are_classified() {
        assert_eq!(Error::from_ioctl("exec", KernelError::NoDevice), Error::DeviceLost);
        assert_eq!(
            Error::from_ioctl("bo_create", KernelError::NoMemory),
            Error::OutOfDeviceMemory
        );
        assert_eq!(Error::from_ioctl("bo_wait", KernelError::TimedOut), Error::Timeout);
        assert_eq!(
            Error::from_ioctl("vm_bind", KernelError::Invalid),
            Error::IoctlFailed {
                op: "vm_bind",
                errno: 22
            }
        );
        assert_eq!(
            Error::from_ioctl("exec", KernelError::Other(5)).to_string(),
            "exec failed: errno 5"
        );
    }
}
