//! Error types for netlink and platform operations.

use std::io;
use std::time::Duration;

/// Result type for netlink and platform operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the kernel or reconciling state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Kernel error with operation context.
    #[error("{operation}: {message} (errno {errno})")]
    KernelWithContext {
        /// The operation that failed.
        operation: String,
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Message was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid attribute format.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// Parse error.
    #[error("parse error: {0}")]
    Parse(String),

    /// Object is not known to the kernel or the cache.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create without replace semantics hit an existing identity.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed request fields.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Rejected by the capability gate.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// No acknowledgement arrived in time.
    #[error("{operation}: timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// How long we waited.
        after: Duration,
    },
}

/// Caller-facing status of an operation or capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Status {
    Success,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    NotSupported,
    /// Opaque kernel failure, errno surfaced verbatim.
    KernelError(i32),
    Timeout,
}

impl Status {
    /// Whether this status reports success.
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::NotFound => write!(f, "not-found"),
            Status::AlreadyExists => write!(f, "already-exists"),
            Status::InvalidArgument => write!(f, "invalid-argument"),
            Status::NotSupported => write!(f, "not-supported"),
            Status::KernelError(errno) => write!(f, "kernel-error({})", errno),
            Status::Timeout => write!(f, "timeout"),
        }
    }
}

impl Error {
    /// Create a kernel error from a (negative) errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Create a kernel error with operation context.
    pub fn from_errno_with_context(errno: i32, operation: impl Into<String>) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::KernelWithContext {
            operation: operation.into(),
            errno: -errno,
            message,
        }
    }

    /// Add context to this error.
    ///
    /// Wraps kernel errors with operation context. Other errors are returned unchanged.
    pub fn with_context(self, operation: impl Into<String>) -> Self {
        match self {
            Self::Kernel { errno, message } => Self::KernelWithContext {
                operation: operation.into(),
                errno,
                message,
            },
            other => other,
        }
    }

    /// Check if this is a "not found" error.
    ///
    /// Covers the errno values the kernel uses for a missing object of each
    /// kind: ENOENT (qdisc, filter), ESRCH (route), ENODEV (link) and
    /// EADDRNOTAVAIL (address).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => matches!(
                *errno,
                libc::ENOENT | libc::ESRCH | libc::ENODEV | libc::EADDRNOTAVAIL
            ),
            Self::NotFound(_) => true,
            _ => false,
        }
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(libc::EPERM | libc::EACCES))
    }

    /// Check if this is an "already exists" error (EEXIST).
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_)) || self.errno() == Some(libc::EEXIST)
    }

    /// Check if this is a "device busy" error (EBUSY).
    pub fn is_busy(&self) -> bool {
        self.errno() == Some(libc::EBUSY)
    }

    /// Check if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self.errno(), Some(libc::EAGAIN | libc::EBUSY | libc::EINTR))
    }

    /// Check if this is a receive buffer overrun on the socket.
    pub fn is_overrun(&self) -> bool {
        match self {
            Self::Io(e) => e.raw_os_error() == Some(libc::ENOBUFS),
            _ => false,
        }
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Map onto the closed caller-facing status set.
    pub fn status(&self) -> Status {
        match self {
            Self::NotFound(_) => Status::NotFound,
            Self::AlreadyExists(_) => Status::AlreadyExists,
            Self::InvalidArgument(_) => Status::InvalidArgument,
            Self::NotSupported(_) => Status::NotSupported,
            Self::Timeout { .. } => Status::Timeout,
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => {
                if self.is_not_found() {
                    Status::NotFound
                } else {
                    match *errno {
                        libc::EEXIST => Status::AlreadyExists,
                        libc::EINVAL => Status::InvalidArgument,
                        libc::EOPNOTSUPP => Status::NotSupported,
                        other => Status::KernelError(other),
                    }
                }
            }
            Self::Io(e) => Status::KernelError(e.raw_os_error().unwrap_or(libc::EIO)),
            Self::Truncated { .. }
            | Self::InvalidMessage(_)
            | Self::InvalidAttribute(_)
            | Self::Parse(_) => Status::KernelError(libc::EPROTO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errno() {
        let err = Error::from_errno(-1); // EPERM
        assert!(err.is_permission_denied());
        assert_eq!(err.errno(), Some(1));
        assert_eq!(err.status(), Status::KernelError(1));
    }

    #[test]
    fn test_from_errno_with_context() {
        let err = Error::from_errno_with_context(-2, "deleting qdisc on test0");
        assert!(err.is_not_found());
        let msg = err.to_string();
        assert!(msg.contains("deleting qdisc on test0"));
        assert!(msg.contains("No such file or directory"));
    }

    #[test]
    fn test_not_found_per_kind() {
        for errno in [libc::ENOENT, libc::ESRCH, libc::ENODEV, libc::EADDRNOTAVAIL] {
            let err = Error::from_errno(-errno);
            assert!(err.is_not_found(), "errno {} should be not-found", errno);
            assert_eq!(err.status(), Status::NotFound);
        }
    }

    #[test]
    fn test_transient_classes() {
        assert!(Error::from_errno(-libc::EAGAIN).is_transient());
        assert!(Error::from_errno(-libc::EBUSY).is_transient());
        assert!(!Error::from_errno(-libc::EINVAL).is_transient());
        assert!(!Error::from_errno(-libc::EPERM).is_transient());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::from_errno(-libc::EEXIST).status(),
            Status::AlreadyExists
        );
        assert_eq!(
            Error::from_errno(-libc::EINVAL).status(),
            Status::InvalidArgument
        );
        assert_eq!(
            Error::from_errno(-libc::EOPNOTSUPP).status(),
            Status::NotSupported
        );
        let timeout = Error::Timeout {
            operation: "add qdisc".into(),
            after: Duration::from_secs(1),
        };
        assert_eq!(timeout.status(), Status::Timeout);
        assert_eq!(
            Error::NotSupported("fq_codel".into()).status(),
            Status::NotSupported
        );
    }

    #[test]
    fn test_overrun() {
        let err = Error::Io(io::Error::from_raw_os_error(libc::ENOBUFS));
        assert!(err.is_overrun());
        assert!(!Error::from_errno(-libc::ENOBUFS).is_overrun());
    }

    #[test]
    fn test_with_context_keeps_other_errors() {
        let err = Error::InvalidArgument("prefix length 33".into()).with_context("add address");
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
