//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel across the
//! QUIC transport layer.
//!
//! Callers of the node service only see three outcomes, expressed by
//! [`StatusCode`]: a bad request, a permission failure, or an internal error
//! worth retrying.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument (missing `remote`, malformed
    /// `rc-addr`, empty target path, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operating system refused the mount for lack of permission.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// `rclone mount` exited unsuccessfully; `reason` carries its output.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Caller-facing status taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusCode {
    InvalidArgument,
    PermissionDenied,
    Internal,
    Unavailable,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::PermissionDenied => "PermissionDenied",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
        };
        f.write_str(name)
    }
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Classify this error into the status code reported to the caller.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::PermissionDenied(_) => StatusCode::PermissionDenied,
            Self::MountFailed { .. } | Self::UnmountFailed { .. } | Self::Internal(_) => {
                StatusCode::Internal
            }
            Self::TransportError(_) => StatusCode::Unavailable,
        }
    }
}
