//! Error types for the acceleration engine.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, AccelError>;

/// Errors surfaced by the acceleration engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AccelError {
    /// MKey/PSV pool empty or no room left in a queue
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// More scatter/gather entries than a work request can carry
    #[error("Too many scatter entries: {0}")]
    TooManySge(usize),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Memory domain or device map refused to translate an address
    #[error("Memory translation failed: addr {addr:#x}, len {len}")]
    Translation { addr: u64, len: usize },

    /// The device rejected a work request
    #[error("Work request post failed: {0}")]
    WrPost(String),

    /// The device reported a completion error or signature mismatch
    #[error("I/O error reported by device")]
    Io,

    /// Operation not supported by this device
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl AccelError {
    /// Convert to an appropriate errno value for callers keeping the
    /// original integer contract.
    #[inline]
    #[must_use]
    #[allow(clippy::wildcard_enum_match_arm)]
    pub fn to_errno(&self) -> i32 {
        match *self {
            AccelError::ResourceExhausted(_) => libc::ENOMEM,
            AccelError::TooManySge(_) => libc::E2BIG,
            AccelError::InvalidInput(_) => libc::EINVAL,
            AccelError::Translation { .. } => libc::EINVAL,
            AccelError::Unsupported(_) => libc::ENOTSUP,
            AccelError::Config(_) => libc::EINVAL,
            _ => libc::EIO,
        }
    }

    /// True for the transient out-of-resources condition that queues the
    /// task instead of failing it.
    #[inline]
    pub(crate) fn is_nomem(&self) -> bool {
        matches!(*self, AccelError::ResourceExhausted(_))
    }
}
