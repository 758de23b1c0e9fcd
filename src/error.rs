//! Error types for block allocation

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("Out of space: no free blocks available")]
    NoSpace,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Volume error: {0}")]
    Volume(#[source] anyhow::Error),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid magic number in superblock")]
    InvalidMagic,

    #[error("Unsupported format version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u32),

    #[error("Superblock checksum verification failed")]
    ChecksumMismatch,

    #[error("Corrupted metadata: {0}")]
    Corrupted(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AllocError {
    /// True for errors caused by a broken caller contract rather than the volume.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, AllocError::InvariantViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, AllocError>;

/// Builds the error for a broken allocator invariant.
///
/// Debug builds panic with `invariant violated: <message>`; release builds log
/// the violation and hand back [`AllocError::InvariantViolation`] so the
/// current operation fails instead of the process.
pub(crate) fn invariant_violation(message: String) -> AllocError {
    if cfg!(debug_assertions) {
        panic!("invariant violated: {}", message);
    }
    tracing::error!("invariant violated: {}", message);
    AllocError::InvariantViolation(message)
}

/// Returns early with [`invariant_violation`] when `$cond` does not hold
macro_rules! ensure_invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::invariant_violation(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_invariant;
