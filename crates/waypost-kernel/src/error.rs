//! Kernel-specific error types.

use thiserror::Error;
use waypost_types::error::WaypostError;

/// Kernel error type wrapping [`WaypostError`] with node lifecycle failures.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped WaypostError.
    #[error(transparent)]
    Waypost(#[from] WaypostError),

    /// The node could not start.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

impl From<std::io::Error> for KernelError {
    fn from(err: std::io::Error) -> Self {
        KernelError::Waypost(WaypostError::Io(err))
    }
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
