//! Memory subsystem error types
//!
//! Specific error types for production-grade error handling

use thiserror::Error;

/// Memory subsystem errors
#[derive(Debug, Error)]
pub enum MemoryError {
    /// System allocation failed after pool fallback
    #[error("out of memory: system allocation of {size} bytes failed")]
    OutOfMemory { size: usize },

    /// Bounded pool with auto-expand disabled is drained
    #[error("pool exhausted: {pool}")]
    PoolExhausted { pool: String },

    /// Bad request parameters (zero size, non-power-of-two alignment, ...)
    #[error("invalid parameters: {reason}")]
    InvalidParameters { reason: String },

    /// Pixel format the backend cannot lay out
    #[error("unsupported pixel format: {format}")]
    UnsupportedFormat { format: String },

    /// No buffer backend could be resolved from the registry
    #[error("buffer backend unavailable: {requested}")]
    BackendUnavailable { requested: String },

    /// Operation before setup or after shutdown
    #[error("not initialized or already shut down")]
    NotInitialized,

    /// Rejected configuration at construction time
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl MemoryError {
    /// Construct an `InvalidParameters` error from anything displayable.
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            reason: reason.into(),
        }
    }

    /// Construct an `InvalidConfig` error from anything displayable.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Result type for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;
