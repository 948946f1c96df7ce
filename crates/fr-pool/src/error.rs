//! Error types for the shared buffer pool.

use crate::BufferId;
use thiserror::Error;

/// Convenience alias for results using the pool error type.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors raised while creating, opening or accessing a buffer pool.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The requested pool geometry cannot be allocated.
    #[error("Invalid pool geometry: {0}")]
    InvalidGeometry(String),

    /// A buffer ID does not name a block in this pool.
    #[error("Buffer {id} is out of range for a pool of {num_buffers} buffers")]
    InvalidBufferId {
        /// Offending buffer ID.
        id: BufferId,
        /// Number of buffers in the pool.
        num_buffers: usize,
    },

    /// An access would run past the end of a block.
    #[error("Access of {len} bytes at offset {offset} exceeds buffer size {buffer_size}")]
    OutOfBounds {
        /// Start offset within the block.
        offset: usize,
        /// Requested length.
        len: usize,
        /// Size of each block.
        buffer_size: usize,
    },

    /// A shared-memory file does not carry a valid pool header.
    #[error("Shared buffer header mismatch: {0}")]
    HeaderMismatch(String),

    /// Mapping or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
