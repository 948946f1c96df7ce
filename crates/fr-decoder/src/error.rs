//! Error types for the frame decoder.
//!
//! Per-message decode outcomes are never errors: malformed data is reported
//! through [`FrameReceiveState::Invalid`](crate::FrameReceiveState::Invalid)
//! so the receive loop can keep going. `DecoderError` covers caller misuse of
//! the buffer bookkeeping, bad configuration parameters and failures of the
//! underlying buffer pool.

use crate::ledger::FrameKey;
use fr_pool::{BufferId, PoolError};
use thiserror::Error;

/// Convenience alias for results using the decoder error type.
pub type DecoderResult<T> = std::result::Result<T, DecoderError>;

/// Errors raised by the frame decoder engine.
#[derive(Error, Debug)]
pub enum DecoderError {
    /// The shared buffer pool rejected an access.
    #[error("Buffer manager error: {0}")]
    Pool(#[from] PoolError),

    /// A configuration parameter is present but unusable.
    #[error("Invalid configuration parameter '{key}': {reason}")]
    InvalidParameter {
        /// Fully prefixed parameter key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Buffer operations need a registered buffer manager.
    #[error("No buffer manager registered with decoder")]
    NoBufferManager,

    /// The buffer is already queued or mapped by this decoder.
    #[error("Buffer {0} is already held by the decoder")]
    DuplicateBuffer(BufferId),

    /// The buffer ID is beyond the registered pool.
    #[error("Buffer {id} is outside the registered pool of {num_buffers} buffers")]
    BufferOutOfRange {
        /// Offending buffer ID.
        id: BufferId,
        /// Size of the registered pool.
        num_buffers: usize,
    },

    /// A frame key is already in the frame buffer map.
    #[error("Frame {0} is already mapped to a buffer")]
    FrameAlreadyMapped(FrameKey),

    /// A message target refers to a buffer the decoder no longer maps.
    #[error("Message target for buffer {0} is no longer mapped")]
    StaleMessageTarget(BufferId),

    /// No decoder variant is registered under this name.
    #[error("Unknown decoder type '{0}'")]
    UnknownDecoder(String),

    /// Reading into a message buffer failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
