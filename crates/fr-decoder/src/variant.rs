//! The capability interface every wire-format decoder implements.
//!
//! The [`FrameDecoder`](crate::FrameDecoder) engine owns buffer bookkeeping,
//! timeouts, configuration and frame delivery. A [`DecoderVariant`] only
//! interprets bytes: it says where the next read should land, what the read
//! means for the frame in progress, and which stalled frames to give up on.
//! Variants reach the shared bookkeeping through the
//! [`DecoderContext`](crate::DecoderContext) they are handed on every call.

use crate::context::DecoderContext;
use crate::error::DecoderResult;
use crate::params::ParamMessage;
use crate::version::{self, VersionInfo};
use fr_pool::BufferId;
use serde::{Deserialize, Serialize};

/// Outcome of processing one received unit of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameReceiveState {
    /// More data is expected for the current frame.
    Incomplete,
    /// The frame is complete and ready for release.
    Complete,
    /// The frame was released despite detected loss.
    CompleteMissingData,
    /// Malformed data; discarded, never released downstream.
    Invalid,
}

impl FrameReceiveState {
    /// Numeric form used in frame headers and status messages.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Incomplete => 0,
            Self::Complete => 1,
            Self::CompleteMissingData => 2,
            Self::Invalid => 3,
        }
    }

    /// Inverse of [`to_wire`](Self::to_wire).
    #[must_use]
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Incomplete),
            1 => Some(Self::Complete),
            2 => Some(Self::CompleteMissingData),
            3 => Some(Self::Invalid),
            _ => None,
        }
    }

    /// Whether this state ends a frame that is handed downstream.
    #[must_use]
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Complete | Self::CompleteMissingData)
    }
}

/// Where the receive loop should write the next unit of incoming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    /// A region of the variant's own scratch memory (headers, datagrams,
    /// or the drop buffer used when no empty buffer is available).
    Scratch {
        /// Start offset in the scratch buffer.
        offset: usize,
        /// Writable length.
        len: usize,
    },
    /// A region of a pool buffer mapped to the frame in progress.
    Buffer {
        /// Pool buffer receiving the data.
        buffer_id: BufferId,
        /// Start offset within the buffer.
        offset: usize,
        /// Writable length.
        len: usize,
    },
}

impl MessageTarget {
    /// Writable length of the target.
    #[must_use]
    pub fn len(&self) -> usize {
        match *self {
            Self::Scratch { len, .. } | Self::Buffer { len, .. } => len,
        }
    }

    /// Whether the target has no room.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wire-format specific half of a frame decoder.
///
/// Implementations must keep [`next_message_buffer`](Self::next_message_buffer)
/// idempotent: calling it twice without an intervening
/// [`process_message`](Self::process_message) returns the same target, since a
/// read may find no data waiting.
pub trait DecoderVariant: Send {
    /// Registered decoder name, used in logs and status.
    fn name(&self) -> &'static str;

    /// Buffer size this decoder needs for one frame, header included.
    fn frame_buffer_size(&self) -> usize;

    /// Bytes reserved for the [`FrameHeader`](crate::FrameHeader) at the
    /// start of each frame buffer.
    fn frame_header_size(&self) -> usize;

    /// Apply variant parameters found under `prefix`.
    ///
    /// # Errors
    /// Returns [`DecoderError::InvalidParameter`](crate::DecoderError::InvalidParameter)
    /// for unusable values. Unknown keys are ignored.
    fn configure(&mut self, _prefix: &str, _msg: &ParamMessage) -> DecoderResult<()> {
        Ok(())
    }

    /// Report variant parameters under `prefix`.
    fn request_configuration(&self, _prefix: &str, _reply: &mut ParamMessage) {}

    /// Scratch memory backing [`MessageTarget::Scratch`] targets.
    fn scratch(&mut self) -> &mut [u8];

    /// Choose the write target for the next unit of incoming data.
    fn next_message_buffer(&mut self, ctx: &mut DecoderContext) -> MessageTarget;

    /// Interpret `bytes_received` bytes just written to the last target.
    fn process_message(&mut self, ctx: &mut DecoderContext, bytes_received: usize)
        -> FrameReceiveState;

    /// Whether the next read may start a new frame and so needs an empty
    /// buffer. `false` while the current frame already owns its buffer.
    fn needs_new_buffer(&self) -> bool {
        true
    }

    /// Scan for stalled frames and release or discard them.
    fn monitor_buffers(&mut self, ctx: &mut DecoderContext);

    /// Add variant counters under `prefix`.
    fn status(&self, _prefix: &str, _status: &mut ParamMessage) {}

    /// The stream feeding this decoder has ended.
    ///
    /// Returns the state of any frame cut short by the end of stream.
    fn end_of_stream(&mut self, _ctx: &mut DecoderContext) -> Option<FrameReceiveState> {
        None
    }

    /// Forget all in-progress state after the engine dropped its buffers.
    fn reset(&mut self);

    /// Version of the decoder implementation.
    fn version(&self) -> VersionInfo {
        version::version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_values() {
        for state in [
            FrameReceiveState::Incomplete,
            FrameReceiveState::Complete,
            FrameReceiveState::CompleteMissingData,
            FrameReceiveState::Invalid,
        ] {
            assert_eq!(FrameReceiveState::from_wire(state.to_wire()), Some(state));
        }
        assert_eq!(FrameReceiveState::from_wire(7), None);
    }

    #[test]
    fn test_is_complete() {
        assert!(FrameReceiveState::Complete.is_complete());
        assert!(FrameReceiveState::CompleteMissingData.is_complete());
        assert!(!FrameReceiveState::Incomplete.is_complete());
        assert!(!FrameReceiveState::Invalid.is_complete());
    }

    #[test]
    fn test_target_len() {
        let target = MessageTarget::Buffer {
            buffer_id: 1,
            offset: 40,
            len: 100,
        };
        assert_eq!(target.len(), 100);
        assert!(MessageTarget::Scratch { offset: 0, len: 0 }.is_empty());
    }
}
