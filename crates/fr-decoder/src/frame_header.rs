//! Header written at the start of each released frame buffer.
//!
//! Downstream processes that map the same shared memory read this header to
//! learn which frame a buffer holds and whether it arrived whole, without
//! needing the callback metadata.
//!
//! Layout (40 bytes, little-endian):
//!
//! ```text
//! 0   magic             u32  "FRHD"
//! 4   state             u32  1 = complete, 2 = complete with missing data
//! 8   frame_number      u64
//! 16  bytes_received    u64
//! 24  packets_received  u32
//! 28  packets_expected  u32
//! 32  start_time_ns     u64  unix epoch nanoseconds
//! ```

use crate::variant::FrameReceiveState;
use bytes::{Buf, BufMut};

/// Magic number opening a frame header ("FRHD").
pub const FRAME_HEADER_MAGIC: u32 = 0x4652_4844;

/// Frame header describing the payload that follows it in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame number.
    pub frame_number: u64,
    /// `true` unless the frame was released with missing data.
    pub complete: bool,
    /// Payload bytes written after the header.
    pub bytes_received: u64,
    /// Packets received for the frame.
    pub packets_received: u32,
    /// Packets expected for the frame (0 if the format has no packets).
    pub packets_expected: u32,
    /// Frame start time as unix epoch nanoseconds.
    pub start_time_ns: u64,
}

impl FrameHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 40;

    /// Encode into the first [`SIZE`](Self::SIZE) bytes of `dst`.
    ///
    /// Returns `false` without writing if `dst` is too short.
    pub fn encode(&self, dst: &mut [u8]) -> bool {
        if dst.len() < Self::SIZE {
            return false;
        }
        let state = if self.complete {
            FrameReceiveState::Complete
        } else {
            FrameReceiveState::CompleteMissingData
        };

        let mut cursor = &mut dst[..Self::SIZE];
        cursor.put_u32_le(FRAME_HEADER_MAGIC);
        cursor.put_u32_le(state.to_wire());
        cursor.put_u64_le(self.frame_number);
        cursor.put_u64_le(self.bytes_received);
        cursor.put_u32_le(self.packets_received);
        cursor.put_u32_le(self.packets_expected);
        cursor.put_u64_le(self.start_time_ns);
        true
    }

    /// Decode a header from the start of `src`.
    #[must_use]
    pub fn decode(src: &[u8]) -> Option<Self> {
        if src.len() < Self::SIZE {
            return None;
        }
        let mut cursor = &src[..Self::SIZE];
        if cursor.get_u32_le() != FRAME_HEADER_MAGIC {
            return None;
        }
        let complete = match FrameReceiveState::from_wire(cursor.get_u32_le())? {
            FrameReceiveState::Complete => true,
            FrameReceiveState::CompleteMissingData => false,
            _ => return None,
        };

        Some(Self {
            frame_number: cursor.get_u64_le(),
            complete,
            bytes_received: cursor.get_u64_le(),
            packets_received: cursor.get_u32_le(),
            packets_expected: cursor.get_u32_le(),
            start_time_ns: cursor.get_u64_le(),
        })
    }
}
