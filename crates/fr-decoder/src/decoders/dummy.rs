//! Minimal TCP decoder used to exercise the engine and receive loop.
//!
//! Every read is a complete frame of at most [`DUMMY_FRAME_BUFFER_SIZE`]
//! bytes. There is no header and nothing can stall, so the monitor has
//! nothing to do.

use crate::context::{DecoderContext, FrameRelease};
use crate::ledger::FrameKey;
use crate::variant::{DecoderVariant, FrameReceiveState, MessageTarget};
use fr_pool::BufferId;
use tracing::{error, info};

/// Frame buffer size of the dummy decoder.
pub const DUMMY_FRAME_BUFFER_SIZE: usize = 30;

/// Decoder that treats every read as one complete frame.
#[derive(Debug)]
pub struct DummyTcpDecoder {
    drop_buffer: [u8; DUMMY_FRAME_BUFFER_SIZE],
    next_frame: FrameKey,
    current: Option<(FrameKey, Option<BufferId>)>,
}

impl Default for DummyTcpDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyTcpDecoder {
    /// New decoder starting at frame 0.
    #[must_use]
    pub fn new() -> Self {
        let decoder = Self {
            drop_buffer: [0; DUMMY_FRAME_BUFFER_SIZE],
            next_frame: 0,
            current: None,
        };
        info!(version = %decoder.version().long, "DummyTcpDecoder loaded");
        decoder
    }

    fn current_frame(&mut self, ctx: &mut DecoderContext) -> (FrameKey, Option<BufferId>) {
        if let Some(current) = self.current {
            return current;
        }
        let key = self.next_frame;
        let buffer = match ctx.begin_frame(key) {
            Ok(buffer) => buffer,
            Err(err) => {
                error!(parent: ctx.span(), frame_number = key, error = %err, "Failed to map frame");
                ctx.record_dropped(key);
                None
            }
        };
        self.current = Some((key, buffer));
        (key, buffer)
    }
}

impl DecoderVariant for DummyTcpDecoder {
    fn name(&self) -> &'static str {
        "dummy_tcp"
    }

    fn frame_buffer_size(&self) -> usize {
        DUMMY_FRAME_BUFFER_SIZE
    }

    fn frame_header_size(&self) -> usize {
        0
    }

    fn scratch(&mut self) -> &mut [u8] {
        &mut self.drop_buffer
    }

    fn next_message_buffer(&mut self, ctx: &mut DecoderContext) -> MessageTarget {
        match self.current_frame(ctx) {
            (_, Some(buffer_id)) => MessageTarget::Buffer {
                buffer_id,
                offset: 0,
                len: DUMMY_FRAME_BUFFER_SIZE,
            },
            (_, None) => MessageTarget::Scratch {
                offset: 0,
                len: DUMMY_FRAME_BUFFER_SIZE,
            },
        }
    }

    fn process_message(&mut self, ctx: &mut DecoderContext, bytes_received: usize) -> FrameReceiveState {
        let (key, buffer) = self.current_frame(ctx);
        self.current = None;
        self.next_frame = key.wrapping_add(1);

        if buffer.is_some() {
            ctx.record_progress(key, bytes_received, 1);
            ctx.release_frame(
                key,
                FrameRelease {
                    complete: true,
                    header_size: 0,
                    packets_expected: 0,
                    geometry: None,
                },
            );
        }
        FrameReceiveState::Complete
    }

    fn needs_new_buffer(&self) -> bool {
        self.current.is_none()
    }

    fn monitor_buffers(&mut self, _ctx: &mut DecoderContext) {}

    fn reset(&mut self) {
        self.current = None;
    }
}
