//! Header-prefixed image frames over a TCP byte stream.
//!
//! Each frame on the wire is a fixed header followed by its payload:
//!
//! ```text
//! 0   magic          u32  "FRTC"
//! 4   frame_type     u8   1 = image
//! 5   pixel_type     u8
//! 6   compression    u8
//! 7   reserved       u8
//! 8   frame_number   u64
//! 16  width          u32
//! 20  height         u32
//! 24  payload_size   u32
//! ```
//!
//! All fields are little-endian. The header is read into scratch memory and
//! validated; the payload then goes straight into the mapped buffer after the
//! [`FrameHeader`]. A frame that finds no empty buffer has its payload read
//! into scratch and thrown away so the stream stays aligned.

use crate::context::{DecoderContext, FrameRelease, PACKET_LOG_TARGET};
use crate::definitions::{CompressionType, FrameGeometry, PixelType};
use crate::error::{DecoderError, DecoderResult};
use crate::frame_header::FrameHeader;
use crate::ledger::FrameKey;
use crate::limits::{validate_frame_size, SizeViolation, MAX_FRAME_BYTES};
use crate::params::ParamMessage;
use crate::variant::{DecoderVariant, FrameReceiveState, MessageTarget};
use bytes::{Buf, BufMut};
use fr_pool::BufferId;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Magic number opening a TCP frame header ("FRTC").
pub const TCP_FRAME_MAGIC: u32 = 0x4652_5443;
/// Frame type value for image frames.
pub const TCP_FRAME_TYPE_IMAGE: u8 = 1;

/// Parameter key for the largest accepted payload.
pub const CONFIG_TCP_MAX_PAYLOAD_SIZE: &str = "max_payload_size";
/// Default largest accepted payload (8 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

// Scratch is reused for discarded payloads, so it is larger than a header.
const DRAIN_CHUNK: usize = 64 * 1024;

/// Raw TCP frame header as read from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFrameHeader {
    /// Magic number, [`TCP_FRAME_MAGIC`] when valid.
    pub magic: u32,
    /// Frame type, [`TCP_FRAME_TYPE_IMAGE`] when valid.
    pub frame_type: u8,
    /// Wire value of the [`PixelType`].
    pub pixel_type: u8,
    /// Wire value of the [`CompressionType`].
    pub compression: u8,
    /// Frame number.
    pub frame_number: u64,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Payload bytes following the header.
    pub payload_size: u32,
}

impl TcpFrameHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 28;

    /// Header for an uncompressed image of the given geometry.
    #[must_use]
    pub fn image(frame_number: u64, width: u32, height: u32, pixel_type: PixelType) -> Self {
        let payload_size = (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(pixel_type.bytes_per_pixel());
        Self {
            magic: TCP_FRAME_MAGIC,
            frame_type: TCP_FRAME_TYPE_IMAGE,
            pixel_type: pixel_type.to_wire(),
            compression: CompressionType::None.to_wire(),
            frame_number,
            width,
            height,
            payload_size: u32::try_from(payload_size).unwrap_or(u32::MAX),
        }
    }

    /// Decode from the first [`SIZE`](Self::SIZE) bytes of `src`.
    #[must_use]
    pub fn decode(src: &[u8]) -> Option<Self> {
        if src.len() < Self::SIZE {
            return None;
        }
        let mut cursor = &src[..Self::SIZE];
        let magic = cursor.get_u32_le();
        let frame_type = cursor.get_u8();
        let pixel_type = cursor.get_u8();
        let compression = cursor.get_u8();
        let _reserved = cursor.get_u8();
        Some(Self {
            magic,
            frame_type,
            pixel_type,
            compression,
            frame_number: cursor.get_u64_le(),
            width: cursor.get_u32_le(),
            height: cursor.get_u32_le(),
            payload_size: cursor.get_u32_le(),
        })
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut cursor = &mut out[..];
        cursor.put_u32_le(self.magic);
        cursor.put_u8(self.frame_type);
        cursor.put_u8(self.pixel_type);
        cursor.put_u8(self.compression);
        cursor.put_u8(0);
        cursor.put_u64_le(self.frame_number);
        cursor.put_u32_le(self.width);
        cursor.put_u32_le(self.height);
        cursor.put_u32_le(self.payload_size);
        out
    }

    /// Check the header against the decoder's limits.
    ///
    /// # Errors
    /// Returns the first [`TcpHeaderError`] found.
    pub fn validate(&self, max_payload_size: usize) -> Result<FrameGeometry, TcpHeaderError> {
        if self.magic != TCP_FRAME_MAGIC {
            return Err(TcpHeaderError::BadMagic(self.magic));
        }
        if self.frame_type != TCP_FRAME_TYPE_IMAGE {
            return Err(TcpHeaderError::UnsupportedFrameType(self.frame_type));
        }
        let pixel_type =
            PixelType::from_wire(self.pixel_type).ok_or(TcpHeaderError::UnknownPixelType(self.pixel_type))?;
        let compression = CompressionType::from_wire(self.compression)
            .ok_or(TcpHeaderError::UnknownCompression(self.compression))?;

        let size = validate_frame_size(self.width, self.height, pixel_type.bytes_per_pixel())?;
        if size.bytes == 0 {
            return Err(TcpHeaderError::EmptyFrame);
        }

        let declared = self.payload_size as usize;
        match compression {
            CompressionType::None if declared != size.bytes => {
                return Err(TcpHeaderError::PayloadMismatch {
                    declared,
                    expected: size.bytes,
                });
            }
            CompressionType::None => {}
            _ if declared == 0 || declared > size.bytes => {
                return Err(TcpHeaderError::PayloadMismatch {
                    declared,
                    expected: size.bytes,
                });
            }
            _ => {}
        }
        if declared > max_payload_size {
            return Err(TcpHeaderError::PayloadTooLarge {
                declared,
                max: max_payload_size,
            });
        }

        Ok(FrameGeometry {
            width: self.width,
            height: self.height,
            pixel_type,
            compression,
        })
    }
}

/// Why a TCP frame header was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TcpHeaderError {
    /// Magic number did not match.
    #[error("bad frame magic 0x{0:08x}")]
    BadMagic(u32),
    /// Frame type is not an image.
    #[error("unsupported frame type {0}")]
    UnsupportedFrameType(u8),
    /// Pixel type value is unknown.
    #[error("unknown pixel type {0}")]
    UnknownPixelType(u8),
    /// Compression value is unknown.
    #[error("unknown compression {0}")]
    UnknownCompression(u8),
    /// Geometry breaks a size limit.
    #[error("{0}")]
    Size(#[from] SizeViolation),
    /// Width or height is zero.
    #[error("frame has no pixels")]
    EmptyFrame,
    /// Payload size does not fit the declared geometry.
    #[error("payload size {declared} does not match image size {expected}")]
    PayloadMismatch {
        /// Payload size from the header.
        declared: usize,
        /// Uncompressed size implied by the geometry.
        expected: usize,
    },
    /// Payload exceeds what one frame buffer can hold.
    #[error("payload size {declared} exceeds frame buffer capacity {max}")]
    PayloadTooLarge {
        /// Payload size from the header.
        declared: usize,
        /// Largest payload a buffer can hold.
        max: usize,
    },
}

#[derive(Debug, Clone, Copy)]
enum TcpState {
    AwaitingHeader {
        received: usize,
    },
    AwaitingPayload {
        key: FrameKey,
        buffer: Option<BufferId>,
        geometry: FrameGeometry,
        expected: usize,
        received: usize,
    },
}

/// Decoder for header-prefixed frames on a TCP stream.
#[derive(Debug)]
pub struct TcpFrameDecoder {
    scratch: Vec<u8>,
    state: TcpState,
    max_payload_size: usize,
    frames_completed: u64,
    frames_discarded: u64,
    headers_rejected: u64,
}

impl Default for TcpFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpFrameDecoder {
    /// New decoder with the default payload limit.
    #[must_use]
    pub fn new() -> Self {
        let decoder = Self {
            scratch: vec![0; DRAIN_CHUNK],
            state: TcpState::AwaitingHeader { received: 0 },
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            frames_completed: 0,
            frames_discarded: 0,
            headers_rejected: 0,
        };
        info!(version = %decoder.version().long, "TcpFrameDecoder loaded");
        decoder
    }

    fn payload_capacity(&self, ctx: &DecoderContext) -> usize {
        let buffer_capacity = ctx
            .buffer_size()
            .map_or(usize::MAX, |size| size.saturating_sub(FrameHeader::SIZE));
        self.max_payload_size.min(buffer_capacity)
    }

    fn process_header(&mut self, ctx: &mut DecoderContext) -> FrameReceiveState {
        let Some(header) = TcpFrameHeader::decode(&self.scratch) else {
            return FrameReceiveState::Incomplete;
        };
        self.state = TcpState::AwaitingHeader { received: 0 };

        let geometry = match header.validate(self.payload_capacity(ctx)) {
            Ok(geometry) => geometry,
            Err(err) => {
                self.headers_rejected += 1;
                ctx.record_invalid(format_args!("frame {}: {err}", header.frame_number));
                return FrameReceiveState::Invalid;
            }
        };

        if ctx.packet_logging() {
            debug!(
                target: PACKET_LOG_TARGET,
                parent: ctx.span(),
                frame_number = header.frame_number,
                width = header.width,
                height = header.height,
                payload_size = header.payload_size,
                "Frame header received"
            );
        }

        let key = header.frame_number;
        let buffer = match ctx.begin_frame(key) {
            Ok(buffer) => buffer,
            Err(err) => {
                error!(parent: ctx.span(), frame_number = key, error = %err, "Failed to map frame");
                ctx.record_dropped(key);
                None
            }
        };
        self.state = TcpState::AwaitingPayload {
            key,
            buffer,
            geometry,
            expected: header.payload_size as usize,
            received: 0,
        };
        FrameReceiveState::Incomplete
    }
}

impl DecoderVariant for TcpFrameDecoder {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn frame_buffer_size(&self) -> usize {
        FrameHeader::SIZE + self.max_payload_size
    }

    fn frame_header_size(&self) -> usize {
        FrameHeader::SIZE
    }

    fn configure(&mut self, prefix: &str, msg: &ParamMessage) -> DecoderResult<()> {
        let key = format!("{prefix}{CONFIG_TCP_MAX_PAYLOAD_SIZE}");
        if let Some(max) = msg.get_param::<usize>(&key)? {
            if max == 0 || max > MAX_FRAME_BYTES {
                return Err(DecoderError::InvalidParameter {
                    key,
                    reason: format!("must be between 1 and {MAX_FRAME_BYTES}"),
                });
            }
            self.max_payload_size = max;
        }
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut ParamMessage) {
        reply.set_param(
            &format!("{prefix}{CONFIG_TCP_MAX_PAYLOAD_SIZE}"),
            self.max_payload_size as u64,
        );
    }

    fn scratch(&mut self) -> &mut [u8] {
        &mut self.scratch
    }

    fn next_message_buffer(&mut self, _ctx: &mut DecoderContext) -> MessageTarget {
        match self.state {
            TcpState::AwaitingHeader { received } => MessageTarget::Scratch {
                offset: received,
                len: TcpFrameHeader::SIZE - received,
            },
            TcpState::AwaitingPayload {
                buffer: Some(buffer_id),
                expected,
                received,
                ..
            } => MessageTarget::Buffer {
                buffer_id,
                offset: FrameHeader::SIZE + received,
                len: expected - received,
            },
            TcpState::AwaitingPayload {
                buffer: None,
                expected,
                received,
                ..
            } => MessageTarget::Scratch {
                offset: 0,
                len: (expected - received).min(self.scratch.len()),
            },
        }
    }

    fn process_message(&mut self, ctx: &mut DecoderContext, bytes_received: usize) -> FrameReceiveState {
        match &mut self.state {
            TcpState::AwaitingHeader { received } => {
                *received += bytes_received;
                if *received < TcpFrameHeader::SIZE {
                    return FrameReceiveState::Incomplete;
                }
                self.process_header(ctx)
            }
            TcpState::AwaitingPayload {
                key,
                buffer,
                geometry,
                expected,
                received,
            } => {
                *received += bytes_received;
                let (key, buffer, geometry) = (*key, *buffer, *geometry);
                if buffer.is_some() {
                    ctx.record_progress(key, bytes_received, 1);
                }
                if *received < *expected {
                    return FrameReceiveState::Incomplete;
                }

                self.state = TcpState::AwaitingHeader { received: 0 };
                if buffer.is_some() {
                    ctx.release_frame(
                        key,
                        FrameRelease {
                            complete: true,
                            header_size: FrameHeader::SIZE,
                            packets_expected: 0,
                            geometry: Some(geometry),
                        },
                    );
                    self.frames_completed += 1;
                } else {
                    debug!(parent: ctx.span(), frame_number = key, "Discarded frame payload drained");
                }
                FrameReceiveState::Complete
            }
        }
    }

    fn needs_new_buffer(&self) -> bool {
        matches!(self.state, TcpState::AwaitingHeader { .. })
    }

    fn monitor_buffers(&mut self, ctx: &mut DecoderContext) {
        for key in ctx.expired_frames() {
            ctx.record_timeout(key);
            ctx.discard_frame(key);
            self.frames_discarded += 1;

            // The rest of the payload is still on the wire
            if let TcpState::AwaitingPayload {
                key: current,
                buffer,
                ..
            } = &mut self.state
            {
                if *current == key {
                    *buffer = None;
                }
            }
        }
    }

    fn status(&self, prefix: &str, status: &mut ParamMessage) {
        status.set_param(&format!("{prefix}frames_completed"), self.frames_completed);
        status.set_param(&format!("{prefix}frames_discarded"), self.frames_discarded);
        status.set_param(&format!("{prefix}headers_rejected"), self.headers_rejected);
    }

    fn end_of_stream(&mut self, ctx: &mut DecoderContext) -> Option<FrameReceiveState> {
        let state = std::mem::replace(&mut self.state, TcpState::AwaitingHeader { received: 0 });
        match state {
            TcpState::AwaitingHeader { received: 0 } => None,
            TcpState::AwaitingHeader { received } => {
                ctx.record_invalid(format_args!("stream ended {received} bytes into a frame header"));
                Some(FrameReceiveState::Invalid)
            }
            TcpState::AwaitingPayload {
                key,
                buffer,
                expected,
                received,
                ..
            } => {
                if buffer.is_some() {
                    ctx.discard_frame(key);
                    self.frames_discarded += 1;
                }
                warn!(
                    parent: ctx.span(),
                    frame_number = key,
                    received,
                    expected,
                    "Stream ended mid-frame, discarding partial frame"
                );
                ctx.record_invalid(format_args!("frame {key} truncated by end of stream"));
                Some(FrameReceiveState::Invalid)
            }
        }
    }

    fn reset(&mut self) {
        self.state = TcpState::AwaitingHeader { received: 0 };
    }
}
