//! Shared decoder state handed to variants on every call.
//!
//! The context is the only way a variant touches buffers: it maps new frames
//! from the empty buffer queue, records progress, writes payload into pool
//! memory and ends frames by releasing or discarding them. Released frames are
//! collected here and delivered by the engine once its lock is dropped.

use crate::callback::{FrameMetadata, ReadyFrame};
use crate::config::DecoderConfig;
use crate::definitions::FrameGeometry;
use crate::error::{DecoderError, DecoderResult};
use crate::frame_header::FrameHeader;
use crate::ledger::{BufferLedger, FrameKey, MappedFrame};
use fr_pool::{BufferId, SharedBufferManager};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{error, warn, Span};

/// Tracing target of the packet logging channel.
pub const PACKET_LOG_TARGET: &str = "fr_decoder::packet";

/// Health counters reported in status replies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecoderCounters {
    /// Frames given up on by the monitor.
    pub frames_timedout: u64,
    /// Frames handed downstream, whole or with missing data.
    pub frames_released: u64,
    /// Frames handed downstream with missing data.
    pub frames_missing_data: u64,
    /// Frames that found no empty buffer and were not stored.
    pub frames_dropped: u64,
    /// Received units rejected as malformed.
    pub invalid_messages: u64,
}

/// How a variant ends a frame it hands downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRelease {
    /// `false` releases the frame as complete-with-missing-data.
    pub complete: bool,
    /// Frame header size reserved at the start of the buffer.
    pub header_size: usize,
    /// Packets the format expected, 0 if not packetised.
    pub packets_expected: u32,
    /// Image geometry declared by the wire format.
    pub geometry: Option<FrameGeometry>,
}

/// Buffer bookkeeping, configuration and counters shared by engine and variant.
#[derive(Debug)]
pub struct DecoderContext {
    config: DecoderConfig,
    ledger: BufferLedger,
    manager: Option<Arc<SharedBufferManager>>,
    counters: DecoderCounters,
    released: Vec<ReadyFrame>,
    generation: u64,
    span: Span,
}

impl Default for DecoderContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderContext {
    pub(crate) fn new() -> Self {
        Self {
            config: DecoderConfig::default(),
            ledger: BufferLedger::new(),
            manager: None,
            counters: DecoderCounters::default(),
            released: Vec::new(),
            generation: 0,
            span: Span::none(),
        }
    }

    // ========================================================================
    // Read access
    // ========================================================================

    /// Current base configuration.
    #[must_use]
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Frame timeout as a duration.
    #[must_use]
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.config.frame_timeout_ms))
    }

    /// Whether per-message packet logging is on.
    #[must_use]
    pub fn packet_logging(&self) -> bool {
        self.config.enable_packet_logging
    }

    /// Logging span all decoder events are parented to.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Registered buffer pool.
    #[must_use]
    pub fn buffer_manager(&self) -> Option<&Arc<SharedBufferManager>> {
        self.manager.as_ref()
    }

    /// Size of each pool buffer, if a pool is registered.
    #[must_use]
    pub fn buffer_size(&self) -> Option<usize> {
        self.manager.as_ref().map(|m| m.buffer_size())
    }

    /// Buffer ownership ledger.
    #[must_use]
    pub fn ledger(&self) -> &BufferLedger {
        &self.ledger
    }

    /// Health counters.
    #[must_use]
    pub fn counters(&self) -> DecoderCounters {
        self.counters
    }

    /// Progress of frame `key`, if it is in progress.
    #[must_use]
    pub fn frame(&self, key: FrameKey) -> Option<&MappedFrame> {
        self.ledger.frame(key)
    }

    // ========================================================================
    // Frame lifecycle (variant facing)
    // ========================================================================

    /// Map frame `key` to the next empty buffer.
    ///
    /// Returns `Ok(None)` and counts a dropped frame when the empty buffer
    /// queue is exhausted.
    ///
    /// # Errors
    /// Returns [`DecoderError::FrameAlreadyMapped`] if `key` is in progress.
    pub fn begin_frame(&mut self, key: FrameKey) -> DecoderResult<Option<BufferId>> {
        let mapped = self.ledger.map_frame(key)?;
        if mapped.is_none() {
            self.counters.frames_dropped += 1;
            warn!(
                parent: &self.span,
                frame_number = key,
                frames_dropped = self.counters.frames_dropped,
                "No empty buffers available, dropping frame"
            );
        }
        Ok(mapped)
    }

    /// Record `bytes` and `packets` of newly received data for frame `key`.
    pub fn record_progress(&mut self, key: FrameKey, bytes: usize, packets: u32) {
        if let Some(frame) = self.ledger.frame_mut(key) {
            frame.bytes_received += bytes;
            frame.packets_received += packets;
            frame.last_arrival = Instant::now();
        }
    }

    /// Copy `data` into pool buffer `buffer_id` at `offset`.
    ///
    /// # Errors
    /// Fails if no pool is registered or the write overruns the buffer.
    pub fn write_payload(&self, buffer_id: BufferId, offset: usize, data: &[u8]) -> DecoderResult<()> {
        let manager = self.manager.as_ref().ok_or(DecoderError::NoBufferManager)?;
        manager.write_at(buffer_id, offset, data)?;
        Ok(())
    }

    /// Hand frame `key` downstream.
    ///
    /// Writes the frame header (when `release.header_size` is non-zero),
    /// removes the frame from the map and queues it for the frame ready
    /// callback. The buffer leaves the decoder's ownership.
    pub fn release_frame(&mut self, key: FrameKey, release: FrameRelease) -> Option<BufferId> {
        let frame = self.ledger.unmap(key)?;

        if release.header_size > 0 {
            self.write_frame_header(key, &frame, &release);
        }

        self.counters.frames_released += 1;
        if !release.complete {
            self.counters.frames_missing_data += 1;
        }

        self.released.push(ReadyFrame {
            buffer_id: frame.buffer_id,
            metadata: FrameMetadata {
                frame_number: key,
                payload_size: frame.bytes_received,
                header_size: release.header_size,
                complete: release.complete,
                packets_received: frame.packets_received,
                packets_expected: release.packets_expected,
                geometry: release.geometry,
                generation: self.generation,
            },
        });
        Some(frame.buffer_id)
    }

    fn write_frame_header(&self, key: FrameKey, frame: &MappedFrame, release: &FrameRelease) {
        let header = FrameHeader {
            frame_number: key,
            complete: release.complete,
            bytes_received: frame.bytes_received as u64,
            packets_received: frame.packets_received,
            packets_expected: release.packets_expected,
            start_time_ns: frame
                .start_time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
        };
        let mut encoded = [0u8; FrameHeader::SIZE];
        header.encode(&mut encoded);

        let written = self
            .write_payload(frame.buffer_id, 0, &encoded[..release.header_size.min(FrameHeader::SIZE)]);
        if let Err(err) = written {
            error!(
                parent: &self.span,
                frame_number = key,
                buffer_id = frame.buffer_id,
                error = %err,
                "Failed to write frame header"
            );
        }
    }

    /// Abandon frame `key` and put its buffer back on the empty buffer queue.
    pub fn discard_frame(&mut self, key: FrameKey) -> Option<BufferId> {
        self.ledger.recycle(key).map(|frame| frame.buffer_id)
    }

    /// In-progress frames older than the frame timeout.
    #[must_use]
    pub fn expired_frames(&self) -> Vec<FrameKey> {
        self.ledger.expired(Instant::now(), self.frame_timeout())
    }

    /// Count a frame timeout for frame `key`.
    pub fn record_timeout(&mut self, key: FrameKey) {
        self.counters.frames_timedout += 1;
        let (bytes_received, packets_received) = self
            .ledger
            .frame(key)
            .map(|f| (f.bytes_received, f.packets_received))
            .unwrap_or_default();
        warn!(
            parent: &self.span,
            frame_number = key,
            bytes_received,
            packets_received,
            timeout_ms = self.config.frame_timeout_ms,
            frames_timedout = self.counters.frames_timedout,
            "Frame timed out, possible data loss"
        );
    }

    /// Count a malformed message.
    pub fn record_invalid(&mut self, reason: impl Display) {
        self.counters.invalid_messages += 1;
        warn!(
            parent: &self.span,
            reason = %reason,
            invalid_messages = self.counters.invalid_messages,
            "Invalid data received"
        );
    }

    /// Count a frame that will never reach a buffer (no empty buffer, no map entry).
    pub fn record_dropped(&mut self, key: FrameKey) {
        self.counters.frames_dropped += 1;
        warn!(
            parent: &self.span,
            frame_number = key,
            frames_dropped = self.counters.frames_dropped,
            "Frame dropped"
        );
    }

    // ========================================================================
    // Engine facing
    // ========================================================================

    pub(crate) fn config_mut(&mut self) -> &mut DecoderConfig {
        &mut self.config
    }

    pub(crate) fn set_span(&mut self, span: Span) {
        self.span = span;
    }

    pub(crate) fn set_manager(&mut self, manager: Arc<SharedBufferManager>) {
        self.ledger.set_capacity(manager.num_buffers());
        self.manager = Some(manager);
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut BufferLedger {
        &mut self.ledger
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub(crate) fn take_released(&mut self) -> Vec<ReadyFrame> {
        std::mem::take(&mut self.released)
    }
}
