//! The frame decoder engine.
//!
//! [`FrameDecoder`] wraps one [`DecoderVariant`] and owns everything that is
//! the same for every wire format: the empty buffer queue and frame buffer
//! map, the stalled-frame timeout, configuration and status exchanges, and
//! delivery of released frames to the downstream callback.
//!
//! # Concurrency
//!
//! The receive loop and the periodic monitor run independently and share one
//! engine through an `Arc`. All bookkeeping sits behind a single mutex, so
//! pushes, pops, map updates and [`drop_all_buffers`](FrameDecoder::drop_all_buffers)
//! never interleave. [`receive`](FrameDecoder::receive) holds that mutex from
//! choosing the write target through processing the bytes, which means a
//! frame cannot be timed out or dropped between a read and its bookkeeping.
//!
//! Frame ready callbacks run after the mutex is released, on the thread that
//! released the frame (the receive loop for completed frames, the monitor for
//! timed-out ones). Callbacks may push or return buffers, but must not
//! register a new callback from inside the callback.

use crate::callback::{BufferReturner, FrameMetadata, FrameReadyCallback, ReadyFrame};
use crate::config::DecoderConfig;
use crate::context::{DecoderContext, DecoderCounters, PACKET_LOG_TARGET};
use crate::error::{DecoderError, DecoderResult};
use crate::ledger::SlotState;
use crate::params::ParamMessage;
use crate::variant::{DecoderVariant, FrameReceiveState, MessageTarget};
use crate::version::VersionInfo;
use fr_pool::{BufferId, PoolError, SharedBufferManager};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn, Span};

/// Result of one [`FrameDecoder::receive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Bytes were read and processed.
    Processed(FrameReceiveState),
    /// The source had nothing to read.
    WouldBlock,
    /// The source reported end of stream (a zero-length read).
    Closed,
}

struct DecoderInner {
    ctx: DecoderContext,
    variant: Box<dyn DecoderVariant>,
}

/// Frame decoder engine driving one wire-format variant.
pub struct FrameDecoder {
    inner: Mutex<DecoderInner>,
    callback: Mutex<Option<FrameReadyCallback>>,
    returner: BufferReturner,
    name: &'static str,
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FrameDecoder")
            .field("name", &self.name)
            .field("config", inner.ctx.config())
            .field("empty_buffers", &inner.ctx.ledger().num_empty())
            .field("mapped_buffers", &inner.ctx.ledger().num_mapped())
            .finish()
    }
}

impl FrameDecoder {
    /// Wrap `variant` in a new engine with default configuration.
    #[must_use]
    pub fn new(variant: Box<dyn DecoderVariant>) -> Self {
        let name = variant.name();
        info!(
            decoder = name,
            version = %variant.version().long,
            "Frame decoder loaded"
        );
        Self {
            inner: Mutex::new(DecoderInner {
                ctx: DecoderContext::new(),
                variant,
            }),
            callback: Mutex::new(None),
            returner: BufferReturner::new(),
            name,
        }
    }

    /// Registered name of the wrapped variant.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Version of the wrapped variant.
    #[must_use]
    pub fn version(&self) -> VersionInfo {
        self.inner.lock().variant.version()
    }

    // ========================================================================
    // Setup and configuration
    // ========================================================================

    /// Initialise the decoder with a logging span and configuration.
    ///
    /// Every decoder event, including packet logging, is emitted under
    /// `span`. Calling `init` again re-applies configuration and replaces the
    /// span without resetting counters.
    ///
    /// # Errors
    /// Returns [`DecoderError::InvalidParameter`] if the configuration holds
    /// an unusable value; nothing is changed in that case.
    pub fn init(&self, span: Span, config: &ParamMessage) -> DecoderResult<()> {
        let mut inner = self.inner.lock();
        inner.ctx.set_span(span);
        Self::configure_locked(&mut inner, "", config)?;
        info!(
            parent: inner.ctx.span(),
            decoder = self.name,
            enable_packet_logging = inner.ctx.config().enable_packet_logging,
            frame_timeout_ms = inner.ctx.config().frame_timeout_ms,
            "Frame decoder initialised"
        );
        Ok(())
    }

    /// Apply a configuration request whose parameters sit under `prefix`.
    ///
    /// Absent keys keep their values; unknown keys are ignored.
    ///
    /// # Errors
    /// Returns [`DecoderError::InvalidParameter`] for an unusable value.
    pub fn configure(&self, prefix: &str, msg: &ParamMessage) -> DecoderResult<()> {
        let mut inner = self.inner.lock();
        Self::configure_locked(&mut inner, prefix, msg)
    }

    fn configure_locked(inner: &mut DecoderInner, prefix: &str, msg: &ParamMessage) -> DecoderResult<()> {
        let mut base: DecoderConfig = *inner.ctx.config();
        base.apply(prefix, msg)?;
        inner.variant.configure(prefix, msg)?;
        *inner.ctx.config_mut() = base;
        Ok(())
    }

    /// Populate `reply` with the decoder's parameters under `prefix`.
    ///
    /// Base parameters come first, then the variant's own.
    pub fn request_configuration(&self, prefix: &str, reply: &mut ParamMessage) {
        let inner = self.inner.lock();
        inner.ctx.config().write_to(prefix, reply);
        inner.variant.request_configuration(prefix, reply);
    }

    /// Bind the shared buffer pool.
    ///
    /// Replacing a bound pool leaves currently held IDs in place; the owner
    /// must follow up with [`drop_all_buffers`](Self::drop_all_buffers)
    /// since those IDs no longer name valid memory.
    pub fn register_buffer_manager(&self, manager: Arc<SharedBufferManager>) {
        let mut inner = self.inner.lock();

        let required = inner.variant.frame_buffer_size();
        if manager.buffer_size() < required {
            warn!(
                parent: inner.ctx.span(),
                buffer_size = manager.buffer_size(),
                required,
                "Buffer manager blocks are smaller than the decoder frame buffer size"
            );
        }

        if let Some(previous) = inner.ctx.buffer_manager() {
            let held = inner.ctx.ledger().num_empty() + inner.ctx.ledger().num_mapped();
            info!(
                parent: inner.ctx.span(),
                previous_manager = previous.manager_id(),
                new_manager = manager.manager_id(),
                held_buffers = held,
                "Replacing buffer manager"
            );
        }

        debug!(
            parent: inner.ctx.span(),
            manager_id = manager.manager_id(),
            num_buffers = manager.num_buffers(),
            buffer_size = manager.buffer_size(),
            "Buffer manager registered"
        );
        inner.ctx.set_manager(manager);
    }

    /// Register the callback invoked once per released frame, replacing any
    /// previous one.
    pub fn register_frame_ready_callback<F>(&self, callback: F)
    where
        F: FnMut(BufferId, FrameMetadata) + Send + 'static,
    {
        *self.callback.lock() = Some(Box::new(callback));
    }

    /// Register an already boxed callback, such as one built by
    /// [`channel_callback`](crate::channel_callback).
    pub fn register_boxed_callback(&self, callback: FrameReadyCallback) {
        *self.callback.lock() = Some(callback);
    }

    // ========================================================================
    // Buffer queue
    // ========================================================================

    /// Append `buffer_id` to the empty buffer queue.
    ///
    /// # Errors
    /// Fails without a registered pool, for IDs outside the pool, and for IDs
    /// the decoder already holds.
    pub fn push_empty_buffer(&self, buffer_id: BufferId) -> DecoderResult<()> {
        self.inner.lock().ctx.ledger_mut().push_empty(buffer_id)?;
        self.returner.notify_available();
        Ok(())
    }

    /// Push every pool buffer the decoder does not already hold.
    ///
    /// Returns the number of buffers pushed.
    ///
    /// # Errors
    /// Returns [`DecoderError::NoBufferManager`] without a registered pool.
    pub fn push_all_buffers(&self) -> DecoderResult<usize> {
        let mut inner = self.inner.lock();
        let num_buffers = inner
            .ctx
            .buffer_manager()
            .map(|m| m.num_buffers())
            .ok_or(DecoderError::NoBufferManager)?;

        let ledger = inner.ctx.ledger_mut();
        let mut pushed = 0;
        for id in 0..num_buffers {
            if ledger.slot_state(id) == SlotState::Outstanding {
                ledger.push_empty(id)?;
                pushed += 1;
            }
        }
        if pushed > 0 {
            self.returner.notify_available();
        }
        Ok(pushed)
    }

    /// Handle for returning consumed buffers from any thread.
    #[must_use]
    pub fn buffer_returner(&self) -> BufferReturner {
        self.returner.clone()
    }

    /// Buffers waiting in the empty buffer queue.
    #[must_use]
    pub fn num_empty_buffers(&self) -> usize {
        self.inner.lock().ctx.ledger().num_empty()
    }

    /// Buffers mapped to in-progress frames.
    #[must_use]
    pub fn num_mapped_buffers(&self) -> usize {
        self.inner.lock().ctx.ledger().num_mapped()
    }

    /// Whether the next read may start a frame that needs an empty buffer.
    ///
    /// Receive loops apply backpressure only when this is `true`; a frame
    /// that already owns its buffer keeps reading.
    #[must_use]
    pub fn needs_new_buffer(&self) -> bool {
        self.inner.lock().variant.needs_new_buffer()
    }

    /// Configured frame timeout in milliseconds.
    #[must_use]
    pub fn frame_timeout_ms(&self) -> u32 {
        self.inner.lock().ctx.config().frame_timeout_ms
    }

    /// Frames timed out since the decoder was created.
    #[must_use]
    pub fn num_frames_timedout(&self) -> u64 {
        self.inner.lock().ctx.counters().frames_timedout
    }

    /// Snapshot of all health counters.
    #[must_use]
    pub fn counters(&self) -> DecoderCounters {
        self.inner.lock().ctx.counters()
    }

    /// Buffer size the variant needs per frame.
    #[must_use]
    pub fn frame_buffer_size(&self) -> usize {
        self.inner.lock().variant.frame_buffer_size()
    }

    /// Frame header size the variant reserves in each buffer.
    #[must_use]
    pub fn frame_header_size(&self) -> usize {
        self.inner.lock().variant.frame_header_size()
    }

    /// Drop every buffer held in the empty queue or mapped to a frame.
    ///
    /// Used when the buffer pool is replaced or reshaped, since held IDs may
    /// now name different memory. Frames in progress are abandoned, not
    /// drained; pending buffer returns are discarded too.
    pub fn drop_all_buffers(&self) {
        let mut inner = self.inner.lock();
        let (dropped_empty, dropped_mapped) = inner.ctx.ledger_mut().clear();

        if dropped_empty > 0 {
            info!(
                parent: inner.ctx.span(),
                dropped = dropped_empty,
                "Dropping {dropped_empty} buffers from empty buffer queue"
            );
        }
        if dropped_mapped > 0 {
            warn!(
                parent: inner.ctx.span(),
                dropped = dropped_mapped,
                "Dropping {dropped_mapped} unreleased buffers from decoder - possible data loss"
            );
        }

        inner.variant.reset();
        let discarded_returns = self.returner.advance_generation();
        if discarded_returns > 0 {
            debug!(
                parent: inner.ctx.span(),
                discarded_returns,
                "Discarded pending buffer returns"
            );
        }
        inner.ctx.set_generation(self.returner.generation());
    }

    fn drain_returns(&self, inner: &mut DecoderInner) {
        let (returned, stale) = self.returner.drain();
        for buffer_id in returned {
            if let Err(err) = inner.ctx.ledger_mut().push_empty(buffer_id) {
                warn!(
                    parent: inner.ctx.span(),
                    buffer_id,
                    error = %err,
                    "Rejected returned buffer"
                );
            }
        }
        if stale > 0 {
            debug!(
                parent: inner.ctx.span(),
                stale,
                "Ignored buffer returns from a previous generation"
            );
        }
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Write target for the next unit of incoming data.
    pub fn next_message_buffer(&self) -> MessageTarget {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.drain_returns(inner);
        inner.variant.next_message_buffer(&mut inner.ctx)
    }

    /// Run `fill` over the memory named by `target`.
    ///
    /// # Errors
    /// Returns [`DecoderError::StaleMessageTarget`] if the target's buffer is
    /// no longer mapped (timed out or dropped since the target was handed out).
    pub fn fill_message_buffer<R>(
        &self,
        target: MessageTarget,
        fill: impl FnOnce(&mut [u8]) -> R,
    ) -> DecoderResult<R> {
        let mut inner = self.inner.lock();
        Self::fill_target(&mut inner, target, fill)
    }

    fn fill_target<R>(
        inner: &mut DecoderInner,
        target: MessageTarget,
        fill: impl FnOnce(&mut [u8]) -> R,
    ) -> DecoderResult<R> {
        match target {
            MessageTarget::Scratch { offset, len } => {
                let scratch = inner.variant.scratch();
                let end = offset.saturating_add(len).min(scratch.len());
                let start = offset.min(end);
                Ok(fill(&mut scratch[start..end]))
            }
            MessageTarget::Buffer {
                buffer_id,
                offset,
                len,
            } => {
                if !matches!(inner.ctx.ledger().slot_state(buffer_id), SlotState::Mapped(_)) {
                    return Err(DecoderError::StaleMessageTarget(buffer_id));
                }
                let manager = inner
                    .ctx
                    .buffer_manager()
                    .cloned()
                    .ok_or(DecoderError::NoBufferManager)?;
                let buffer_size = manager.buffer_size();
                let end = offset
                    .checked_add(len)
                    .filter(|end| *end <= buffer_size)
                    .ok_or(PoolError::OutOfBounds {
                        offset,
                        len,
                        buffer_size,
                    })?;
                Ok(manager.with_buffer_mut(buffer_id, |block| fill(&mut block[offset..end]))?)
            }
        }
    }

    /// Interpret `bytes_received` bytes just written to the last target.
    ///
    /// Frames completed by this message are delivered to the callback
    /// before returning.
    pub fn process_message(&self, bytes_received: usize) -> FrameReceiveState {
        let (state, released) = {
            let mut inner = self.inner.lock();
            let state = Self::process_locked(&mut inner, bytes_received);
            (state, inner.ctx.take_released())
        };
        self.dispatch(released);
        state
    }

    fn process_locked(inner: &mut DecoderInner, bytes_received: usize) -> FrameReceiveState {
        let state = inner.variant.process_message(&mut inner.ctx, bytes_received);
        if inner.ctx.packet_logging() {
            debug!(
                target: PACKET_LOG_TARGET,
                parent: inner.ctx.span(),
                bytes_received,
                ?state,
                empty_buffers = inner.ctx.ledger().num_empty(),
                mapped_buffers = inner.ctx.ledger().num_mapped(),
                "Message processed"
            );
        }
        state
    }

    /// Acquire a target, let `read` fill it and process the result, all
    /// under one lock.
    ///
    /// `read` is expected to be non-blocking (for example tokio's
    /// `try_read`/`try_recv`). A zero-length read is reported as
    /// [`ReceiveOutcome::Closed`] and `WouldBlock` as
    /// [`ReceiveOutcome::WouldBlock`].
    ///
    /// # Errors
    /// Propagates I/O errors from `read` other than `WouldBlock`.
    pub fn receive<F>(&self, read: F) -> DecoderResult<ReceiveOutcome>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let (outcome, released) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            self.drain_returns(inner);

            let target = inner.variant.next_message_buffer(&mut inner.ctx);
            debug_assert!(!target.is_empty(), "decoder handed out an empty target");

            match Self::fill_target(inner, target, read)? {
                Ok(0) => (ReceiveOutcome::Closed, Vec::new()),
                Ok(n) => {
                    let state = Self::process_locked(inner, n);
                    (ReceiveOutcome::Processed(state), inner.ctx.take_released())
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    (ReceiveOutcome::WouldBlock, Vec::new())
                }
                Err(err) => return Err(err.into()),
            }
        };
        self.dispatch(released);
        Ok(outcome)
    }

    /// Tell the variant its input stream ended.
    ///
    /// Returns the state of a frame cut short by the end of stream, if any.
    pub fn end_of_stream(&self) -> Option<FrameReceiveState> {
        let (state, released) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let state = inner.variant.end_of_stream(&mut inner.ctx);
            (state, inner.ctx.take_released())
        };
        self.dispatch(released);
        state
    }

    /// Scan for stalled frames; one monitor tick.
    pub fn monitor_buffers(&self) {
        let released = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            self.drain_returns(inner);
            inner.variant.monitor_buffers(&mut inner.ctx);
            inner.ctx.take_released()
        };
        self.dispatch(released);
    }

    fn dispatch(&self, frames: Vec<ReadyFrame>) {
        if frames.is_empty() {
            return;
        }
        let mut callback = self.callback.lock();
        match callback.as_mut() {
            Some(callback) => {
                for frame in frames {
                    callback(frame.buffer_id, frame.metadata);
                }
            }
            None => {
                for frame in frames {
                    warn!(
                        buffer_id = frame.buffer_id,
                        frame_number = frame.metadata.frame_number,
                        "No frame ready callback registered, returning buffer"
                    );
                    self.returner.return_frame(frame.buffer_id, &frame.metadata);
                }
            }
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Populate `status` with decoder counters under `prefix`.
    pub fn status(&self, prefix: &str, status: &mut ParamMessage) {
        let inner = self.inner.lock();
        let counters = inner.ctx.counters();
        let key = |name: &str| format!("{prefix}{name}");

        status.set_param(&key("name"), self.name);
        status.set_param(&key("empty_buffers"), inner.ctx.ledger().num_empty() as u64);
        status.set_param(&key("mapped_buffers"), inner.ctx.ledger().num_mapped() as u64);
        status.set_param(&key("frames_timedout"), counters.frames_timedout);
        status.set_param(&key("frames_released"), counters.frames_released);
        status.set_param(&key("frames_missing_data"), counters.frames_missing_data);
        status.set_param(&key("frames_dropped"), counters.frames_dropped);
        status.set_param(&key("invalid_messages"), counters.invalid_messages);
        inner.variant.status(prefix, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::DummyTcpDecoder;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn decoder_with_pool(num_buffers: usize) -> (FrameDecoder, Arc<SharedBufferManager>) {
        let decoder = FrameDecoder::new(Box::new(DummyTcpDecoder::new()));
        let pool = SharedBufferManager::new("engine-test", num_buffers, 64).unwrap();
        decoder.register_buffer_manager(Arc::clone(&pool));
        (decoder, pool)
    }

    #[test]
    fn test_init_applies_config_and_keeps_counters() {
        let (decoder, _pool) = decoder_with_pool(2);
        let config = ParamMessage::from_value(json!({ "frame_timeout_ms": 250 })).unwrap();
        decoder.init(Span::none(), &config).unwrap();
        assert_eq!(decoder.frame_timeout_ms(), 250);

        decoder.push_all_buffers().unwrap();
        decoder.register_frame_ready_callback(|_, _| {});
        decoder.receive(|buf| Ok(buf.len())).unwrap();
        assert_eq!(decoder.counters().frames_released, 1);

        let config = ParamMessage::from_value(json!({ "enable_packet_logging": true })).unwrap();
        decoder.init(Span::none(), &config).unwrap();
        assert_eq!(decoder.frame_timeout_ms(), 250);
        assert_eq!(decoder.counters().frames_released, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (decoder, _pool) = decoder_with_pool(1);
        let config = ParamMessage::from_value(json!({ "frame_timeout_ms": -1 })).unwrap();
        assert!(decoder.init(Span::none(), &config).is_err());
        assert_eq!(decoder.frame_timeout_ms(), crate::config::DEFAULT_FRAME_TIMEOUT_MS);
    }

    #[test]
    fn test_push_without_manager_fails() {
        let decoder = FrameDecoder::new(Box::new(DummyTcpDecoder::new()));
        assert!(matches!(
            decoder.push_empty_buffer(0),
            Err(DecoderError::NoBufferManager)
        ));
    }

    #[test]
    fn test_push_all_skips_held_buffers() {
        let (decoder, _pool) = decoder_with_pool(4);
        decoder.push_empty_buffer(2).unwrap();
        assert_eq!(decoder.push_all_buffers().unwrap(), 3);
        assert_eq!(decoder.num_empty_buffers(), 4);
        assert_eq!(decoder.push_all_buffers().unwrap(), 0);
    }

    #[test]
    fn test_callback_may_return_buffer_synchronously() {
        let (decoder, _pool) = decoder_with_pool(1);
        let decoder = Arc::new(decoder);
        decoder.push_all_buffers().unwrap();

        let weak = Arc::downgrade(&decoder);
        decoder.register_frame_ready_callback(move |buffer_id, _| {
            if let Some(decoder) = weak.upgrade() {
                decoder.push_empty_buffer(buffer_id).unwrap();
            }
        });

        for _ in 0..5 {
            let outcome = decoder.receive(|buf| Ok(buf.len())).unwrap();
            assert_eq!(outcome, ReceiveOutcome::Processed(FrameReceiveState::Complete));
        }
        assert_eq!(decoder.num_empty_buffers(), 1);
        assert_eq!(decoder.counters().frames_released, 5);
        assert_eq!(decoder.counters().frames_dropped, 0);
    }

    #[test]
    fn test_returner_feeds_next_frame() {
        let (decoder, _pool) = decoder_with_pool(1);
        decoder.push_all_buffers().unwrap();
        let returner = decoder.buffer_returner();

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let cb_returner = returner.clone();
        decoder.register_frame_ready_callback(move |buffer_id, metadata| {
            counter.fetch_add(1, Ordering::SeqCst);
            cb_returner.return_frame(buffer_id, &metadata);
        });

        decoder.receive(|buf| Ok(buf.len())).unwrap();
        assert_eq!(returner.pending(), 1);
        decoder.receive(|buf| Ok(buf.len())).unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(decoder.counters().frames_dropped, 0);
    }

    #[test]
    fn test_receive_reports_would_block_and_closed() {
        let (decoder, _pool) = decoder_with_pool(1);
        decoder.push_all_buffers().unwrap();

        let outcome = decoder
            .receive(|_| Err(io::Error::from(io::ErrorKind::WouldBlock)))
            .unwrap();
        assert_eq!(outcome, ReceiveOutcome::WouldBlock);

        let outcome = decoder.receive(|_| Ok(0)).unwrap();
        assert_eq!(outcome, ReceiveOutcome::Closed);

        let err = decoder
            .receive(|_| Err(io::Error::from(io::ErrorKind::ConnectionReset)))
            .unwrap_err();
        assert!(matches!(err, DecoderError::Io(_)));
    }

    #[test]
    fn test_missing_callback_returns_buffer() {
        let (decoder, _pool) = decoder_with_pool(1);
        decoder.push_all_buffers().unwrap();

        decoder.receive(|buf| Ok(buf.len())).unwrap();
        assert_eq!(decoder.buffer_returner().pending(), 1);

        // Drained on the next acquisition
        decoder.next_message_buffer();
        assert_eq!(decoder.num_empty_buffers(), 0);
        assert_eq!(decoder.num_mapped_buffers(), 1);
    }

    #[test]
    #[traced_test]
    fn test_drop_all_buffers_logs_abandoned_frames() {
        let (decoder, _pool) = decoder_with_pool(5);
        decoder.push_all_buffers().unwrap();
        {
            let mut inner = decoder.inner.lock();
            for key in 0..3 {
                inner.ctx.ledger_mut().map_frame(key).unwrap();
            }
        }
        assert_eq!(decoder.num_empty_buffers(), 2);
        assert_eq!(decoder.num_mapped_buffers(), 3);

        decoder.drop_all_buffers();

        assert_eq!(decoder.num_empty_buffers(), 0);
        assert_eq!(decoder.num_mapped_buffers(), 0);
        assert!(logs_contain("Dropping 2 buffers from empty buffer queue"));
        assert!(logs_contain(
            "Dropping 3 unreleased buffers from decoder - possible data loss"
        ));
        assert!(logs_contain("WARN"));
    }

    #[test]
    fn test_stale_returns_ignored_after_drop() {
        let (decoder, _pool) = decoder_with_pool(2);
        decoder.push_all_buffers().unwrap();
        let returner = decoder.buffer_returner();

        let held = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&held);
        decoder.register_frame_ready_callback(move |buffer_id, metadata| {
            sink.lock().push((buffer_id, metadata));
        });
        decoder.receive(|buf| Ok(buf.len())).unwrap();

        decoder.drop_all_buffers();
        for (buffer_id, metadata) in held.lock().drain(..) {
            returner.return_frame(buffer_id, &metadata);
        }
        decoder.next_message_buffer();

        assert_eq!(decoder.num_empty_buffers(), 0);
        assert_eq!(decoder.num_mapped_buffers(), 0);
    }

    #[test]
    fn test_status_keys() {
        let (decoder, _pool) = decoder_with_pool(3);
        decoder.push_all_buffers().unwrap();

        let mut status = ParamMessage::new();
        decoder.status("decoder/", &mut status);
        let value = status.to_value();
        assert_eq!(value["decoder"]["name"], "dummy_tcp");
        assert_eq!(value["decoder"]["empty_buffers"], 3);
        assert_eq!(value["decoder"]["mapped_buffers"], 0);
        assert_eq!(value["decoder"]["frames_timedout"], 0);
    }
}
