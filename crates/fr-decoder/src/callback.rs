//! Frame delivery to the downstream pipeline, and the path buffers take back.
//!
//! Delivery is synchronous and single-consumer: the engine invokes one
//! [`FrameReadyCallback`] exactly once per released frame, on the thread that
//! released it, after its own state lock has been dropped. The callback now
//! owns the buffer. It gives it back either through
//! [`FrameDecoder::push_empty_buffer`](crate::FrameDecoder::push_empty_buffer)
//! or, from any thread, through a [`BufferReturner`].
//!
//! [`channel_callback`] turns a bounded tokio channel into a callback for
//! consumers that run as async tasks. A full channel does not block the
//! receive path: the frame is dropped and its buffer returned at once.

use crate::definitions::FrameGeometry;
use crate::ledger::FrameKey;
use crossbeam_queue::SegQueue;
use fr_pool::BufferId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

/// Metadata delivered with each released frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame key (frame number).
    pub frame_number: FrameKey,
    /// Payload bytes received, excluding the frame header.
    pub payload_size: usize,
    /// Size of the frame header at the start of the buffer.
    pub header_size: usize,
    /// `false` if the frame was released with missing data.
    pub complete: bool,
    /// Packets (or reads) received.
    pub packets_received: u32,
    /// Packets expected, 0 if the format is not packetised.
    pub packets_expected: u32,
    /// Image geometry, when the wire format declares it.
    pub geometry: Option<FrameGeometry>,
    /// Buffer generation, bumped each time the decoder drops all buffers.
    pub generation: u64,
}

/// A released frame as sent through [`channel_callback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyFrame {
    /// Buffer holding the frame.
    pub buffer_id: BufferId,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Callback invoked once per released frame.
pub type FrameReadyCallback = Box<dyn FnMut(BufferId, FrameMetadata) + Send>;

#[derive(Debug, Default)]
struct ReturnQueue {
    queue: SegQueue<(u64, BufferId)>,
    generation: AtomicU64,
    available: Notify,
}

/// Lock-free handle for returning consumed buffers to a decoder.
///
/// Returned IDs are validated and moved onto the empty buffer queue the next
/// time the decoder hands out a message buffer or runs its monitor. Returns
/// tagged with a generation older than the decoder's last
/// [`drop_all_buffers`](crate::FrameDecoder::drop_all_buffers) are discarded.
#[derive(Debug, Clone, Default)]
pub struct BufferReturner {
    inner: Arc<ReturnQueue>,
}

impl BufferReturner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return the buffer of a frame delivered to the callback.
    pub fn return_frame(&self, buffer_id: BufferId, metadata: &FrameMetadata) {
        self.inner.queue.push((metadata.generation, buffer_id));
        self.notify_available();
    }

    /// Return a buffer belonging to the current generation.
    pub fn return_buffer(&self, buffer_id: BufferId) {
        let generation = self.generation();
        self.inner.queue.push((generation, buffer_id));
        self.notify_available();
    }

    /// Wait until a buffer is returned or pushed to the decoder.
    ///
    /// A signal sent while nobody is waiting is kept for the next waiter, so
    /// callers check their condition, then await this, then check again.
    pub async fn buffer_available(&self) {
        self.inner.available.notified().await;
    }

    pub(crate) fn notify_available(&self) {
        self.inner.available.notify_one();
    }

    /// Returns waiting to be drained.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Start a new generation and forget every pending return.
    pub(crate) fn advance_generation(&self) -> usize {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let mut discarded = 0;
        while self.inner.queue.pop().is_some() {
            discarded += 1;
        }
        discarded
    }

    /// Pop all pending returns, split into current and stale generations.
    pub(crate) fn drain(&self) -> (Vec<BufferId>, usize) {
        let generation = self.generation();
        let mut current = Vec::new();
        let mut stale = 0;
        while let Some((tag, id)) = self.inner.queue.pop() {
            if tag == generation {
                current.push(id);
            } else {
                stale += 1;
            }
        }
        (current, stale)
    }
}

/// Adapt a bounded channel into a frame ready callback.
///
/// If the channel is full or closed the frame is dropped with a warning and
/// its buffer is returned through `returner`, so the receive path never
/// blocks on a slow consumer.
#[must_use]
pub fn channel_callback(
    tx: mpsc::Sender<ReadyFrame>,
    returner: BufferReturner,
) -> FrameReadyCallback {
    Box::new(move |buffer_id, metadata| {
        let frame = ReadyFrame {
            buffer_id,
            metadata,
        };
        if let Err(err) = tx.try_send(frame) {
            let (reason, frame) = match err {
                mpsc::error::TrySendError::Full(frame) => ("queue full", frame),
                mpsc::error::TrySendError::Closed(frame) => ("consumer closed", frame),
            };
            warn!(
                buffer_id = frame.buffer_id,
                frame_number = frame.metadata.frame_number,
                reason,
                "Downstream could not accept frame, returning buffer"
            );
            returner.return_frame(frame.buffer_id, &frame.metadata);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(frame_number: FrameKey, generation: u64) -> FrameMetadata {
        FrameMetadata {
            frame_number,
            payload_size: 16,
            header_size: 0,
            complete: true,
            packets_received: 1,
            packets_expected: 0,
            geometry: None,
            generation,
        }
    }

    #[test]
    fn test_drain_splits_generations() {
        let returner = BufferReturner::new();
        returner.return_buffer(1);
        returner.return_frame(2, &metadata(0, 0));
        returner.advance_generation();
        assert_eq!(returner.pending(), 0);

        returner.return_frame(3, &metadata(1, 0));
        returner.return_buffer(4);
        let (current, stale) = returner.drain();
        assert_eq!(current, vec![4]);
        assert_eq!(stale, 1);
        assert_eq!(returner.pending(), 0);
    }

    #[test]
    fn test_return_signals_availability() {
        let returner = BufferReturner::new();
        let waiter = returner.clone();
        returner.return_buffer(5);
        // Signal sent before anyone waited is not lost
        tokio_test::block_on(waiter.buffer_available());
        assert_eq!(waiter.pending(), 1);
    }

    #[tokio::test]
    async fn test_channel_callback_delivers() {
        let (tx, mut rx) = mpsc::channel(4);
        let returner = BufferReturner::new();
        let mut callback = channel_callback(tx, returner.clone());

        callback(7, metadata(99, 0));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.buffer_id, 7);
        assert_eq!(frame.metadata.frame_number, 99);
        assert_eq!(returner.pending(), 0);
    }

    #[test]
    fn test_channel_full_returns_buffer() {
        let (tx, mut rx) = mpsc::channel(1);
        let returner = BufferReturner::new();
        let mut callback = channel_callback(tx, returner.clone());

        callback(1, metadata(1, 0));
        callback(2, metadata(2, 0));

        let delivered = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(delivered.buffer_id, 1);
        assert_eq!(returner.drain(), (vec![2], 0));
    }

    #[test]
    fn test_closed_channel_returns_buffer() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let returner = BufferReturner::new();
        let mut callback = channel_callback(tx, returner.clone());

        callback(5, metadata(1, 0));
        assert_eq!(returner.drain(), (vec![5], 0));
    }
}
