//! Buffer ownership ledger: empty buffer queue, frame buffer map and the
//! slot table that keeps them honest.
//!
//! # Design
//!
//! Every buffer ID the decoder has been given is in exactly one of three
//! states, recorded in a slot table indexed by [`BufferId`]:
//!
//! - `Outstanding`: not held by the decoder (never pushed, or released
//!   downstream and not yet returned)
//! - `Empty`: waiting in the FIFO empty buffer queue
//! - `Mapped(key)`: filling with the in-progress frame `key`
//!
//! The queue and the map are only mutated together with the slot table, so a
//! duplicate push or a double return is caught at the push instead of
//! silently corrupting the pool. [`BufferLedger::is_consistent`] checks the
//! three views agree and is asserted after every mutation in debug builds.

use crate::error::{DecoderError, DecoderResult};
use fr_pool::BufferId;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Key identifying an in-progress frame (normally the frame number).
pub type FrameKey = u64;

/// Ownership state of one buffer ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not held by the decoder.
    Outstanding,
    /// Queued for a new frame.
    Empty,
    /// Filling with the given frame.
    Mapped(FrameKey),
}

/// Decode progress of a frame in the frame buffer map.
#[derive(Debug, Clone)]
pub struct MappedFrame {
    /// Buffer receiving the frame.
    pub buffer_id: BufferId,
    /// Payload bytes written so far.
    pub bytes_received: usize,
    /// Packets (or reads) received so far.
    pub packets_received: u32,
    /// Arrival of the first data for this frame.
    pub first_arrival: Instant,
    /// Arrival of the most recent data.
    pub last_arrival: Instant,
    /// Wall-clock start of the frame, for the frame header.
    pub start_time: SystemTime,
}

/// Empty buffer queue plus frame buffer map, tied together by a slot table.
#[derive(Debug, Default)]
pub struct BufferLedger {
    slots: Vec<SlotState>,
    capacity: Option<usize>,
    empty: VecDeque<BufferId>,
    frames: BTreeMap<FrameKey, MappedFrame>,
}

impl BufferLedger {
    /// Ledger with no registered pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the ledger to a pool of `num_buffers` IDs.
    ///
    /// Buffers already held are kept; the owner is expected to follow a pool
    /// change with [`clear`](Self::clear).
    pub fn set_capacity(&mut self, num_buffers: usize) {
        self.capacity = Some(num_buffers);
    }

    /// Size of the registered pool, if any.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of buffers in the empty buffer queue.
    #[must_use]
    pub fn num_empty(&self) -> usize {
        self.empty.len()
    }

    /// Number of buffers mapped to in-progress frames.
    #[must_use]
    pub fn num_mapped(&self) -> usize {
        self.frames.len()
    }

    /// Ownership state of `id`.
    #[must_use]
    pub fn slot_state(&self, id: BufferId) -> SlotState {
        self.slots.get(id).copied().unwrap_or(SlotState::Outstanding)
    }

    fn set_slot(&mut self, id: BufferId, state: SlotState) {
        if id >= self.slots.len() {
            self.slots.resize(id + 1, SlotState::Outstanding);
        }
        self.slots[id] = state;
    }

    /// Append `id` to the tail of the empty buffer queue.
    ///
    /// # Errors
    /// - [`DecoderError::NoBufferManager`] if no pool is registered
    /// - [`DecoderError::BufferOutOfRange`] if `id` is beyond the pool
    /// - [`DecoderError::DuplicateBuffer`] if `id` is already queued or mapped
    pub fn push_empty(&mut self, id: BufferId) -> DecoderResult<()> {
        let num_buffers = self.capacity.ok_or(DecoderError::NoBufferManager)?;
        if id >= num_buffers {
            return Err(DecoderError::BufferOutOfRange { id, num_buffers });
        }
        if self.slot_state(id) != SlotState::Outstanding {
            return Err(DecoderError::DuplicateBuffer(id));
        }

        self.set_slot(id, SlotState::Empty);
        self.empty.push_back(id);
        debug_assert!(self.is_consistent());
        Ok(())
    }

    /// Take the head of the empty buffer queue and map it to frame `key`.
    ///
    /// Returns `Ok(None)` when the queue is exhausted.
    ///
    /// # Errors
    /// Returns [`DecoderError::FrameAlreadyMapped`] if `key` is in progress.
    pub fn map_frame(&mut self, key: FrameKey) -> DecoderResult<Option<BufferId>> {
        if self.frames.contains_key(&key) {
            return Err(DecoderError::FrameAlreadyMapped(key));
        }
        let Some(buffer_id) = self.empty.pop_front() else {
            return Ok(None);
        };

        let now = Instant::now();
        self.set_slot(buffer_id, SlotState::Mapped(key));
        self.frames.insert(
            key,
            MappedFrame {
                buffer_id,
                bytes_received: 0,
                packets_received: 0,
                first_arrival: now,
                last_arrival: now,
                start_time: SystemTime::now(),
            },
        );
        debug_assert!(self.is_consistent());
        Ok(Some(buffer_id))
    }

    /// Progress record of frame `key`.
    #[must_use]
    pub fn frame(&self, key: FrameKey) -> Option<&MappedFrame> {
        self.frames.get(&key)
    }

    /// Mutable progress record of frame `key`.
    pub fn frame_mut(&mut self, key: FrameKey) -> Option<&mut MappedFrame> {
        self.frames.get_mut(&key)
    }

    /// Keys of all in-progress frames, oldest key first.
    pub fn frame_keys(&self) -> impl Iterator<Item = FrameKey> + '_ {
        self.frames.keys().copied()
    }

    /// Remove frame `key` and hand its buffer out of the decoder.
    ///
    /// The buffer becomes `Outstanding` until it is pushed back.
    pub fn unmap(&mut self, key: FrameKey) -> Option<MappedFrame> {
        let frame = self.frames.remove(&key)?;
        self.set_slot(frame.buffer_id, SlotState::Outstanding);
        debug_assert!(self.is_consistent());
        Some(frame)
    }

    /// Remove frame `key` and put its buffer back on the empty buffer queue.
    pub fn recycle(&mut self, key: FrameKey) -> Option<MappedFrame> {
        let frame = self.frames.remove(&key)?;
        self.set_slot(frame.buffer_id, SlotState::Empty);
        self.empty.push_back(frame.buffer_id);
        debug_assert!(self.is_consistent());
        Some(frame)
    }

    /// Frames whose first data arrived more than `timeout` before `now`.
    #[must_use]
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<FrameKey> {
        self.frames
            .iter()
            .filter(|(_, frame)| now.saturating_duration_since(frame.first_arrival) > timeout)
            .map(|(key, _)| *key)
            .collect()
    }

    /// Replace the queue, the map and the slot table with empty ones.
    ///
    /// Returns how many queued and mapped buffers were dropped.
    pub fn clear(&mut self) -> (usize, usize) {
        let dropped_empty = std::mem::take(&mut self.empty).len();
        let dropped_mapped = std::mem::take(&mut self.frames).len();
        self.slots = Vec::new();
        (dropped_empty, dropped_mapped)
    }

    /// Whether the slot table, queue and map describe the same ownership.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let queued_ok = self
            .empty
            .iter()
            .all(|&id| self.slot_state(id) == SlotState::Empty);
        let mapped_ok = self
            .frames
            .iter()
            .all(|(&key, frame)| self.slot_state(frame.buffer_id) == SlotState::Mapped(key));

        let slot_empty = self.slots.iter().filter(|s| **s == SlotState::Empty).count();
        let slot_mapped = self
            .slots
            .iter()
            .filter(|s| matches!(s, SlotState::Mapped(_)))
            .count();

        queued_ok
            && mapped_ok
            && slot_empty == self.empty.len()
            && slot_mapped == self.frames.len()
    }
}
