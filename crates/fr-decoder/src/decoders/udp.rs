//! Packetised frames over UDP datagrams.
//!
//! A frame is split into `packets_per_frame` datagrams. Each carries a small
//! header followed by up to `packet_payload_size` bytes:
//!
//! ```text
//! 0   magic          u32  "FRUD"
//! 4   packet_number  u16  position within the frame
//! 6   flags          u16  0x1 start of frame, 0x2 end of frame
//! 8   frame_number   u64
//! ```
//!
//! Datagrams land in scratch memory and their payload is copied to
//! `packet_number * packet_payload_size` past the [`FrameHeader`] of the
//! frame's buffer, so packets may arrive in any order. Frames interleave
//! freely. A frame still missing packets when the timeout expires is
//! released with missing data rather than discarded.
//!
//! Released frames stay retired for one frame timeout: stragglers and
//! duplicates for them are counted as late and never map a new buffer.

use crate::context::{DecoderContext, FrameRelease, PACKET_LOG_TARGET};
use crate::error::{DecoderError, DecoderResult};
use crate::frame_header::FrameHeader;
use crate::ledger::FrameKey;
use crate::limits::MAX_FRAME_BYTES;
use crate::params::ParamMessage;
use crate::variant::{DecoderVariant, FrameReceiveState, MessageTarget};
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Magic number opening a UDP packet header ("FRUD").
pub const UDP_PACKET_MAGIC: u32 = 0x4652_5544;
/// Flag set on the first packet of a frame.
pub const UDP_FLAG_START_OF_FRAME: u16 = 0x1;
/// Flag set on the last packet of a frame.
pub const UDP_FLAG_END_OF_FRAME: u16 = 0x2;

/// Parameter key for the number of packets in one frame.
pub const CONFIG_UDP_PACKETS_PER_FRAME: &str = "packets_per_frame";
/// Parameter key for the payload bytes in a full packet.
pub const CONFIG_UDP_PACKET_PAYLOAD_SIZE: &str = "packet_payload_size";
/// Default packets per frame.
pub const DEFAULT_PACKETS_PER_FRAME: u32 = 4;
/// Default payload bytes per packet.
pub const DEFAULT_PACKET_PAYLOAD_SIZE: usize = 8000;

const MAX_PACKETS_PER_FRAME: u32 = u16::MAX as u32 + 1;
// Largest payload a single UDP datagram can carry after our header.
const MAX_PACKET_PAYLOAD_SIZE: usize = 65_507 - UdpPacketHeader::SIZE;

/// UDP packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpPacketHeader {
    /// Magic number, [`UDP_PACKET_MAGIC`] when valid.
    pub magic: u32,
    /// Position of the packet within its frame.
    pub packet_number: u16,
    /// Start/end of frame flags.
    pub flags: u16,
    /// Frame the packet belongs to.
    pub frame_number: u64,
}

impl UdpPacketHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Header for packet `packet_number` of `packets_per_frame` in a frame.
    #[must_use]
    pub fn new(frame_number: u64, packet_number: u16, packets_per_frame: u32) -> Self {
        let mut flags = 0;
        if packet_number == 0 {
            flags |= UDP_FLAG_START_OF_FRAME;
        }
        if u32::from(packet_number) + 1 == packets_per_frame {
            flags |= UDP_FLAG_END_OF_FRAME;
        }
        Self {
            magic: UDP_PACKET_MAGIC,
            packet_number,
            flags,
            frame_number,
        }
    }

    /// Decode from the first [`SIZE`](Self::SIZE) bytes of `src`.
    #[must_use]
    pub fn decode(src: &[u8]) -> Option<Self> {
        if src.len() < Self::SIZE {
            return None;
        }
        let mut cursor = &src[..Self::SIZE];
        Some(Self {
            magic: cursor.get_u32_le(),
            packet_number: cursor.get_u16_le(),
            flags: cursor.get_u16_le(),
            frame_number: cursor.get_u64_le(),
        })
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut cursor = &mut out[..];
        cursor.put_u32_le(self.magic);
        cursor.put_u16_le(self.packet_number);
        cursor.put_u16_le(self.flags);
        cursor.put_u64_le(self.frame_number);
        out
    }
}

#[derive(Debug)]
struct PacketProgress {
    seen: Vec<bool>,
    count: u32,
}

impl PacketProgress {
    fn new(packets_per_frame: u32) -> Self {
        Self {
            seen: vec![false; packets_per_frame as usize],
            count: 0,
        }
    }

    fn expected(&self) -> u32 {
        self.seen.len() as u32
    }

    /// Mark `packet`; `false` if it was already seen.
    fn mark(&mut self, packet: usize) -> bool {
        match self.seen.get_mut(packet) {
            Some(seen) if !*seen => {
                *seen = true;
                self.count += 1;
                true
            }
            _ => false,
        }
    }

    fn is_complete(&self) -> bool {
        self.count == self.expected()
    }
}

#[derive(Debug)]
struct DroppedFrame {
    progress: PacketProgress,
    first_arrival: Instant,
}

/// Decoder for packetised frames on a UDP socket.
#[derive(Debug)]
pub struct UdpFrameDecoder {
    scratch: Vec<u8>,
    packets_per_frame: u32,
    packet_payload_size: usize,
    frames: HashMap<FrameKey, PacketProgress>,
    dropped: HashMap<FrameKey, DroppedFrame>,
    retired: HashMap<FrameKey, Instant>,
    packets_received: u64,
    packets_duplicate: u64,
    packets_late: u64,
    packets_lost: u64,
}

impl Default for UdpFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpFrameDecoder {
    /// New decoder with default packet geometry.
    #[must_use]
    pub fn new() -> Self {
        let decoder = Self {
            scratch: vec![0; Self::scratch_size(DEFAULT_PACKET_PAYLOAD_SIZE)],
            packets_per_frame: DEFAULT_PACKETS_PER_FRAME,
            packet_payload_size: DEFAULT_PACKET_PAYLOAD_SIZE,
            frames: HashMap::new(),
            dropped: HashMap::new(),
            retired: HashMap::new(),
            packets_received: 0,
            packets_duplicate: 0,
            packets_late: 0,
            packets_lost: 0,
        };
        info!(version = %decoder.version().long, "UdpFrameDecoder loaded");
        decoder
    }

    // One spare byte so an oversize datagram is seen as oversize, not truncated to fit.
    fn scratch_size(packet_payload_size: usize) -> usize {
        UdpPacketHeader::SIZE + packet_payload_size + 1
    }

    fn payload_offset(&self, packet_number: u16) -> usize {
        FrameHeader::SIZE + usize::from(packet_number) * self.packet_payload_size
    }

    fn retire(&mut self, key: FrameKey) {
        self.retired.insert(key, Instant::now());
    }

    fn release(&mut self, ctx: &mut DecoderContext, key: FrameKey, complete: bool) {
        let Some(progress) = self.frames.remove(&key) else {
            return;
        };
        self.retire(key);
        if !complete {
            self.packets_lost += u64::from(progress.expected() - progress.count);
        }
        ctx.release_frame(
            key,
            FrameRelease {
                complete,
                header_size: FrameHeader::SIZE,
                packets_expected: progress.expected(),
                geometry: None,
            },
        );
    }

    fn accept_packet(
        &mut self,
        ctx: &mut DecoderContext,
        header: UdpPacketHeader,
        payload_len: usize,
    ) -> FrameReceiveState {
        let key = header.frame_number;
        let packet = usize::from(header.packet_number);
        let offset = self.payload_offset(header.packet_number);

        if self.retired.contains_key(&key) {
            self.packets_late += 1;
            if ctx.packet_logging() {
                debug!(
                    target: PACKET_LOG_TARGET,
                    parent: ctx.span(),
                    frame_number = key,
                    packet_number = packet,
                    "Late packet for released frame ignored"
                );
            }
            return FrameReceiveState::Incomplete;
        }

        if !self.frames.contains_key(&key) && !self.dropped.contains_key(&key) {
            match ctx.begin_frame(key) {
                Ok(Some(_)) => {
                    self.frames.insert(key, PacketProgress::new(self.packets_per_frame));
                }
                Ok(None) => {
                    self.dropped.insert(
                        key,
                        DroppedFrame {
                            progress: PacketProgress::new(self.packets_per_frame),
                            first_arrival: Instant::now(),
                        },
                    );
                }
                Err(err) => {
                    error!(parent: ctx.span(), frame_number = key, error = %err, "Failed to map frame");
                    ctx.record_dropped(key);
                    return FrameReceiveState::Invalid;
                }
            }
        }

        if let Some(dropped) = self.dropped.get_mut(&key) {
            if !dropped.progress.mark(packet) {
                self.packets_duplicate += 1;
                return FrameReceiveState::Incomplete;
            }
            if dropped.progress.is_complete() {
                self.dropped.remove(&key);
                self.retire(key);
                debug!(parent: ctx.span(), frame_number = key, "All packets of dropped frame received");
                return FrameReceiveState::Complete;
            }
            return FrameReceiveState::Incomplete;
        }

        let Some(buffer_id) = ctx.frame(key).map(|frame| frame.buffer_id) else {
            // Frame was tracked but its buffer is gone; forget it
            self.frames.remove(&key);
            ctx.record_invalid(format_args!("packet for unmapped frame {key}"));
            return FrameReceiveState::Invalid;
        };
        let Some(progress) = self.frames.get_mut(&key) else {
            return FrameReceiveState::Invalid;
        };
        if packet >= progress.seen.len() {
            ctx.record_invalid(format_args!(
                "packet {packet} beyond frame {key} of {} packets",
                progress.expected()
            ));
            return FrameReceiveState::Invalid;
        }
        if progress.seen[packet] {
            self.packets_duplicate += 1;
            if ctx.packet_logging() {
                debug!(
                    target: PACKET_LOG_TARGET,
                    parent: ctx.span(),
                    frame_number = key,
                    packet_number = packet,
                    "Duplicate packet ignored"
                );
            }
            return FrameReceiveState::Incomplete;
        }

        // Only a stored packet counts towards completion
        let payload = &self.scratch[UdpPacketHeader::SIZE..UdpPacketHeader::SIZE + payload_len];
        if let Err(err) = ctx.write_payload(buffer_id, offset, payload) {
            ctx.record_invalid(format_args!("packet {packet} of frame {key}: {err}"));
            return FrameReceiveState::Invalid;
        }
        progress.mark(packet);
        let complete = progress.is_complete();
        ctx.record_progress(key, payload_len, 1);

        if complete {
            self.release(ctx, key, true);
            FrameReceiveState::Complete
        } else {
            FrameReceiveState::Incomplete
        }
    }
}

impl DecoderVariant for UdpFrameDecoder {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn frame_buffer_size(&self) -> usize {
        FrameHeader::SIZE + self.packets_per_frame as usize * self.packet_payload_size
    }

    fn frame_header_size(&self) -> usize {
        FrameHeader::SIZE
    }

    fn configure(&mut self, prefix: &str, msg: &ParamMessage) -> DecoderResult<()> {
        let packets_key = format!("{prefix}{CONFIG_UDP_PACKETS_PER_FRAME}");
        let payload_key = format!("{prefix}{CONFIG_UDP_PACKET_PAYLOAD_SIZE}");

        let packets_per_frame = msg
            .get_param::<u32>(&packets_key)?
            .unwrap_or(self.packets_per_frame);
        let packet_payload_size = msg
            .get_param::<usize>(&payload_key)?
            .unwrap_or(self.packet_payload_size);

        if packets_per_frame == 0 || packets_per_frame > MAX_PACKETS_PER_FRAME {
            return Err(DecoderError::InvalidParameter {
                key: packets_key,
                reason: format!("must be between 1 and {MAX_PACKETS_PER_FRAME}"),
            });
        }
        if packet_payload_size == 0 || packet_payload_size > MAX_PACKET_PAYLOAD_SIZE {
            return Err(DecoderError::InvalidParameter {
                key: payload_key,
                reason: format!("must be between 1 and {MAX_PACKET_PAYLOAD_SIZE}"),
            });
        }
        let frame_bytes = (packets_per_frame as usize).saturating_mul(packet_payload_size);
        if frame_bytes > MAX_FRAME_BYTES {
            return Err(DecoderError::InvalidParameter {
                key: packets_key,
                reason: format!("frame of {frame_bytes} bytes exceeds maximum {MAX_FRAME_BYTES}"),
            });
        }

        self.packets_per_frame = packets_per_frame;
        if packet_payload_size != self.packet_payload_size {
            self.packet_payload_size = packet_payload_size;
            self.scratch = vec![0; Self::scratch_size(packet_payload_size)];
        }
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut ParamMessage) {
        reply.set_param(
            &format!("{prefix}{CONFIG_UDP_PACKETS_PER_FRAME}"),
            self.packets_per_frame,
        );
        reply.set_param(
            &format!("{prefix}{CONFIG_UDP_PACKET_PAYLOAD_SIZE}"),
            self.packet_payload_size as u64,
        );
    }

    fn scratch(&mut self) -> &mut [u8] {
        &mut self.scratch
    }

    fn next_message_buffer(&mut self, _ctx: &mut DecoderContext) -> MessageTarget {
        MessageTarget::Scratch {
            offset: 0,
            len: self.scratch.len(),
        }
    }

    fn process_message(&mut self, ctx: &mut DecoderContext, bytes_received: usize) -> FrameReceiveState {
        self.packets_received += 1;

        let Some(header) = UdpPacketHeader::decode(&self.scratch[..bytes_received.min(self.scratch.len())])
        else {
            ctx.record_invalid(format_args!("datagram of {bytes_received} bytes is shorter than a packet header"));
            return FrameReceiveState::Invalid;
        };
        if header.magic != UDP_PACKET_MAGIC {
            ctx.record_invalid(format_args!("bad packet magic 0x{:08x}", header.magic));
            return FrameReceiveState::Invalid;
        }
        let payload_len = bytes_received - UdpPacketHeader::SIZE;
        if payload_len > self.packet_payload_size {
            ctx.record_invalid(format_args!(
                "packet payload exceeds {} bytes",
                self.packet_payload_size
            ));
            return FrameReceiveState::Invalid;
        }
        if u32::from(header.packet_number) >= self.packets_per_frame {
            ctx.record_invalid(format_args!(
                "packet number {} beyond {} packets per frame",
                header.packet_number, self.packets_per_frame
            ));
            return FrameReceiveState::Invalid;
        }

        if ctx.packet_logging() {
            debug!(
                target: PACKET_LOG_TARGET,
                parent: ctx.span(),
                frame_number = header.frame_number,
                packet_number = header.packet_number,
                start_of_frame = header.flags & UDP_FLAG_START_OF_FRAME != 0,
                end_of_frame = header.flags & UDP_FLAG_END_OF_FRAME != 0,
                payload_len,
                "Packet received"
            );
        }

        self.accept_packet(ctx, header, payload_len)
    }

    fn monitor_buffers(&mut self, ctx: &mut DecoderContext) {
        for key in ctx.expired_frames() {
            ctx.record_timeout(key);
            if self.frames.contains_key(&key) {
                self.release(ctx, key, false);
            } else {
                // Mapped before a reconfiguration or reset lost track of it
                self.retire(key);
                ctx.release_frame(
                    key,
                    FrameRelease {
                        complete: false,
                        header_size: FrameHeader::SIZE,
                        packets_expected: self.packets_per_frame,
                        geometry: None,
                    },
                );
            }
        }

        let now = Instant::now();
        let timeout = ctx.frame_timeout();
        self.retired
            .retain(|_, retired_at| now.saturating_duration_since(*retired_at) <= timeout);

        let mut forgotten = Vec::new();
        self.dropped.retain(|key, frame| {
            let keep = now.saturating_duration_since(frame.first_arrival) <= timeout;
            if !keep {
                debug!(
                    parent: ctx.span(),
                    frame_number = key,
                    packets_received = frame.progress.count,
                    "Forgetting incomplete dropped frame"
                );
                forgotten.push(*key);
            }
            keep
        });
        for key in forgotten {
            self.retire(key);
        }
    }

    fn status(&self, prefix: &str, status: &mut ParamMessage) {
        status.set_param(&format!("{prefix}packets_received"), self.packets_received);
        status.set_param(&format!("{prefix}packets_duplicate"), self.packets_duplicate);
        status.set_param(&format!("{prefix}packets_late"), self.packets_late);
        status.set_param(&format!("{prefix}packets_lost"), self.packets_lost);
    }

    fn reset(&mut self) {
        self.frames.clear();
        self.dropped.clear();
        self.retired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fr_pool::SharedBufferManager;
    use std::time::Duration;

    const PAYLOAD: usize = 8;
    const PACKETS: u32 = 4;

    fn setup(num_buffers: usize) -> (UdpFrameDecoder, DecoderContext) {
        let mut decoder = UdpFrameDecoder::new();
        let mut msg = ParamMessage::new();
        msg.set_param(CONFIG_UDP_PACKETS_PER_FRAME, PACKETS);
        msg.set_param(CONFIG_UDP_PACKET_PAYLOAD_SIZE, PAYLOAD as u64);
        decoder.configure("", &msg).unwrap();

        let mut ctx = DecoderContext::new();
        let pool = SharedBufferManager::new("udp-test", num_buffers, decoder.frame_buffer_size()).unwrap();
        ctx.set_manager(pool);
        for id in 0..num_buffers {
            ctx.ledger_mut().push_empty(id).unwrap();
        }
        (decoder, ctx)
    }

    fn datagram(frame: u64, packet: u16, fill: u8) -> Vec<u8> {
        let mut bytes = UdpPacketHeader::new(frame, packet, PACKETS).encode().to_vec();
        bytes.extend_from_slice(&[fill; PAYLOAD]);
        bytes
    }

    fn send(decoder: &mut UdpFrameDecoder, ctx: &mut DecoderContext, bytes: &[u8]) -> FrameReceiveState {
        let target = decoder.next_message_buffer(ctx);
        assert!(target.len() >= bytes.len());
        decoder.scratch()[..bytes.len()].copy_from_slice(bytes);
        decoder.process_message(ctx, bytes.len())
    }

    #[test]
    fn test_header_flags() {
        let first = UdpPacketHeader::new(1, 0, 3);
        let last = UdpPacketHeader::new(1, 2, 3);
        assert_eq!(first.flags, UDP_FLAG_START_OF_FRAME);
        assert_eq!(last.flags, UDP_FLAG_END_OF_FRAME);
        assert_eq!(UdpPacketHeader::decode(&last.encode()), Some(last));
    }

    #[test]
    fn test_out_of_order_packets_assemble() {
        let (mut decoder, mut ctx) = setup(2);

        for packet in [2u16, 0, 3] {
            let state = send(&mut decoder, &mut ctx, &datagram(10, packet, packet as u8 + 1));
            assert_eq!(state, FrameReceiveState::Incomplete);
        }
        let state = send(&mut decoder, &mut ctx, &datagram(10, 1, 2));
        assert_eq!(state, FrameReceiveState::Complete);

        let released = ctx.take_released();
        assert_eq!(released.len(), 1);
        let frame = &released[0];
        assert!(frame.metadata.complete);
        assert_eq!(frame.metadata.packets_received, 4);
        assert_eq!(frame.metadata.payload_size, 4 * PAYLOAD);

        let stored = ctx
            .buffer_manager()
            .unwrap()
            .copy_out(frame.buffer_id, FrameHeader::SIZE, 4 * PAYLOAD)
            .unwrap();
        for (packet, chunk) in stored.chunks(PAYLOAD).enumerate() {
            assert!(chunk.iter().all(|b| *b == packet as u8 + 1));
        }
    }

    #[test]
    fn test_interleaved_frames() {
        let (mut decoder, mut ctx) = setup(2);
        for packet in 0..PACKETS as u16 - 1 {
            send(&mut decoder, &mut ctx, &datagram(1, packet, 1));
            send(&mut decoder, &mut ctx, &datagram(2, packet, 2));
        }
        assert_eq!(ctx.ledger().num_mapped(), 2);
        assert_eq!(
            send(&mut decoder, &mut ctx, &datagram(2, 3, 2)),
            FrameReceiveState::Complete
        );
        assert_eq!(ctx.take_released()[0].metadata.frame_number, 2);
        assert_eq!(ctx.ledger().num_mapped(), 1);
    }

    #[test]
    fn test_duplicate_packet_ignored() {
        let (mut decoder, mut ctx) = setup(1);
        send(&mut decoder, &mut ctx, &datagram(1, 0, 1));
        assert_eq!(
            send(&mut decoder, &mut ctx, &datagram(1, 0, 9)),
            FrameReceiveState::Incomplete
        );
        assert_eq!(decoder.packets_duplicate, 1);
        assert_eq!(ctx.frame(1).unwrap().packets_received, 1);
    }

    #[test]
    fn test_bad_packets_are_invalid_and_frame_continues() {
        let (mut decoder, mut ctx) = setup(1);
        send(&mut decoder, &mut ctx, &datagram(1, 0, 1));

        let mut bad_magic = datagram(1, 1, 1);
        bad_magic[0] = 0;
        assert_eq!(send(&mut decoder, &mut ctx, &bad_magic), FrameReceiveState::Invalid);
        assert_eq!(send(&mut decoder, &mut ctx, &[0; 4]), FrameReceiveState::Invalid);
        assert_eq!(
            send(&mut decoder, &mut ctx, &datagram(1, 7, 1)),
            FrameReceiveState::Invalid
        );
        let mut oversize = datagram(1, 1, 1);
        oversize.push(0);
        assert_eq!(send(&mut decoder, &mut ctx, &oversize), FrameReceiveState::Invalid);

        assert_eq!(ctx.counters().invalid_messages, 4);
        assert_eq!(ctx.ledger().num_mapped(), 1);
        for packet in 1..PACKETS as u16 {
            send(&mut decoder, &mut ctx, &datagram(1, packet, 1));
        }
        assert_eq!(ctx.take_released().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_with_missing_data() {
        let (mut decoder, mut ctx) = setup(1);
        send(&mut decoder, &mut ctx, &datagram(4, 0, 1));
        send(&mut decoder, &mut ctx, &datagram(4, 3, 1));

        tokio::time::advance(Duration::from_millis(500)).await;
        decoder.monitor_buffers(&mut ctx);
        assert!(ctx.take_released().is_empty());

        tokio::time::advance(Duration::from_millis(600)).await;
        decoder.monitor_buffers(&mut ctx);
        let released = ctx.take_released();
        assert_eq!(released.len(), 1);
        assert!(!released[0].metadata.complete);
        assert_eq!(released[0].metadata.packets_received, 2);
        assert_eq!(released[0].metadata.packets_expected, PACKETS);
        assert_eq!(ctx.counters().frames_timedout, 1);
        assert_eq!(ctx.counters().frames_missing_data, 1);
        assert_eq!(decoder.packets_lost, 2);

        let header = ctx
            .buffer_manager()
            .unwrap()
            .with_buffer(released[0].buffer_id, FrameHeader::decode)
            .unwrap()
            .unwrap();
        assert!(!header.complete);
    }

    #[test]
    fn test_frame_without_buffer_is_tracked_as_dropped() {
        let (mut decoder, mut ctx) = setup(1);
        send(&mut decoder, &mut ctx, &datagram(1, 0, 1));
        for packet in 0..PACKETS as u16 {
            send(&mut decoder, &mut ctx, &datagram(2, packet, 2));
        }
        // Dropped once, not once per packet
        assert_eq!(ctx.counters().frames_dropped, 1);
        assert!(decoder.dropped.is_empty());
        assert!(ctx.take_released().is_empty());
    }

    #[test]
    fn test_duplicate_after_completion_is_not_remapped() {
        let (mut decoder, mut ctx) = setup(2);
        for packet in 0..PACKETS as u16 {
            send(&mut decoder, &mut ctx, &datagram(7, packet, 7));
        }
        assert_eq!(ctx.take_released().len(), 1);

        assert_eq!(
            send(&mut decoder, &mut ctx, &datagram(7, 1, 7)),
            FrameReceiveState::Incomplete
        );
        assert_eq!(ctx.ledger().num_mapped(), 0);
        assert_eq!(ctx.ledger().num_empty(), 1);
        assert_eq!(decoder.packets_late, 1);
        assert_eq!(decoder.packets_duplicate, 0);

        decoder.monitor_buffers(&mut ctx);
        assert!(ctx.take_released().is_empty());
    }

    #[test]
    fn test_map_failure_counts_dropped_frame() {
        let (mut decoder, mut ctx) = setup(2);
        ctx.ledger_mut().map_frame(3).unwrap();

        assert_eq!(
            send(&mut decoder, &mut ctx, &datagram(3, 0, 1)),
            FrameReceiveState::Invalid
        );
        assert_eq!(ctx.counters().frames_dropped, 1);
        assert_eq!(ctx.ledger().num_empty(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_after_timeout_is_not_remapped() {
        let (mut decoder, mut ctx) = setup(2);
        send(&mut decoder, &mut ctx, &datagram(4, 0, 1));

        tokio::time::advance(Duration::from_millis(1100)).await;
        decoder.monitor_buffers(&mut ctx);
        assert_eq!(ctx.take_released().len(), 1);

        send(&mut decoder, &mut ctx, &datagram(4, 1, 1));
        assert_eq!(ctx.ledger().num_mapped(), 0);
        assert_eq!(ctx.ledger().num_empty(), 1);
        assert_eq!(decoder.packets_late, 1);

        // Released exactly once, and forgotten after another timeout
        tokio::time::advance(Duration::from_millis(1100)).await;
        decoder.monitor_buffers(&mut ctx);
        assert!(ctx.take_released().is_empty());
        assert_eq!(ctx.counters().frames_released, 1);
        assert!(decoder.retired.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_does_not_count_packet() {
        let (mut decoder, _) = setup(1);
        let mut ctx = DecoderContext::new();
        // Room for the frame header and two packets only
        ctx.set_manager(SharedBufferManager::new("udp-small", 1, FrameHeader::SIZE + 2 * PAYLOAD).unwrap());
        ctx.ledger_mut().push_empty(0).unwrap();

        let states: Vec<_> = (0..PACKETS as u16)
            .map(|packet| send(&mut decoder, &mut ctx, &datagram(3, packet, 3)))
            .collect();
        assert_eq!(
            states,
            [
                FrameReceiveState::Incomplete,
                FrameReceiveState::Incomplete,
                FrameReceiveState::Invalid,
                FrameReceiveState::Invalid,
            ]
        );

        // A retry of a packet that was never stored is not a duplicate
        assert_eq!(
            send(&mut decoder, &mut ctx, &datagram(3, 3, 3)),
            FrameReceiveState::Invalid
        );
        assert_eq!(decoder.packets_duplicate, 0);
        assert_eq!(ctx.frame(3).unwrap().packets_received, 2);

        tokio::time::advance(Duration::from_millis(1100)).await;
        decoder.monitor_buffers(&mut ctx);
        let released = ctx.take_released();
        assert_eq!(released.len(), 1);
        assert!(!released[0].metadata.complete);
        assert_eq!(released[0].metadata.packets_received, 2);
        assert_eq!(decoder.packets_lost, 2);
    }

    #[test]
    fn test_configure_rejects_zero_packets() {
        let mut decoder = UdpFrameDecoder::new();
        let mut msg = ParamMessage::new();
        msg.set_param(CONFIG_UDP_PACKETS_PER_FRAME, 0);
        msg.set_param(CONFIG_UDP_PACKET_PAYLOAD_SIZE, 100);
        assert!(decoder.configure("", &msg).is_err());
        // Nothing applied
        assert_eq!(decoder.packet_payload_size, DEFAULT_PACKET_PAYLOAD_SIZE);
    }
}
