//! Buffer lifecycle through the public decoder API.

use fr_decoder::decoders::{create_decoder, DecoderKind, TcpFrameHeader};
use fr_decoder::definitions::PixelType;
use fr_decoder::{
    FrameDecoder, FrameMetadata, FrameReceiveState, MessageTarget, ParamMessage, ReceiveOutcome,
};
use fr_pool::{BufferId, SharedBufferManager};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

type Delivered = Arc<Mutex<Vec<(BufferId, FrameMetadata)>>>;

fn decoder(kind: DecoderKind, num_buffers: usize, buffer_size: usize) -> (Arc<FrameDecoder>, Delivered) {
    let decoder = Arc::new(FrameDecoder::new(create_decoder(kind)));
    decoder.init(Span::none(), &ParamMessage::new()).unwrap();
    decoder.register_buffer_manager(SharedBufferManager::new("lifecycle", num_buffers, buffer_size).unwrap());

    let delivered: Delivered = Arc::default();
    let sink = Arc::clone(&delivered);
    decoder.register_frame_ready_callback(move |buffer_id, metadata| {
        sink.lock().push((buffer_id, metadata));
    });
    (decoder, delivered)
}

/// Drive `data` through `receive` as a stream, one target at a time.
fn stream(decoder: &FrameDecoder, data: &[u8]) -> Vec<FrameReceiveState> {
    let mut states = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let outcome = decoder
            .receive(|buf| {
                let n = buf.len().min(rest.len());
                buf[..n].copy_from_slice(&rest[..n]);
                rest = &rest[n..];
                Ok(n)
            })
            .unwrap();
        match outcome {
            ReceiveOutcome::Processed(state) => states.push(state),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    states
}

#[test]
fn completed_frame_leaves_both_collections() {
    let (decoder, delivered) = decoder(DecoderKind::DummyTcp, 4, 64);
    for id in [1, 2, 3] {
        decoder.push_empty_buffer(id).unwrap();
    }
    assert_eq!(decoder.num_empty_buffers(), 3);

    let target = decoder.next_message_buffer();
    let MessageTarget::Buffer { buffer_id, .. } = target else {
        panic!("expected a pool buffer, got {target:?}");
    };
    assert_eq!(buffer_id, 1);
    assert_eq!(decoder.num_mapped_buffers(), 1);

    decoder.fill_message_buffer(target, |buf| buf[..4].copy_from_slice(b"abcd")).unwrap();
    assert_eq!(decoder.process_message(4), FrameReceiveState::Complete);

    let delivered = delivered.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, 1);
    assert_eq!(delivered[0].1.payload_size, 4);
    assert_eq!(decoder.num_empty_buffers(), 2);
    assert_eq!(decoder.num_mapped_buffers(), 0);

    // The released buffer is outstanding, so it can be pushed back exactly once
    decoder.push_empty_buffer(1).unwrap();
    assert!(decoder.push_empty_buffer(1).is_err());
}

#[test]
fn held_buffers_never_exceed_pool() {
    let (decoder, delivered) = decoder(DecoderKind::DummyTcp, 3, 64);
    decoder.push_all_buffers().unwrap();
    let returner = decoder.buffer_returner();

    for round in 0..20 {
        decoder.receive(|buf| Ok(buf.len())).unwrap();
        assert!(decoder.num_empty_buffers() + decoder.num_mapped_buffers() <= 3);

        // Hand back every other frame, keep the rest outstanding for a while
        if round % 2 == 0 {
            for (buffer_id, metadata) in delivered.lock().drain(..) {
                returner.return_frame(buffer_id, &metadata);
            }
        }
    }
    assert!(decoder.counters().frames_released > 0);
}

#[test]
fn configuration_round_trip() {
    let (decoder, _) = decoder(DecoderKind::Udp, 2, 1024);
    let config = ParamMessage::from_value(json!({
        "decoder_config": {
            "enable_packet_logging": true,
            "frame_timeout_ms": 250,
            "packets_per_frame": 2,
            "packet_payload_size": 64,
        }
    }))
    .unwrap();
    decoder.configure("decoder_config/", &config).unwrap();

    let mut first = ParamMessage::new();
    decoder.request_configuration("decoder_config/", &mut first);
    let mut second = ParamMessage::new();
    decoder.request_configuration("decoder_config/", &mut second);

    assert_eq!(first, second);
    assert_eq!(first, config);
    assert_eq!(decoder.frame_timeout_ms(), 250);
}

#[test]
fn zero_timeout_rejected_without_change() {
    let (decoder, _) = decoder(DecoderKind::DummyTcp, 1, 64);
    let config = ParamMessage::from_value(json!({
        "enable_packet_logging": true,
        "frame_timeout_ms": 0,
    }))
    .unwrap();
    assert!(decoder.configure("", &config).is_err());

    let mut reply = ParamMessage::new();
    decoder.request_configuration("", &mut reply);
    assert_eq!(reply.get_param::<bool>("enable_packet_logging").unwrap(), Some(false));
    assert_eq!(decoder.frame_timeout_ms(), 1000);
}

#[tokio::test(start_paused = true)]
async fn stalled_frame_times_out() {
    let (decoder, delivered) = decoder(DecoderKind::Tcp, 2, 4096);
    let config = ParamMessage::from_value(json!({ "frame_timeout_ms": 100 })).unwrap();
    decoder.configure("", &config).unwrap();
    decoder.push_all_buffers().unwrap();

    let mut partial = TcpFrameHeader::image(1, 16, 16, PixelType::Raw8).encode().to_vec();
    partial.extend_from_slice(&[0x55; 64]);
    stream(&decoder, &partial);
    assert_eq!(decoder.num_mapped_buffers(), 1);

    tokio::time::advance(Duration::from_millis(50)).await;
    decoder.monitor_buffers();
    assert_eq!(decoder.num_frames_timedout(), 0);
    assert_eq!(decoder.num_mapped_buffers(), 1);

    tokio::time::advance(Duration::from_millis(100)).await;
    decoder.monitor_buffers();
    assert_eq!(decoder.num_frames_timedout(), 1);
    assert_eq!(decoder.num_mapped_buffers(), 0);
    assert_eq!(decoder.num_empty_buffers(), 2);
    assert!(delivered.lock().is_empty());
}

#[test]
fn tcp_size_mismatch_is_invalid() {
    let (decoder, delivered) = decoder(DecoderKind::Tcp, 2, 4096);
    decoder.push_all_buffers().unwrap();

    let header = TcpFrameHeader {
        payload_size: 100,
        ..TcpFrameHeader::image(1, 16, 16, PixelType::Raw8)
    };
    assert_eq!(stream(&decoder, &header.encode()), vec![FrameReceiveState::Invalid]);
    assert!(delivered.lock().is_empty());
    assert_eq!(decoder.num_mapped_buffers(), 0);
    assert_eq!(decoder.counters().invalid_messages, 1);
}

#[test]
fn tcp_frames_back_to_back() {
    let (decoder, delivered) = decoder(DecoderKind::Tcp, 4, 4096);
    decoder.push_all_buffers().unwrap();

    let mut wire = Vec::new();
    for frame in 0..3u64 {
        wire.extend_from_slice(&TcpFrameHeader::image(frame, 8, 4, PixelType::Raw16).encode());
        wire.extend_from_slice(&[frame as u8; 64]);
    }
    let states = stream(&decoder, &wire);
    assert_eq!(
        states.iter().filter(|s| **s == FrameReceiveState::Complete).count(),
        3
    );

    let delivered = delivered.lock();
    let numbers: Vec<u64> = delivered.iter().map(|(_, m)| m.frame_number).collect();
    assert_eq!(numbers, vec![0, 1, 2]);
    let geometry = delivered[0].1.geometry.unwrap();
    assert_eq!((geometry.width, geometry.height), (8, 4));
    assert_eq!(geometry.pixel_type, PixelType::Raw16);
}

#[test]
fn drop_all_then_reuse_pool() {
    let (decoder, delivered) = decoder(DecoderKind::DummyTcp, 3, 64);
    decoder.push_all_buffers().unwrap();
    decoder.next_message_buffer();

    decoder.drop_all_buffers();
    assert_eq!(decoder.num_empty_buffers(), 0);
    assert_eq!(decoder.num_mapped_buffers(), 0);

    decoder.register_buffer_manager(SharedBufferManager::new("replacement", 2, 64).unwrap());
    assert_eq!(decoder.push_all_buffers().unwrap(), 2);
    stream(&decoder, b"after");
    assert_eq!(delivered.lock().len(), 1);
    assert_eq!(delivered.lock()[0].1.generation, 1);
}

#[test]
fn status_reports_counters() {
    let (decoder, _) = decoder(DecoderKind::Udp, 2, 1024);
    let mut status = ParamMessage::new();
    decoder.status("decoder/", &mut status);

    for key in [
        "name",
        "empty_buffers",
        "mapped_buffers",
        "frames_timedout",
        "frames_released",
        "frames_dropped",
        "invalid_messages",
        "packets_received",
    ] {
        assert!(status.has_param(&format!("decoder/{key}")), "missing {key}");
    }
}
