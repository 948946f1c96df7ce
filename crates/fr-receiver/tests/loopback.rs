//! End-to-end receive over loopback sockets.

use fr_decoder::decoders::{TcpFrameHeader, UdpPacketHeader};
use fr_decoder::definitions::PixelType;
use fr_decoder::{FrameHeader, ReadyFrame};
use fr_receiver::{FrameReceiverService, ReceiverConfig};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

async fn next_frame(frames: &mut mpsc::Receiver<ReadyFrame>) -> ReadyFrame {
    tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("frame channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_frames_arrive_in_order() {
    let config = ReceiverConfig::from_toml_str(
        r#"
        [receiver]
        bind_address = "127.0.0.1:0"
        decoder_type = "tcp"

        [buffers]
        num_buffers = 8
        buffer_size = 4096
        "#,
    )
    .unwrap();
    let mut handle = FrameReceiverService::start(config).await.unwrap();
    let mut frames = handle.take_frames().unwrap();
    let returner = handle.buffer_returner();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    for frame in 0..6u64 {
        client
            .write_all(&TcpFrameHeader::image(frame, 16, 8, PixelType::Raw8).encode())
            .await
            .unwrap();
        client.write_all(&[frame as u8; 128]).await.unwrap();
    }
    client.flush().await.unwrap();

    for expected in 0..6u64 {
        let frame = next_frame(&mut frames).await;
        assert_eq!(frame.metadata.frame_number, expected);
        assert_eq!(frame.metadata.payload_size, 128);

        let manager = handle.buffer_manager();
        let payload = manager
            .copy_out(frame.buffer_id, FrameHeader::SIZE, 128)
            .unwrap();
        assert!(payload.iter().all(|b| *b == expected as u8));
        let header = manager
            .with_buffer(frame.buffer_id, FrameHeader::decode)
            .unwrap()
            .unwrap();
        assert_eq!(header.frame_number, expected);

        returner.return_frame(frame.buffer_id, &frame.metadata);
    }

    let status = handle.status();
    assert_eq!(status.get_param::<u64>("decoder/frames_released").unwrap(), Some(6));
    assert_eq!(status.get_param::<String>("receiver/transport").unwrap().as_deref(), Some("tcp"));

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_reconnect_after_close() {
    let config = ReceiverConfig::from_toml_str(
        r#"
        [receiver]
        bind_address = "127.0.0.1:0"
        decoder_type = "dummy_tcp"

        [buffers]
        num_buffers = 2
        buffer_size = 64
        "#,
    )
    .unwrap();
    let mut handle = FrameReceiverService::start(config).await.unwrap();
    let mut frames = handle.take_frames().unwrap();
    let returner = handle.buffer_returner();

    for _ in 0..2 {
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let frame = next_frame(&mut frames).await;
        returner.return_frame(frame.buffer_id, &frame.metadata);
        drop(client);
    }

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_frame_with_lost_packet_is_released_on_timeout() {
    let config = ReceiverConfig::from_toml_str(
        r#"
        monitor_interval_ms = 10

        [receiver]
        bind_address = "127.0.0.1:0"
        decoder_type = "udp"

        [buffers]
        num_buffers = 4
        buffer_size = 1024

        [decoder]
        frame_timeout_ms = 100

        [decoder.params]
        packets_per_frame = 3
        packet_payload_size = 64
        "#,
    )
    .unwrap();
    let mut handle = FrameReceiverService::start(config).await.unwrap();
    let mut frames = handle.take_frames().unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let send = |frame: u64, packet: u16| {
        let mut datagram = UdpPacketHeader::new(frame, packet, 3).encode().to_vec();
        datagram.extend_from_slice(&[packet as u8 + 1; 64]);
        datagram
    };

    // Frame 1 complete, out of order; frame 2 loses its middle packet
    for (frame, packet) in [(1, 2), (1, 0), (2, 0), (1, 1), (2, 2)] {
        sender
            .send_to(&send(frame, packet), handle.local_addr())
            .await
            .unwrap();
    }

    let first = next_frame(&mut frames).await;
    assert_eq!(first.metadata.frame_number, 1);
    assert!(first.metadata.complete);
    assert_eq!(first.metadata.packets_received, 3);

    let second = next_frame(&mut frames).await;
    assert_eq!(second.metadata.frame_number, 2);
    assert!(!second.metadata.complete);
    assert_eq!(second.metadata.packets_received, 2);
    assert_eq!(handle.decoder().num_frames_timedout(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_config_does_not_start() {
    let mut config = ReceiverConfig::default();
    config.buffers.num_buffers = 0;
    assert!(FrameReceiverService::start(config).await.is_err());
}
