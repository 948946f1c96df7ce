//! Socket receive loops feeding a [`FrameDecoder`].
//!
//! Both loops wait for readiness without holding the decoder lock, then read
//! with a non-blocking `try_read`/`try_recv` inside
//! [`FrameDecoder::receive`], so a read and its bookkeeping are atomic with
//! respect to the monitor task.

use fr_decoder::{FrameDecoder, ReceiveOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pauses reads while the decoder has nowhere to put a new frame.
///
/// The pause lasts at most `wait` per exhaustion episode. Once it expires the
/// loop keeps reading (frames are dropped and counted) until a buffer comes
/// back, after which the next exhaustion may pause again. Reads that continue
/// a frame already owning its buffer are never paused.
#[derive(Debug)]
pub(crate) struct Backpressure {
    wait: Duration,
    gave_up: bool,
}

impl Backpressure {
    pub(crate) fn new(wait: Duration) -> Self {
        Self {
            wait,
            gave_up: false,
        }
    }

    fn has_buffer(decoder: &FrameDecoder) -> bool {
        decoder.num_empty_buffers() > 0 || decoder.buffer_returner().pending() > 0
    }

    pub(crate) async fn wait_for_buffer(&mut self, decoder: &FrameDecoder) {
        if self.wait.is_zero() || !decoder.needs_new_buffer() {
            return;
        }
        if Self::has_buffer(decoder) {
            self.gave_up = false;
            return;
        }
        if self.gave_up {
            return;
        }

        debug!("No empty buffers, pausing reads");
        let returner = decoder.buffer_returner();
        let deadline = Instant::now() + self.wait;
        loop {
            let available = returner.buffer_available();
            if Self::has_buffer(decoder) {
                debug!("Buffer returned, resuming reads");
                return;
            }
            tokio::select! {
                _ = available => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        self.gave_up = true;
        warn!(
            wait_ms = self.wait.as_millis() as u64,
            "No buffer returned in time, frames will be dropped until one is"
        );
    }
}

enum StreamEnd {
    Closed,
    Shutdown,
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Accept connections one at a time and decode each stream until it closes.
pub(crate) async fn run_tcp(
    listener: TcpListener,
    decoder: Arc<FrameDecoder>,
    mut backpressure: Backpressure,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(address = ?listener.local_addr().ok(), "TCP receive loop started");

    while !shutdown_requested(&shutdown) {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "Failed to accept connection");
                continue;
            }
        };

        info!(%peer, "Connection accepted");
        match read_stream(&stream, &decoder, &mut backpressure, &mut shutdown).await {
            StreamEnd::Closed => info!(%peer, "Connection closed"),
            StreamEnd::Shutdown => break,
        }
    }

    info!("TCP receive loop stopped");
}

async fn read_stream(
    stream: &TcpStream,
    decoder: &FrameDecoder,
    backpressure: &mut Backpressure,
    shutdown: &mut watch::Receiver<bool>,
) -> StreamEnd {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return StreamEnd::Shutdown,
            _ = backpressure.wait_for_buffer(decoder) => {}
        }
        tokio::select! {
            _ = shutdown.changed() => return StreamEnd::Shutdown,
            ready = stream.readable() => {
                if let Err(err) = ready {
                    warn!(error = %err, "Stream failed");
                    decoder.end_of_stream();
                    return StreamEnd::Closed;
                }
            }
        }

        match decoder.receive(|buf| stream.try_read(buf)) {
            Ok(ReceiveOutcome::Processed(_) | ReceiveOutcome::WouldBlock) => {}
            Ok(ReceiveOutcome::Closed) => {
                if let Some(state) = decoder.end_of_stream() {
                    debug!(?state, "Stream ended inside a frame");
                }
                return StreamEnd::Closed;
            }
            Err(err) => {
                warn!(error = %err, "Read failed, closing connection");
                decoder.end_of_stream();
                return StreamEnd::Closed;
            }
        }
    }
}

/// Decode datagrams from a bound UDP socket.
pub(crate) async fn run_udp(
    socket: UdpSocket,
    decoder: Arc<FrameDecoder>,
    mut backpressure: Backpressure,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(address = ?socket.local_addr().ok(), "UDP receive loop started");

    while !shutdown_requested(&shutdown) {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = backpressure.wait_for_buffer(&decoder) => {}
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            ready = socket.readable() => {
                if let Err(err) = ready {
                    warn!(error = %err, "Socket failed");
                    continue;
                }
            }
        }

        match decoder.receive(|buf| socket.try_recv(buf)) {
            Ok(ReceiveOutcome::Processed(_) | ReceiveOutcome::WouldBlock) => {}
            Ok(ReceiveOutcome::Closed) => debug!("Ignoring empty datagram"),
            Err(err) => warn!(error = %err, "Receive failed"),
        }
    }

    info!("UDP receive loop stopped");
}
