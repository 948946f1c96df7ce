//! Frame receiver service.
//!
//! Wires a [`FrameDecoder`] to a socket and a buffer pool:
//!
//! - builds the [`SharedBufferManager`] from configuration
//! - registers a channel-backed frame ready callback and hands every buffer
//!   to the decoder
//! - spawns the receive loop (TCP or UDP) and the buffer monitor
//!
//! Consumers take released frames from [`ReceiverHandle::take_frames`] and
//! give buffers back through [`ReceiverHandle::buffer_returner`].

pub mod config;
mod monitor;
mod receive;

pub use config::{ConfigError, ReceiverConfig, Transport};

use fr_decoder::decoders::create_decoder;
use fr_decoder::{
    channel_callback, BufferReturner, DecoderError, FrameDecoder, ParamMessage, ReadyFrame,
};
use fr_pool::{PoolError, SharedBufferManager};
use receive::Backpressure;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, info_span};

/// Prefix of decoder parameters in configuration and status messages.
pub const DECODER_PREFIX: &str = "decoder/";

/// Errors starting or stopping the receiver.
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// Configuration was unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The buffer pool could not be created.
    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),
    /// The decoder rejected its configuration or buffers.
    #[error("Decoder error: {0}")]
    Decoder(#[from] DecoderError),
    /// Binding the socket failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A receiver task panicked.
    #[error("Receiver task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Starts frame receivers.
#[derive(Debug)]
pub struct FrameReceiverService;

impl FrameReceiverService {
    /// Build the pool and decoder, bind the socket and spawn the tasks.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// Fails if the configuration is invalid, the pool cannot be created, the
    /// decoder rejects its parameters or the socket cannot be bound.
    pub async fn start(config: ReceiverConfig) -> Result<ReceiverHandle, ReceiverError> {
        config.validate()?;
        let bind_address = config.receiver.socket_addr()?;

        let manager = match &config.buffers.shared_memory_path {
            Some(path) => SharedBufferManager::create(path, config.buffers.num_buffers, config.buffers.buffer_size)?,
            None => SharedBufferManager::new(
                &config.receiver.name,
                config.buffers.num_buffers,
                config.buffers.buffer_size,
            )?,
        };

        let decoder = Arc::new(FrameDecoder::new(create_decoder(config.receiver.decoder_type)));
        let span = info_span!("frame_receiver", name = %config.receiver.name);
        decoder.init(span, &config.decoder.to_param_message())?;
        decoder.register_buffer_manager(Arc::clone(&manager));

        let (frame_tx, frame_rx) = mpsc::channel(config.runtime.frame_queue_depth);
        decoder.register_boxed_callback(channel_callback(frame_tx, decoder.buffer_returner()));
        let pushed = decoder.push_all_buffers()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Backpressure::new(Duration::from_millis(config.runtime.backpressure_wait_ms));

        let transport = config.receiver.transport();
        let (local_addr, receive_task) = match transport {
            Transport::Tcp => {
                let listener = TcpListener::bind(bind_address).await?;
                let local_addr = listener.local_addr()?;
                let task = tokio::spawn(receive::run_tcp(
                    listener,
                    Arc::clone(&decoder),
                    backpressure,
                    shutdown_rx.clone(),
                ));
                (local_addr, task)
            }
            Transport::Udp => {
                let socket = UdpSocket::bind(bind_address).await?;
                let local_addr = socket.local_addr()?;
                let task = tokio::spawn(receive::run_udp(
                    socket,
                    Arc::clone(&decoder),
                    backpressure,
                    shutdown_rx.clone(),
                ));
                (local_addr, task)
            }
        };
        let monitor_task = tokio::spawn(monitor::run_monitor(
            Arc::clone(&decoder),
            Duration::from_millis(config.runtime.monitor_interval_ms),
            shutdown_rx,
        ));

        info!(
            name = %config.receiver.name,
            decoder = decoder.name(),
            ?transport,
            %local_addr,
            buffers = pushed,
            buffer_size = manager.buffer_size(),
            "Frame receiver started"
        );

        Ok(ReceiverHandle {
            name: config.receiver.name,
            transport,
            local_addr,
            decoder,
            manager,
            frames: Some(frame_rx),
            shutdown: shutdown_tx,
            tasks: vec![receive_task, monitor_task],
        })
    }
}

/// Running receiver.
#[derive(Debug)]
pub struct ReceiverHandle {
    name: String,
    transport: Transport,
    local_addr: SocketAddr,
    decoder: Arc<FrameDecoder>,
    manager: Arc<SharedBufferManager>,
    frames: Option<mpsc::Receiver<ReadyFrame>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ReceiverHandle {
    /// Address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The decoder driven by this receiver.
    #[must_use]
    pub fn decoder(&self) -> &Arc<FrameDecoder> {
        &self.decoder
    }

    /// The buffer pool frames are written into.
    #[must_use]
    pub fn buffer_manager(&self) -> &Arc<SharedBufferManager> {
        &self.manager
    }

    /// Take the channel of released frames. Returns `None` after the first call.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<ReadyFrame>> {
        self.frames.take()
    }

    /// Handle for giving consumed buffers back to the decoder.
    #[must_use]
    pub fn buffer_returner(&self) -> BufferReturner {
        self.decoder.buffer_returner()
    }

    /// Apply decoder parameters found under [`DECODER_PREFIX`].
    ///
    /// # Errors
    /// Returns the decoder's error for unusable values.
    pub fn configure(&self, msg: &ParamMessage) -> Result<(), ReceiverError> {
        Ok(self.decoder.configure(DECODER_PREFIX, msg)?)
    }

    /// Current configuration of the decoder, under [`DECODER_PREFIX`].
    #[must_use]
    pub fn request_configuration(&self) -> ParamMessage {
        let mut reply = ParamMessage::new();
        self.decoder.request_configuration(DECODER_PREFIX, &mut reply);
        reply
    }

    /// Receiver and decoder status.
    #[must_use]
    pub fn status(&self) -> ParamMessage {
        let mut status = ParamMessage::new();
        status.set_param("receiver/name", self.name.as_str());
        status.set_param("receiver/transport", format!("{:?}", self.transport).to_lowercase());
        status.set_param("receiver/local_address", self.local_addr.to_string());
        status.set_param("buffers/total", self.manager.num_buffers() as u64);
        status.set_param("buffers/size", self.manager.buffer_size() as u64);
        self.decoder.status(DECODER_PREFIX, &mut status);
        status
    }

    /// Stop the receive and monitor tasks and wait for them to finish.
    ///
    /// Buffers still held by the decoder are dropped.
    ///
    /// # Errors
    /// Returns [`ReceiverError::Task`] if a task panicked.
    pub async fn shutdown(self) -> Result<(), ReceiverError> {
        info!(name = %self.name, "Stopping frame receiver");
        // Receivers may already be gone if a task exited early
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await?;
        }
        self.decoder.drop_all_buffers();
        Ok(())
    }
}
