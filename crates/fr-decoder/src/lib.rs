//! Frame decoder engine for detector data streams.
//!
//! A frame receiver reads raw network data and reconstructs complete frames
//! into buffers of a [`SharedBufferManager`](fr_pool::SharedBufferManager).
//! This crate is the part that decides which buffer each byte lands in and
//! when a frame is done with:
//!
//! - an empty buffer queue of buffer IDs ready for new frames
//! - a frame buffer map of in-progress frames and their buffers
//! - a timeout that gives up on frames that stop arriving
//! - a callback that hands completed frames downstream
//!
//! The wire format is pluggable. [`FrameDecoder`] is the engine; each
//! protocol implements [`DecoderVariant`] and is built from a
//! [`DecoderKind`](decoders::DecoderKind) by [`decoders::create_decoder`].
//!
//! # Buffer lifecycle
//!
//! ```text
//!   push_empty_buffer ──> empty queue ──(first data)──> frame map
//!          ^                   ^                           │
//!          │                   └────── timeout (discard) ──┤
//!          │                                               │ release
//!          └──── consumer returns buffer <── callback <────┘
//! ```
//!
//! Every buffer ID is in at most one of the queue or the map, and released
//! buffers are in neither until they are pushed back.
//!
//! # Example
//!
//! ```
//! use fr_decoder::decoders::{create_decoder, DecoderKind};
//! use fr_decoder::{FrameDecoder, ParamMessage};
//! use fr_pool::SharedBufferManager;
//!
//! let decoder = FrameDecoder::new(create_decoder(DecoderKind::DummyTcp));
//! decoder.init(tracing::Span::none(), &ParamMessage::new()).unwrap();
//! decoder.register_buffer_manager(SharedBufferManager::new("doc", 3, 64).unwrap());
//! decoder.push_all_buffers().unwrap();
//!
//! let returner = decoder.buffer_returner();
//! decoder.register_frame_ready_callback(move |buffer_id, metadata| {
//!     // Downstream processing would happen here
//!     returner.return_frame(buffer_id, &metadata);
//! });
//!
//! decoder.receive(|buf| {
//!     buf[..5].copy_from_slice(b"hello");
//!     Ok(5)
//! }).unwrap();
//! assert_eq!(decoder.counters().frames_released, 1);
//! ```

pub mod callback;
pub mod config;
pub mod context;
pub mod decoders;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod frame_header;
pub mod ledger;
pub mod limits;
pub mod params;
pub mod variant;
pub mod version;

pub use callback::{channel_callback, BufferReturner, FrameMetadata, FrameReadyCallback, ReadyFrame};
pub use config::{
    DecoderConfig, CONFIG_DECODER_ENABLE_PACKET_LOGGING, CONFIG_DECODER_FRAME_TIMEOUT_MS,
    DEFAULT_ENABLE_PACKET_LOGGING, DEFAULT_FRAME_TIMEOUT_MS,
};
pub use context::{DecoderContext, DecoderCounters, FrameRelease, PACKET_LOG_TARGET};
pub use engine::{FrameDecoder, ReceiveOutcome};
pub use error::{DecoderError, DecoderResult};
pub use frame_header::FrameHeader;
pub use ledger::{BufferLedger, FrameKey, SlotState};
pub use params::ParamMessage;
pub use variant::{DecoderVariant, FrameReceiveState, MessageTarget};
pub use version::VersionInfo;
