//! Receiver process configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables prefixed with `FR_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! FR_RECEIVER__BIND_ADDRESS=0.0.0.0:6000
//! FR_BUFFERS__NUM_BUFFERS=128
//! FR_DECODER__FRAME_TIMEOUT_MS=500
//! ```
//!
//! # Example
//!
//! ```toml
//! monitor_interval_ms = 100
//!
//! [receiver]
//! name = "detector-a"
//! bind_address = "0.0.0.0:5000"
//! decoder_type = "udp"
//!
//! [buffers]
//! shared_memory_path = "/dev/shm/detector-a"
//! num_buffers = 256
//! buffer_size = 65576
//!
//! [decoder]
//! frame_timeout_ms = 1000
//!
//! [decoder.params]
//! packets_per_frame = 8
//! packet_payload_size = 8192
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use fr_decoder::decoders::DecoderKind;
use fr_decoder::{
    ParamMessage, CONFIG_DECODER_ENABLE_PACKET_LOGGING, CONFIG_DECODER_FRAME_TIMEOUT_MS,
    DEFAULT_ENABLE_PACKET_LOGGING, DEFAULT_FRAME_TIMEOUT_MS,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "FR_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or did not deserialize.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values loaded but are unusable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Socket type the receiver listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// One TCP connection at a time.
    Tcp,
    /// Datagrams on a bound UDP socket.
    Udp,
}

/// Top-level receiver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Listener settings
    #[serde(default)]
    pub receiver: ListenerConfig,
    /// Shared buffer pool settings
    #[serde(default)]
    pub buffers: BufferPoolConfig,
    /// Decoder parameters
    #[serde(default)]
    pub decoder: DecoderSection,
    /// Runtime behaviour of the receive and monitor tasks
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Receiver name, used as the logging span and pool name
    #[serde(default = "default_name")]
    pub name: String,
    /// Address to bind (`host:port`)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Socket type; derived from the decoder type when absent
    #[serde(default)]
    pub transport: Option<Transport>,
    /// Decoder variant
    #[serde(default = "default_decoder_type")]
    pub decoder_type: DecoderKind,
}

/// Buffer pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Backing file for a shared pool; anonymous memory when absent
    #[serde(default)]
    pub shared_memory_path: Option<PathBuf>,
    /// Number of buffers in the pool
    #[serde(default = "default_num_buffers")]
    pub num_buffers: usize,
    /// Size of each buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Decoder parameters applied through `FrameDecoder::init`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderSection {
    /// Log every processed message on the packet logging target
    #[serde(default = "default_packet_logging")]
    pub enable_packet_logging: bool,
    /// Stalled frame timeout in milliseconds
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_ms: u32,
    /// Variant-specific parameters, passed through unchanged
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Receive and monitor task configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Period of the buffer monitor in milliseconds
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    /// Capacity of the frame ready channel
    #[serde(default = "default_frame_queue_depth")]
    pub frame_queue_depth: usize,
    /// Longest pause of the receive loop waiting for a returned buffer (0 = never pause)
    #[serde(default = "default_backpressure_wait")]
    pub backpressure_wait_ms: u64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "frame-receiver".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_decoder_type() -> DecoderKind {
    DecoderKind::DummyTcp
}

fn default_num_buffers() -> usize {
    64
}

fn default_buffer_size() -> usize {
    1024 * 1024
}

fn default_packet_logging() -> bool {
    DEFAULT_ENABLE_PACKET_LOGGING
}

fn default_frame_timeout() -> u32 {
    DEFAULT_FRAME_TIMEOUT_MS
}

fn default_monitor_interval() -> u64 {
    100
}

fn default_frame_queue_depth() -> usize {
    64
}

fn default_backpressure_wait() -> u64 {
    50
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            bind_address: default_bind_address(),
            transport: None,
            decoder_type: default_decoder_type(),
        }
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            shared_memory_path: None,
            num_buffers: default_num_buffers(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for DecoderSection {
    fn default() -> Self {
        Self {
            enable_packet_logging: default_packet_logging(),
            frame_timeout_ms: default_frame_timeout(),
            params: Map::new(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval(),
            frame_queue_depth: default_frame_queue_depth(),
            backpressure_wait_ms: default_backpressure_wait(),
        }
    }
}

impl ListenerConfig {
    /// Transport in effect, explicit or derived from the decoder type.
    #[must_use]
    pub fn transport(&self) -> Transport {
        self.transport.unwrap_or(if self.decoder_type.is_stream() {
            Transport::Tcp
        } else {
            Transport::Udp
        })
    }

    /// Parsed bind address.
    ///
    /// # Errors
    /// Returns a validation error if the address does not parse.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_address.parse().map_err(|e| {
            ConfigError::ValidationError(format!(
                "Invalid bind_address '{}': {e}",
                self.bind_address
            ))
        })
    }
}

impl DecoderSection {
    /// Decoder parameters as a message for `FrameDecoder::init`.
    #[must_use]
    pub fn to_param_message(&self) -> ParamMessage {
        let mut msg = ParamMessage::new();
        for (key, value) in &self.params {
            msg.set_param(key, value.clone());
        }
        msg.set_param(CONFIG_DECODER_ENABLE_PACKET_LOGGING, self.enable_packet_logging);
        msg.set_param(CONFIG_DECODER_FRAME_TIMEOUT_MS, self.frame_timeout_ms);
        msg
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ReceiverConfig {
    /// Load configuration from a TOML file and `FR_` environment variables
    ///
    /// Environment variables take precedence over the file. A missing file
    /// leaves every value at its default.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the sources cannot be parsed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Load configuration from a TOML string, without environment overrides
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the string cannot be parsed or validation fails.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receiver.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "receiver.name cannot be empty".to_string(),
            ));
        }
        self.receiver.socket_addr()?;

        let transport = self.receiver.transport();
        let expected = if self.receiver.decoder_type.is_stream() {
            Transport::Tcp
        } else {
            Transport::Udp
        };
        if transport != expected {
            return Err(ConfigError::ValidationError(format!(
                "Decoder '{}' cannot be used with transport {:?}",
                self.receiver.decoder_type, transport
            )));
        }

        if self.buffers.num_buffers == 0 {
            return Err(ConfigError::ValidationError(
                "buffers.num_buffers must be greater than 0".to_string(),
            ));
        }
        if self.buffers.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "buffers.buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.decoder.frame_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "decoder.frame_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.runtime.monitor_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.runtime.frame_queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "frame_queue_depth must be greater than 0".to_string(),
            ));
        }
        if self.runtime.backpressure_wait_ms > 0
            && self.runtime.backpressure_wait_ms >= u64::from(self.decoder.frame_timeout_ms)
        {
            return Err(ConfigError::ValidationError(format!(
                "backpressure_wait_ms ({}) must be less than decoder.frame_timeout_ms ({})",
                self.runtime.backpressure_wait_ms, self.decoder.frame_timeout_ms
            )));
        }

        Ok(())
    }
}
