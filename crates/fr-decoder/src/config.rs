//! Base decoder configuration shared by every decoder variant.

use crate::error::{DecoderError, DecoderResult};
use crate::params::ParamMessage;
use serde::{Deserialize, Serialize};

/// Parameter key enabling per-message diagnostic logging.
pub const CONFIG_DECODER_ENABLE_PACKET_LOGGING: &str = "enable_packet_logging";
/// Parameter key for the stalled-frame timeout in milliseconds.
pub const CONFIG_DECODER_FRAME_TIMEOUT_MS: &str = "frame_timeout_ms";

/// Packet logging is off unless asked for.
pub const DEFAULT_ENABLE_PACKET_LOGGING: bool = false;
/// Frames may stay mapped for one second before being treated as stalled.
pub const DEFAULT_FRAME_TIMEOUT_MS: u32 = 1000;

/// Base configuration of a frame decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Log every received unit on the packet logging target.
    #[serde(default = "default_enable_packet_logging")]
    pub enable_packet_logging: bool,
    /// Longest time an in-progress frame may stay mapped.
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u32,
}

fn default_enable_packet_logging() -> bool {
    DEFAULT_ENABLE_PACKET_LOGGING
}

fn default_frame_timeout_ms() -> u32 {
    DEFAULT_FRAME_TIMEOUT_MS
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            enable_packet_logging: DEFAULT_ENABLE_PACKET_LOGGING,
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT_MS,
        }
    }
}

impl DecoderConfig {
    /// Apply the base parameters found under `prefix` in `msg`.
    ///
    /// Absent keys keep their current values. The update is all-or-nothing:
    /// if any present key is invalid nothing changes.
    ///
    /// # Errors
    /// Returns [`DecoderError::InvalidParameter`] for a mistyped value or a
    /// zero timeout.
    pub fn apply(&mut self, prefix: &str, msg: &ParamMessage) -> DecoderResult<()> {
        let logging_key = format!("{prefix}{CONFIG_DECODER_ENABLE_PACKET_LOGGING}");
        let timeout_key = format!("{prefix}{CONFIG_DECODER_FRAME_TIMEOUT_MS}");

        let enable_packet_logging = msg
            .get_param::<bool>(&logging_key)?
            .unwrap_or(self.enable_packet_logging);
        let frame_timeout_ms = msg
            .get_param::<u32>(&timeout_key)?
            .unwrap_or(self.frame_timeout_ms);

        if frame_timeout_ms == 0 {
            return Err(DecoderError::InvalidParameter {
                key: timeout_key,
                reason: "must be greater than 0".into(),
            });
        }

        self.enable_packet_logging = enable_packet_logging;
        self.frame_timeout_ms = frame_timeout_ms;
        Ok(())
    }

    /// Write the base parameters under `prefix` into `reply`.
    pub fn write_to(&self, prefix: &str, reply: &mut ParamMessage) {
        reply.set_param(
            &format!("{prefix}{CONFIG_DECODER_ENABLE_PACKET_LOGGING}"),
            self.enable_packet_logging,
        );
        reply.set_param(
            &format!("{prefix}{CONFIG_DECODER_FRAME_TIMEOUT_MS}"),
            self.frame_timeout_ms,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = DecoderConfig::default();
        assert!(!config.enable_packet_logging);
        assert_eq!(config.frame_timeout_ms, 1000);
    }

    #[test]
    fn test_apply_partial_keeps_prior_values() {
        let mut config = DecoderConfig::default();
        let msg = ParamMessage::from_value(json!({ "frame_timeout_ms": 100 })).unwrap();
        config.apply("", &msg).unwrap();
        assert_eq!(config.frame_timeout_ms, 100);
        assert!(!config.enable_packet_logging);

        let msg = ParamMessage::from_value(json!({ "enable_packet_logging": true })).unwrap();
        config.apply("", &msg).unwrap();
        assert_eq!(config.frame_timeout_ms, 100);
        assert!(config.enable_packet_logging);
    }

    #[test]
    fn test_apply_with_prefix_ignores_unprefixed() {
        let mut config = DecoderConfig::default();
        let msg = ParamMessage::from_value(json!({
            "frame_timeout_ms": 5,
            "decoder": { "frame_timeout_ms": 50 }
        }))
        .unwrap();
        config.apply("decoder/", &msg).unwrap();
        assert_eq!(config.frame_timeout_ms, 50);
    }

    #[test]
    fn test_zero_timeout_rejected_atomically() {
        let mut config = DecoderConfig::default();
        let msg = ParamMessage::from_value(json!({
            "enable_packet_logging": true,
            "frame_timeout_ms": 0
        }))
        .unwrap();
        assert!(config.apply("", &msg).is_err());
        assert_eq!(config, DecoderConfig::default());
    }

    #[test]
    fn test_write_to_with_prefix() {
        let mut reply = ParamMessage::new();
        DecoderConfig::default().write_to("decoder_config/", &mut reply);
        assert_eq!(
            reply.to_value(),
            json!({ "decoder_config": { "enable_packet_logging": false, "frame_timeout_ms": 1000 } })
        );
    }
}
