//! Concrete wire-format decoders and the registry that builds them by name.

mod dummy;
mod tcp;
mod udp;

pub use dummy::{DummyTcpDecoder, DUMMY_FRAME_BUFFER_SIZE};
pub use tcp::{TcpFrameDecoder, TcpFrameHeader, TCP_FRAME_MAGIC, TCP_FRAME_TYPE_IMAGE};
pub use udp::{UdpFrameDecoder, UdpPacketHeader, UDP_FLAG_END_OF_FRAME, UDP_FLAG_START_OF_FRAME, UDP_PACKET_MAGIC};

use crate::error::DecoderError;
use crate::variant::DecoderVariant;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Decoder variants that can be selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    /// Fixed 30-byte test frames over TCP.
    DummyTcp,
    /// Header-prefixed image frames over a TCP stream.
    Tcp,
    /// Packetised frames over UDP datagrams.
    Udp,
}

impl DecoderKind {
    /// Configuration name of the variant.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DummyTcp => "dummy_tcp",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    /// Whether the variant reads from a connected byte stream.
    #[must_use]
    pub fn is_stream(self) -> bool {
        !matches!(self, Self::Udp)
    }
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecoderKind {
    type Err = DecoderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dummy_tcp" => Ok(Self::DummyTcp),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(DecoderError::UnknownDecoder(other.to_string())),
        }
    }
}

/// Build a decoder variant with default parameters.
#[must_use]
pub fn create_decoder(kind: DecoderKind) -> Box<dyn DecoderVariant> {
    match kind {
        DecoderKind::DummyTcp => Box::new(DummyTcpDecoder::new()),
        DecoderKind::Tcp => Box::new(TcpFrameDecoder::new()),
        DecoderKind::Udp => Box::new(UdpFrameDecoder::new()),
    }
}
