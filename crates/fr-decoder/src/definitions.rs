//! Frame description types shared with downstream dataset writers.

use serde::{Deserialize, Serialize};

/// Pixel type of the incoming image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelType {
    /// Unsigned 8-bit.
    Raw8,
    /// Unsigned 16-bit.
    Raw16,
    /// IEEE 754 single precision.
    Float32,
    /// Unsigned 64-bit.
    Raw64,
}

impl PixelType {
    /// Bytes occupied by one pixel.
    #[must_use]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Raw8 => 1,
            Self::Raw16 => 2,
            Self::Float32 => 4,
            Self::Raw64 => 8,
        }
    }

    /// Decode the wire representation.
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Raw8),
            1 => Some(Self::Raw16),
            2 => Some(Self::Float32),
            3 => Some(Self::Raw64),
            _ => None,
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Raw8 => 0,
            Self::Raw16 => 1,
            Self::Float32 => 2,
            Self::Raw64 => 3,
        }
    }
}

/// Compression applied to the payload by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    /// Raw pixels.
    None,
    /// LZ4 block compression.
    Lz4,
    /// Bitshuffle + LZ4.
    Bslz4,
    /// Blosc container.
    Blosc,
}

impl CompressionType {
    /// Decode the wire representation.
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Bslz4),
            3 => Some(Self::Blosc),
            _ => None,
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Bslz4 => 2,
            Self::Blosc => 3,
        }
    }
}

/// Image geometry declared by a wire format, forwarded with each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel type.
    pub pixel_type: PixelType,
    /// Payload compression.
    pub compression: CompressionType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_wire_values() {
        for pixel in [PixelType::Raw8, PixelType::Raw16, PixelType::Float32, PixelType::Raw64] {
            assert_eq!(PixelType::from_wire(pixel.to_wire()), Some(pixel));
        }
        assert_eq!(PixelType::from_wire(4), None);
        assert_eq!(PixelType::Raw16.bytes_per_pixel(), 2);
    }

    #[test]
    fn test_unknown_compression() {
        assert_eq!(CompressionType::from_wire(9), None);
        assert_eq!(CompressionType::from_wire(3), Some(CompressionType::Blosc));
    }
}
