//! Hard limits applied to sizes declared by incoming headers.

use thiserror::Error;

/// Largest frame payload a header may declare (default: 256MB).
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;
/// Largest width or height a header may declare.
pub const MAX_FRAME_DIMENSION: u32 = 65_536;

/// Why a declared frame size was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SizeViolation {
    /// A dimension exceeds [`MAX_FRAME_DIMENSION`].
    #[error("frame dimensions {width}x{height} exceed maximum {max_dimension}")]
    DimensionsTooLarge {
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
        /// Allowed maximum.
        max_dimension: u32,
    },
    /// Size arithmetic overflowed.
    #[error("size overflow computing {context}")]
    Overflow {
        /// Which quantity overflowed.
        context: &'static str,
    },
    /// The frame exceeds [`MAX_FRAME_BYTES`].
    #[error("frame of {bytes} bytes exceeds maximum {max_bytes}")]
    TooLarge {
        /// Declared size.
        bytes: usize,
        /// Allowed maximum.
        max_bytes: usize,
    },
}

/// Validated frame sizing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    /// Pixel count.
    pub pixels: usize,
    /// Uncompressed byte count.
    pub bytes: usize,
}

/// Validate frame dimensions and calculate pixel/byte sizes safely.
///
/// # Errors
/// Returns a [`SizeViolation`] for oversized or overflowing geometry.
pub fn validate_frame_size(
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) -> Result<FrameSize, SizeViolation> {
    if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return Err(SizeViolation::DimensionsTooLarge {
            width,
            height,
            max_dimension: MAX_FRAME_DIMENSION,
        });
    }

    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or(SizeViolation::Overflow {
            context: "frame pixel count",
        })?;

    let bytes = pixels
        .checked_mul(bytes_per_pixel)
        .ok_or(SizeViolation::Overflow {
            context: "frame byte size",
        })?;

    if bytes > MAX_FRAME_BYTES {
        return Err(SizeViolation::TooLarge {
            bytes,
            max_bytes: MAX_FRAME_BYTES,
        });
    }

    Ok(FrameSize { pixels, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_frame() {
        let size = validate_frame_size(2048, 2048, 2).unwrap();
        assert_eq!(size.pixels, 2048 * 2048);
        assert_eq!(size.bytes, 2048 * 2048 * 2);
    }

    #[test]
    fn test_oversized_dimension() {
        assert!(matches!(
            validate_frame_size(70_000, 1, 1),
            Err(SizeViolation::DimensionsTooLarge { .. })
        ));
    }

    #[test]
    fn test_too_many_bytes() {
        assert!(matches!(
            validate_frame_size(65_536, 65_536, 8),
            Err(SizeViolation::TooLarge { .. })
        ));
    }
}
