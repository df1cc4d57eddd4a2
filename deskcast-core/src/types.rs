//! Frame types shared by the capture and delivery stages.
//!
//! [`RawScreenFrame`] is whatever the capture backend hands back, in its
//! native layout. [`Frame`] is the normalised BGR24 image at the output
//! resolution, the only thing that travels through the queue.

use crate::error::CastError;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha (DXGI default).
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Blue, Green, Red.
    Bgr8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Bgr8 => 3,
        }
    }
}

// ── RawScreenFrame ───────────────────────────────────────────────

/// A raw, uncompressed screen capture obtained from the OS.
///
/// The `data` buffer holds `height` rows of `stride` bytes each.
/// `stride` may be larger than `width * bytes_per_pixel` due to
/// GPU row-alignment requirements.
#[derive(Debug, Clone)]
pub struct RawScreenFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes** (may exceed `width * bpp`).
    pub stride: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Raw pixel data, `stride * height` bytes.
    pub data: Vec<u8>,
}

impl RawScreenFrame {
    /// Build a tightly packed frame (`stride == width * bpp`).
    pub fn packed(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            stride: width * format.bytes_per_pixel() as u32,
            format,
            data,
        }
    }

    /// Total byte size the raw bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Returns the pixel bytes of row `y`, without padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        let end = start + self.width as usize * self.format.bytes_per_pixel();
        &self.data[start..end]
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// Bytes per pixel of every [`Frame`] (BGR24).
pub const FRAME_BYTES_PER_PIXEL: usize = 3;

/// A BGR24 image at the configured output resolution.
///
/// The encoder receives frames back to back with no delimiter, so the
/// byte length is always exactly `width * height * 3`.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    sequence: u64,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap a BGR24 buffer, rejecting buffers of the wrong length.
    pub fn new(width: u32, height: u32, sequence: u64, data: Vec<u8>) -> Result<Self, CastError> {
        let expected = Self::byte_len_for(width, height);
        if data.len() != expected {
            return Err(CastError::InvalidFrame {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            sequence,
            data,
        })
    }

    /// Size in bytes of a frame with the given geometry.
    pub const fn byte_len_for(width: u32, height: u32) -> usize {
        width as usize * height as usize * FRAME_BYTES_PER_PIXEL
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Capture-side sequence number. Gaps mean frames were dropped.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_wrong_length() {
        let err = Frame::new(4, 2, 0, vec![0; 10]).unwrap_err();
        assert!(matches!(
            err,
            CastError::InvalidFrame {
                expected: 24,
                actual: 10
            }
        ));
    }

    #[test]
    fn frame_accepts_exact_length() {
        let frame = Frame::new(640, 480, 7, vec![0; 640 * 480 * 3]).unwrap();
        assert_eq!(frame.byte_len(), 921_600);
        assert_eq!(frame.sequence(), 7);
    }

    #[test]
    fn raw_row_skips_padding() {
        let mut raw = RawScreenFrame::packed(2, 2, PixelFormat::Bgra8, Vec::new());
        raw.stride = 12; // 8 bytes of pixels + 4 bytes padding
        raw.data = (0..24).collect();
        assert_eq!(raw.row(1), &[12, 13, 14, 15, 16, 17, 18, 19]);
        assert_eq!(raw.byte_len(), 24);
    }
}
