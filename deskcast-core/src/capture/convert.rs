//! Normalisation of raw captures into output-sized BGR24 frames.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};

use crate::error::CastError;
use crate::types::{FRAME_BYTES_PER_PIXEL, Frame, PixelFormat, RawScreenFrame};

/// Repack a raw capture into tightly packed BGR24, dropping alpha and
/// row padding.
pub fn to_bgr24(raw: &RawScreenFrame) -> Result<Vec<u8>, CastError> {
    let bpp = raw.format.bytes_per_pixel();
    let row_bytes = raw.width as usize * bpp;
    if (raw.stride as usize) < row_bytes || raw.data.len() < raw.byte_len() {
        return Err(CastError::InvalidFrame {
            expected: raw.byte_len().max(row_bytes * raw.height as usize),
            actual: raw.data.len(),
        });
    }

    let mut out = Vec::with_capacity(Frame::byte_len_for(raw.width, raw.height));
    for y in 0..raw.height {
        let row = raw.row(y);
        match raw.format {
            PixelFormat::Bgr8 => out.extend_from_slice(row),
            PixelFormat::Bgra8 => {
                for px in row.chunks_exact(4) {
                    out.extend_from_slice(&px[..3]);
                }
            }
            PixelFormat::Rgba8 => {
                for px in row.chunks_exact(4) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
        }
    }
    Ok(out)
}

/// Scale a packed 3-byte-per-pixel buffer to `dst_w × dst_h`.
///
/// Nearest-neighbour keeps the per-tick cost low at desktop
/// resolutions. Channel order is preserved untouched.
pub fn resize_bgr24(
    data: Vec<u8>,
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
) -> Result<Vec<u8>, CastError> {
    if src_w == dst_w && src_h == dst_h {
        return Ok(data);
    }
    let actual = data.len();
    let src: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_raw(src_w, src_h, data).ok_or(CastError::InvalidFrame {
            expected: src_w as usize * src_h as usize * FRAME_BYTES_PER_PIXEL,
            actual,
        })?;
    Ok(imageops::resize(&src, dst_w, dst_h, FilterType::Nearest).into_raw())
}

/// Convert and scale a capture into a queue-ready [`Frame`].
pub fn prepare_frame(
    raw: &RawScreenFrame,
    width: u32,
    height: u32,
    sequence: u64,
) -> Result<Frame, CastError> {
    let bgr = to_bgr24(raw)?;
    let scaled = resize_bgr24(bgr, raw.width, raw.height, width, height)?;
    Frame::new(width, height, sequence, scaled)
}
