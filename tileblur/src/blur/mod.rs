//! Gaussian blur over pixel buffers.
//!
//! One convolution routine serves every execution mode: the sequential
//! baseline blurs whole images, and the tile pipeline blurs padded tiles
//! (whose padding already contains the true neighboring pixels, so border
//! handling inside a tile reduces to the same clamped sampling used at
//! real image borders).

mod kernel;

pub use kernel::Kernel;

use image::{Rgba, RgbaImage};
use thiserror::Error;

/// Blur errors.
#[derive(Debug, Error)]
pub enum BlurError {
    /// Kernel size must be odd and non-zero.
    #[error("kernel size must be odd and non-zero, got {0}")]
    InvalidKernelSize(u32),
}

/// Applies a weighted-sum convolution to a pixel buffer.
///
/// Sampling outside the buffer clamps to the nearest in-bounds pixel.
/// Output dimensions equal input dimensions. A 1x1 kernel reproduces the
/// input exactly.
pub fn blur_image(src: &RgbaImage, kernel: &Kernel) -> RgbaImage {
    let width = src.width();
    let height = src.height();
    let size = kernel.size();
    let offset = i64::from(size / 2);
    let max_x = (width - 1) as i64;
    let max_y = (height - 1) as i64;

    RgbaImage::from_fn(width, height, |x, y| {
        let (mut r, mut g, mut b, mut a) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);

        for ky in 0..size {
            for kx in 0..size {
                let sx = (x as i64 + i64::from(kx) - offset).clamp(0, max_x);
                let sy = (y as i64 + i64::from(ky) - offset).clamp(0, max_y);
                let pixel = src.get_pixel(sx as u32, sy as u32);
                let w = kernel.weight(kx, ky);

                r += f64::from(pixel[0]) * w;
                g += f64::from(pixel[1]) * w;
                b += f64::from(pixel[2]) * w;
                a += f64::from(pixel[3]) * w;
            }
        }

        Rgba([
            r.round().clamp(0.0, 255.0) as u8,
            g.round().clamp(0.0, 255.0) as u8,
            b.round().clamp(0.0, 255.0) as u8,
            a.round().clamp(0.0, 255.0) as u8,
        ])
    })
}

/// Crops the unpadded center region out of a blurred padded tile.
///
/// The result is `width x height` pixels starting at `(padding, padding)`,
/// so reassembled tiles never duplicate their overlap.
pub fn extract_center(blurred: &RgbaImage, padding: u32, width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        *blurred.get_pixel(x + padding, y + padding)
    })
}
