//! Image partitioning with border-clamped padding.

use super::{Tile, TileError, TileGrid};
use image::RgbaImage;

/// Partitions an image into padded tiles in row-major order.
///
/// Every pixel of the source belongs to exactly one tile's unpadded
/// region. The padded data samples `padding` extra pixels on each side;
/// coordinates outside the source bounds read the nearest in-bounds pixel.
///
/// Pure function: the source image is not modified. Typically invoked once
/// per image by the coordinator.
///
/// # Errors
///
/// Returns [`TileError::InvalidTileEdge`] if `tile_edge` is zero.
pub fn split(
    image: &RgbaImage,
    image_id: u32,
    tile_edge: u32,
    padding: u32,
) -> Result<Vec<Tile>, TileError> {
    let grid = TileGrid::new(image.width(), image.height(), tile_edge)?;

    let tiles = grid
        .iter()
        .map(|rect| Tile {
            image_id,
            tile_id: rect.tile_id,
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            padding,
            data: extract_padded(image, rect.x, rect.y, rect.width, rect.height, padding),
        })
        .collect();

    Ok(tiles)
}

/// Copies the padded window for one tile, clamping out-of-bounds reads to
/// the nearest in-bounds pixel.
fn extract_padded(
    image: &RgbaImage,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    padding: u32,
) -> RgbaImage {
    let max_x = (image.width() - 1) as i64;
    let max_y = (image.height() - 1) as i64;

    RgbaImage::from_fn(width + 2 * padding, height + 2 * padding, |px, py| {
        let sx = (x as i64 + px as i64 - padding as i64).clamp(0, max_x);
        let sy = (y as i64 + py as i64 - padding as i64).clamp(0, max_y);
        *image.get_pixel(sx as u32, sy as u32)
    })
}
