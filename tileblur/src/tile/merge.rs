//! Merging processed tiles into an output canvas.

use super::{ProcessedTile, TileError};
use image::RgbaImage;

/// Writes a processed tile's pixels into the canvas at the tile's
/// unpadded extent.
///
/// The tiling engine does not deduplicate: writing the same tile twice is
/// harmless for the pixels but callers that need exactly-once accounting
/// (the assembler) must gate merges on their received-tile set.
///
/// # Errors
///
/// Returns [`TileError::MismatchedData`] if the tile's data dimensions
/// disagree with its declared extent, or [`TileError::OutOfBounds`] if the
/// extent does not fit inside the canvas.
pub fn merge(canvas: &mut RgbaImage, tile: &ProcessedTile) -> Result<(), TileError> {
    if tile.data.width() != tile.width || tile.data.height() != tile.height {
        return Err(TileError::MismatchedData {
            expected: (tile.width, tile.height),
            actual: (tile.data.width(), tile.data.height()),
        });
    }
    if tile.x + tile.width > canvas.width() || tile.y + tile.height > canvas.height() {
        return Err(TileError::OutOfBounds {
            x: tile.x,
            y: tile.y,
            width: tile.width,
            height: tile.height,
        });
    }

    for py in 0..tile.height {
        for px in 0..tile.width {
            canvas.put_pixel(tile.x + px, tile.y + py, *tile.data.get_pixel(px, py));
        }
    }

    Ok(())
}
