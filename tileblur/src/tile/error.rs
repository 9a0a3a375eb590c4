//! Tiling engine errors.

use thiserror::Error;

/// Errors from tiling-grid construction and tile merging.
#[derive(Debug, Error)]
pub enum TileError {
    /// Tile edge length must be non-zero.
    #[error("tile edge length must be greater than zero")]
    InvalidTileEdge,

    /// Tile data dimensions disagree with its declared extent.
    #[error("tile data is {actual:?} but extent declares {expected:?}")]
    MismatchedData {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    /// Tile extent does not fit inside the target canvas.
    #[error("tile extent {width}x{height} at ({x}, {y}) exceeds canvas bounds")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
}
