//! Tiling grid geometry.

use super::TileError;

/// Geometry of a tiling grid over one image.
///
/// The grid is deterministic: iteration is row-major (top-to-bottom,
/// left-to-right) and tile ids count up from 0 in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    width: u32,
    height: u32,
    tile_edge: u32,
}

/// The unpadded placement of one tile within its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub tile_id: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileGrid {
    /// Creates a grid for an image of `width x height` with the given tile
    /// edge length.
    ///
    /// # Errors
    ///
    /// Returns [`TileError::InvalidTileEdge`] if `tile_edge` is zero.
    pub fn new(width: u32, height: u32, tile_edge: u32) -> Result<Self, TileError> {
        if tile_edge == 0 {
            return Err(TileError::InvalidTileEdge);
        }
        Ok(Self {
            width,
            height,
            tile_edge,
        })
    }

    /// Number of tile columns: `ceil(width / tile_edge)`.
    #[inline]
    pub fn cols(&self) -> u32 {
        self.width.div_ceil(self.tile_edge)
    }

    /// Number of tile rows: `ceil(height / tile_edge)`.
    #[inline]
    pub fn rows(&self) -> u32 {
        self.height.div_ceil(self.tile_edge)
    }

    /// Total number of tiles in the grid.
    #[inline]
    pub fn tile_count(&self) -> u32 {
        self.cols() * self.rows()
    }

    /// Iterates tile placements in row-major order, ids from 0.
    pub fn iter(&self) -> impl Iterator<Item = TileRect> + '_ {
        let edge = self.tile_edge;
        let (w, h) = (self.width, self.height);
        let cols = self.cols();
        (0..self.tile_count()).map(move |tile_id| {
            let col = tile_id % cols;
            let row = tile_id / cols;
            let x = col * edge;
            let y = row * edge;
            TileRect {
                tile_id,
                x,
                y,
                width: edge.min(w - x),
                height: edge.min(h - y),
            }
        })
    }
}
