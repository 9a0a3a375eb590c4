//! Tiling engine: partition an image into overlapping tiles and merge
//! processed tiles back into a canvas.
//!
//! The engine is a set of pure functions used from both ends of the
//! pipeline: the coordinator calls [`split`] to cut an image into padded
//! tiles, and the assembler calls [`merge`] to write blurred tiles back
//! into an output canvas.
//!
//! # Grid contract
//!
//! For an image of `W x H` pixels and tile edge `T`, the grid has
//! `ceil(W/T) x ceil(H/T)` tiles in row-major order with ids starting at 0.
//! Edge tiles are shorter/narrower than `T`. The unpadded tile regions
//! exactly partition the image: no overlap, no gap.
//!
//! # Padding contract
//!
//! Each tile carries `padding` extra pixels on every side so that a blur
//! kernel of size `2 * padding + 1` can be applied without seams. Padded
//! coordinates outside the source image are clamped to the nearest
//! in-bounds pixel (never wrapped, never zero-filled), so the padded data
//! is always exactly `(width + 2*padding) x (height + 2*padding)`.

mod error;
mod grid;
mod merge;
mod split;

pub use error::TileError;
pub use grid::{TileGrid, TileRect};
pub use merge::merge;
pub use split::split;

use image::RgbaImage;

/// A rectangular sub-region of one image, with overlap padding.
///
/// `data` holds the padded pixel grid; the unpadded region is located at
/// `(padding, padding)` within it.
#[derive(Debug, Clone)]
pub struct Tile {
    /// Image this tile belongs to.
    pub image_id: u32,
    /// Tile index within the image grid (row-major, starting at 0).
    pub tile_id: u32,
    /// Top-left corner in image coordinates (unpadded).
    pub x: u32,
    /// Top-left corner in image coordinates (unpadded).
    pub y: u32,
    /// Unpadded width.
    pub width: u32,
    /// Unpadded height.
    pub height: u32,
    /// Overlap on each side (half the blur kernel size).
    pub padding: u32,
    /// Padded pixel data, `(width + 2*padding) x (height + 2*padding)`.
    pub data: RgbaImage,
}

/// The output of blurring a [`Tile`]: same identity and placement, but
/// `data` holds only the unpadded center region.
#[derive(Debug, Clone)]
pub struct ProcessedTile {
    /// Image this tile belongs to.
    pub image_id: u32,
    /// Tile index within the image grid.
    pub tile_id: u32,
    /// Top-left corner in image coordinates.
    pub x: u32,
    /// Top-left corner in image coordinates.
    pub y: u32,
    /// Tile width.
    pub width: u32,
    /// Tile height.
    pub height: u32,
    /// Unpadded pixel data, `width x height`.
    pub data: RgbaImage,
}
