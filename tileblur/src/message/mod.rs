//! Queue envelopes and wire encoding.
//!
//! Tiles travel through the work queue as JSON envelopes with pixel data
//! flattened to raw RGBA bytes. Decoding validates the payload against its
//! declared geometry so consumers can treat any mismatch as a malformed
//! message (log, acknowledge, skip) instead of crashing.

use crate::tile::{ProcessedTile, Tile};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream carrying tile jobs from the coordinator to the worker pool.
pub const JOB_STREAM: &str = "jobs";

/// Stream carrying blurred tiles from the worker pool to the assembler.
pub const RESULT_STREAM: &str = "results";

/// Consumer group competing over [`JOB_STREAM`].
pub const WORKER_GROUP: &str = "workers";

/// Consumer group competing over [`RESULT_STREAM`].
pub const ASSEMBLER_GROUP: &str = "assemblers";

/// Envelope kind for tile jobs.
pub const KIND_TILE: &str = "tile";

/// Errors from envelope encoding and decoding.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The payload is not valid JSON for this envelope type.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope kind is not one this consumer handles.
    #[error("unexpected envelope kind {0:?}")]
    UnexpectedKind(String),

    /// The envelope is missing its tile payload.
    #[error("envelope has no tile payload")]
    MissingTile,

    /// Pixel data length disagrees with the declared tile geometry.
    #[error("pixel data is {actual} bytes but geometry requires {expected}")]
    PixelMismatch { expected: usize, actual: usize },
}

/// Pixel grid flattened for the wire: dimensions plus raw RGBA bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePixels {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl WirePixels {
    fn from_image(image: &RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            rgba: image.as_raw().clone(),
        }
    }

    fn into_image(self) -> Result<RgbaImage, MessageError> {
        let expected = (self.width as usize) * (self.height as usize) * 4;
        if self.rgba.len() != expected {
            return Err(MessageError::PixelMismatch {
                expected,
                actual: self.rgba.len(),
            });
        }
        RgbaImage::from_raw(self.width, self.height, self.rgba).ok_or(
            MessageError::PixelMismatch {
                expected,
                actual: expected,
            },
        )
    }
}

/// A tile job awaiting blur, as published to [`JOB_STREAM`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    /// Discriminator; consumers skip kinds they do not understand.
    pub kind: String,
    pub image_id: u32,
    pub tile_id: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub padding: u32,
    pub pixels: Option<WirePixels>,
}

impl JobMessage {
    /// Wraps a tile for publication.
    pub fn from_tile(tile: &Tile) -> Self {
        Self {
            kind: KIND_TILE.to_string(),
            image_id: tile.image_id,
            tile_id: tile.tile_id,
            x: tile.x,
            y: tile.y,
            width: tile.width,
            height: tile.height,
            padding: tile.padding,
            pixels: Some(WirePixels::from_image(&tile.data)),
        }
    }

    /// Serializes the envelope for the queue.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes an envelope from a queue payload.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Validates the envelope and rebuilds the domain tile.
    ///
    /// Fails on an unexpected kind, a missing payload, or pixel data that
    /// disagrees with the declared geometry.
    pub fn into_tile(self) -> Result<Tile, MessageError> {
        if self.kind != KIND_TILE {
            return Err(MessageError::UnexpectedKind(self.kind));
        }
        let pixels = self.pixels.ok_or(MessageError::MissingTile)?;
        let padded = (self.width + 2 * self.padding, self.height + 2 * self.padding);
        if (pixels.width, pixels.height) != padded {
            return Err(MessageError::PixelMismatch {
                expected: (padded.0 as usize) * (padded.1 as usize) * 4,
                actual: pixels.rgba.len(),
            });
        }
        Ok(Tile {
            image_id: self.image_id,
            tile_id: self.tile_id,
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            padding: self.padding,
            data: pixels.into_image()?,
        })
    }
}

/// A blurred tile as published to [`RESULT_STREAM`], with observability
/// metadata about the worker that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub image_id: u32,
    pub tile_id: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub pixels: Option<WirePixels>,
    /// Consumer name of the worker that blurred this tile.
    pub worker_id: String,
    /// Wall-clock blur duration in milliseconds.
    pub processing_ms: u64,
}

impl ResultMessage {
    /// Wraps a processed tile for publication.
    pub fn from_processed(tile: &ProcessedTile, worker_id: &str, processing_ms: u64) -> Self {
        Self {
            image_id: tile.image_id,
            tile_id: tile.tile_id,
            x: tile.x,
            y: tile.y,
            width: tile.width,
            height: tile.height,
            pixels: Some(WirePixels::from_image(&tile.data)),
            worker_id: worker_id.to_string(),
            processing_ms,
        }
    }

    /// Serializes the envelope for the queue.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes an envelope from a queue payload.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Validates the envelope and rebuilds the processed tile.
    pub fn into_processed(self) -> Result<ProcessedTile, MessageError> {
        let pixels = self.pixels.ok_or(MessageError::MissingTile)?;
        if (pixels.width, pixels.height) != (self.width, self.height) {
            return Err(MessageError::PixelMismatch {
                expected: (self.width as usize) * (self.height as usize) * 4,
                actual: pixels.rgba.len(),
            });
        }
        Ok(ProcessedTile {
            image_id: self.image_id,
            tile_id: self.tile_id,
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            data: pixels.into_image()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn sample_tile() -> Tile {
        Tile {
            image_id: 3,
            tile_id: 5,
            x: 256,
            y: 0,
            width: 16,
            height: 12,
            padding: 2,
            data: RgbaImage::from_fn(20, 16, |x, y| Rgba([x as u8, y as u8, 0, 255])),
        }
    }

    #[test]
    fn test_job_round_trip() {
        let tile = sample_tile();
        let encoded = JobMessage::from_tile(&tile).encode().unwrap();
        let decoded = JobMessage::decode(&encoded).unwrap().into_tile().unwrap();

        assert_eq!(decoded.image_id, 3);
        assert_eq!(decoded.tile_id, 5);
        assert_eq!(decoded.padding, 2);
        assert_eq!(decoded.data, tile.data);
    }

    #[test]
    fn test_result_round_trip() {
        let processed = ProcessedTile {
            image_id: 1,
            tile_id: 0,
            x: 0,
            y: 0,
            width: 8,
            height: 8,
            data: RgbaImage::from_pixel(8, 8, Rgba([9, 9, 9, 255])),
        };
        let encoded = ResultMessage::from_processed(&processed, "worker-1", 42)
            .encode()
            .unwrap();
        let decoded = ResultMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.worker_id, "worker-1");
        assert_eq!(decoded.processing_ms, 42);
        assert_eq!(decoded.into_processed().unwrap().data, processed.data);
    }

    #[test]
    fn test_unexpected_kind_rejected() {
        let mut msg = JobMessage::from_tile(&sample_tile());
        msg.kind = "shutdown".to_string();
        assert!(matches!(
            msg.into_tile(),
            Err(MessageError::UnexpectedKind(_))
        ));
    }

    #[test]
    fn test_missing_pixels_rejected() {
        let mut msg = JobMessage::from_tile(&sample_tile());
        msg.pixels = None;
        assert!(matches!(msg.into_tile(), Err(MessageError::MissingTile)));
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let mut msg = JobMessage::from_tile(&sample_tile());
        msg.width = 99;
        assert!(matches!(
            msg.into_tile(),
            Err(MessageError::PixelMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        assert!(matches!(
            JobMessage::decode(b"not json"),
            Err(MessageError::Malformed(_))
        ));
    }
}
