//! Image file boundary: decode, encode, and input discovery.
//!
//! The pipeline core only ever sees [`RgbaImage`] pixel grids; this module
//! owns the conversion to and from files on disk. PNG (lossless) and JPEG
//! (lossy) inputs are accepted; outputs are always PNG.

use image::RgbaImage;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Input file extensions accepted by [`discover_images`].
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Errors from the image file boundary.
#[derive(Debug, Error)]
pub enum RasterError {
    /// Filesystem error while reading or writing.
    #[error("I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file could not be decoded as an image.
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The output file could not be encoded or written.
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Decodes an image file into an RGBA pixel grid.
pub fn load_image(path: &Path) -> Result<RgbaImage, RasterError> {
    let img = image::open(path).map_err(|source| RasterError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(img.to_rgba8())
}

/// Encodes a pixel grid as PNG, creating parent directories as needed.
pub fn save_image(image: &RgbaImage, path: &Path) -> Result<(), RasterError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RasterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    image
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|source| RasterError::Encode {
            path: path.to_path_buf(),
            source,
        })
}

/// Lists candidate image files in a directory, sorted by file name.
///
/// The ordering is stable for a given directory contents, so image ids
/// (positions in this list) are reproducible across runs.
pub fn discover_images(dir: &Path) -> Result<Vec<PathBuf>, RasterError> {
    let entries = fs::read_dir(dir).map_err(|source| RasterError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| RasterError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if matches {
            paths.push(path);
        }
    }

    paths.sort();
    Ok(paths)
}

/// Builds the output path for an input image: `<output_dir>/<stem>_blurred.png`.
pub fn output_path_for(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    output_dir.join(format!("{stem}_blurred.png"))
}
