//! Saving still captures to disk in display orientation.

use binocle_hw::{rotate_and_mirror, to_packed_chroma, Frame, TransformError};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("pixel transform failed: {0}")]
    Transform(#[from] TransformError),
    #[error("luma plane does not fit {width}x{height}")]
    Size { width: u32, height: u32 },
    #[error("failed to create {0}: {1}")]
    Dir(PathBuf, std::io::Error),
    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),
}

/// Convert `frame` to packed chroma, rotate it 90° and mirror it, and save
/// the luma plane as a grayscale PNG under `dir`.
///
/// The file is named `<prefix>-<local time>-<sequence>.png`.
pub fn save_corrected_luma(frame: &Frame, dir: &Path, prefix: &str) -> Result<PathBuf, SnapshotError> {
    let packed = to_packed_chroma(frame)?;
    let corrected = rotate_and_mirror(&packed);
    let (width, height) = (corrected.width(), corrected.height());
    let gray = image::GrayImage::from_raw(width, height, corrected.luma().to_vec())
        .ok_or(SnapshotError::Size { width, height })?;

    std::fs::create_dir_all(dir).map_err(|e| SnapshotError::Dir(dir.to_path_buf(), e))?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f");
    let path = dir.join(format!("{prefix}-{stamp}-{}.png", frame.sequence()));
    gray.save_with_format(&path, image::ImageFormat::Png)?;
    tracing::info!(path = %path.display(), width, height, "snapshot saved");
    Ok(path)
}
