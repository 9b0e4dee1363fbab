use crate::error::{NormalizeError, Result};
use crate::macenko_normalize::{NormalizeOutcome, StainNormalizer};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use ndarray::{Array3, ArrayView3};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use tracing::debug;

/// Quality for JPEG outputs (same as OpenCV's `imwrite` default).
pub const JPEG_QUALITY: u8 = 95;

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg"))
        .unwrap_or(false)
}

/// Decode a JPEG/PNG/TIFF file into an (H, W, 3) RGB array.
pub fn read_rgb(path: &Path) -> Result<Array3<u8>> {
    let img = image::open(path)
        .map_err(|e| NormalizeError::ImageReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .to_rgb8();
    let (w, h) = img.dimensions();
    Ok(Array3::from_shape_vec((h as usize, w as usize, 3), img.into_raw())?)
}

/// Encode an (H, W, 3) RGB array; the format follows the file extension.
/// Missing parent directories are created.
pub fn write_rgb(path: &Path, im: ArrayView3<u8>) -> Result<()> {
    let (h, w, c) = im.dim();
    if c != 3 {
        return Err(NormalizeError::ChannelCount(c));
    }
    let write_err = |reason: String| NormalizeError::ImageWriteError {
        path: path.to_path_buf(),
        reason,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let data: Vec<u8> = im.iter().copied().collect();
    let img = RgbImage::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| write_err(format!("buffer does not fit {w}x{h}")))?;
    if is_jpeg(path) {
        let mut writer = BufWriter::new(File::create(path)?);
        JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
            .encode_image(&img)
            .map_err(|e| write_err(e.to_string()))
    } else {
        img.save(path).map_err(|e| write_err(e.to_string()))
    }
}

/// Load, normalize, and save a single image.
pub fn normalize_image_file(
    input: &Path,
    output: &Path,
    normalizer: &StainNormalizer,
) -> Result<NormalizeOutcome> {
    let im = read_rgb(input)?;
    let normalized = normalizer.normalize(im.view())?;
    write_rgb(output, normalized.image.view())?;
    debug!(
        "{} -> {} ({:?})",
        input.display(),
        output.display(),
        normalized.outcome
    );
    Ok(normalized.outcome)
}
