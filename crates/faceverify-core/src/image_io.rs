//! Image loading and color conversion.

use image::{DynamicImage, GrayImage, ImageDecoder, ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

// BT.601 luma weights, the conversion classical cascades were trained on.
const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("cannot read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("image has zero width or height")]
    ZeroDimensions,
}

/// Decode an image file, guessing the format from its content.
///
/// The EXIF orientation tag is applied, so camera photos come back upright.
pub fn load_image(path: &Path) -> Result<DynamicImage, ImageError> {
    let io_err = |source| ImageError::Io { path: path.to_path_buf(), source };
    let decode_err = |source| ImageError::Decode { path: path.to_path_buf(), source };

    let mut decoder = ImageReader::open(path)
        .map_err(io_err)?
        .with_guessed_format()
        .map_err(io_err)?
        .into_decoder()
        .map_err(decode_err)?;
    let orientation = decoder.orientation().map_err(decode_err)?;
    let mut image = DynamicImage::from_decoder(decoder).map_err(decode_err)?;
    image.apply_orientation(orientation);

    check_dimensions(&image)?;
    tracing::debug!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        ?orientation,
        "image loaded"
    );
    Ok(image)
}

pub fn check_dimensions(image: &DynamicImage) -> Result<(), ImageError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(ImageError::ZeroDimensions);
    }
    Ok(())
}

/// Convert an RGB image to 8-bit grayscale using BT.601 weights.
pub fn to_grayscale(rgb: &RgbImage) -> GrayImage {
    let (width, height) = rgb.dimensions();
    let data = rgb
        .as_raw()
        .chunks_exact(3)
        .map(|px| {
            let y = LUMA_R * px[0] as f32 + LUMA_G * px[1] as f32 + LUMA_B * px[2] as f32;
            y.round().clamp(0.0, 255.0) as u8
        })
        .collect();

    // Buffer length is exactly width * height by construction.
    GrayImage::from_raw(width, height, data).unwrap_or_else(|| GrayImage::new(width, height))
}
