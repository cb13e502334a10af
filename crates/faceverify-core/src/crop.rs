//! Face cropping and tensor preprocessing for the embedding network.

use crate::types::{BoundingBox, Rect};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum CropError {
    #[error("invalid crop parameters: {0}")]
    InvalidParams(String),
}

/// Margin and output size for face crops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropParams {
    /// Enlargement of the detected box around its center.
    pub scale_factor: f32,
    /// Side of the square crop handed to the embedding network.
    pub target_size: u32,
}

impl Default for CropParams {
    fn default() -> Self {
        Self { scale_factor: 1.5, target_size: 96 }
    }
}

impl CropParams {
    pub fn validate(&self) -> Result<(), CropError> {
        if !(self.scale_factor.is_finite() && self.scale_factor > 0.0) {
            return Err(CropError::InvalidParams(format!(
                "scale_factor must be a finite value > 0, got {}",
                self.scale_factor
            )));
        }
        if self.target_size == 0 {
            return Err(CropError::InvalidParams("target_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Pixel scaling applied before inference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// x / 255
    #[default]
    UnitRange,
    /// (x - 127.5) / 128
    Symmetric,
    /// Per-image prewhitening: (x - mean) / max(std, 1/sqrt(N))
    Standardize,
}

/// Memory layout of the network input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// Channels last, as exported from Keras.
    #[default]
    Nhwc,
    Nchw,
}

/// A square RGB face crop ready for embedding.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub image: RgbImage,
    /// Region of the source image the crop was cut from.
    pub region: Rect,
}

/// Enlarge `face` around its center by `scale_factor` and clamp it to the image.
///
/// The result always covers at least one pixel.
pub fn face_region(face: &BoundingBox, image_width: u32, image_height: u32, scale_factor: f32) -> Rect {
    let (cx, cy) = face.center();
    let half_w = face.width * scale_factor / 2.0;
    let half_h = face.height * scale_factor / 2.0;

    let clamp_span = |lo: f32, hi: f32, limit: u32| -> (i32, i32) {
        let limit = limit as i32;
        let start = (lo.floor() as i32).clamp(0, limit - 1);
        let end = (hi.ceil() as i32).clamp(start + 1, limit);
        (start, end)
    };

    let (x0, x1) = clamp_span(cx - half_w, cx + half_w, image_width);
    let (y0, y1) = clamp_span(cy - half_h, cy + half_h, image_height);

    Rect::new(x0, y0, x1 - x0, y1 - y0)
}

/// Cut the enlarged face region out of `image` and resize it to the target square.
pub fn crop_face(image: &RgbImage, face: &BoundingBox, params: &CropParams) -> FaceCrop {
    let region = face_region(face, image.width(), image.height(), params.scale_factor);
    let cut = imageops::crop_imm(
        image,
        region.x as u32,
        region.y as u32,
        region.width as u32,
        region.height as u32,
    )
    .to_image();
    let resized = imageops::resize(&cut, params.target_size, params.target_size, FilterType::Triangle);

    tracing::debug!(?region, size = params.target_size, "face cropped");
    FaceCrop { image: resized, region }
}

/// Build a batch-of-one float tensor from a crop.
pub fn to_tensor(crop: &FaceCrop, layout: TensorLayout, normalization: Normalization) -> Array4<f32> {
    let (w, h) = (crop.image.width() as usize, crop.image.height() as usize);
    let raw = crop.image.as_raw();
    let (offset, scale) = normalization_coefficients(raw, normalization);

    let mut tensor = match layout {
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
    };

    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                let v = (raw[(y * w + x) * 3 + c] as f32 - offset) * scale;
                match layout {
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
                }
            }
        }
    }

    tensor
}

/// `(offset, scale)` such that normalized = (x - offset) * scale.
fn normalization_coefficients(raw: &[u8], normalization: Normalization) -> (f32, f32) {
    match normalization {
        Normalization::UnitRange => (0.0, 1.0 / 255.0),
        Normalization::Symmetric => (127.5, 1.0 / 128.0),
        Normalization::Standardize => {
            if raw.is_empty() {
                return (0.0, 1.0);
            }
            let n = raw.len() as f64;
            let mean = raw.iter().map(|&p| p as f64).sum::<f64>() / n;
            let var = raw.iter().map(|&p| (p as f64 - mean).powi(2)).sum::<f64>() / n;
            let std = var.sqrt().max(1.0 / n.sqrt());
            (mean as f32, (1.0 / std) as f32)
        }
    }
}
