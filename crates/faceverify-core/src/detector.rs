//! Face detection seam and the Haar cascade detector.

use crate::cascade::{self, HaarCascade};
use crate::types::BoundingBox;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum DetectorError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({0}), expected exactly one")]
    MultipleFaces(usize),
    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
}

/// Pyramid and grouping parameters for cascade detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Pyramid step between scales, must be > 1.
    pub scale_factor: f32,
    /// Raw hits a cluster needs beyond the first to count as a face.
    pub min_neighbors: u32,
    /// Smallest window side considered, in pixels.
    pub min_size: u32,
    /// Largest window side considered, in pixels.
    pub max_size: Option<u32>,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.5,
            min_neighbors: 5,
            min_size: 30,
            max_size: None,
        }
    }
}

impl DetectorParams {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !(self.scale_factor.is_finite() && self.scale_factor > 1.0) {
            return Err(DetectorError::InvalidParams(format!(
                "scale_factor must be a finite value > 1, got {}",
                self.scale_factor
            )));
        }
        if let Some(max) = self.max_size {
            if max < self.min_size {
                return Err(DetectorError::InvalidParams(format!(
                    "max_size {max} is below min_size {}",
                    self.min_size
                )));
            }
        }
        Ok(())
    }
}

/// Pluggable face detection backend.
pub trait FaceDetector {
    /// Detect faces in a grayscale image, strongest first.
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox>;
}

/// Viola-Jones detector over a [`HaarCascade`].
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: DetectorParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: DetectorParams) -> Result<Self, DetectorError> {
        params.validate()?;
        Ok(Self { cascade, params })
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let hits = self.cascade.detect_multi_scale(gray, &self.params);
        let groups = cascade::group_rectangles(&hits, self.params.min_neighbors, cascade::GROUP_EPS);

        let mut faces: Vec<BoundingBox> = groups
            .into_iter()
            .map(|(rect, neighbors)| BoundingBox::from_rect(rect, neighbors as f32))
            .collect();
        faces.sort_by(strongest_first);

        tracing::debug!(raw = hits.len(), faces = faces.len(), "cascade detection");
        faces
    }
}

/// Higher neighbor count first, larger box on ties.
fn strongest_first(a: &BoundingBox, b: &BoundingBox) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.area().total_cmp(&a.area()))
}

/// Detect exactly one face, failing on zero or several.
pub fn detect_single(
    detector: &dyn FaceDetector,
    gray: &GrayImage,
) -> Result<BoundingBox, DetectorError> {
    let mut faces = detector.detect(gray);
    match faces.len() {
        0 => Err(DetectorError::NoFaceDetected),
        1 => Ok(faces.remove(0)),
        n => Err(DetectorError::MultipleFaces(n)),
    }
}
