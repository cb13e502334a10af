//! Face verification: detect, crop, embed, and threshold the distance.

use crate::cascade::{CascadeError, HaarCascade};
use crate::crop::{self, CropError, CropParams, FaceCrop};
use crate::detector::{self, CascadeDetector, DetectorError, DetectorParams, FaceDetector};
use crate::embedder::{EmbedderError, EmbedderParams, FaceEmbedder, OnnxEmbedder};
use crate::image_io::{self, ImageError};
use crate::types::{BoundingBox, DimensionMismatch, Embedding};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("image error: {0}")]
    Image(#[from] ImageError),
    #[error("cascade error: {0}")]
    Cascade(#[from] CascadeError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("crop error: {0}")]
    Crop(#[from] CropError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("{0}")]
    Distance(#[from] DimensionMismatch),
    #[error("image {index}: {source}")]
    InImage {
        index: usize,
        #[source]
        source: Box<VerifyError>,
    },
}

impl VerifyError {
    fn in_image(self, index: usize) -> Self {
        VerifyError::InImage { index, source: Box::new(self) }
    }

    /// The underlying error, without the image annotation.
    pub fn root(&self) -> &VerifyError {
        match self {
            VerifyError::InImage { source, .. } => source.root(),
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyParams {
    /// Embeddings closer than this belong to the same person.
    pub threshold: f32,
    pub detector: DetectorParams,
    pub crop: CropParams,
}

impl Default for VerifyParams {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            detector: DetectorParams::default(),
            crop: CropParams::default(),
        }
    }
}

/// Distance between the faces of two images.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub first: FaceCrop,
    pub second: FaceCrop,
    pub embeddings: [Embedding; 2],
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct Verification {
    pub comparison: Comparison,
    pub threshold: f32,
    pub is_match: bool,
}

/// Two-image face verifier.
///
/// The cascade and the embedding network are loaded on first use and
/// reused for every later comparison.
pub struct FaceVerifier {
    params: VerifyParams,
    embedder_params: EmbedderParams,
    cascade_path: PathBuf,
    model_path: PathBuf,
    detector: Option<Box<dyn FaceDetector>>,
    embedder: Option<Box<dyn FaceEmbedder>>,
}

impl FaceVerifier {
    pub fn new(
        cascade_path: impl Into<PathBuf>,
        model_path: impl Into<PathBuf>,
        params: VerifyParams,
        embedder_params: EmbedderParams,
    ) -> Result<Self, VerifyError> {
        params.crop.validate()?;
        Ok(Self {
            params,
            embedder_params,
            cascade_path: cascade_path.into(),
            model_path: model_path.into(),
            detector: None,
            embedder: None,
        })
    }

    /// Build a verifier around ready-made components.
    pub fn with_components(
        detector: Box<dyn FaceDetector>,
        embedder: Box<dyn FaceEmbedder>,
        params: VerifyParams,
    ) -> Result<Self, VerifyError> {
        params.crop.validate()?;
        Ok(Self {
            params,
            embedder_params: EmbedderParams::default(),
            cascade_path: PathBuf::new(),
            model_path: PathBuf::new(),
            detector: Some(detector),
            embedder: Some(embedder),
        })
    }

    pub fn params(&self) -> &VerifyParams {
        &self.params
    }

    fn detector(&mut self) -> Result<&dyn FaceDetector, VerifyError> {
        let detector: Box<dyn FaceDetector> = match self.detector.take() {
            Some(detector) => detector,
            None => {
                let cascade = HaarCascade::load(&self.cascade_path)?;
                Box::new(CascadeDetector::new(cascade, self.params.detector.clone())?)
            }
        };
        Ok(&**self.detector.insert(detector))
    }

    fn embedder(&mut self) -> Result<&mut dyn FaceEmbedder, VerifyError> {
        let embedder: Box<dyn FaceEmbedder> = match self.embedder.take() {
            Some(embedder) => embedder,
            None => Box::new(OnnxEmbedder::load(&self.model_path, self.embedder_params.clone())?),
        };
        Ok(&mut **self.embedder.insert(embedder))
    }

    /// Every face the detector finds, without the single-face rule.
    pub fn detect_faces(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, VerifyError> {
        image_io::check_dimensions(image)?;
        let gray = image_io::to_grayscale(&image.to_rgb8());
        Ok(self.detector()?.detect(&gray))
    }

    /// Detect the single face of an image and crop it.
    pub fn process(&mut self, image: &DynamicImage) -> Result<FaceCrop, VerifyError> {
        image_io::check_dimensions(image)?;
        let rgb = image.to_rgb8();
        let gray = image_io::to_grayscale(&rgb);

        let face = detector::detect_single(self.detector()?, &gray)?;
        tracing::debug!(
            x = face.x,
            y = face.y,
            width = face.width,
            neighbors = face.confidence,
            "face detected"
        );

        Ok(crop::crop_face(&rgb, &face, &self.params.crop))
    }

    pub fn process_image(&mut self, path: &Path) -> Result<FaceCrop, VerifyError> {
        let image = image_io::load_image(path)?;
        self.process(&image)
    }

    /// Crop and embed the single face of an image file.
    pub fn embed_image(&mut self, path: &Path) -> Result<(FaceCrop, Embedding), VerifyError> {
        let crop = self.process_image(path)?;
        let embedding = self.embedder()?.embed(&crop)?;
        Ok((crop, embedding))
    }

    pub fn compare_images(
        &mut self,
        first: &DynamicImage,
        second: &DynamicImage,
    ) -> Result<Comparison, VerifyError> {
        self.detector()?;
        self.embedder()?;

        let first = self.process(first).map_err(|e| e.in_image(1))?;
        let second = self.process(second).map_err(|e| e.in_image(2))?;

        let embedder = self.embedder()?;
        let a = embedder.embed(&first).map_err(|e| VerifyError::from(e).in_image(1))?;
        let b = embedder.embed(&second).map_err(|e| VerifyError::from(e).in_image(2))?;

        let distance = a.euclidean_distance(&b)?;
        tracing::debug!(distance, dim = a.dim(), "embeddings compared");

        Ok(Comparison { first, second, embeddings: [a, b], distance })
    }

    /// Embedding distance between the faces in two image files.
    pub fn get_distance(&mut self, path1: &Path, path2: &Path) -> Result<Comparison, VerifyError> {
        let first = image_io::load_image(path1).map_err(|e| VerifyError::from(e).in_image(1))?;
        let second = image_io::load_image(path2).map_err(|e| VerifyError::from(e).in_image(2))?;
        self.compare_images(&first, &second)
    }

    pub fn verify(&mut self, path1: &Path, path2: &Path) -> Result<Verification, VerifyError> {
        let threshold = self.params.threshold;
        self.verify_with_threshold(path1, path2, threshold)
    }

    pub fn verify_with_threshold(
        &mut self,
        path1: &Path,
        path2: &Path,
        threshold: f32,
    ) -> Result<Verification, VerifyError> {
        let comparison = self.get_distance(path1, path2)?;
        Ok(decide(comparison, threshold))
    }

    pub fn verify_images(
        &mut self,
        first: &DynamicImage,
        second: &DynamicImage,
    ) -> Result<Verification, VerifyError> {
        let comparison = self.compare_images(first, second)?;
        Ok(decide(comparison, self.params.threshold))
    }
}

fn decide(comparison: Comparison, threshold: f32) -> Verification {
    let is_match = comparison.distance < threshold;
    tracing::info!(distance = comparison.distance, threshold, is_match, "verification complete");
    Verification { comparison, threshold, is_match }
}
