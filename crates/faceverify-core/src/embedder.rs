//! Pretrained face embedding network via ONNX Runtime.
//!
//! Maps a normalized RGB face crop to a fixed-length embedding whose
//! Euclidean distance reflects identity similarity.

use crate::crop::{self, FaceCrop, Normalization, TensorLayout};
use crate::types::Embedding;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — export the embedding network to ONNX and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("crop is {actual:?} but the model expects {expected:?} (width, height)")]
    InputSizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// How crops are fed to the network and how its output is post-processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderParams {
    pub layout: TensorLayout,
    pub normalization: Normalization,
    /// Scale embeddings to unit length before comparing them.
    pub l2_normalize: bool,
    pub intra_threads: usize,
}

impl Default for EmbedderParams {
    fn default() -> Self {
        Self {
            layout: TensorLayout::Nhwc,
            normalization: Normalization::UnitRange,
            l2_normalize: true,
            intra_threads: 2,
        }
    }
}

/// Pluggable embedding backend.
pub trait FaceEmbedder {
    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedderError>;
}

/// Embedding network loaded from an ONNX file.
pub struct OnnxEmbedder {
    session: Session,
    params: EmbedderParams,
    /// Static (width, height) of the network input, when the model declares one.
    input_size: Option<(u32, u32)>,
    model_version: Option<String>,
}

impl OnnxEmbedder {
    /// Load the embedding network from the given path.
    pub fn load(model_path: &Path, params: EmbedderParams) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(params.intra_threads.max(1))?
            .commit_from_file(model_path)?;

        let input_size = session
            .inputs()
            .first()
            .and_then(|input| input.dtype().tensor_shape())
            .and_then(|shape| spatial_size(shape, params.layout));

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            ?input_size,
            "loaded embedding model"
        );

        let model_version = model_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());

        Ok(Self { session, params, input_size, model_version })
    }

    pub fn input_size(&self) -> Option<(u32, u32)> {
        self.input_size
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed(&mut self, crop: &FaceCrop) -> Result<Embedding, EmbedderError> {
        check_input_size(self.input_size, crop.image.dimensions())?;

        let input = crop::to_tensor(crop, self.params.layout, self.params.normalization);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        finish_embedding(raw.to_vec(), self.params.l2_normalize, self.model_version.clone())
    }
}

/// Spatial (width, height) of a 4-D input shape; dynamic dims yield `None`.
fn spatial_size(shape: &[i64], layout: TensorLayout) -> Option<(u32, u32)> {
    if shape.len() != 4 {
        return None;
    }
    let (h, w) = match layout {
        TensorLayout::Nhwc => (shape[1], shape[2]),
        TensorLayout::Nchw => (shape[2], shape[3]),
    };
    (h > 0 && w > 0).then_some((w as u32, h as u32))
}

/// A static model input must match the crop exactly; dynamic inputs take any size.
fn check_input_size(expected: Option<(u32, u32)>, actual: (u32, u32)) -> Result<(), EmbedderError> {
    match expected {
        Some(expected) if expected != actual => {
            Err(EmbedderError::InputSizeMismatch { expected, actual })
        }
        _ => Ok(()),
    }
}

fn finish_embedding(
    raw: Vec<f32>,
    l2_normalize: bool,
    model_version: Option<String>,
) -> Result<Embedding, EmbedderError> {
    if raw.is_empty() {
        return Err(EmbedderError::InferenceFailed("model returned an empty embedding".into()));
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(EmbedderError::InferenceFailed("embedding contains non-finite values".into()));
    }

    let embedding = Embedding { values: raw, model_version };
    Ok(if l2_normalize { embedding.normalized() } else { embedding })
}
