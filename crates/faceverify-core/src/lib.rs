//! faceverify-core — Face verification engine.
//!
//! Detects a single frontal face per image with a Haar feature cascade,
//! crops and normalizes it, embeds it with a pretrained ONNX network and
//! compares embeddings by Euclidean distance.

pub mod cascade;
pub mod crop;
pub mod detector;
pub mod embedder;
pub mod image_io;
pub mod types;
pub mod verifier;

pub use cascade::{CascadeError, HaarCascade};
pub use crop::{CropError, CropParams, FaceCrop, Normalization, TensorLayout};
pub use detector::{CascadeDetector, DetectorError, DetectorParams, FaceDetector};
pub use embedder::{EmbedderError, EmbedderParams, FaceEmbedder, OnnxEmbedder};
pub use types::{BoundingBox, Embedding, Rect};
pub use verifier::{Comparison, FaceVerifier, VerifyError, VerifyParams, Verification};

use std::path::PathBuf;

/// File name of the default frontal-face cascade inside the model directory.
pub const DEFAULT_CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
/// File name of the default embedding network inside the model directory.
pub const DEFAULT_MODEL_FILE: &str = "facenet.onnx";

/// Directory searched for the cascade and embedding model.
///
/// `$FACEVERIFY_MODEL_DIR`, else `$XDG_DATA_HOME/faceverify/models`,
/// else `~/.local/share/faceverify/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACEVERIFY_MODEL_DIR") {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceverify")
        .join("models")
}
