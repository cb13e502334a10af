use anyhow::{Context, Result};
use faceverify_core::{CropParams, DetectorParams, EmbedderParams, VerifyParams};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration: defaults, then an optional TOML file, then
/// `FACEVERIFY_*` environment variables. Command-line flags are applied last
/// by the caller.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding the cascade and embedding model.
    pub model_dir: Option<PathBuf>,
    /// Explicit cascade path, overrides `model_dir`.
    pub cascade: Option<PathBuf>,
    /// Explicit ONNX model path, overrides `model_dir`.
    pub model: Option<PathBuf>,
    pub verify: VerifySection,
    pub detector: DetectorParams,
    pub crop: CropParams,
    pub embedder: EmbedderParams,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifySection {
    /// Euclidean distance below which two faces match.
    pub threshold: f32,
}

impl Default for VerifySection {
    fn default() -> Self {
        Self { threshold: VerifyParams::default().threshold }
    }
}

impl Config {
    /// Load from an optional TOML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    /// Override fields from `FACEVERIFY_*` variables provided by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEVERIFY_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FACEVERIFY_CASCADE") {
            self.cascade = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FACEVERIFY_MODEL") {
            self.model = Some(PathBuf::from(v));
        }

        set_parsed(&lookup, "FACEVERIFY_THRESHOLD", &mut self.verify.threshold);
        set_parsed(&lookup, "FACEVERIFY_SCALE_FACTOR", &mut self.detector.scale_factor);
        set_parsed(&lookup, "FACEVERIFY_MIN_NEIGHBORS", &mut self.detector.min_neighbors);
        set_parsed(&lookup, "FACEVERIFY_MIN_SIZE", &mut self.detector.min_size);
        set_parsed(&lookup, "FACEVERIFY_CROP_SCALE", &mut self.crop.scale_factor);
        set_parsed(&lookup, "FACEVERIFY_CROP_SIZE", &mut self.crop.target_size);
        set_parsed(&lookup, "FACEVERIFY_INTRA_THREADS", &mut self.embedder.intra_threads);
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(faceverify_core::default_model_dir)
    }

    pub fn cascade_path(&self) -> PathBuf {
        self.cascade
            .clone()
            .unwrap_or_else(|| self.model_dir().join(faceverify_core::DEFAULT_CASCADE_FILE))
    }

    pub fn model_path(&self) -> PathBuf {
        self.model
            .clone()
            .unwrap_or_else(|| self.model_dir().join(faceverify_core::DEFAULT_MODEL_FILE))
    }

    pub fn verify_params(&self) -> VerifyParams {
        VerifyParams {
            threshold: self.verify.threshold,
            detector: self.detector.clone(),
            crop: self.crop.clone(),
        }
    }
}

fn set_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment value"),
        }
    }
}
