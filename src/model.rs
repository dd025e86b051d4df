//! Fitted trip-duration regression and its on-disk artifact.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::storage::hidden_sibling;

pub const MODEL_FILE_NAME: &str = "model.bin";
const FORMAT_VERSION: u32 = 1;

/// Linear model `duration = intercept + coefficients . features`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripDurationModel {
    format_version: u32,
    pub features: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl TripDurationModel {
    pub fn new(features: Vec<String>, coefficients: Vec<f64>, intercept: f64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            features,
            coefficients,
            intercept,
        }
    }

    /// Predict durations for each row of `x` (columns in `features` order).
    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        x.dot(&ArrayView1::from(self.coefficients.as_slice())) + self.intercept
    }

    pub fn predict_one(&self, row: &[f64]) -> f64 {
        row.iter()
            .zip(&self.coefficients)
            .map(|(x, c)| x * c)
            .sum::<f64>()
            + self.intercept
    }

    /// Write the artifact as `<dir>/model.bin`, creating `dir` if needed.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(MODEL_FILE_NAME);
        let bytes = bincode::serialize(self)
            .map_err(|e| PipelineError::Artifact(format!("failed to serialize model: {e}")))?;

        let tmp = hidden_sibling(&path);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let model: Self = bincode::deserialize(&bytes).map_err(|e| {
            PipelineError::Artifact(format!("failed to decode {}: {e}", path.display()))
        })?;

        if model.format_version != FORMAT_VERSION {
            return Err(PipelineError::Artifact(format!(
                "unsupported model format version {}",
                model.format_version
            )));
        }
        if model.coefficients.len() != model.features.len() {
            return Err(PipelineError::Artifact(format!(
                "model has {} coefficients for {} features",
                model.coefficients.len(),
                model.features.len()
            )));
        }
        Ok(model)
    }
}
