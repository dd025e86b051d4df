//! Error taxonomy for the ETL and training jobs.

use polars::prelude::PolarsError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Download or storage read/write failure.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// A logical endpoint could not be resolved to a physical name.
    #[error("Configuration unavailable: {0}")]
    ConfigUnavailable(String),

    #[error("Schema error: {0}")]
    Schema(String),

    /// Nothing left to train or evaluate on after cleaning.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Model fit failed: {0}")]
    Fit(String),

    #[error("Model artifact error: {0}")]
    Artifact(String),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn source_unavailable(context: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable(context.to_string())
    }

    pub fn config_unavailable(context: impl std::fmt::Display) -> Self {
        Self::ConfigUnavailable(context.to_string())
    }
}
