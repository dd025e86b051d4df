//! Resolution of logical endpoints (raw bucket, processed bucket) to physical
//! bucket names.
//!
//! Jobs receive a [`ConfigSource`] at construction and resolve everything they
//! need before touching storage, so a missing value aborts the run early.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PipelineError, Result};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Endpoint {
    RawBucket,
    ProcessedBucket,
}

impl Endpoint {
    /// Name of the infrastructure output holding this endpoint.
    pub fn output_name(&self) -> &'static str {
        match self {
            Endpoint::RawBucket => "raw_data_bucket_name",
            Endpoint::ProcessedBucket => "processed_data_bucket_name",
        }
    }

    pub fn env_var(&self) -> &'static str {
        match self {
            Endpoint::RawBucket => "TRIP_RAW_BUCKET",
            Endpoint::ProcessedBucket => "TRIP_PROCESSED_BUCKET",
        }
    }
}

pub trait ConfigSource {
    fn resolve(&self, endpoint: Endpoint) -> Result<String>;
}

impl<T: ConfigSource + ?Sized> ConfigSource for &T {
    fn resolve(&self, endpoint: Endpoint) -> Result<String> {
        (**self).resolve(endpoint)
    }
}

impl<T: ConfigSource + ?Sized> ConfigSource for Box<T> {
    fn resolve(&self, endpoint: Endpoint) -> Result<String> {
        (**self).resolve(endpoint)
    }
}

#[derive(Deserialize)]
struct TfState {
    #[serde(default)]
    outputs: HashMap<String, TfOutput>,
}

#[derive(Deserialize)]
struct TfOutput {
    value: serde_json::Value,
}

/// Reads bucket names from the `outputs` section of a Terraform state file.
#[derive(Clone, Debug)]
pub struct TerraformState {
    path: PathBuf,
}

impl TerraformState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<TfState> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            PipelineError::config_unavailable(format!(
                "failed to read state file {}: {e}",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            PipelineError::config_unavailable(format!(
                "failed to parse state file {}: {e}",
                self.path.display()
            ))
        })
    }
}

impl ConfigSource for TerraformState {
    fn resolve(&self, endpoint: Endpoint) -> Result<String> {
        let state = self.load()?;
        let name = endpoint.output_name();
        let output = state.outputs.get(name).ok_or_else(|| {
            PipelineError::config_unavailable(format!(
                "output '{name}' missing from {}",
                self.path.display()
            ))
        })?;

        match output.value.as_str() {
            Some(value) if !value.is_empty() => Ok(value.to_string()),
            _ => Err(PipelineError::config_unavailable(format!(
                "output '{name}' is not a non-empty string"
            ))),
        }
    }
}

/// Reads bucket names from `TRIP_RAW_BUCKET` / `TRIP_PROCESSED_BUCKET`.
#[derive(Clone, Debug, Default)]
pub struct EnvConfig;

impl ConfigSource for EnvConfig {
    fn resolve(&self, endpoint: Endpoint) -> Result<String> {
        match std::env::var(endpoint.env_var()) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(PipelineError::config_unavailable(format!(
                "{} is not set",
                endpoint.env_var()
            ))),
        }
    }
}

/// Fixed endpoint map.
#[derive(Clone, Debug, Default)]
pub struct StaticConfig {
    values: HashMap<Endpoint, String>,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, endpoint: Endpoint, value: impl Into<String>) -> Self {
        self.values.insert(endpoint, value.into());
        self
    }
}

impl ConfigSource for StaticConfig {
    fn resolve(&self, endpoint: Endpoint) -> Result<String> {
        self.values.get(&endpoint).cloned().ok_or_else(|| {
            PipelineError::config_unavailable(format!(
                "no value for {}",
                endpoint.output_name()
            ))
        })
    }
}

/// Tries `primary` first and falls back to `secondary` when it cannot resolve.
#[derive(Clone, Debug)]
pub struct Fallback<A, B> {
    primary: A,
    secondary: B,
}

impl<A, B> Fallback<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }
}

impl<A: ConfigSource, B: ConfigSource> ConfigSource for Fallback<A, B> {
    fn resolve(&self, endpoint: Endpoint) -> Result<String> {
        match self.primary.resolve(endpoint) {
            Ok(value) => Ok(value),
            Err(PipelineError::ConfigUnavailable(first)) => {
                self.secondary.resolve(endpoint).map_err(|e| match e {
                    PipelineError::ConfigUnavailable(second) => {
                        PipelineError::ConfigUnavailable(format!("{first}; {second}"))
                    }
                    other => other,
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn state_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn terraform_state_resolves_both_buckets() {
        let file = state_file(
            r#"{"version": 4, "outputs": {
                "raw_data_bucket_name": {"value": "trips-raw", "type": "string"},
                "processed_data_bucket_name": {"value": "trips-processed", "type": "string"}
            }}"#,
        );
        let cfg = TerraformState::new(file.path());

        assert_eq!(cfg.resolve(Endpoint::RawBucket).unwrap(), "trips-raw");
        assert_eq!(
            cfg.resolve(Endpoint::ProcessedBucket).unwrap(),
            "trips-processed"
        );
    }

    #[test]
    fn missing_state_file_is_config_unavailable() {
        let cfg = TerraformState::new("/nonexistent/terraform.tfstate");
        let err = cfg.resolve(Endpoint::RawBucket).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigUnavailable(_)));
    }

    #[test]
    fn missing_or_non_string_output_is_config_unavailable() {
        let file = state_file(r#"{"outputs": {"raw_data_bucket_name": {"value": 12}}}"#);
        let cfg = TerraformState::new(file.path());

        assert!(matches!(
            cfg.resolve(Endpoint::RawBucket),
            Err(PipelineError::ConfigUnavailable(_))
        ));
        assert!(matches!(
            cfg.resolve(Endpoint::ProcessedBucket),
            Err(PipelineError::ConfigUnavailable(_))
        ));
    }

    #[test]
    fn malformed_json_is_config_unavailable() {
        let file = state_file("{ not json");
        let cfg = TerraformState::new(file.path());
        assert!(matches!(
            cfg.resolve(Endpoint::RawBucket),
            Err(PipelineError::ConfigUnavailable(_))
        ));
    }

    #[test]
    fn fallback_uses_secondary_when_primary_missing() {
        let primary = StaticConfig::new().with(Endpoint::RawBucket, "from-primary");
        let secondary = StaticConfig::new()
            .with(Endpoint::RawBucket, "from-secondary")
            .with(Endpoint::ProcessedBucket, "processed");
        let cfg = Fallback::new(primary, secondary);

        assert_eq!(cfg.resolve(Endpoint::RawBucket).unwrap(), "from-primary");
        assert_eq!(cfg.resolve(Endpoint::ProcessedBucket).unwrap(), "processed");
    }

    #[test]
    fn fallback_reports_both_failures() {
        let cfg = Fallback::new(StaticConfig::new(), StaticConfig::new());
        match cfg.resolve(Endpoint::ProcessedBucket) {
            Err(PipelineError::ConfigUnavailable(msg)) => assert!(msg.contains(';')),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
