//! Download of one month of raw trip data and upload into the raw bucket.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::config::{ConfigSource, Endpoint};
use crate::error::{PipelineError, Result};
use crate::storage::{hidden_sibling, ObjectStore};

const TRIP_DATA_BASE_URL: &str = "https://d37ci6vzurychx.cloudfront.net/trip-data";

/// Public URL of the yellow taxi parquet file for `year`-`month`.
pub fn monthly_data_url(year: i32, month: u32) -> String {
    format!("{TRIP_DATA_BASE_URL}/{}", monthly_file_name(year, month))
}

pub fn monthly_file_name(year: i32, month: u32) -> String {
    format!("yellow_tripdata_{year:04}-{month:02}.parquet")
}

/// Download `url` to `path`. An existing file at `path` is kept as is.
///
/// Returns whether a download happened.
pub fn download_file(url: &str, path: &Path) -> Result<bool> {
    if path.exists() {
        warn!("File {} already exists. Skipping download.", path.display());
        return Ok(false);
    }

    info!("Downloading data from {} to {}...", url, path.display());
    let response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| PipelineError::source_unavailable(format!("failed to download {url}: {e}")))?;
    let bytes = response
        .bytes()
        .map_err(|e| PipelineError::source_unavailable(format!("failed to download {url}: {e}")))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = hidden_sibling(path);
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;

    info!("Download complete ({} bytes).", bytes.len());
    Ok(true)
}

pub struct IngestJob<C, S> {
    config: C,
    store: S,
}

impl<C: ConfigSource, S: ObjectStore> IngestJob<C, S> {
    pub fn new(config: C, store: S) -> Self {
        Self { config, store }
    }

    /// Fetch `url` into `local_path` and upload it to the raw bucket under its
    /// file name. Returns the object key.
    pub fn run(&self, url: &str, local_path: &Path) -> Result<String> {
        let bucket = self.config.resolve(Endpoint::RawBucket)?;

        download_file(url, local_path)?;

        let key = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PipelineError::source_unavailable(format!(
                    "{} has no file name",
                    local_path.display()
                ))
            })?;
        let bytes = fs::read(local_path).map_err(|e| {
            PipelineError::source_unavailable(format!(
                "failed to read {}: {e}",
                local_path.display()
            ))
        })?;

        info!("Uploading {} to bucket {} as {}...", local_path.display(), bucket, key);
        self.store.put(&bucket, &key, &bytes)?;
        info!("Upload complete.");
        Ok(key)
    }
}
