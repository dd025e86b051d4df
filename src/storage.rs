//! Object storage collaborator.
//!
//! Jobs only see the [`ObjectStore`] contract: list, get and put raw bytes,
//! plus the provided parquet read/write helpers and the latest-object policy.
//! [`FsObjectStore`] maps buckets onto directories under a root.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use polars::prelude::*;
use tracing::debug;

use crate::error::{PipelineError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub last_modified: SystemTime,
    pub size: u64,
}

/// Pick the object with the greatest last-modified timestamp. Ties go to the
/// greatest key so the choice does not depend on listing order.
pub fn select_latest(objects: &[ObjectMeta]) -> Option<&ObjectMeta> {
    objects
        .iter()
        .max_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        })
}

pub trait ObjectStore {
    fn list(&self, bucket: &str) -> Result<Vec<ObjectMeta>>;

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch the most recently modified object in `bucket`.
    fn get_latest(&self, bucket: &str) -> Result<(String, Vec<u8>)> {
        let objects = self.list(bucket)?;
        let latest = select_latest(&objects).ok_or_else(|| {
            PipelineError::source_unavailable(format!("no objects found in bucket '{bucket}'"))
        })?;
        let bytes = self.get(bucket, &latest.key)?;
        Ok((latest.key.clone(), bytes))
    }

    /// Read a parquet object into a dataframe.
    fn read(&self, bucket: &str, key: &str) -> Result<DataFrame> {
        let bytes = self.get(bucket, key)?;
        read_parquet_bytes(bytes).map_err(|e| {
            PipelineError::source_unavailable(format!("failed to read {bucket}/{key}: {e}"))
        })
    }

    /// Serialize `df` as parquet and store it under `key`.
    fn write(&self, df: &mut DataFrame, bucket: &str, key: &str) -> Result<()> {
        let bytes = write_parquet_bytes(df)?;
        self.put(bucket, key, &bytes)
    }
}

impl<T: ObjectStore + ?Sized> ObjectStore for &T {
    fn list(&self, bucket: &str) -> Result<Vec<ObjectMeta>> {
        (**self).list(bucket)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        (**self).get(bucket, key)
    }

    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
        (**self).put(bucket, key, bytes)
    }
}

pub fn read_parquet_bytes(bytes: Vec<u8>) -> Result<DataFrame> {
    Ok(ParquetReader::new(Cursor::new(bytes)).finish()?)
}

pub fn write_parquet_bytes(df: &mut DataFrame) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ParquetWriter::new(&mut buf).finish(df)?;
    Ok(buf)
}

/// Filesystem-backed store: `<root>/<bucket>/<key>`.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(PipelineError::source_unavailable(format!(
                "invalid object key '{key}'"
            )));
        }
        Ok(key
            .split('/')
            .fold(self.bucket_dir(bucket), |path, part| path.join(part)))
    }

    fn collect(dir: &Path, prefix: &str, out: &mut Vec<ObjectMeta>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // in-flight writes
            if name.starts_with('.') {
                continue;
            }
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            let meta = entry.metadata()?;
            if meta.is_dir() {
                Self::collect(&entry.path(), &key, out)?;
            } else {
                out.push(ObjectMeta {
                    key,
                    last_modified: meta.modified()?,
                    size: meta.len(),
                });
            }
        }
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn list(&self, bucket: &str) -> Result<Vec<ObjectMeta>> {
        let dir = self.bucket_dir(bucket);
        let mut objects = Vec::new();
        Self::collect(&dir, "", &mut objects).map_err(|e| {
            PipelineError::source_unavailable(format!(
                "failed to list bucket '{bucket}' at {}: {e}",
                dir.display()
            ))
        })?;
        debug!("listed {} objects in bucket {}", objects.len(), bucket);
        Ok(objects)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path).map_err(|e| {
            PipelineError::source_unavailable(format!("failed to read {}: {e}", path.display()))
        })
    }

    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = hidden_sibling(&path);
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| {
            PipelineError::source_unavailable(format!("failed to write {}: {e}", path.display()))
        })?;
        debug!("wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }
}

/// `dir/name` -> `dir/.name.tmp`
pub(crate) fn hidden_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}
