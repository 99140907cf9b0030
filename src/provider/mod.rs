//! Artifact providers — materialize `(model, version)` bytes locally.
//!
//! A provider copies one model version from the shared artifact repository
//! into the node's model directory. Providers write to a temp sibling of the
//! destination and atomically rename into place, so the engine never
//! observes a half-fetched model and a failed fetch leaves no partial tree.

mod disk;
mod object;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

pub use disk::DiskProvider;
pub use object::ObjectStoreProvider;

use crate::config::ModelProviderConfig;
use crate::{ModelKey, Result};

/// A source of model artifacts.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Materialize `key` into `dest` (the final `{name}/{version}` path)
    /// and return the number of bytes written.
    ///
    /// `dest`'s parent directory must exist. Any pre-existing content at
    /// `dest` is replaced.
    async fn fetch(&self, key: &ModelKey, dest: &Path) -> Result<u64>;
}

/// Build a provider from its config variant.
pub fn from_config(config: &ModelProviderConfig) -> Result<Arc<dyn ModelProvider>> {
    match config {
        ModelProviderConfig::Disk { base_dir } => {
            Ok(Arc::new(DiskProvider::new(base_dir.clone())))
        }
        ModelProviderConfig::S3 {
            bucket,
            base_path,
            region,
            endpoint,
        } => Ok(Arc::new(ObjectStoreProvider::s3(
            bucket,
            base_path,
            region.as_deref(),
            endpoint.as_deref(),
        )?)),
    }
}

/// Swap a freshly written temp tree into `dest`.
///
/// `dest` is removed first if a stale tree is present; rename is atomic on
/// the same filesystem, which the temp sibling guarantees.
pub(crate) async fn commit_fetch(tmp: &Path, dest: &Path) -> std::io::Result<()> {
    if tokio::fs::metadata(dest).await.is_ok() {
        tokio::fs::remove_dir_all(dest).await?;
    }
    tokio::fs::rename(tmp, dest).await
}

/// Temp sibling path for an in-flight fetch of `dest`.
pub(crate) fn staging_path(dest: &Path) -> std::path::PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    dest.with_file_name(format!(".{name}.tmp"))
}

/// Remove a stale staging tree left behind by an interrupted fetch.
pub(crate) async fn clear_staging(tmp: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(tmp).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
