//! Filesystem artifact provider.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{clear_staging, commit_fetch, staging_path, ModelProvider};
use crate::{ModelKey, MuninError, Result};

/// Reads model trees from a base directory on a local or mounted
/// filesystem: `{base_dir}/{name}/{version}/…`.
pub struct DiskProvider {
    base_dir: PathBuf,
}

impl DiskProvider {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }
}

#[async_trait]
impl ModelProvider for DiskProvider {
    async fn fetch(&self, key: &ModelKey, dest: &Path) -> Result<u64> {
        let source = self.base_dir.join(&key.name).join(&key.version);
        if !source.is_dir() {
            return Err(MuninError::FetchFailed {
                model: key.to_string(),
                reason: format!("no artifact at {}", source.display()),
            });
        }

        let tmp = staging_path(dest);
        clear_staging(&tmp).await?;

        debug!(model = %key, source = %source.display(), "copying artifact");
        let copy_src = source.clone();
        let copy_dst = tmp.clone();
        let bytes = tokio::task::spawn_blocking(move || copy_tree(&copy_src, &copy_dst))
            .await
            .map_err(|e| MuninError::FetchFailed {
                model: key.to_string(),
                reason: format!("copy task failed: {e}"),
            })?
            .map_err(|e| MuninError::FetchFailed {
                model: key.to_string(),
                reason: e.to_string(),
            })?;

        commit_fetch(&tmp, dest).await?;
        Ok(bytes)
    }
}

/// Recursively copy a directory tree, returning total bytes copied.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<u64> {
    std::fs::create_dir_all(dst)?;
    let mut total = 0;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            total += std::fs::copy(entry.path(), &target)?;
        }
        // Symlinks and specials in the artifact repo are skipped.
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_preserves_subpaths() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("variables")).unwrap();
        std::fs::write(src.path().join("saved_model.pb"), b"graph").unwrap();
        std::fs::write(src.path().join("variables/weights"), b"0123456789").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let out = dst.path().join("copy");
        let bytes = copy_tree(src.path(), &out).unwrap();

        assert_eq!(bytes, 15);
        assert!(out.join("saved_model.pb").is_file());
        assert!(out.join("variables/weights").is_file());
    }
}
