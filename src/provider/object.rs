//! Object-store artifact provider.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::debug;

use super::{clear_staging, commit_fetch, staging_path, ModelProvider};
use crate::{ModelKey, MuninError, Result};

/// Downloads model trees from an S3-compatible object store. Objects live
/// under `{base_path}/{name}/{version}/…`; subpaths are preserved on disk.
pub struct ObjectStoreProvider {
    store: Arc<dyn ObjectStore>,
    base_path: String,
}

impl ObjectStoreProvider {
    /// Build against an S3-compatible store. Credentials come from the
    /// environment (standard AWS variable set).
    pub fn s3(
        bucket: &str,
        base_path: &str,
        region: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = endpoint {
            // Custom endpoints (minio and friends) are commonly plain HTTP.
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        let store = builder.build().map_err(|e| {
            MuninError::Configuration(format!("object store init failed: {e}"))
        })?;
        Ok(Self {
            store: Arc::new(store),
            base_path: base_path.trim_matches('/').to_string(),
        })
    }

    /// For tests: wrap an existing store implementation.
    #[doc(hidden)]
    pub fn with_store(store: Arc<dyn ObjectStore>, base_path: &str) -> Self {
        Self {
            store,
            base_path: base_path.trim_matches('/').to_string(),
        }
    }

    fn prefix_for(&self, key: &ModelKey) -> ObjectPath {
        if self.base_path.is_empty() {
            ObjectPath::from(key.rel_path())
        } else {
            ObjectPath::from(format!("{}/{}", self.base_path, key.rel_path()))
        }
    }
}

#[async_trait]
impl ModelProvider for ObjectStoreProvider {
    async fn fetch(&self, key: &ModelKey, dest: &Path) -> Result<u64> {
        let prefix = self.prefix_for(key);
        let fetch_err = |reason: String| MuninError::FetchFailed {
            model: key.to_string(),
            reason,
        };

        let tmp = staging_path(dest);
        clear_staging(&tmp).await?;
        tokio::fs::create_dir_all(&tmp).await?;

        let mut total = 0u64;
        let mut objects = self.store.list(Some(&prefix));
        while let Some(meta) = objects
            .try_next()
            .await
            .map_err(|e| fetch_err(e.to_string()))?
        {
            let rel = meta
                .location
                .as_ref()
                .strip_prefix(prefix.as_ref())
                .map(|r| r.trim_start_matches('/'))
                .unwrap_or_default();
            if rel.is_empty() {
                continue;
            }
            let target = tmp.join(rel);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let bytes = self
                .store
                .get(&meta.location)
                .await
                .map_err(|e| fetch_err(e.to_string()))?
                .bytes()
                .await
                .map_err(|e| fetch_err(e.to_string()))?;
            total += bytes.len() as u64;
            tokio::fs::write(&target, &bytes).await?;
            debug!(model = %key, object = %meta.location, size = bytes.len(), "downloaded");
        }

        if total == 0 {
            clear_staging(&tmp).await?;
            return Err(fetch_err(format!("no objects under {prefix}")));
        }

        commit_fetch(&tmp, dest).await?;
        Ok(total)
    }
}
