//! Pluggable blob storage for backup outputs.

pub mod local;
pub mod s3;

use crate::config::StorageKind;
use crate::error::Error;
use crate::{Result, Secrets};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Storage calls are retried on transient failures up to 5 times with
/// exponential backoff capped at 30 seconds.
pub const STORAGE_RETRIES: u32 = 5;
pub const STORAGE_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Opaque blob store. Names may contain `/` separators; a backup occupies
/// one name prefix. Implementations must never expose a half-written blob
/// under its final name, and `delete` also clears any partial state left by
/// an interrupted `put`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store a blob, returning its final location for logging.
    async fn put(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String>;

    async fn get(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// Fetch a whole blob into memory.
pub async fn read_all(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut reader = storage.get(name).await?;
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .await
        .map_err(|e| Error::StorageUnavailable(format!("read {}: {}", name, e)))?;
    Ok(data)
}

pub async fn build_storage(kind: StorageKind, secrets: &Secrets) -> Result<Arc<dyn Storage>> {
    match kind {
        StorageKind::Local => {
            let root = secrets
                .local_path
                .clone()
                .ok_or_else(|| Error::ConfigInvalid("LOCAL_PATH is not set".into()))?;
            Ok(Arc::new(local::LocalStorage::new(root)))
        }
        StorageKind::Aws => {
            let bucket = secrets
                .s3_bucket
                .clone()
                .ok_or_else(|| Error::ConfigInvalid("AWS_S3_BUCKET is not set".into()))?;
            let store = s3::S3Storage::new(bucket, secrets.s3_prefix.clone()).await;
            Ok(Arc::new(store))
        }
    }
}
