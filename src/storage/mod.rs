//! Blob storage gateway.

pub mod gcs;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{AppError, Result};

pub use gcs::GcsClient;

/// Location of an uploaded object.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredObject {
    pub gcs_uri: String,
    pub bucket: String,
    pub object_name: String,
}

/// Split a `gs://bucket/object` URI into `(bucket, object_name)`.
pub fn parse_gcs_uri(gcs_uri: &str) -> Result<(String, String)> {
    let rest = gcs_uri
        .strip_prefix("gs://")
        .ok_or_else(|| AppError::Validation(format!("invalid GCS URI: {gcs_uri}")))?;

    match rest.split_once('/') {
        Some((bucket, object)) if !bucket.is_empty() && !object.is_empty() => {
            Ok((bucket.to_string(), object.to_string()))
        }
        _ => Err(AppError::Validation(format!("invalid GCS URI: {gcs_uri}"))),
    }
}

/// Narrow interface over the object store. Concurrent callers from the worker
/// pool interleave safely; implementations hold no per-call state.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload bytes under `object_name` in the default asset bucket.
    async fn upload(&self, data: Bytes, object_name: &str, mime_type: &str)
        -> Result<StoredObject>;

    /// Download a `gs://` URI. Rejects anything else with a validation error.
    async fn download(&self, gcs_uri: &str) -> Result<Bytes>;

    /// V4 signed GET URL. `bucket` defaults to the asset bucket, `ttl` to the
    /// configured lifetime.
    fn signed_read_url(
        &self,
        object_name: &str,
        bucket: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<String>;

    /// V4 signed PUT URL with a content-type binding.
    fn signed_write_url(
        &self,
        object_name: &str,
        content_type: &str,
        ttl: Option<Duration>,
    ) -> Result<String>;

    /// Delete an object. `Ok(true)` when deleted, `Ok(false)` when it did not
    /// exist; any other failure is an error.
    async fn delete(&self, gcs_uri: &str) -> Result<bool>;

    /// Whether the object exists.
    async fn exists(&self, gcs_uri: &str) -> Result<bool>;

    /// The default asset bucket.
    fn bucket(&self) -> &str;
}
