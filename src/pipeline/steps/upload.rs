//! Cloud upload step.
//!
//! Assets are normally uploaded at creation time, so this usually just
//! verifies the existing object and refreshes its signed URL.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::error::Result;
use crate::pipeline::registry::StepRunner;
use crate::pipeline::types::{metadata_map, PipelineContext, PipelineResult};
use crate::pipeline::PipelineDeps;
use crate::storage::ObjectStore;

pub struct CloudUploadStep {
    deps: Arc<PipelineDeps>,
}

impl CloudUploadStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl StepRunner for CloudUploadStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        if let (Some(gcs_uri), Some(object_name)) =
            (ctx.asset.gcs_uri.as_deref(), ctx.asset.object_name.as_deref())
        {
            let bucket = ctx.asset.bucket.as_deref();
            let signed_url = self.deps.blobs.signed_read_url(object_name, bucket, None)?;
            info!(asset_id = %ctx.asset.id, gcs_uri = %gcs_uri, "asset already in cloud storage");

            return Ok(PipelineResult::succeeded(metadata_map([
                ("gcsUri", json!(gcs_uri)),
                ("signedUrl", json!(signed_url)),
                (
                    "bucket",
                    json!(bucket.unwrap_or_else(|| self.deps.blobs.bucket())),
                ),
                ("objectName", json!(object_name)),
            ])));
        }

        super::require_local_file(&ctx.asset_path)?;
        let data = tokio::fs::read(&ctx.asset_path).await?;

        let object_name = format!("assets/{}/{}", ctx.asset.id, ctx.asset.file_name);
        let stored = self
            .deps
            .blobs
            .upload(data.into(), &object_name, &ctx.asset.mime_type)
            .await?;
        let signed_url = self
            .deps
            .blobs
            .signed_read_url(&stored.object_name, Some(&stored.bucket), None)?;

        Ok(PipelineResult::succeeded(metadata_map([
            ("gcsUri", json!(stored.gcs_uri)),
            ("signedUrl", json!(signed_url)),
            ("bucket", json!(stored.bucket)),
            ("objectName", json!(stored.object_name)),
        ])))
    }
}
