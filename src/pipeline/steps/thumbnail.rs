//! Thumbnail extraction step.
//!
//! Images get a resized cover (longest side capped at 400 px); videos get
//! their first frame. The JPEG is stored at a stable object name; signed URLs
//! are minted on demand by readers since they expire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::error::Result;
use crate::models::AssetType;
use crate::pipeline::registry::StepRunner;
use crate::pipeline::types::{metadata_map, PipelineContext, PipelineResult};
use crate::pipeline::PipelineDeps;
use crate::storage::ObjectStore;

const FFMPEG_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IMAGE_DIMENSION: u32 = 400;

pub struct ThumbnailStep {
    deps: Arc<PipelineDeps>,
}

impl ThumbnailStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl StepRunner for ThumbnailStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        super::require_local_file(&ctx.asset_path)?;

        let source = ctx.asset_path.to_string_lossy().to_string();
        let data = if ctx.asset_type == AssetType::Image {
            // Resize through a temp file: some encoders refuse pipe output.
            let out = tempfile::Builder::new()
                .suffix(".jpg")
                .tempfile()
                .map_err(|e| crate::error::AppError::Internal(format!("temp file: {e}")))?;
            let scale = format!(
                "scale='min({MAX_IMAGE_DIMENSION},iw)':'min({MAX_IMAGE_DIMENSION},ih)':force_original_aspect_ratio=decrease"
            );
            super::run_ffmpeg(
                &[
                    "-y",
                    "-i",
                    &source,
                    "-vf",
                    &scale,
                    "-q:v",
                    "5",
                    &out.path().to_string_lossy(),
                ],
                FFMPEG_TIMEOUT,
            )
            .await?;
            tokio::fs::read(out.path()).await?
        } else {
            super::run_ffmpeg(
                &[
                    "-y", "-i", &source, "-ss", "0", "-vframes", "1", "-f", "image2", "-q:v",
                    "5", "pipe:1",
                ],
                FFMPEG_TIMEOUT,
            )
            .await?
        };

        if data.is_empty() {
            return Ok(PipelineResult::failed(
                "no thumbnail data produced",
                Default::default(),
            ));
        }

        let object_name = format!("assets/{}/thumbnail.jpg", ctx.asset.id);
        let stored = self
            .deps
            .blobs
            .upload(data.into(), &object_name, "image/jpeg")
            .await?;

        info!(asset_id = %ctx.asset.id, "thumbnail uploaded");

        Ok(PipelineResult::succeeded(metadata_map([
            ("objectName", json!(object_name)),
            ("gcsUri", json!(stored.gcs_uri)),
        ])))
    }
}
