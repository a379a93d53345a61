//! Frame sampling step: evenly spaced frames for filmstrip and preview.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::registry::StepRunner;
use crate::pipeline::types::{metadata_map, PipelineContext, PipelineResult};
use crate::pipeline::PipelineDeps;
use crate::storage::ObjectStore;

const FRAME_COUNT: usize = 20;
/// Height of each sampled frame; width preserves the aspect ratio.
const FRAME_HEIGHT: u32 = 120;
const PER_FRAME_TIMEOUT: Duration = Duration::from_secs(15);

/// Midpoint timestamps: `duration * (i + 0.5) / count`.
pub(crate) fn sample_timestamps(duration: f64, count: usize) -> Vec<f64> {
    (0..count)
        .map(|i| duration * (i as f64 + 0.5) / count as f64)
        .collect()
}

pub struct FrameSamplingStep {
    deps: Arc<PipelineDeps>,
}

impl FrameSamplingStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl StepRunner for FrameSamplingStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        super::require_local_file(&ctx.asset_path)?;

        let state = self
            .deps
            .state
            .get(&ctx.user_id, &ctx.project_id, &ctx.asset.id)
            .await?;
        let Some(duration) = super::known_duration(ctx.asset.duration, &state) else {
            return Ok(PipelineResult::failed(
                "no duration available for frame sampling",
                Default::default(),
            ));
        };

        let source = ctx.asset_path.to_string_lossy().to_string();
        let scale = format!("scale=-1:{FRAME_HEIGHT}:force_original_aspect_ratio=decrease");
        let mut object_names: Vec<String> = Vec::new();

        for (i, ts) in sample_timestamps(duration, FRAME_COUNT).into_iter().enumerate() {
            let out = tempfile::Builder::new()
                .suffix(".jpg")
                .tempfile()
                .map_err(|e| crate::error::AppError::Internal(format!("temp file: {e}")))?;

            let ts_arg = format!("{ts:.3}");
            let extract = super::run_ffmpeg(
                &[
                    "-y",
                    "-ss",
                    &ts_arg,
                    "-i",
                    &source,
                    "-vframes",
                    "1",
                    "-vf",
                    &scale,
                    "-q:v",
                    "5",
                    &out.path().to_string_lossy(),
                ],
                PER_FRAME_TIMEOUT,
            )
            .await;

            // Losing individual frames is tolerable; losing all of them is not.
            if let Err(e) = extract {
                warn!(asset_id = %ctx.asset.id, frame = i, error = %e, "frame extraction failed");
                continue;
            }

            let data = match tokio::fs::read(out.path()).await {
                Ok(data) if !data.is_empty() => data,
                _ => continue,
            };

            let object_name = format!("assets/{}/frames/frame_{i:02}.jpg", ctx.asset.id);
            self.deps
                .blobs
                .upload(data.into(), &object_name, "image/jpeg")
                .await?;
            object_names.push(object_name);
        }

        if object_names.is_empty() {
            return Ok(PipelineResult::failed(
                "no frames extracted",
                Default::default(),
            ));
        }

        info!(asset_id = %ctx.asset.id, frames = object_names.len(), "frame sampling complete");

        Ok(PipelineResult::succeeded(metadata_map([
            ("frameCount", json!(object_names.len())),
            ("duration", json!(duration)),
            ("objectNames", json!(object_names)),
        ])))
    }
}
