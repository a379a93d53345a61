//! Audio extraction step.
//!
//! Video and audio containers sometimes use codecs the speech service does
//! not decode reliably, so the audio track is re-encoded to 16 kHz mono FLAC
//! and uploaded for the transcription step to consume.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::registry::StepRunner;
use crate::pipeline::types::{metadata_map, PipelineContext, PipelineResult};
use crate::pipeline::PipelineDeps;
use crate::probe::extract_metadata;
use crate::storage::ObjectStore;

const FFMPEG_TIMEOUT: Duration = Duration::from_secs(300);

pub struct AudioExtractStep {
    deps: Arc<PipelineDeps>,
}

impl AudioExtractStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

async fn has_audio_stream(path: &Path) -> bool {
    match extract_metadata(path).await {
        Ok(metadata) => metadata.audio_codec.is_some(),
        Err(_) => false,
    }
}

async fn extract_flac(source: &Path, output: &Path) -> Result<()> {
    super::run_ffmpeg(
        &[
            "-y",
            "-i",
            &source.to_string_lossy(),
            "-vn",
            "-acodec",
            "flac",
            "-ac",
            "1",
            "-ar",
            "16000",
            &output.to_string_lossy(),
        ],
        FFMPEG_TIMEOUT,
    )
    .await?;

    let size = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(crate::error::AppError::Internal(
            "ffmpeg produced an empty FLAC file".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl StepRunner for AudioExtractStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        super::require_local_file(&ctx.asset_path)?;

        if !has_audio_stream(&ctx.asset_path).await {
            info!(asset_id = %ctx.asset.id, "no audio stream, skipping audio extract");
            return Ok(PipelineResult::succeeded(metadata_map([
                ("skipped", json!(true)),
                ("reason", json!("no_audio")),
            ])));
        }

        let flac = tempfile::Builder::new()
            .suffix(".flac")
            .tempfile()
            .map_err(|e| crate::error::AppError::Internal(format!("temp file: {e}")))?;

        if let Err(e) = extract_flac(&ctx.asset_path, flac.path()).await {
            warn!(asset_id = %ctx.asset.id, error = %e, "audio extract failed");
            return Ok(PipelineResult::failed(
                e.to_string(),
                metadata_map([("skipped", json!(false))]),
            ));
        }

        let data = tokio::fs::read(flac.path()).await?;
        let destination = format!("assets/{}/audio_for_transcription.flac", ctx.asset.id);
        let stored = self
            .deps
            .blobs
            .upload(data.into(), &destination, "audio/flac")
            .await?;

        info!(asset_id = %ctx.asset.id, gcs_uri = %stored.gcs_uri, "uploaded transcription audio");

        Ok(PipelineResult::succeeded(metadata_map([
            ("audioForTranscriptionGcsUri", json!(stored.gcs_uri)),
            ("bucket", json!(stored.bucket)),
            ("objectName", json!(stored.object_name)),
        ])))
    }
}
