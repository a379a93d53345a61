//! Waveform extraction step.
//!
//! Decodes the audio track to 16-bit mono PCM at 8 kHz, normalises to
//! `[0, 1]` and buckets the samples into 200 peaks. Assets without audio get
//! a silent waveform so the UI can still render a track lane.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::error::Result;
use crate::pipeline::registry::StepRunner;
use crate::pipeline::types::{metadata_map, PipelineContext, PipelineResult};
use crate::pipeline::PipelineDeps;
use crate::probe::extract_metadata;

pub const WAVEFORM_SAMPLE_COUNT: usize = 200;
const FFMPEG_TIMEOUT: Duration = Duration::from_secs(60);

pub struct WaveformStep {
    deps: Arc<PipelineDeps>,
}

impl WaveformStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

/// Decode raw s16le bytes into samples.
pub(crate) fn decode_s16le(raw: &[u8]) -> Vec<i16> {
    raw.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Normalise to `[0, 1]` and reduce to `WAVEFORM_SAMPLE_COUNT` peaks, taking
/// the maximum within each bucket.
pub(crate) fn bucket_peaks(samples: &[i16]) -> Vec<f64> {
    if samples.is_empty() {
        return vec![0.0; WAVEFORM_SAMPLE_COUNT];
    }

    let max_val = samples
        .iter()
        .map(|s| (*s as i32).abs())
        .max()
        .unwrap_or(0)
        .max(1) as f64;

    let step = (samples.len() / WAVEFORM_SAMPLE_COUNT).max(1);
    (0..WAVEFORM_SAMPLE_COUNT)
        .map(|i| {
            let start = i * step;
            if start >= samples.len() {
                return 0.0;
            }
            let end = (start + step).min(samples.len());
            samples[start..end]
                .iter()
                .map(|s| (*s as i32).abs() as f64 / max_val)
                .fold(0.0, f64::max)
        })
        .collect()
}

#[async_trait]
impl StepRunner for WaveformStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        super::require_local_file(&ctx.asset_path)?;

        let state = self
            .deps
            .state
            .get(&ctx.user_id, &ctx.project_id, &ctx.asset.id)
            .await?;
        let Some(duration) = super::known_duration(ctx.asset.duration, &state) else {
            return Ok(PipelineResult::failed(
                "no duration available for waveform",
                Default::default(),
            ));
        };

        let has_audio = match extract_metadata(&ctx.asset_path).await {
            Ok(metadata) => metadata.audio_codec.is_some(),
            Err(_) => false,
        };
        if !has_audio {
            info!(asset_id = %ctx.asset.id, "no audio stream, emitting silent waveform");
            return Ok(PipelineResult::succeeded(metadata_map([
                ("samples", json!(vec![0.0; WAVEFORM_SAMPLE_COUNT])),
                ("duration", json!(duration)),
            ])));
        }

        let raw = match super::run_ffmpeg(
            &[
                "-y",
                "-i",
                &ctx.asset_path.to_string_lossy(),
                "-vn",
                "-acodec",
                "pcm_s16le",
                "-ac",
                "1",
                "-ar",
                "8000",
                "-f",
                "s16le",
                "pipe:1",
            ],
            FFMPEG_TIMEOUT,
        )
        .await
        {
            Ok(raw) => raw,
            Err(e) => return Ok(PipelineResult::failed(e.to_string(), Default::default())),
        };

        let peaks = bucket_peaks(&decode_s16le(&raw));
        info!(asset_id = %ctx.asset.id, samples = peaks.len(), "waveform extracted");

        Ok(PipelineResult::succeeded(metadata_map([
            ("samples", json!(peaks)),
            ("duration", json!(duration)),
        ])))
    }
}
