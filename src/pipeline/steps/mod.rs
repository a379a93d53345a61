//! Pipeline step implementations and registration.

pub mod audio_extract;
pub mod detection;
pub mod frame_sampling;
pub mod gemini_analysis;
pub mod image_convert;
pub mod metadata;
pub mod thumbnail;
pub mod transcode;
pub mod transcription;
pub mod upload;
pub mod waveform;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;

use crate::error::{AppError, Result};
use crate::models::AssetType;
use crate::pipeline::registry::{StepDefinition, StepRegistry};
use crate::pipeline::types::PipelineState;
use crate::pipeline::PipelineDeps;

pub use transcode::run_transcode_for_asset;

/// Register the full step set, in execution order. Must run before the first
/// task is processed.
pub fn register_all(registry: &StepRegistry, deps: &Arc<PipelineDeps>) {
    let video = || Some(vec![AssetType::Video]);
    let video_audio = || Some(vec![AssetType::Video, AssetType::Audio]);
    let video_image = || Some(vec![AssetType::Video, AssetType::Image]);
    let visual_media = || Some(vec![AssetType::Video, AssetType::Audio, AssetType::Image]);

    registry.register(StepDefinition {
        id: "metadata",
        label: "Extract metadata",
        description: "Extract file metadata using ffprobe.",
        auto_start: true,
        supported_types: None,
        runner: Arc::new(metadata::MetadataStep::new()),
    });
    registry.register(StepDefinition {
        id: "cloud-upload",
        label: "Upload to Cloud Storage",
        description: "Copies the original asset into the configured bucket.",
        auto_start: true,
        supported_types: None,
        runner: Arc::new(upload::CloudUploadStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "audio-extract",
        label: "Extract audio for transcription",
        description: "Extract audio to FLAC so Speech-to-Text can transcribe reliably.",
        auto_start: true,
        supported_types: video_audio(),
        runner: Arc::new(audio_extract::AudioExtractStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "thumbnail",
        label: "Extract thumbnail",
        description: "Extract first frame as thumbnail image.",
        auto_start: true,
        supported_types: video_image(),
        runner: Arc::new(thumbnail::ThumbnailStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "image-convert",
        label: "Convert image",
        description: "Convert HEIC/HEIF images to PNG for compatibility.",
        auto_start: true,
        supported_types: Some(vec![AssetType::Image]),
        runner: Arc::new(image_convert::ImageConvertStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "frame-sampling",
        label: "Sample frames",
        description: "Extract video frames at even intervals for preview and filmstrip.",
        auto_start: true,
        supported_types: video(),
        runner: Arc::new(frame_sampling::FrameSamplingStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "waveform",
        label: "Extract waveform",
        description: "Extract audio waveform peak data.",
        auto_start: true,
        supported_types: video_audio(),
        runner: Arc::new(waveform::WaveformStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "shot-detection",
        label: "Detect shot changes",
        description: "Extract shot boundaries with the Video Intelligence API.",
        auto_start: true,
        supported_types: video(),
        runner: Arc::new(detection::ShotDetectionStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "label-detection",
        label: "Detect labels",
        description: "Identify objects, locations and activities with the Video Intelligence API.",
        auto_start: true,
        supported_types: video(),
        runner: Arc::new(detection::LabelDetectionStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "person-detection",
        label: "Detect people",
        description: "Detect people with body landmarks and attributes.",
        auto_start: true,
        supported_types: video(),
        runner: Arc::new(detection::PersonDetectionStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "face-detection",
        label: "Detect faces",
        description: "Analyze the video for faces with the Video Intelligence API.",
        auto_start: true,
        supported_types: video(),
        runner: Arc::new(detection::FaceDetectionStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "transcode",
        label: "Transcode video",
        description: "Transcode to MP4 via the Cloud Transcoder API and repoint the asset.",
        auto_start: true,
        supported_types: video(),
        runner: Arc::new(transcode::TranscodeStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "transcription",
        label: "Transcribe audio/video",
        description: "Generate captions with Cloud Speech-to-Text.",
        auto_start: true,
        supported_types: video_audio(),
        runner: Arc::new(transcription::TranscriptionStep::new(deps.clone())),
    });
    registry.register(StepDefinition {
        id: "gemini-analysis",
        label: "Gemini AI Analysis",
        description: "Comprehensive multimodal analysis for detailed asset descriptions.",
        auto_start: true,
        supported_types: visual_media(),
        runner: Arc::new(gemini_analysis::GeminiAnalysisStep::new(deps.clone())),
    });
}

/// Run ffmpeg with the given arguments, capturing stdout.
pub(crate) async fn run_ffmpeg(args: &[&str], timeout: Duration) -> Result<Vec<u8>> {
    let child = Command::new("ffmpeg")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let child = match child {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::Internal(
                "ffmpeg not found, install ffmpeg".to_string(),
            ));
        }
        Err(e) => return Err(AppError::Internal(format!("ffmpeg spawn failed: {e}"))),
    };

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| AppError::Internal("ffmpeg timed out".to_string()))?
        .map_err(|e| AppError::Internal(format!("ffmpeg failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Internal(format!(
            "ffmpeg failed: {}",
            stderr.chars().take(500).collect::<String>()
        )));
    }

    Ok(output.stdout)
}

/// The cloud-upload step's stored `gcsUri` for an asset, if present.
pub(crate) fn upload_gcs_uri(state: &PipelineState) -> Option<String> {
    state
        .step_metadata("cloud-upload")
        .and_then(|m| m.get("gcsUri"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Known duration of an asset: the record's value when positive, otherwise
/// whatever the metadata step measured.
pub(crate) fn known_duration(
    asset_duration: Option<f64>,
    state: &PipelineState,
) -> Option<f64> {
    if let Some(duration) = asset_duration {
        if duration > 0.0 {
            return Some(duration);
        }
    }
    state
        .step_metadata("metadata")
        .and_then(|m| m.get("duration"))
        .and_then(Value::as_f64)
        .filter(|d| *d > 0.0)
}

/// Require the asset's local file to exist.
pub(crate) fn require_local_file(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || !path.exists() {
        return Err(AppError::NotFound(format!(
            "asset file not found: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Create a named temp file with the given suffix and write `data` to it.
pub(crate) fn write_temp(data: &[u8], suffix: &str) -> Result<tempfile::NamedTempFile> {
    let file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .map_err(|e| AppError::Internal(format!("temp file: {e}")))?;
    std::fs::write(file.path(), data)?;
    Ok(file)
}

/// Re-probe a derived output (transcoded MP4 or converted PNG) and fold the
/// measured fields into the asset record and the metadata step.
///
/// Repairs dimension extraction failures on containers ffprobe reads
/// unreliably (some MOV and HEIC inputs). Best effort: any failure is logged
/// and swallowed.
pub(crate) async fn reextract_metadata(
    deps: &PipelineDeps,
    user_id: &str,
    project_id: &str,
    asset_id: &str,
    derived_gcs_uri: &str,
    suffix: &str,
    marker: &str,
) -> Option<serde_json::Map<String, Value>> {
    use crate::storage::ObjectStore;

    let outcome: Result<serde_json::Map<String, Value>> = async {
        let data = deps.blobs.download(derived_gcs_uri).await?;
        let file = write_temp(&data, suffix)?;
        let probed = crate::probe::extract_metadata(file.path()).await?;

        let mut updates = serde_json::Map::new();
        if let Some(v) = probed.width {
            updates.insert("width".to_string(), v.into());
        }
        if let Some(v) = probed.height {
            updates.insert("height".to_string(), v.into());
        }
        if let Some(v) = probed.duration {
            updates.insert("duration".to_string(), v.into());
        }
        if let Some(v) = probed.codec {
            updates.insert("videoCodec".to_string(), v.into());
        }
        if let Some(v) = probed.audio_codec {
            updates.insert("audioCodec".to_string(), v.into());
        }
        if let Some(v) = probed.sample_rate {
            updates.insert("sampleRate".to_string(), v.into());
        }
        if let Some(v) = probed.channels {
            updates.insert("channels".to_string(), v.into());
        }
        if let Some(v) = probed.bitrate {
            updates.insert("bitrate".to_string(), v.into());
        }
        if let Some(v) = probed.format_name {
            updates.insert("formatName".to_string(), v.into());
        }
        if let Some(v) = probed.size {
            updates.insert("fileSize".to_string(), v.into());
        }
        Ok(updates)
    }
    .await;

    let updates = match outcome {
        Ok(updates) if !updates.is_empty() => updates,
        Ok(_) => return None,
        Err(e) => {
            tracing::warn!(
                asset_id = %asset_id,
                error = %e,
                "metadata re-extraction after repoint failed"
            );
            return None;
        }
    };

    if let Err(e) = deps
        .assets
        .update(user_id, project_id, asset_id, Value::Object(updates.clone()))
        .await
    {
        tracing::warn!(asset_id = %asset_id, error = %e, "asset update after re-extraction failed");
    }

    let mut step_metadata = updates.clone();
    step_metadata.insert(marker.to_string(), Value::Bool(true));
    let mut step = crate::pipeline::types::StepState::idle("metadata", "Extract metadata");
    step.status = crate::pipeline::types::StepStatus::Succeeded;
    step.metadata = step_metadata;
    if let Err(e) = deps
        .state
        .update_step(user_id, project_id, asset_id, step)
        .await
    {
        tracing::warn!(asset_id = %asset_id, error = %e, "metadata step rewrite failed");
    }

    Some(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{StepState, StepStatus};
    use serde_json::json;

    fn state_with_step(id: &str, status: StepStatus, metadata: Value) -> PipelineState {
        let mut step = StepState::idle(id, id);
        step.status = status;
        step.metadata = metadata.as_object().cloned().unwrap_or_default();
        PipelineState {
            asset_id: "a1".to_string(),
            steps: vec![step],
            updated_at: crate::models::now_iso(),
        }
    }

    #[test]
    fn upload_uri_comes_from_cloud_upload_metadata() {
        let state = state_with_step(
            "cloud-upload",
            StepStatus::Succeeded,
            json!({"gcsUri": "gs://b/assets/a1/f.mp4"}),
        );
        assert_eq!(
            upload_gcs_uri(&state).as_deref(),
            Some("gs://b/assets/a1/f.mp4")
        );

        let empty = state_with_step("metadata", StepStatus::Succeeded, json!({}));
        assert!(upload_gcs_uri(&empty).is_none());
    }

    #[test]
    fn duration_prefers_the_asset_record() {
        let state = state_with_step(
            "metadata",
            StepStatus::Succeeded,
            json!({"duration": 12.0}),
        );
        assert_eq!(known_duration(Some(30.0), &state), Some(30.0));
        assert_eq!(known_duration(None, &state), Some(12.0));
        assert_eq!(known_duration(Some(0.0), &state), Some(12.0));

        let empty = state_with_step("metadata", StepStatus::Succeeded, json!({}));
        assert_eq!(known_duration(Some(0.0), &empty), None);
    }

    #[test]
    fn write_temp_preserves_suffix() {
        let file = write_temp(b"data", ".flac").unwrap();
        assert!(file.path().to_string_lossy().ends_with(".flac"));
        assert_eq!(std::fs::read(file.path()).unwrap(), b"data");
    }
}
