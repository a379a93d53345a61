//! Gemini multimodal analysis step.
//!
//! Stages the asset through the Files API and asks a category-specific
//! prompt. Keys rotate on quota exhaustion; when every key is exhausted for
//! a model, the next model in the priority list is tried.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::keys::is_quota_exhausted;
use crate::pipeline::registry::StepRunner;
use crate::pipeline::types::{metadata_map, PipelineContext, PipelineResult};
use crate::pipeline::PipelineDeps;
use crate::services::gemini::AnalysisRequest;

/// Extension → MIME fallback for generic upload types.
const EXTENSION_MIME: &[(&str, &str)] = &[
    // Video
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("avi", "video/x-msvideo"),
    ("mkv", "video/x-matroska"),
    ("webm", "video/webm"),
    ("wmv", "video/x-ms-wmv"),
    ("flv", "video/x-flv"),
    ("m4v", "video/mp4"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("3gp", "video/3gpp"),
    ("3gpp", "video/3gpp"),
    // Audio
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("aac", "audio/aac"),
    ("m4a", "audio/mp4"),
    ("flac", "audio/flac"),
    ("ogg", "audio/ogg"),
    ("wma", "audio/x-ms-wma"),
    ("aiff", "audio/aiff"),
    ("aif", "audio/aiff"),
    // Image
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("heic", "image/heic"),
    ("heif", "image/heif"),
    ("tiff", "image/tiff"),
    ("tif", "image/tiff"),
];

/// Resolve a usable MIME type, replacing `application/octet-stream` with a
/// guess from the file extension where possible.
pub fn resolve_mime_type(mime_type: &str, file_name: &str) -> String {
    if !mime_type.is_empty() && mime_type != "application/octet-stream" {
        return mime_type.to_string();
    }

    if let Some((_, ext)) = file_name.rsplit_once('.') {
        let ext = ext.to_lowercase();
        if let Some((_, mime)) = EXTENSION_MIME.iter().find(|(e, _)| *e == ext) {
            return mime.to_string();
        }
    }

    mime_type.to_string()
}

fn media_category(mime_type: &str) -> &'static str {
    if mime_type.starts_with("video/") {
        "video"
    } else if mime_type.starts_with("audio/") {
        "audio"
    } else if mime_type.starts_with("image/") {
        "image"
    } else {
        "media"
    }
}

/// Category-specific analysis prompt.
pub fn build_analysis_prompt(category: &str, asset_name: &str) -> String {
    match category {
        "video" => format!(
            r#"You are analyzing a video named "{asset_name}". Provide an extremely thorough temporal analysis.

Your analysis MUST include:

1. **Overview**: Brief summary of the video content, purpose, and overall narrative/subject.

2. **Scene-by-Scene Breakdown**: For EACH distinct scene or segment:
   - Timestamp range (e.g., 0:00-0:15)
   - Detailed description of visual content
   - Camera movements/angles (pan, zoom, static, etc.)
   - Transitions between scenes (cut, fade, dissolve, etc.)
   - Any on-screen text, graphics, or overlays

3. **Visual Elements**: Color palette and lighting over time, composition and framing, visual style, visible effects or post-processing.

4. **Audio Elements**: Dialogue or narration (summarize key points), music genre and mood, sound effects and ambient audio.

5. **Key Moments**: The most significant moments with timestamps.

6. **Technical Observations**: Estimated quality/resolution, aspect ratio, frame rate characteristics, visible artifacts.

7. **Content Tags**: Relevant tags for searchability (subjects, actions, settings, moods).

Be specific with timestamps and descriptions. This analysis will be used for video editing and searching."#
        ),
        "audio" => format!(
            r#"You are analyzing an audio file named "{asset_name}". Provide an extremely thorough temporal analysis.

Your analysis MUST include:

1. **Overview**: Type of audio content (speech, music, sound effects, podcast, etc.) and general summary.

2. **Temporal Breakdown**: Segment-by-segment analysis with timestamp ranges and transitions.

3. **For Speech/Voice Content**: Transcription of key sections, speaker identification, tone and delivery, topics with timestamps.

4. **For Music**: Genre and style, tempo and rhythm, instruments, mood progression, structure with timestamps.

5. **Sound Design**: Sound effects with timestamps, ambient audio, mixing characteristics.

6. **Technical Observations**: Quality assessment, volume levels and dynamics, artifacts or noise.

7. **Content Tags**: Relevant searchable tags.

Be specific with timestamps. This analysis will be used for audio editing and searching."#
        ),
        "image" => format!(
            r#"You are analyzing an image named "{asset_name}". Provide an extremely thorough analysis.

Your analysis MUST include:

1. **Overview**: Brief summary of what the image depicts and its likely purpose.

2. **Main Subject(s)**: Detailed description, position and scale within the frame, actions or poses.

3. **Composition**: Framing, leading lines and visual flow, foreground/midground/background layers, negative space.

4. **Visual Style**: Color palette, lighting direction and mood, contrast and exposure, photographic or artistic style.

5. **Background & Setting**: Environment, time of day or season if apparent, location context clues.

6. **Text & Graphics**: Transcribe visible text; describe graphics, logos, or overlays.

7. **Technical Observations**: Estimated resolution/quality, focus and depth of field, visible artifacts or editing.

8. **Mood & Emotion**: Overall feeling the image conveys.

9. **Content Tags**: Comprehensive list of searchable tags.

This analysis will be used for asset management and searching."#
        ),
        _ => format!(
            r#"You are analyzing a media file named "{asset_name}". Provide a comprehensive analysis covering:
- What the content depicts or contains
- Notable features and details
- Quality assessment
- Relevant searchable tags

Be thorough and specific. This analysis will be used for asset management."#
        ),
    }
}

pub struct GeminiAnalysisStep {
    deps: Arc<PipelineDeps>,
}

impl GeminiAnalysisStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl StepRunner for GeminiAnalysisStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        let keys = &self.deps.keys;
        if !keys.is_initialized() {
            keys.init(self.deps.config.gemini_api_keys.as_deref());
        }
        if keys.current().is_none() {
            return Ok(PipelineResult::failed(
                "GEMINI_API_KEY / GEMINI_API_KEYS is not configured",
                Default::default(),
            ));
        }

        let state = self
            .deps
            .state
            .get(&ctx.user_id, &ctx.project_id, &ctx.asset.id)
            .await?;
        let gcs_uri = super::upload_gcs_uri(&state).ok_or_else(|| {
            AppError::Validation("cloud upload must complete before analysis".to_string())
        })?;

        let mime_type = resolve_mime_type(&ctx.asset.mime_type, &ctx.asset.file_name);
        let category = media_category(&mime_type);
        let request = AnalysisRequest {
            gcs_uri: gcs_uri.clone(),
            mime_type: mime_type.clone(),
            prompt: build_analysis_prompt(category, &ctx.asset.name),
            display_name: ctx.asset.name.clone(),
        };

        info!(
            asset_id = %ctx.asset.id,
            category = category,
            mime_type = %mime_type,
            "starting analysis"
        );

        let key_attempts = keys.count().max(1);
        let mut last_error: Option<AppError> = None;
        let mut outcome = None;
        let mut used_model = None;

        'models: for model_id in &self.deps.config.analysis_model_ids {
            for _ in 0..key_attempts {
                let Some(api_key) = keys.current() else {
                    return Ok(PipelineResult::failed(
                        "GEMINI_API_KEY / GEMINI_API_KEYS is not configured",
                        Default::default(),
                    ));
                };

                match self.deps.analyzer.analyze(&request, &api_key, model_id).await {
                    Ok(result) => {
                        outcome = Some(result);
                        used_model = Some(model_id.clone());
                        break 'models;
                    }
                    Err(e) if is_quota_exhausted(&e) => {
                        warn!(model = %model_id, error = %e, "quota exhausted, rotating key");
                        last_error = Some(e);
                        keys.rotate();
                    }
                    // Any non-quota error fails the step immediately.
                    Err(e) => return Err(e),
                }
            }
        }

        let Some(outcome) = outcome else {
            // Every model in the priority list exhausted: fail with the last
            // error, leaving the rotator where it is.
            return Err(last_error
                .unwrap_or_else(|| AppError::Internal("analysis failed".to_string())));
        };

        if outcome.analysis.is_empty() {
            return Ok(PipelineResult::failed(
                "no analysis generated",
                Default::default(),
            ));
        }

        info!(
            asset_id = %ctx.asset.id,
            tokens = outcome.total_tokens.unwrap_or_default(),
            "analysis complete"
        );

        Ok(PipelineResult::succeeded(metadata_map([
            ("analysis", json!(outcome.analysis)),
            ("category", json!(category)),
            ("promptTokens", json!(outcome.prompt_tokens)),
            ("completionTokens", json!(outcome.completion_tokens)),
            ("totalTokens", json!(outcome.total_tokens)),
            ("model", json!(used_model)),
            ("gcsUri", json!(gcs_uri)),
        ])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::StepStatus;
    use crate::test_support::{harness, seed_step, test_context, video_asset};

    async fn seeded(fx: &crate::test_support::TestHarness) {
        seed_step(
            &fx.deps,
            "a1",
            "cloud-upload",
            StepStatus::Succeeded,
            json!({"gcsUri": "gs://test-bucket/assets/a1/clip.mp4"}),
        )
        .await;
    }

    #[test]
    fn mime_resolution_falls_back_to_extension() {
        assert_eq!(resolve_mime_type("video/mp4", "x.mp4"), "video/mp4");
        assert_eq!(
            resolve_mime_type("application/octet-stream", "clip.MOV"),
            "video/quicktime"
        );
        assert_eq!(
            resolve_mime_type("application/octet-stream", "mystery.zzz"),
            "application/octet-stream"
        );
        assert_eq!(resolve_mime_type("", "song.flac"), "audio/flac");
    }

    #[test]
    fn prompts_are_category_specific() {
        assert!(build_analysis_prompt("video", "clip.mp4").contains("Scene-by-Scene"));
        assert!(build_analysis_prompt("audio", "song.mp3").contains("Temporal Breakdown"));
        assert!(build_analysis_prompt("image", "pic.png").contains("Main Subject"));
        assert!(build_analysis_prompt("media", "blob.bin").contains("comprehensive analysis"));
        assert!(build_analysis_prompt("video", "my clip").contains("my clip"));
    }

    #[tokio::test]
    async fn happy_path_uses_the_first_key_and_model() {
        let fx = harness();
        seeded(&fx).await;
        fx.analyzer.push_ok("A detailed description.");

        let step = GeminiAnalysisStep::new(fx.deps.clone());
        let result = step.run(&test_context(video_asset("a1"))).await.unwrap();

        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.metadata["analysis"], "A detailed description.");
        assert_eq!(result.metadata["category"], "video");
        assert_eq!(result.metadata["model"], "model-a");
        assert_eq!(fx.analyzer.call_log(), vec![("k1".to_string(), "model-a".to_string())]);
    }

    #[tokio::test]
    async fn quota_errors_rotate_through_keys_then_models() {
        let fx = harness();
        seeded(&fx).await;
        // Three keys exhaust on model-a, then the first key succeeds on
        // model-b.
        fx.analyzer.push_quota_error();
        fx.analyzer.push_quota_error();
        fx.analyzer.push_quota_error();
        fx.analyzer.push_ok("Recovered on the fallback model.");

        let step = GeminiAnalysisStep::new(fx.deps.clone());
        let result = step.run(&test_context(video_asset("a1"))).await.unwrap();

        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.metadata["model"], "model-b");
        let log = fx.analyzer.call_log();
        assert_eq!(
            log,
            vec![
                ("k1".to_string(), "model-a".to_string()),
                ("k2".to_string(), "model-a".to_string()),
                ("k3".to_string(), "model-a".to_string()),
                // Index wrapped around after three rotations.
                ("k1".to_string(), "model-b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn exhausting_every_model_fails_with_the_last_error() {
        let fx = harness();
        seeded(&fx).await;
        // 3 keys x 2 models, all quota-exhausted.
        for _ in 0..6 {
            fx.analyzer.push_quota_error();
        }

        let step = GeminiAnalysisStep::new(fx.deps.clone());
        let err = step.run(&test_context(video_asset("a1"))).await.unwrap_err();
        assert!(crate::keys::is_quota_exhausted(&err));
        assert_eq!(fx.analyzer.call_log().len(), 6);
    }

    #[tokio::test]
    async fn non_quota_errors_fail_immediately() {
        let fx = harness();
        seeded(&fx).await;
        fx.analyzer
            .push(Err(AppError::Backend("500 internal".to_string())));

        let step = GeminiAnalysisStep::new(fx.deps.clone());
        let err = step.run(&test_context(video_asset("a1"))).await.unwrap_err();
        assert!(err.to_string().contains("500"));
        // No rotation, no retries.
        assert_eq!(fx.analyzer.call_log().len(), 1);
        assert_eq!(fx.deps.keys.current().as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn missing_upload_is_a_validation_error() {
        let fx = harness();
        let step = GeminiAnalysisStep::new(fx.deps.clone());
        let err = step.run(&test_context(video_asset("a1"))).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn no_keys_configured_fails_the_step() {
        let fx = harness();
        seeded(&fx).await;
        fx.deps.keys.init(None);

        let step = GeminiAnalysisStep::new(fx.deps.clone());
        let result = step.run(&test_context(video_asset("a1"))).await.unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("not configured"));
    }
}
