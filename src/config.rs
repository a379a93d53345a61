//! Configuration for the asset service.
//!
//! Loaded from environment variables with the same names the deployment uses;
//! every knob has a sensible default except the GCP project and asset bucket.

use crate::error::{AppError, Result};

#[derive(Clone, Debug)]
pub struct Config {
    /// GCP project owning Firestore, Pub/Sub and the default buckets.
    pub google_project_id: String,
    /// Service account key: inline JSON, base64 JSON, or a filesystem path.
    pub service_account_key: Option<String>,

    /// Default bucket for asset uploads and derived artifacts.
    pub asset_bucket: String,
    /// Lifetime of signed read URLs, seconds.
    pub signed_url_ttl_secs: u64,

    /// Redis backing the task queue and task-status records.
    pub redis_url: String,
    /// Parallel task slots per worker process (clamped to 1..=32).
    pub worker_concurrency: usize,

    /// Transcoder API location and optional project override.
    pub transcoder_location: String,
    pub transcoder_project_id: Option<String>,
    /// Output height for transcodes; width auto-derives from the source.
    pub transcode_target_height: Option<i64>,

    /// Pub/Sub topic for terminal pipeline events.
    pub pipeline_event_topic: String,

    /// Comma-separated Gemini API keys fed to the rotator.
    pub gemini_api_keys: Option<String>,
    /// Model priority list for the analysis step.
    pub analysis_model_ids: Vec<String>,

    /// Speech-to-Text configuration.
    pub speech_project_id: Option<String>,
    pub speech_location: String,
    pub speech_recognizer_id: String,
    pub speech_model: String,
    pub speech_language_codes: Vec<String>,

    /// CloudConvert (image conversion).
    pub cloudconvert_api_key: Option<String>,
    pub cloudconvert_sandbox: bool,

    /// Skip face detection for clips longer than this, seconds.
    pub face_detection_max_duration_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let google_project_id = std::env::var("GOOGLE_PROJECT_ID")
            .map_err(|_| AppError::Validation("GOOGLE_PROJECT_ID not set".to_string()))?;
        let asset_bucket = std::env::var("ASSET_GCS_BUCKET")
            .map_err(|_| AppError::Validation("ASSET_GCS_BUCKET not set".to_string()))?;

        Ok(Config {
            google_project_id,
            service_account_key: std::env::var("GOOGLE_SERVICE_ACCOUNT_KEY").ok(),
            asset_bucket,
            signed_url_ttl_secs: std::env::var("ASSET_SIGNED_URL_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            worker_concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(4)
                .clamp(1, 32),
            transcoder_location: std::env::var("TRANSCODER_LOCATION")
                .unwrap_or_else(|_| "us-central1".to_string()),
            transcoder_project_id: std::env::var("TRANSCODER_PROJECT_ID").ok(),
            transcode_target_height: std::env::var("TRANSCODE_TARGET_HEIGHT")
                .ok()
                .and_then(|v| v.parse().ok()),
            pipeline_event_topic: std::env::var("PIPELINE_EVENT_TOPIC")
                .unwrap_or_else(|_| "gemini-pipeline-events".to_string()),
            gemini_api_keys: std::env::var("GEMINI_API_KEYS")
                .or_else(|_| std::env::var("GEMINI_API_KEY"))
                .ok(),
            analysis_model_ids: parse_csv(
                &std::env::var("GEMINI_ANALYSIS_MODEL_IDS")
                    .unwrap_or_else(|_| "gemini-3-pro-preview,gemini-2.5-pro".to_string()),
            ),
            speech_project_id: std::env::var("SPEECH_PROJECT_ID").ok(),
            speech_location: std::env::var("SPEECH_LOCATION")
                .unwrap_or_else(|_| "global".to_string()),
            speech_recognizer_id: std::env::var("SPEECH_RECOGNIZER_ID")
                .unwrap_or_else(|_| "_".to_string()),
            speech_model: std::env::var("SPEECH_MODEL").unwrap_or_else(|_| "chirp_3".to_string()),
            speech_language_codes: parse_csv(
                &std::env::var("SPEECH_LANGUAGE_CODES").unwrap_or_else(|_| "en-US".to_string()),
            ),
            cloudconvert_api_key: std::env::var("CLOUDCONVERT_API_KEY").ok(),
            cloudconvert_sandbox: std::env::var("CLOUDCONVERT_SANDBOX")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            face_detection_max_duration_secs: std::env::var("FACE_DETECTION_MAX_DURATION_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
        })
    }

    /// Project to bill Transcoder jobs against.
    pub fn effective_transcoder_project_id(&self) -> &str {
        self.transcoder_project_id
            .as_deref()
            .unwrap_or(&self.google_project_id)
    }

    /// Project hosting the Speech recognizer.
    pub fn effective_speech_project_id(&self) -> &str {
        self.speech_project_id
            .as_deref()
            .unwrap_or(&self.google_project_id)
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
