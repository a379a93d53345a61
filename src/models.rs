//! Shared data model: asset records, external-job records, queue tasks.
//!
//! Persisted documents use camelCase field names. Unknown keys coming back
//! from the document store are preserved through the flattened `extra` maps so
//! a partial reader never drops fields another writer owns.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// ISO-8601 UTC timestamp with a trailing `Z`, the format every persisted
/// document uses.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Asset type classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Video,
    Audio,
    Image,
    Other,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Video => "video",
            AssetType::Audio => "audio",
            AssetType::Image => "image",
            AssetType::Other => "other",
        }
    }
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uploaded media file and its metadata record.
///
/// Keyed by `(userId, projectId, id)` under
/// `users/{uid}/projects/{pid}/assets/{id}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<AssetType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<i64>,

    #[serde(default)]
    pub uploaded_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default = "default_source")]
    pub source: String,

    /// Set when the record has been repointed to a transcoded MP4.
    #[serde(default)]
    pub transcoded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcode_status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcode_error: Option<String>,
    /// Set when the record has been repointed to a converted image.
    #[serde(default)]
    pub converted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_gcs_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_signed_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_mime_type: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_source() -> String {
    "api".to_string()
}

/// Status shared by external-job records and the asset's transcode shadow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// One word of transcript with its start offset in milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: i64,
    pub speech: String,
}

/// Record of a remote long-running job (transcode, image conversion,
/// transcription). All three kinds share this shape; kind-specific inputs
/// live in `config`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub asset_id: String,
    #[serde(default)]
    pub asset_name: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub input_gcs_uri: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_gcs_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_signed_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_name: Option<String>,

    pub status: JobStatus,
    /// Handle returned by the remote service, polled for status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_job_name: Option<String>,
    /// Normalised parameter set used when creating the remote job; carries a
    /// derived `hash` for deduplication.
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Transcription-only outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<TranscriptSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_codes: Option<Vec<String>>,

    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub project_id: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl JobRecord {
    /// The `hash` field of the stored config, if any.
    pub fn config_hash(&self) -> Option<&str> {
        self.config.get("hash").and_then(|v| v.as_str())
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

/// Lifecycle of a queued task, kept in a TTL'd status record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Payload of a full-pipeline task.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTaskPayload {
    pub user_id: String,
    pub project_id: String,
    pub asset_id: String,
    /// Snapshot of the asset record at enqueue time.
    pub asset_data: Value,
    /// Local path if the asset is already materialised on this host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_path: Option<String>,
    /// Routing hints forwarded into the completion event's `metadata.agent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_metadata: Option<Value>,
}

/// Payload of a single-step task.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepTaskPayload {
    pub user_id: String,
    pub project_id: String,
    pub asset_id: String,
    pub asset_data: Value,
    pub step_id: String,
    #[serde(default)]
    pub params: Value,
}

/// Work routed through the broker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum TaskKind {
    Pipeline(PipelineTaskPayload),
    Step(StepTaskPayload),
}

/// A queued task as it travels through the broker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: String,
}
