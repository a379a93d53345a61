//! Media metadata extraction via ffprobe, plus asset-type classification.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::AssetType;

/// Hard timeout for the probe binary.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata extracted from a media file. Fields the probe could not measure
/// stay `None`, never zero.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub duration: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    /// First video stream codec.
    pub codec: Option<String>,
    pub audio_codec: Option<String>,
    pub sample_rate: Option<i64>,
    pub channels: Option<i64>,
    pub bitrate: Option<i64>,
    pub format_name: Option<String>,
    pub size: Option<i64>,
}

/// Run ffprobe against a local file and map its JSON output.
pub async fn extract_metadata(path: &Path) -> Result<MediaMetadata> {
    if !path.exists() {
        return Err(AppError::NotFound(format!(
            "file not found: {}",
            path.display()
        )));
    }

    let child = Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let child = match child {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::ProbeUnavailable);
        }
        Err(e) => return Err(AppError::ProbeFailed(e.to_string())),
    };

    let output = tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| AppError::ProbeTimeout)?
        .map_err(|e| AppError::ProbeFailed(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::ProbeFailed(stderr.chars().take(500).collect()));
    }

    let data: Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| AppError::ProbeFailed(format!("unparseable ffprobe output: {e}")))?;

    let metadata = parse_ffprobe_output(&data);
    debug!(path = %path.display(), ?metadata, "probed media file");
    Ok(metadata)
}

/// Map ffprobe's format/streams JSON into [`MediaMetadata`].
pub fn parse_ffprobe_output(data: &Value) -> MediaMetadata {
    let mut metadata = MediaMetadata::default();

    if let Some(format) = data.get("format") {
        metadata.format_name = format
            .get("format_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        metadata.size = lenient_i64(format.get("size"));
        metadata.duration = lenient_f64(format.get("duration"));
        metadata.bitrate = lenient_i64(format.get("bit_rate"));
    }

    for stream in data
        .get("streams")
        .and_then(Value::as_array)
        .map(|s| s.as_slice())
        .unwrap_or_default()
    {
        match stream.get("codec_type").and_then(Value::as_str) {
            Some("video") if metadata.codec.is_none() => {
                metadata.codec = stream
                    .get("codec_name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                metadata.width = lenient_i64(stream.get("width"));
                metadata.height = lenient_i64(stream.get("height"));
                if metadata.duration.is_none() {
                    metadata.duration = lenient_f64(stream.get("duration"));
                }
            }
            Some("audio") if metadata.audio_codec.is_none() => {
                metadata.audio_codec = stream
                    .get("codec_name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                metadata.sample_rate = lenient_i64(stream.get("sample_rate"));
                metadata.channels = lenient_i64(stream.get("channels"));
                if metadata.duration.is_none() {
                    metadata.duration = lenient_f64(stream.get("duration"));
                }
            }
            _ => {}
        }
    }

    metadata
}

/// ffprobe emits numerics both as JSON numbers and as strings.
fn lenient_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn lenient_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

const VIDEO_EXTS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v"];
const AUDIO_EXTS: &[&str] = &["mp3", "wav", "m4a", "aac", "ogg", "flac"];
const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "svg"];

/// Classify an asset by MIME type, falling back to the file extension when
/// the MIME type is generic.
pub fn classify_asset_type(mime_type: &str, file_name: Option<&str>) -> AssetType {
    if mime_type.starts_with("video/") {
        return AssetType::Video;
    }
    if mime_type.starts_with("audio/") {
        return AssetType::Audio;
    }
    if mime_type.starts_with("image/") {
        return AssetType::Image;
    }

    if let Some(name) = file_name {
        if let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) {
            let ext = ext.to_lowercase();
            if VIDEO_EXTS.contains(&ext.as_str()) {
                return AssetType::Video;
            }
            if AUDIO_EXTS.contains(&ext.as_str()) {
                return AssetType::Audio;
            }
            if IMAGE_EXTS.contains(&ext.as_str()) {
                return AssetType::Image;
            }
        }
    }

    AssetType::Other
}
