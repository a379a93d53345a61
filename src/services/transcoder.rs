//! Cloud Transcoder API client and job-config normalisation.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::auth::GcpAuth;
use crate::error::{AppError, Result};

const TRANSCODER_BASE: &str = "https://transcoder.googleapis.com/v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Mp4,
    Hls,
    Dash,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Hls => "hls",
            OutputFormat::Dash => "dash",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "hls" => OutputFormat::Hls,
            "dash" => OutputFormat::Dash,
            _ => OutputFormat::Mp4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Vp9 => "vp9",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "h265" | "hevc" => VideoCodec::H265,
            "vp9" => VideoCodec::Vp9,
            _ => VideoCodec::H264,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Mp3,
    Opus,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Mp3 => "mp3",
            AudioCodec::Opus => "opus",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "mp3" => AudioCodec::Mp3,
            "opus" => AudioCodec::Opus,
            _ => AudioCodec::Aac,
        }
    }
}

/// Normalised transcode parameters.
///
/// Width and height params are intentionally not accepted: the target height
/// comes from process configuration and the width auto-derives from the
/// source aspect ratio.
#[derive(Clone, Debug, PartialEq)]
pub struct TranscodeSpec {
    pub output_format: OutputFormat,
    pub video_codec: VideoCodec,
    pub video_bitrate_bps: i64,
    pub target_height: Option<i64>,
    pub frame_rate: f64,
    /// When the source has no audio track, no audio stream is declared in the
    /// remote job; declaring one against a silent input fails validation.
    pub has_audio: bool,
    pub audio_codec: AudioCodec,
    pub audio_bitrate_bps: Option<i64>,
    pub sample_rate_hz: Option<i64>,
    pub channels: Option<i64>,
}

impl TranscodeSpec {
    /// Apply defaults and caller params.
    pub fn from_params(params: &Value, has_audio: bool, target_height: Option<i64>) -> Self {
        let mut spec = TranscodeSpec {
            output_format: OutputFormat::Mp4,
            video_codec: VideoCodec::H264,
            video_bitrate_bps: 2_500_000,
            target_height,
            frame_rate: 30.0,
            has_audio,
            audio_codec: AudioCodec::Aac,
            audio_bitrate_bps: None,
            sample_rate_hz: None,
            channels: None,
        };

        if let Some(raw) = params.get("outputFormat").and_then(Value::as_str) {
            spec.output_format = OutputFormat::parse(raw);
        }
        if let Some(raw) = params.get("videoCodec").and_then(Value::as_str) {
            spec.video_codec = VideoCodec::parse(raw);
        }
        if let Some(bps) = parse_bitrate(params.get("videoBitrate"), 100_000) {
            spec.video_bitrate_bps = bps;
        }
        if let Some(rate) = params.get("frameRate").and_then(Value::as_f64) {
            spec.frame_rate = rate;
        }
        if let Some(raw) = params.get("audioCodec").and_then(Value::as_str) {
            spec.audio_codec = AudioCodec::parse(raw);
        }
        spec.audio_bitrate_bps = parse_bitrate(params.get("audioBitrate"), 10_000);
        spec.sample_rate_hz = params.get("sampleRate").and_then(Value::as_i64);
        spec.channels = params.get("channels").and_then(Value::as_i64);

        spec
    }

    /// Normalised config map whose serialised form feeds the dedup hash.
    /// Audio settings are elided entirely for silent sources.
    pub fn config_map(&self) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("outputFormat".to_string(), json!(self.output_format.as_str()));
        config.insert("videoCodec".to_string(), json!(self.video_codec.as_str()));
        config.insert("videoBitrateBps".to_string(), json!(self.video_bitrate_bps));
        if let Some(height) = self.target_height {
            config.insert("targetHeight".to_string(), json!(height));
        }
        config.insert("frameRate".to_string(), json!(self.frame_rate));
        config.insert("hasAudio".to_string(), json!(self.has_audio));

        if self.has_audio {
            config.insert("audioCodec".to_string(), json!(self.audio_codec.as_str()));
            if let Some(bps) = self.audio_bitrate_bps {
                config.insert("audioBitrateBps".to_string(), json!(bps));
            }
            if let Some(rate) = self.sample_rate_hz {
                config.insert("sampleRateHz".to_string(), json!(rate));
            }
            if let Some(channels) = self.channels {
                config.insert("channels".to_string(), json!(channels));
            }
        }

        config
    }

    fn video_stream(&self) -> Value {
        let mut cfg = json!({
            "profile": match self.video_codec {
                VideoCodec::H264 => "high",
                VideoCodec::H265 => "main",
                VideoCodec::Vp9 => "profile0",
            },
            "bitrateBps": self.video_bitrate_bps,
            "frameRate": self.frame_rate,
        });
        if self.video_codec != VideoCodec::Vp9 {
            cfg["preset"] = json!("medium");
        }
        // Omitting width preserves the input aspect ratio.
        if let Some(height) = self.target_height {
            cfg["heightPixels"] = json!(height);
        }

        json!({
            "key": "video-stream0",
            "videoStream": { (self.video_codec.as_str()): cfg }
        })
    }

    fn audio_stream(&self) -> Value {
        let mut stream = json!({
            "codec": self.audio_codec.as_str(),
            // The API requires an audio bitrate.
            "bitrateBps": self.audio_bitrate_bps.unwrap_or(64_000),
        });
        if let Some(rate) = self.sample_rate_hz {
            stream["sampleRateHertz"] = json!(rate);
        }
        if let Some(channels) = self.channels {
            stream["channelCount"] = json!(channels);
        }

        json!({ "key": "audio-stream0", "audioStream": stream })
    }

    /// Transcoder API job `config` payload.
    pub fn to_job_config(&self) -> Value {
        let mut elementary = vec![self.video_stream()];
        let mut stream_keys = vec![json!("video-stream0")];
        if self.has_audio {
            elementary.push(self.audio_stream());
            stream_keys.push(json!("audio-stream0"));
        }

        let mux = match self.output_format {
            OutputFormat::Mp4 => json!({
                "key": "output0",
                "container": "mp4",
                "fileName": "output.mp4",
                "elementaryStreams": stream_keys,
            }),
            OutputFormat::Hls | OutputFormat::Dash => json!({
                "key": "output0",
                "container": "fmp4",
                "segmentSettings": {"segmentDuration": "6s"},
                "elementaryStreams": stream_keys,
            }),
        };

        json!({
            "elementaryStreams": elementary,
            "muxStreams": [mux],
        })
    }
}

/// Bitrates arrive as bps, kbps, or strings like "2500k".
fn parse_bitrate(value: Option<&Value>, kbps_threshold: i64) -> Option<i64> {
    match value? {
        Value::Number(n) => {
            let raw = n.as_i64()?;
            Some(if raw < kbps_threshold { raw * 1000 } else { raw })
        }
        Value::String(s) => {
            let normalised = s.replace(['k', 'K'], "000");
            normalised.parse().ok()
        }
        _ => None,
    }
}

/// Remote job phase, mapped from the API's state strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemotePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug)]
pub struct RemoteJobState {
    pub phase: RemotePhase,
    pub error: Option<String>,
}

/// Narrow interface over the Transcoder API.
#[async_trait]
pub trait TranscodeApi: Send + Sync {
    /// Create a job; returns the full job resource name.
    async fn create_job(
        &self,
        input_uri: &str,
        output_uri: &str,
        spec: &TranscodeSpec,
    ) -> Result<String>;

    async fn job_state(&self, job_name: &str) -> Result<RemoteJobState>;
}

pub struct TranscoderClient {
    auth: std::sync::Arc<GcpAuth>,
    http: reqwest::Client,
    project_id: String,
    location: String,
}

impl TranscoderClient {
    pub fn new(auth: std::sync::Arc<GcpAuth>, project_id: &str, location: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AppError::Backend(format!("http client: {e}")))?;

        Ok(Self {
            auth,
            http,
            project_id: project_id.to_string(),
            location: location.to_string(),
        })
    }
}

#[async_trait]
impl TranscodeApi for TranscoderClient {
    async fn create_job(
        &self,
        input_uri: &str,
        output_uri: &str,
        spec: &TranscodeSpec,
    ) -> Result<String> {
        let url = format!(
            "{TRANSCODER_BASE}/projects/{}/locations/{}/jobs",
            self.project_id, self.location
        );
        let payload = json!({
            "inputUri": input_uri,
            "outputUri": output_uri,
            "config": spec.to_job_config(),
        });

        let token = self.auth.access_token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "transcoder job creation failed with {status}: {body}"
            )));
        }

        let body: Value = response.json().await?;
        let job_name = body
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Backend("transcoder returned no job name".to_string()))?
            .to_string();

        info!(job_name = %job_name, input = %input_uri, "created transcode job");
        Ok(job_name)
    }

    async fn job_state(&self, job_name: &str) -> Result<RemoteJobState> {
        let url = format!("{TRANSCODER_BASE}/{job_name}");
        let token = self.auth.access_token().await?;
        let response = self.http.get(&url).bearer_auth(token).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "transcoder status check failed with {status}: {body}"
            )));
        }

        let body: Value = response.json().await?;
        let phase = match body.get("state").and_then(Value::as_str) {
            Some("PENDING") => RemotePhase::Pending,
            Some("SUCCEEDED") => RemotePhase::Succeeded,
            Some("FAILED") => RemotePhase::Failed,
            _ => RemotePhase::Running,
        };
        let error = body
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(RemoteJobState { phase, error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_the_reference_profile() {
        let spec = TranscodeSpec::from_params(&Value::Null, true, Some(720));
        assert_eq!(spec.output_format, OutputFormat::Mp4);
        assert_eq!(spec.video_codec, VideoCodec::H264);
        assert_eq!(spec.video_bitrate_bps, 2_500_000);
        assert_eq!(spec.frame_rate, 30.0);
        assert_eq!(spec.target_height, Some(720));
        assert!(spec.has_audio);
    }

    #[test]
    fn params_override_defaults() {
        let params = json!({
            "outputFormat": "HLS",
            "videoCodec": "hevc",
            "videoBitrate": "5000k",
            "frameRate": 24.0,
            "audioCodec": "opus",
            "audioBitrate": 128,
            "sampleRate": 48000,
            "channels": 2
        });
        let spec = TranscodeSpec::from_params(&params, true, None);
        assert_eq!(spec.output_format, OutputFormat::Hls);
        assert_eq!(spec.video_codec, VideoCodec::H265);
        assert_eq!(spec.video_bitrate_bps, 5_000_000);
        assert_eq!(spec.frame_rate, 24.0);
        assert_eq!(spec.audio_codec, AudioCodec::Opus);
        // 128 is below the kbps threshold, so it is interpreted as kbps.
        assert_eq!(spec.audio_bitrate_bps, Some(128_000));
        assert_eq!(spec.sample_rate_hz, Some(48000));
        assert_eq!(spec.channels, Some(2));
    }

    #[test]
    fn small_numeric_bitrates_are_kbps() {
        let spec = TranscodeSpec::from_params(&json!({"videoBitrate": 2500}), true, None);
        assert_eq!(spec.video_bitrate_bps, 2_500_000);

        let spec = TranscodeSpec::from_params(&json!({"videoBitrate": 4_000_000}), true, None);
        assert_eq!(spec.video_bitrate_bps, 4_000_000);
    }

    #[test]
    fn silent_source_elides_audio_from_config_and_job() {
        let spec = TranscodeSpec::from_params(&Value::Null, false, None);

        let config = spec.config_map();
        assert_eq!(config["hasAudio"], false);
        assert!(!config.contains_key("audioCodec"));

        let job = spec.to_job_config();
        let streams = job["elementaryStreams"].as_array().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(
            job["muxStreams"][0]["elementaryStreams"],
            json!(["video-stream0"])
        );
    }

    #[test]
    fn audible_source_declares_both_streams() {
        let spec = TranscodeSpec::from_params(&Value::Null, true, Some(1080));
        let job = spec.to_job_config();

        let streams = job["elementaryStreams"].as_array().unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0]["videoStream"]["h264"]["heightPixels"], 1080);
        assert!(streams[0]["videoStream"]["h264"].get("widthPixels").is_none());
        assert_eq!(streams[1]["audioStream"]["codec"], "aac");
        assert_eq!(streams[1]["audioStream"]["bitrateBps"], 64_000);
        assert_eq!(job["muxStreams"][0]["fileName"], "output.mp4");
    }

    #[test]
    fn config_hash_distinguishes_audio_presence() {
        use crate::services::config_hash;

        let with_audio = TranscodeSpec::from_params(&Value::Null, true, None).config_map();
        let without = TranscodeSpec::from_params(&Value::Null, false, None).config_map();
        assert_ne!(config_hash(&with_audio), config_hash(&without));
    }
}
