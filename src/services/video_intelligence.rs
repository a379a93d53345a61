//! Video Intelligence API client.
//!
//! Annotation is a long-running operation; `annotate` submits the request and
//! polls the operation to completion, so callers see a synchronous call with a
//! long timeout.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::auth::GcpAuth;
use crate::error::{AppError, Result};

const VIDEO_INTELLIGENCE_BASE: &str = "https://videointelligence.googleapis.com/v1";
const ANNOTATE_MAX_WAIT: Duration = Duration::from_secs(600);
const ANNOTATE_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoFeature {
    ShotChangeDetection,
    LabelDetection,
    FaceDetection,
    PersonDetection,
}

impl VideoFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoFeature::ShotChangeDetection => "SHOT_CHANGE_DETECTION",
            VideoFeature::LabelDetection => "LABEL_DETECTION",
            VideoFeature::FaceDetection => "FACE_DETECTION",
            VideoFeature::PersonDetection => "PERSON_DETECTION",
        }
    }

    /// Feature-specific `videoContext` payload.
    fn context(&self) -> Option<Value> {
        match self {
            VideoFeature::ShotChangeDetection => None,
            VideoFeature::LabelDetection => Some(json!({
                "labelDetectionConfig": {
                    "labelDetectionMode": "SHOT_AND_FRAME_MODE",
                    "frameConfidenceThreshold": 0.5,
                    "videoConfidenceThreshold": 0.5,
                }
            })),
            VideoFeature::FaceDetection => Some(json!({
                "faceDetectionConfig": {
                    "includeAttributes": true,
                    "includeBoundingBoxes": true,
                }
            })),
            VideoFeature::PersonDetection => Some(json!({
                "personDetectionConfig": {
                    "includeBoundingBoxes": true,
                    "includePoseLandmarks": true,
                    "includeAttributes": true,
                }
            })),
        }
    }
}

/// Narrow interface over the video analysis service. Returns the first
/// `annotationResults` entry for the input.
#[async_trait]
pub trait VideoAnnotator: Send + Sync {
    async fn annotate(&self, gcs_uri: &str, feature: VideoFeature) -> Result<Value>;
}

pub struct VideoIntelligenceClient {
    auth: std::sync::Arc<GcpAuth>,
    http: reqwest::Client,
}

impl VideoIntelligenceClient {
    pub fn new(auth: std::sync::Arc<GcpAuth>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AppError::Backend(format!("http client: {e}")))?;

        Ok(Self { auth, http })
    }
}

#[async_trait]
impl VideoAnnotator for VideoIntelligenceClient {
    async fn annotate(&self, gcs_uri: &str, feature: VideoFeature) -> Result<Value> {
        let mut payload = json!({
            "inputUri": gcs_uri,
            "features": [feature.as_str()],
        });
        if let Some(context) = feature.context() {
            payload["videoContext"] = context;
        }

        let token = self.auth.access_token().await?;
        let response = self
            .http
            .post(format!("{VIDEO_INTELLIGENCE_BASE}/videos:annotate"))
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "video annotation request failed with {status}: {body}"
            )));
        }

        let body: Value = response.json().await?;
        let operation = body
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AppError::Backend("video intelligence returned no operation name".to_string())
            })?
            .to_string();

        info!(operation = %operation, feature = feature.as_str(), "started video annotation");

        // Poll the LRO to completion.
        let started = Instant::now();
        loop {
            let token = self.auth.access_token().await?;
            let response = self
                .http
                .get(format!("{VIDEO_INTELLIGENCE_BASE}/{operation}"))
                .bearer_auth(&token)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(AppError::Backend(format!(
                    "video annotation poll failed with {status}: {body}"
                )));
            }

            let op: Value = response.json().await?;
            if op.get("done").and_then(Value::as_bool).unwrap_or(false) {
                if let Some(error) = op.get("error") {
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown annotation error");
                    return Err(AppError::RemoteJobFailed(message.to_string()));
                }

                let results = op
                    .get("response")
                    .and_then(|r| r.get("annotationResults"))
                    .and_then(Value::as_array)
                    .and_then(|a| a.first())
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                return Ok(results);
            }

            if started.elapsed() > ANNOTATE_MAX_WAIT {
                return Err(AppError::RemoteJobTimeout(format!(
                    "video annotation {operation} exceeded {}s",
                    ANNOTATE_MAX_WAIT.as_secs()
                )));
            }

            debug!(operation = %operation, "annotation still running");
            tokio::time::sleep(ANNOTATE_POLL_INTERVAL).await;
        }
    }
}

/// Convert a protobuf-JSON duration (`"12.5s"` or `{seconds, nanos}`) to
/// seconds.
pub fn offset_seconds(offset: Option<&Value>) -> f64 {
    match offset {
        Some(Value::String(s)) => s.trim_end_matches('s').parse().unwrap_or(0.0),
        Some(Value::Object(map)) => {
            let seconds = match map.get("seconds") {
                Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                Some(Value::String(s)) => s.parse().unwrap_or(0.0),
                _ => 0.0,
            };
            let nanos = map.get("nanos").and_then(Value::as_f64).unwrap_or(0.0);
            seconds + nanos / 1_000_000_000.0
        }
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}
