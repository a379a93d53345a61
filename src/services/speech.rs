//! Speech-to-Text v2 client (batch recognition with word time offsets).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::GcpAuth;
use crate::error::{AppError, Result};
use crate::models::TranscriptSegment;

/// Status of the long-running recognition operation.
#[derive(Clone, Debug)]
pub struct SpeechOperation {
    pub done: bool,
    pub error: Option<String>,
    /// Operation response when `done` without error.
    pub response: Option<Value>,
}

/// Narrow interface over the speech service.
#[async_trait]
pub trait SpeechApi: Send + Sync {
    /// Start a batch recognition; returns the operation name to poll.
    async fn start_batch_recognize(
        &self,
        gcs_uri: &str,
        language_codes: &[String],
    ) -> Result<String>;

    async fn poll_operation(&self, operation_name: &str) -> Result<SpeechOperation>;
}

#[derive(Clone, Debug)]
pub struct SpeechEnv {
    pub project_id: String,
    pub location: String,
    pub recognizer_id: String,
    pub model: String,
}

impl SpeechEnv {
    fn endpoint(&self) -> String {
        if self.location == "global" {
            "speech.googleapis.com".to_string()
        } else {
            format!("{}-speech.googleapis.com", self.location)
        }
    }

    fn recognizer_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/recognizers/{}",
            self.project_id, self.location, self.recognizer_id
        )
    }
}

pub struct SpeechClient {
    auth: std::sync::Arc<GcpAuth>,
    http: reqwest::Client,
    env: SpeechEnv,
}

impl SpeechClient {
    pub fn new(auth: std::sync::Arc<GcpAuth>, env: SpeechEnv) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AppError::Backend(format!("http client: {e}")))?;

        Ok(Self { auth, http, env })
    }
}

#[async_trait]
impl SpeechApi for SpeechClient {
    async fn start_batch_recognize(
        &self,
        gcs_uri: &str,
        language_codes: &[String],
    ) -> Result<String> {
        let recognizer = self.env.recognizer_path();
        let url = format!(
            "https://{}/v2/{recognizer}:batchRecognize",
            self.env.endpoint()
        );

        let payload = json!({
            "recognizer": recognizer,
            "config": {
                "autoDecodingConfig": {},
                "languageCodes": language_codes,
                "model": self.env.model,
                "features": { "enableWordTimeOffsets": true },
            },
            "files": [{ "uri": gcs_uri }],
            "recognitionOutputConfig": { "inlineResponseConfig": {} },
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
                "speech batchRecognize failed with {status}: {body}"
            )));
        }

        let body: Value = response.json().await?;
        let operation = body
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Backend("speech API returned no operation name".to_string()))?
            .to_string();

        info!(operation = %operation, gcs_uri = %gcs_uri, "started batch recognition");
        Ok(operation)
    }

    async fn poll_operation(&self, operation_name: &str) -> Result<SpeechOperation> {
        let url = format!("https://{}/v2/{operation_name}", self.env.endpoint());
        let token = self.auth.access_token().await?;
        let response = self.http.get(&url).bearer_auth(token).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "speech operation poll failed with {status}: {body}"
            )));
        }

        let body: Value = response.json().await?;
        Ok(SpeechOperation {
            done: body.get("done").and_then(Value::as_bool).unwrap_or(false),
            error: body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string),
            response: body.get("response").cloned(),
        })
    }
}

/// Parse a Speech API time offset ("1.5s", a number, or `{seconds, nanos}`)
/// into milliseconds.
pub fn parse_offset_ms(offset: &Value) -> i64 {
    match offset {
        Value::Number(n) => (n.as_f64().unwrap_or(0.0) * 1000.0) as i64,
        Value::String(s) => {
            let numeric = s.trim_end_matches('s');
            numeric
                .parse::<f64>()
                .map(|secs| (secs * 1000.0) as i64)
                .unwrap_or(0)
        }
        Value::Object(map) => {
            let seconds = match map.get("seconds") {
                Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                Some(Value::String(s)) => s.parse().unwrap_or(0.0),
                _ => 0.0,
            };
            let nanos = map.get("nanos").and_then(Value::as_f64).unwrap_or(0.0);
            (seconds * 1000.0 + nanos / 1_000_000.0) as i64
        }
        _ => 0,
    }
}

/// Join transcript text across results and emit one segment per word.
///
/// The inline-response layout is
/// `response.results[file_uri].inlineResult.transcript.results[]`, each with
/// `alternatives[]` carrying `transcript` and word timings.
pub fn parse_transcription_response(response: &Value) -> (String, Vec<TranscriptSegment>) {
    let mut text_parts: Vec<String> = Vec::new();
    let mut segments: Vec<TranscriptSegment> = Vec::new();

    let files = response
        .get("results")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for file_result in files.values() {
        let transcript_data = file_result
            .get("inlineResult")
            .and_then(|r| r.get("transcript"))
            .or_else(|| file_result.get("transcript"))
            .cloned()
            .unwrap_or(Value::Null);

        for result in transcript_data
            .get("results")
            .and_then(Value::as_array)
            .map(|r| r.as_slice())
            .unwrap_or_default()
        {
            let Some(best) = result
                .get("alternatives")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
            else {
                continue;
            };

            if let Some(text) = best.get("transcript").and_then(Value::as_str) {
                if !text.is_empty() {
                    text_parts.push(text.to_string());
                }
            }

            for word in best
                .get("words")
                .and_then(Value::as_array)
                .map(|w| w.as_slice())
                .unwrap_or_default()
            {
                let speech = word
                    .get("word")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                if speech.is_empty() {
                    continue;
                }
                let start = word
                    .get("startOffset")
                    .map(parse_offset_ms)
                    .unwrap_or_default();
                segments.push(TranscriptSegment { start, speech });
            }
        }
    }

    (text_parts.join(" "), segments)
}
