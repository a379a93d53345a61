//! Gemini Files API + generateContent client.
//!
//! Large media cannot be inlined into a generateContent request, so the
//! source is staged through the Files API: resumable upload, wait until the
//! file reaches `ACTIVE`, generate, then delete the transient file (it would
//! otherwise expire server-side after 48 hours).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::storage::ObjectStore;

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com";
/// Bound on waiting for an uploaded file to become ACTIVE.
const FILE_ACTIVE_MAX_WAIT: Duration = Duration::from_secs(120);
const FILE_ACTIVE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One analysis invocation.
#[derive(Clone, Debug)]
pub struct AnalysisRequest {
    pub gcs_uri: String,
    pub mime_type: String,
    pub prompt: String,
    pub display_name: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnalysisOutcome {
    pub analysis: String,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

/// Narrow interface over the multimodal analysis model, keyed per call so the
/// rotation loop stays with the caller.
#[async_trait]
pub trait AnalysisModel: Send + Sync {
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        api_key: &str,
        model_id: &str,
    ) -> Result<AnalysisOutcome>;
}

pub struct GeminiClient {
    http: reqwest::Client,
    blobs: Arc<dyn ObjectStore>,
}

impl GeminiClient {
    pub fn new(blobs: Arc<dyn ObjectStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| AppError::Backend(format!("http client: {e}")))?;

        Ok(Self { http, blobs })
    }

    /// Resumable upload of raw bytes; returns `(name, uri)` of the file.
    async fn upload_file(
        &self,
        data: bytes::Bytes,
        mime_type: &str,
        display_name: &str,
        api_key: &str,
    ) -> Result<(String, String)> {
        let start = self
            .http
            .post(format!("{GEMINI_BASE}/upload/v1beta/files"))
            .query(&[("key", api_key)])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", data.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({"file": {"display_name": display_name}}))
            .send()
            .await?;

        if !start.status().is_success() {
            return Err(api_error("files upload start", start).await);
        }

        let upload_url = start
            .headers()
            .get("X-Goog-Upload-URL")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Backend("files API returned no upload URL".to_string()))?
            .to_string();

        let upload = self
            .http
            .post(&upload_url)
            .header("Content-Length", data.len().to_string())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(data)
            .send()
            .await?;

        if !upload.status().is_success() {
            return Err(api_error("files upload", upload).await);
        }

        let body: Value = upload.json().await?;
        let file = &body["file"];
        let name = file
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Backend("files API returned no file name".to_string()))?;
        let uri = file
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Backend("files API returned no file uri".to_string()))?;

        Ok((name.to_string(), uri.to_string()))
    }

    /// Poll until the uploaded file is ACTIVE, bounded.
    async fn wait_for_active(&self, file_name: &str, api_key: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(format!("{GEMINI_BASE}/v1beta/{file_name}"))
                .query(&[("key", api_key)])
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(api_error("files state poll", response).await);
            }

            let body: Value = response.json().await?;
            match body.get("state").and_then(Value::as_str) {
                Some("ACTIVE") => return Ok(()),
                Some("FAILED") => {
                    let detail = body
                        .get("error")
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "file processing failed".to_string());
                    return Err(AppError::RemoteJobFailed(detail));
                }
                _ => {}
            }

            if started.elapsed() > FILE_ACTIVE_MAX_WAIT {
                return Err(AppError::RemoteJobTimeout(format!(
                    "file {file_name} not ACTIVE after {}s",
                    FILE_ACTIVE_MAX_WAIT.as_secs()
                )));
            }
            tokio::time::sleep(FILE_ACTIVE_POLL_INTERVAL).await;
        }
    }

    async fn delete_file(&self, file_name: &str, api_key: &str) {
        let result = self
            .http
            .delete(format!("{GEMINI_BASE}/v1beta/{file_name}"))
            .query(&[("key", api_key)])
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!(file = %file_name, "deleted transient Gemini file");
            }
            Ok(response) => {
                warn!(file = %file_name, status = %response.status(), "failed to delete Gemini file");
            }
            Err(e) => warn!(file = %file_name, error = %e, "failed to delete Gemini file"),
        }
    }
}

async fn api_error(context: &str, response: reqwest::Response) -> AppError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 429 {
        AppError::QuotaExhausted(format!("{context}: 429 {body}"))
    } else {
        AppError::Backend(format!("{context} failed with {status}: {body}"))
    }
}

#[async_trait]
impl AnalysisModel for GeminiClient {
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        api_key: &str,
        model_id: &str,
    ) -> Result<AnalysisOutcome> {
        let data = self.blobs.download(&request.gcs_uri).await?;

        info!(gcs_uri = %request.gcs_uri, size = data.len(), model = %model_id, "uploading to Gemini Files API");
        let (file_name, file_uri) = self
            .upload_file(data, &request.mime_type, &request.display_name, api_key)
            .await?;

        let outcome = async {
            self.wait_for_active(&file_name, api_key).await?;

            let body = json!({
                "contents": [{
                    "role": "user",
                    "parts": [
                        {"fileData": {"fileUri": file_uri, "mimeType": request.mime_type}},
                        {"text": request.prompt},
                    ],
                }],
                "generationConfig": {
                    "temperature": 0.2,
                    "maxOutputTokens": 8192,
                },
            });

            let response = self
                .http
                .post(format!(
                    "{GEMINI_BASE}/v1beta/models/{model_id}:generateContent"
                ))
                .query(&[("key", api_key)])
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(api_error("generateContent", response).await);
            }

            let payload: Value = response.json().await?;
            Ok(parse_generate_response(&payload))
        }
        .await;

        // The transient file is deleted on success and failure alike.
        self.delete_file(&file_name, api_key).await;
        outcome
    }
}

/// Join candidate text parts and pull token usage.
pub fn parse_generate_response(payload: &Value) -> AnalysisOutcome {
    let mut parts: Vec<&str> = Vec::new();
    for candidate in payload
        .get("candidates")
        .and_then(Value::as_array)
        .map(|c| c.as_slice())
        .unwrap_or_default()
    {
        for part in candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .map(|p| p.as_slice())
            .unwrap_or_default()
        {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    parts.push(text);
                }
            }
        }
    }

    let usage = payload.get("usageMetadata").cloned().unwrap_or(Value::Null);
    AnalysisOutcome {
        analysis: parts.join("\n\n"),
        prompt_tokens: usage.get("promptTokenCount").and_then(Value::as_i64),
        completion_tokens: usage.get("candidatesTokenCount").and_then(Value::as_i64),
        total_tokens: usage.get("totalTokenCount").and_then(Value::as_i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generate_response_joins_parts() {
        let payload = json!({
            "candidates": [{
                "content": {"parts": [{"text": "Overview."}, {"text": "Details."}]}
            }],
            "usageMetadata": {
                "promptTokenCount": 1200,
                "candidatesTokenCount": 900,
                "totalTokenCount": 2100
            }
        });

        let outcome = parse_generate_response(&payload);
        assert_eq!(outcome.analysis, "Overview.\n\nDetails.");
        assert_eq!(outcome.prompt_tokens, Some(1200));
        assert_eq!(outcome.completion_tokens, Some(900));
        assert_eq!(outcome.total_tokens, Some(2100));
    }

    #[test]
    fn empty_candidates_yield_empty_analysis() {
        let outcome = parse_generate_response(&json!({"candidates": []}));
        assert!(outcome.analysis.is_empty());
        assert_eq!(outcome.total_tokens, None);
    }
}
