//! CloudConvert API client for image conversion.
//!
//! A conversion is a three-task job: import/url fetches the input from a
//! signed URL, convert transforms it, export/url publishes a download URL.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{AppError, Result};

const API_BASE: &str = "https://api.cloudconvert.com/v2";
const SANDBOX_API_BASE: &str = "https://sandbox.cloudconvert.com/v2";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvertPhase {
    Waiting,
    Processing,
    Finished,
    Error,
}

#[derive(Clone, Debug)]
pub struct ConversionState {
    pub phase: ConvertPhase,
    pub output_url: Option<String>,
    pub output_filename: Option<String>,
    pub error: Option<String>,
}

/// Narrow interface over the conversion service.
#[async_trait]
pub trait ConvertApi: Send + Sync {
    /// Create a conversion job; returns the remote job id.
    async fn create_job(
        &self,
        input_url: &str,
        input_format: &str,
        output_format: &str,
        filename: &str,
    ) -> Result<String>;

    async fn job_state(&self, job_id: &str) -> Result<ConversionState>;

    /// Download a finished job's export URL.
    async fn fetch_output(&self, url: &str) -> Result<bytes::Bytes>;
}

pub struct CloudConvertClient {
    http: reqwest::Client,
    api_key: String,
    base: &'static str,
}

impl CloudConvertClient {
    pub fn new(api_key: &str, sandbox: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AppError::Backend(format!("http client: {e}")))?;

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            base: if sandbox { SANDBOX_API_BASE } else { API_BASE },
        })
    }
}

#[async_trait]
impl ConvertApi for CloudConvertClient {
    async fn create_job(
        &self,
        input_url: &str,
        input_format: &str,
        output_format: &str,
        filename: &str,
    ) -> Result<String> {
        let payload = json!({
            "tasks": {
                "import-file": {
                    "operation": "import/url",
                    "url": input_url,
                },
                "convert-file": {
                    "operation": "convert",
                    "input": "import-file",
                    "input_format": input_format.to_lowercase(),
                    "output_format": output_format.to_lowercase(),
                    "filename": filename,
                    // Drop source metadata from the converted file.
                    "strip": true,
                },
                "export-file": {
                    "operation": "export/url",
                    "input": "convert-file",
                },
            },
        });

        let response = self
            .http
            .post(format!("{}/jobs", self.base))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "cloudconvert job creation failed with {status}: {body}"
            )));
        }

        let body: Value = response.json().await?;
        let job_id = body
            .get("data")
            .and_then(|d| d.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Backend("cloudconvert returned no job id".to_string()))?
            .to_string();

        info!(job_id = %job_id, from = %input_format, to = %output_format, "created conversion job");
        Ok(job_id)
    }

    async fn job_state(&self, job_id: &str) -> Result<ConversionState> {
        let response = self
            .http
            .get(format!("{}/jobs/{job_id}", self.base))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "cloudconvert status check failed with {status}: {body}"
            )));
        }

        let body: Value = response.json().await?;
        Ok(parse_job_state(&body))
    }

    async fn fetch_output(&self, url: &str) -> Result<bytes::Bytes> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(AppError::Backend(format!(
                "conversion output download failed with {status}"
            )));
        }
        Ok(response.bytes().await?)
    }
}

/// Map a CloudConvert job resource to a [`ConversionState`].
pub fn parse_job_state(body: &Value) -> ConversionState {
    let data = body.get("data").cloned().unwrap_or(Value::Null);
    let phase = match data.get("status").and_then(Value::as_str) {
        Some("processing") => ConvertPhase::Processing,
        Some("finished") => ConvertPhase::Finished,
        Some("error") => ConvertPhase::Error,
        _ => ConvertPhase::Waiting,
    };

    let mut state = ConversionState {
        phase,
        output_url: None,
        output_filename: None,
        error: None,
    };

    let tasks = data
        .get("tasks")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if phase == ConvertPhase::Finished {
        for task in &tasks {
            if task.get("operation").and_then(Value::as_str) == Some("export/url")
                && task.get("status").and_then(Value::as_str) == Some("finished")
            {
                if let Some(file) = task
                    .get("result")
                    .and_then(|r| r.get("files"))
                    .and_then(Value::as_array)
                    .and_then(|f| f.first())
                {
                    state.output_url = file
                        .get("url")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    state.output_filename = file
                        .get("filename")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                break;
            }
        }
    }

    if phase == ConvertPhase::Error {
        state.error = tasks
            .iter()
            .find(|t| t.get("status").and_then(Value::as_str) == Some("error"))
            .and_then(|t| t.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some("unknown conversion error".to_string()));
    }

    state
}
