//! Transcription coordinator step.
//!
//! Unlike the other coordinators this one never blocks on the remote job: it
//! starts the batch recognition, stores the operation name, and returns
//! `waiting`. Each re-entry polls the operation once and either keeps
//! waiting or records the terminal result.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{now_iso, JobRecord, JobStatus};
use crate::pipeline::registry::StepRunner;
use crate::pipeline::types::{metadata_map, PipelineContext, PipelineResult, StepStatus};
use crate::pipeline::PipelineDeps;
use crate::services::config_hash;
use crate::services::speech::parse_transcription_response;

pub struct TranscriptionStep {
    deps: Arc<PipelineDeps>,
}

impl TranscriptionStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }

    /// Source preference: extracted FLAC, then transcoded MP4, then the
    /// original upload. Raw codecs are often decoded as silence, which is
    /// why the FLAC wins.
    async fn resolve_source(&self, ctx: &PipelineContext) -> Result<String> {
        if let Some(uri) = ctx.param_str("audioGcsUri") {
            return Ok(uri.to_string());
        }

        let state = self
            .deps
            .state
            .get(&ctx.user_id, &ctx.project_id, &ctx.asset.id)
            .await?;

        let from_step = |step_id: &str, key: &str| -> Option<String> {
            let step = state.step(step_id)?;
            if step.status != StepStatus::Succeeded {
                return None;
            }
            step.metadata.get(key)?.as_str().map(str::to_string)
        };

        from_step("audio-extract", "audioForTranscriptionGcsUri")
            .or_else(|| from_step("transcode", "outputGcsUri"))
            .or_else(|| super::upload_gcs_uri(&state))
            .ok_or_else(|| {
                AppError::Validation(
                    "cloud upload must complete before transcription".to_string(),
                )
            })
    }

    fn language_codes(&self, ctx: &PipelineContext) -> Vec<String> {
        ctx.params
            .get("languageCodes")
            .and_then(Value::as_array)
            .map(|codes| {
                codes
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|codes| !codes.is_empty())
            .unwrap_or_else(|| self.deps.config.speech_language_codes.clone())
    }

    /// Poll the stored operation once and settle or keep waiting.
    async fn poll_existing(
        &self,
        ctx: &PipelineContext,
        job: &JobRecord,
    ) -> Result<PipelineResult> {
        let operation_name = job.remote_job_name.clone().unwrap_or_default();
        info!(operation = %operation_name, job_id = %job.id, "polling transcription operation");

        let operation = match self.deps.speech.poll_operation(&operation_name).await {
            Ok(op) => op,
            Err(e) => {
                // A failed poll is not a failed transcription; try again on
                // the next re-entry.
                warn!(job_id = %job.id, error = %e, "transcription poll error");
                return Ok(PipelineResult::waiting(metadata_map([
                    ("message", json!("Transcription in progress (poll error)")),
                    ("jobId", json!(job.id)),
                    ("createdAt", json!(job.created_at)),
                    ("pollError", json!(e.to_string())),
                ])));
            }
        };

        if !operation.done {
            info!(operation = %operation_name, "transcription still processing");
            return Ok(PipelineResult::waiting(metadata_map([
                ("message", json!("Transcription in progress")),
                ("jobId", json!(job.id)),
                ("createdAt", json!(job.created_at)),
            ])));
        }

        if let Some(error) = operation.error {
            warn!(job_id = %job.id, error = %error, "transcription operation failed");
            self.deps
                .transcription_jobs
                .update(
                    &ctx.user_id,
                    &ctx.project_id,
                    &job.id,
                    json!({"status": JobStatus::Error, "error": error}),
                )
                .await?;
            return Ok(PipelineResult::failed(
                error.clone(),
                metadata_map([
                    ("message", json!("Transcription failed")),
                    ("jobId", json!(job.id)),
                    ("error", json!(error)),
                ]),
            ));
        }

        let response = operation.response.unwrap_or(Value::Null);
        let (transcript, segments) = parse_transcription_response(&response);
        info!(
            job_id = %job.id,
            segments = segments.len(),
            chars = transcript.len(),
            "transcription completed"
        );

        self.deps
            .transcription_jobs
            .update(
                &ctx.user_id,
                &ctx.project_id,
                &job.id,
                json!({
                    "status": JobStatus::Completed,
                    "transcript": transcript,
                    "segments": segments,
                }),
            )
            .await?;

        Ok(PipelineResult::succeeded(metadata_map([
            ("message", json!("Transcription completed")),
            ("jobId", json!(job.id)),
            ("createdAt", json!(job.created_at)),
            ("transcript", json!(transcript)),
            ("segments", json!(segments)),
        ])))
    }
}

#[async_trait]
impl StepRunner for TranscriptionStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        let existing = self
            .deps
            .transcription_jobs
            .find_latest_for_asset(&ctx.user_id, &ctx.project_id, &ctx.asset.id, None)
            .await?;

        if let Some(job) = existing {
            match job.status {
                JobStatus::Completed => {
                    return Ok(PipelineResult::succeeded(metadata_map([
                        ("message", json!("Transcription completed")),
                        ("jobId", json!(job.id)),
                        ("createdAt", json!(job.created_at)),
                        ("transcript", json!(job.transcript)),
                        ("segments", json!(job.segments)),
                    ])));
                }
                JobStatus::Error => {
                    return Ok(PipelineResult::failed(
                        job.error
                            .clone()
                            .unwrap_or_else(|| "transcription failed previously".to_string()),
                        metadata_map([
                            ("message", json!("Transcription failed")),
                            ("jobId", json!(job.id)),
                            ("error", json!(job.error)),
                        ]),
                    ));
                }
                JobStatus::Processing if job.remote_job_name.is_some() => {
                    return self.poll_existing(ctx, &job).await;
                }
                _ => {}
            }
        }

        // Start a new recognition.
        let gcs_uri = self.resolve_source(ctx).await?;
        let language_codes = self.language_codes(ctx);
        info!(asset_id = %ctx.asset.id, gcs_uri = %gcs_uri, "starting transcription");

        let operation_name = self
            .deps
            .speech
            .start_batch_recognize(&gcs_uri, &language_codes)
            .await?;

        let mut config: Map<String, Value> = Map::new();
        config.insert("languageCodes".to_string(), json!(language_codes));
        let hash = config_hash(&config);
        config.insert("hash".to_string(), json!(hash));

        let now = now_iso();
        let job = JobRecord {
            id: Uuid::new_v4().to_string(),
            asset_id: ctx.asset.id.clone(),
            asset_name: ctx.asset.name.clone(),
            file_name: ctx.asset.file_name.clone(),
            mime_type: ctx.asset.mime_type.clone(),
            input_gcs_uri: gcs_uri,
            status: JobStatus::Processing,
            remote_job_name: Some(operation_name),
            config,
            language_codes: Some(language_codes.clone()),
            created_at: now.clone(),
            updated_at: now,
            user_id: ctx.user_id.clone(),
            project_id: ctx.project_id.clone(),
            ..Default::default()
        };
        self.deps.transcription_jobs.save(&job).await?;

        Ok(PipelineResult::waiting(metadata_map([
            ("jobId", json!(job.id)),
            ("createdAt", json!(job.created_at)),
            ("languageCodes", json!(language_codes)),
        ])))
    }
}
