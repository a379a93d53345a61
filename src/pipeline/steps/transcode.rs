//! Transcode coordinator step.
//!
//! Creates (or reuses) a Cloud Transcoder job, polls it to a terminal state,
//! then repoints the asset record at the derived MP4 while backing up the
//! original location. Jobs are deduplicated by a fingerprint of the
//! normalised config so re-runs never launch a second identical transcode.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{now_iso, Asset, JobRecord, JobStatus};
use crate::pipeline::registry::StepRunner;
use crate::pipeline::types::{PipelineContext, PipelineResult, StepState};
use crate::pipeline::PipelineDeps;
use crate::probe::classify_asset_type;
use crate::services::config_hash;
use crate::services::transcoder::{RemotePhase, TranscodeSpec};
use crate::storage::{parse_gcs_uri, ObjectStore};

const MAX_TRANSCODE_WAIT: Duration = Duration::from_secs(600);
const TRANSCODE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const OUTPUT_FILE_NAME: &str = "output.mp4";

pub struct TranscodeStep {
    deps: Arc<PipelineDeps>,
}

impl TranscodeStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

fn mp4_display_name(original: &str) -> String {
    let base = original.rsplit_once('.').map(|(b, _)| b).unwrap_or(original);
    let base = if base.is_empty() { "video" } else { base };
    format!("{base}.mp4")
}

/// Resolve `(object_name, full_gcs_uri)` for a job's output folder. The
/// asset must never be repointed at the folder itself.
fn output_object_path(folder_uri: &str, file_name: &str) -> Option<(String, String)> {
    let (bucket, folder) = parse_gcs_uri(folder_uri).ok()?;
    let object_name = format!("{}/{}", folder.trim_end_matches('/'), file_name);
    let full_uri = format!("gs://{bucket}/{object_name}");
    Some((object_name, full_uri))
}

/// Whether the source carries an audio track.
///
/// Checks the asset record, then what the metadata step already probed, and
/// finally downloads and probes the source itself. Unknown means assume
/// audio so existing behaviour is never broken by a probe hiccup.
async fn detect_has_audio(deps: &PipelineDeps, ctx: &PipelineContext) -> bool {
    if ctx.asset.audio_codec.is_some() {
        return true;
    }

    if let Ok(state) = deps
        .state
        .get(&ctx.user_id, &ctx.project_id, &ctx.asset.id)
        .await
    {
        if let Some(metadata) = state.step_metadata("metadata") {
            if metadata.contains_key("audioCodec") {
                return true;
            }
            // The probe ran and saw no audio stream.
            if metadata.contains_key("videoCodec") || metadata.contains_key("duration") {
                return false;
            }
        }
    }

    let Some(gcs_uri) = ctx.asset.gcs_uri.as_deref() else {
        return true;
    };

    match probe_remote_audio(deps, gcs_uri, &ctx.asset.file_name).await {
        Ok(has_audio) => has_audio,
        Err(e) => {
            warn!(asset_id = %ctx.asset.id, error = %e, "audio probe failed, assuming audio");
            true
        }
    }
}

async fn probe_remote_audio(deps: &PipelineDeps, gcs_uri: &str, file_name: &str) -> Result<bool> {
    let data = deps.blobs.download(gcs_uri).await?;
    let suffix = file_name
        .rsplit_once('.')
        .map(|(_, ext)| format!(".{ext}"))
        .unwrap_or_else(|| ".mp4".to_string());
    let file = super::write_temp(&data, &suffix)?;
    let metadata = crate::probe::extract_metadata(file.path()).await?;
    Ok(metadata.audio_codec.is_some())
}

impl TranscodeStep {
    /// Shadow the job's progress on the asset record for UI polling.
    async fn set_asset_status(
        &self,
        ctx: &PipelineContext,
        status: JobStatus,
        error: Option<&str>,
    ) {
        let mut updates = Map::new();
        updates.insert("transcodeStatus".to_string(), json!(status));
        updates.insert("transcodeError".to_string(), json!(error));

        if let Err(e) = self
            .deps
            .assets
            .update(
                &ctx.user_id,
                &ctx.project_id,
                &ctx.asset.id,
                Value::Object(updates),
            )
            .await
        {
            warn!(asset_id = %ctx.asset.id, error = %e, "failed to update asset transcode status");
        }
    }

    /// Repoint the asset record at the transcoded MP4, backing up the
    /// original coordinates.
    async fn repoint_asset(
        &self,
        ctx: &PipelineContext,
        input_gcs_uri: &str,
        object_name: &str,
        full_gcs_uri: &str,
        signed_url: Option<&str>,
    ) -> Result<()> {
        if object_name.trim().is_empty() {
            return Err(AppError::Internal(
                "transcoded object name is required, asset not updated".to_string(),
            ));
        }

        let display_name = mp4_display_name(&ctx.asset.file_name);
        let updates = json!({
            "originalGcsUri": input_gcs_uri,
            "originalObjectName": ctx.asset.object_name.clone().unwrap_or_default(),
            "originalSignedUrl": ctx.asset.signed_url,
            "originalMimeType": ctx.asset.mime_type,
            "gcsUri": full_gcs_uri,
            "objectName": object_name,
            "signedUrl": signed_url,
            "mimeType": "video/mp4",
            "name": display_name,
            "fileName": display_name,
            "transcoded": true,
            "transcodedAt": now_iso(),
            "transcodeStatus": JobStatus::Completed,
            "transcodeError": Value::Null,
        });

        self.deps
            .assets
            .update(&ctx.user_id, &ctx.project_id, &ctx.asset.id, updates)
            .await?;
        info!(asset_id = %ctx.asset.id, gcs_uri = %full_gcs_uri, "asset repointed to transcoded output");
        Ok(())
    }

    /// Poll the remote job to a terminal state and update the job record.
    /// Returns `(succeeded, step_metadata)`.
    async fn poll_until_complete(
        &self,
        ctx: &PipelineContext,
        job_name: &str,
        job_id: &str,
        output_folder_uri: &str,
        config: &Map<String, Value>,
    ) -> (bool, Map<String, Value>) {
        let started = Instant::now();

        loop {
            match self.deps.transcoder.job_state(job_name).await {
                Ok(state) => match state.phase {
                    RemotePhase::Succeeded => {
                        let (object_name, full_uri) =
                            match output_object_path(output_folder_uri, OUTPUT_FILE_NAME) {
                                Some(resolved) => resolved,
                                None => {
                                    return (
                                        false,
                                        crate::pipeline::types::metadata_map([
                                            ("message", json!("transcode output path unresolvable")),
                                            ("jobId", json!(job_id)),
                                            ("config", json!(config)),
                                        ]),
                                    )
                                }
                            };

                        let signed_url = self
                            .deps
                            .blobs
                            .signed_read_url(&object_name, None, None)
                            .map_err(|e| {
                                warn!(error = %e, "failed to sign transcoded output URL");
                            })
                            .ok();

                        let _ = self
                            .deps
                            .transcode_jobs
                            .update(
                                &ctx.user_id,
                                &ctx.project_id,
                                job_id,
                                json!({
                                    "status": JobStatus::Completed,
                                    "outputObjectName": object_name,
                                    "outputSignedUrl": signed_url,
                                    "outputFileName": OUTPUT_FILE_NAME,
                                }),
                            )
                            .await;

                        return (
                            true,
                            crate::pipeline::types::metadata_map([
                                ("message", json!("Transcoding completed")),
                                ("jobId", json!(job_id)),
                                ("outputGcsUri", json!(full_uri)),
                                ("outputObjectName", json!(object_name)),
                                ("outputSignedUrl", json!(signed_url)),
                                ("outputFileName", json!(OUTPUT_FILE_NAME)),
                                ("config", json!(config)),
                            ]),
                        );
                    }
                    RemotePhase::Failed => {
                        let error = state.error.unwrap_or_else(|| "unknown error".to_string());
                        let _ = self
                            .deps
                            .transcode_jobs
                            .update(
                                &ctx.user_id,
                                &ctx.project_id,
                                job_id,
                                json!({"status": JobStatus::Error, "error": error}),
                            )
                            .await;
                        return (
                            false,
                            crate::pipeline::types::metadata_map([
                                ("message", json!("Transcoding failed")),
                                ("jobId", json!(job_id)),
                                ("error", json!(error)),
                                ("config", json!(config)),
                            ]),
                        );
                    }
                    RemotePhase::Pending | RemotePhase::Running => {
                        info!(
                            job_name = %job_name,
                            elapsed_secs = started.elapsed().as_secs(),
                            "transcode still running"
                        );
                    }
                },
                Err(e) => warn!(job_name = %job_name, error = %e, "transcode poll error"),
            }

            if started.elapsed() >= MAX_TRANSCODE_WAIT {
                let message =
                    format!("transcoding timed out after {}s", MAX_TRANSCODE_WAIT.as_secs());
                let _ = self
                    .deps
                    .transcode_jobs
                    .update(
                        &ctx.user_id,
                        &ctx.project_id,
                        job_id,
                        json!({"status": JobStatus::Error, "error": message}),
                    )
                    .await;
                return (
                    false,
                    crate::pipeline::types::metadata_map([
                        ("message", json!(message)),
                        ("jobId", json!(job_id)),
                        ("config", json!(config)),
                    ]),
                );
            }

            tokio::time::sleep(TRANSCODE_POLL_INTERVAL).await;
        }
    }

    async fn finish_success(
        &self,
        ctx: &PipelineContext,
        input_gcs_uri: &str,
        metadata: Map<String, Value>,
    ) -> Result<PipelineResult> {
        let object_name = metadata
            .get("outputObjectName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if object_name.trim().is_empty() {
            return Ok(PipelineResult::failed(
                "transcode completed but output path missing, asset not updated",
                metadata,
            ));
        }

        let full_uri = metadata
            .get("outputGcsUri")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let signed_url = metadata
            .get("outputSignedUrl")
            .and_then(Value::as_str)
            .map(str::to_string);

        self.repoint_asset(
            ctx,
            input_gcs_uri,
            &object_name,
            &full_uri,
            signed_url.as_deref(),
        )
        .await?;

        super::reextract_metadata(
            &self.deps,
            &ctx.user_id,
            &ctx.project_id,
            &ctx.asset.id,
            &full_uri,
            ".mp4",
            "reextractedAfterTranscode",
        )
        .await;

        Ok(PipelineResult::succeeded(metadata))
    }

    async fn execute(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        let has_audio = detect_has_audio(&self.deps, ctx).await;
        if !has_audio {
            info!(asset_id = %ctx.asset.id, "no audio track, building video-only transcode config");
        }

        let spec = TranscodeSpec::from_params(
            &ctx.params,
            has_audio,
            self.deps.config.transcode_target_height,
        );
        let mut config = spec.config_map();
        let hash = config_hash(&config);

        let existing = self
            .deps
            .transcode_jobs
            .find_latest_for_asset(&ctx.user_id, &ctx.project_id, &ctx.asset.id, Some(&hash))
            .await?;

        if let Some(job) = existing {
            match job.status {
                JobStatus::Completed => return self.reuse_completed(ctx, &job, &config).await,
                JobStatus::Error => {
                    // No silent retry; delete the record to force one.
                    return Ok(PipelineResult::failed(
                        job.error
                            .clone()
                            .unwrap_or_else(|| "transcoding failed previously".to_string()),
                        crate::pipeline::types::metadata_map([
                            ("message", json!("Transcoding failed (previous attempt)")),
                            ("jobId", json!(job.id)),
                            ("error", json!(job.error)),
                            ("config", json!(config)),
                        ]),
                    ));
                }
                JobStatus::Processing if job.remote_job_name.is_some() => {
                    info!(job_id = %job.id, "resuming poll for transcode job");
                    let job_name = job.remote_job_name.clone().unwrap_or_default();
                    let folder = job.output_gcs_uri.clone().unwrap_or_default();
                    let (ok, metadata) = self
                        .poll_until_complete(ctx, &job_name, &job.id, &folder, &config)
                        .await;
                    return if ok {
                        self.finish_success(ctx, &job.input_gcs_uri, metadata).await
                    } else {
                        let error = metadata
                            .get("error")
                            .or_else(|| metadata.get("message"))
                            .and_then(Value::as_str)
                            .unwrap_or("unknown transcode error")
                            .to_string();
                        self.set_asset_status(ctx, JobStatus::Error, Some(&error)).await;
                        Ok(PipelineResult::failed(error, metadata))
                    };
                }
                _ => {}
            }
        }

        // No usable prior job: start a new one.
        let input_gcs_uri = ctx
            .asset
            .gcs_uri
            .clone()
            .ok_or_else(|| {
                AppError::Validation("asset must be uploaded before transcoding".to_string())
            })?;

        let output_path = format!(
            "{}/{}/transcoded/{}/{hash}/",
            ctx.user_id, ctx.project_id, ctx.asset.id
        );
        let output_gcs_uri = format!("gs://{}/{}", self.deps.blobs.bucket(), output_path);

        let job_name = match self
            .deps
            .transcoder
            .create_job(&input_gcs_uri, &output_gcs_uri, &spec)
            .await
        {
            Ok(name) => name,
            Err(e) => {
                let message = format!("failed to create transcode job: {e}");
                warn!(asset_id = %ctx.asset.id, "{message}");
                self.set_asset_status(ctx, JobStatus::Error, Some(&message)).await;
                return Ok(PipelineResult::failed(
                    message.clone(),
                    crate::pipeline::types::metadata_map([
                        ("message", json!(message)),
                        ("config", json!(config)),
                    ]),
                ));
            }
        };

        config.insert("hash".to_string(), json!(hash));
        let now = now_iso();
        let job = JobRecord {
            id: Uuid::new_v4().to_string(),
            asset_id: ctx.asset.id.clone(),
            asset_name: ctx.asset.name.clone(),
            file_name: ctx.asset.file_name.clone(),
            mime_type: ctx.asset.mime_type.clone(),
            input_gcs_uri: input_gcs_uri.clone(),
            output_gcs_uri: Some(output_gcs_uri.clone()),
            status: JobStatus::Processing,
            remote_job_name: Some(job_name.clone()),
            config: config.clone(),
            created_at: now.clone(),
            updated_at: now,
            user_id: ctx.user_id.clone(),
            project_id: ctx.project_id.clone(),
            ..Default::default()
        };
        self.deps.transcode_jobs.save(&job).await?;
        info!(job_id = %job.id, asset_id = %ctx.asset.id, "started transcode job");

        self.set_asset_status(ctx, JobStatus::Processing, None).await;
        config.remove("hash");

        let (ok, metadata) = self
            .poll_until_complete(ctx, &job_name, &job.id, &output_gcs_uri, &config)
            .await;

        if ok {
            self.finish_success(ctx, &input_gcs_uri, metadata).await
        } else {
            let error = metadata
                .get("error")
                .or_else(|| metadata.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown transcode error")
                .to_string();
            self.set_asset_status(ctx, JobStatus::Error, Some(&error)).await;
            Ok(PipelineResult::failed(error, metadata))
        }
    }

    /// Reuse a prior completed job, repointing the asset if it still points
    /// at the original.
    async fn reuse_completed(
        &self,
        ctx: &PipelineContext,
        job: &JobRecord,
        config: &Map<String, Value>,
    ) -> Result<PipelineResult> {
        info!(job_id = %job.id, "using existing completed transcode job");

        let folder = job.output_gcs_uri.clone().unwrap_or_default();
        let file_name = job
            .output_file_name
            .clone()
            .unwrap_or_else(|| OUTPUT_FILE_NAME.to_string());
        let Some((object_name, full_uri)) = output_object_path(&folder, &file_name) else {
            return Ok(PipelineResult::failed(
                "could not resolve transcoded output path for existing job",
                crate::pipeline::types::metadata_map([
                    ("message", json!("Could not resolve transcoded output path")),
                    ("jobId", json!(job.id)),
                    ("config", json!(config)),
                ]),
            ));
        };

        let signed_url = match job.output_signed_url.clone() {
            Some(url) => Some(url),
            None => self
                .deps
                .blobs
                .signed_read_url(&object_name, None, None)
                .ok(),
        };

        if !ctx.asset.transcoded {
            self.repoint_asset(
                ctx,
                &job.input_gcs_uri,
                &object_name,
                &full_uri,
                signed_url.as_deref(),
            )
            .await?;

            super::reextract_metadata(
                &self.deps,
                &ctx.user_id,
                &ctx.project_id,
                &ctx.asset.id,
                &full_uri,
                ".mp4",
                "reextractedAfterTranscode",
            )
            .await;
        }

        Ok(PipelineResult::succeeded(crate::pipeline::types::metadata_map([
            ("message", json!("Transcoding completed (cached)")),
            ("jobId", json!(job.id)),
            ("outputGcsUri", json!(full_uri)),
            ("outputObjectName", json!(object_name)),
            ("outputSignedUrl", json!(signed_url)),
            ("outputFileName", json!(file_name)),
            ("config", json!(config)),
        ])))
    }
}

#[async_trait]
impl StepRunner for TranscodeStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        self.execute(ctx).await
    }
}

/// On-demand transcode outside the engine: load the asset record and drive
/// the same coordinator.
pub async fn run_transcode_for_asset(
    deps: &Arc<PipelineDeps>,
    user_id: &str,
    project_id: &str,
    asset_id: &str,
    params: Value,
) -> Result<PipelineResult> {
    let asset: Asset = deps.assets.get(user_id, project_id, asset_id).await?;
    let asset_type = classify_asset_type(&asset.mime_type, Some(&asset.file_name));

    let ctx = PipelineContext {
        asset,
        asset_path: std::path::PathBuf::new(),
        asset_type,
        step_state: StepState::idle("transcode", "Transcode video"),
        user_id: user_id.to_string(),
        project_id: project_id.to_string(),
        params,
    };

    TranscodeStep::new(deps.clone()).execute(&ctx).await
}
