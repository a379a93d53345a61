//! Image conversion coordinator step.
//!
//! HEIC/HEIF sources are converted to PNG through the conversion service so
//! browsers and the analysis model can read them. Everything else passes
//! through untouched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{now_iso, JobRecord, JobStatus};
use crate::pipeline::registry::StepRunner;
use crate::pipeline::types::{metadata_map, PipelineContext, PipelineResult};
use crate::pipeline::PipelineDeps;
use crate::services::cloudconvert::{ConvertApi, ConvertPhase};
use crate::services::config_hash;
use crate::storage::ObjectStore;

const MAX_CONVERT_WAIT: Duration = Duration::from_secs(300);
const CONVERT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Closed trigger table: MIME type → `(input_format, output_format)`.
const MIME_TRIGGERS: &[(&str, (&str, &str))] = &[
    ("image/heic", ("heic", "png")),
    ("image/heif", ("heif", "png")),
    ("image/heic-sequence", ("heic", "png")),
    ("image/heif-sequence", ("heif", "png")),
];

const EXT_TRIGGERS: &[(&str, (&str, &str))] = &[
    ("heic", ("heic", "png")),
    ("heif", ("heif", "png")),
];

/// Whether an image needs conversion; MIME wins over the extension fallback.
pub fn needs_conversion(mime_type: &str, file_name: &str) -> Option<(&'static str, &'static str)> {
    let mime = mime_type.to_lowercase();
    if let Some((_, formats)) = MIME_TRIGGERS.iter().find(|(m, _)| *m == mime) {
        return Some(*formats);
    }

    let ext = file_name.rsplit_once('.').map(|(_, e)| e.to_lowercase());
    if let Some(ext) = ext {
        if let Some((_, formats)) = EXT_TRIGGERS.iter().find(|(e, _)| *e == ext) {
            return Some(*formats);
        }
    }
    None
}

fn output_filename(original: &str, output_format: &str) -> String {
    let base = original.rsplit_once('.').map(|(b, _)| b).unwrap_or(original);
    let base = if base.is_empty() { "image" } else { base };
    format!("{base}.{output_format}")
}

fn mime_for(output_format: &str) -> String {
    match output_format {
        "png" => "image/png".to_string(),
        "jpg" | "jpeg" => "image/jpeg".to_string(),
        "webp" => "image/webp".to_string(),
        "gif" => "image/gif".to_string(),
        other => format!("image/{other}"),
    }
}

pub struct ImageConvertStep {
    deps: Arc<PipelineDeps>,
}

impl ImageConvertStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }

    /// Repoint the asset at the converted file, backing up the original.
    async fn repoint_asset(
        &self,
        ctx: &PipelineContext,
        converted_gcs_uri: &str,
        converted_object_name: &str,
        converted_signed_url: Option<&str>,
        converted_filename: &str,
        output_format: &str,
    ) -> Result<()> {
        let updates = json!({
            "originalGcsUri": ctx.asset.gcs_uri.clone().unwrap_or_default(),
            "originalObjectName": ctx.asset.object_name.clone().unwrap_or_default(),
            "originalSignedUrl": ctx.asset.signed_url,
            "originalMimeType": ctx.asset.mime_type,
            "gcsUri": converted_gcs_uri,
            "objectName": converted_object_name,
            "signedUrl": converted_signed_url,
            "mimeType": mime_for(output_format),
            "name": converted_filename,
            "fileName": converted_filename,
            "converted": true,
            "convertedAt": now_iso(),
        });

        self.deps
            .assets
            .update(&ctx.user_id, &ctx.project_id, &ctx.asset.id, updates)
            .await?;
        info!(asset_id = %ctx.asset.id, gcs_uri = %converted_gcs_uri, "asset repointed to converted file");
        Ok(())
    }

    /// Drive the remote conversion to a terminal state.
    async fn wait_for_conversion(
        &self,
        converter: &Arc<dyn ConvertApi>,
        remote_job_id: &str,
    ) -> Result<crate::services::cloudconvert::ConversionState> {
        let started = Instant::now();
        loop {
            let state = converter.job_state(remote_job_id).await?;
            match state.phase {
                ConvertPhase::Finished | ConvertPhase::Error => return Ok(state),
                _ => {}
            }

            if started.elapsed() >= MAX_CONVERT_WAIT {
                return Err(crate::error::AppError::RemoteJobTimeout(format!(
                    "conversion timed out after {}s",
                    MAX_CONVERT_WAIT.as_secs()
                )));
            }
            tokio::time::sleep(CONVERT_POLL_INTERVAL).await;
        }
    }

    async fn mark_job_error(&self, ctx: &PipelineContext, job_id: &str, error: &str) {
        let _ = self
            .deps
            .conversion_jobs
            .update(
                &ctx.user_id,
                &ctx.project_id,
                job_id,
                json!({"status": JobStatus::Error, "error": error}),
            )
            .await;
    }

    async fn finish_conversion(
        &self,
        ctx: &PipelineContext,
        converter: &Arc<dyn ConvertApi>,
        job_id: &str,
        remote_job_id: &str,
        input_format: &str,
        output_format: &str,
        config: &Map<String, Value>,
    ) -> Result<PipelineResult> {
        let state = match self.wait_for_conversion(converter, remote_job_id).await {
            Ok(state) => state,
            Err(e) => {
                self.mark_job_error(ctx, job_id, &e.to_string()).await;
                return Ok(PipelineResult::failed(
                    e.to_string(),
                    metadata_map([("message", json!("Conversion failed")), ("jobId", json!(job_id))]),
                ));
            }
        };

        if state.phase == ConvertPhase::Error {
            let error = state.error.unwrap_or_else(|| "unknown conversion error".to_string());
            self.mark_job_error(ctx, job_id, &error).await;
            return Ok(PipelineResult::failed(
                error.clone(),
                metadata_map([
                    ("message", json!("Conversion failed")),
                    ("jobId", json!(job_id)),
                    ("error", json!(error)),
                ]),
            ));
        }

        let Some(output_url) = state.output_url else {
            self.mark_job_error(ctx, job_id, "no output URL").await;
            return Ok(PipelineResult::failed(
                "conversion finished without an output URL",
                metadata_map([("jobId", json!(job_id))]),
            ));
        };

        // Pull the converted bytes over to our own bucket.
        let filename = state
            .output_filename
            .unwrap_or_else(|| output_filename(&ctx.asset.name, output_format));
        let data = converter.fetch_output(&output_url).await?;

        let object_name = format!(
            "{}/{}/converted/{}/{filename}",
            ctx.user_id, ctx.project_id, ctx.asset.id
        );
        let stored = self
            .deps
            .blobs
            .upload(data, &object_name, &mime_for(output_format))
            .await?;
        let signed_url = self
            .deps
            .blobs
            .signed_read_url(&stored.object_name, None, None)
            .ok();

        self.deps
            .conversion_jobs
            .update(
                &ctx.user_id,
                &ctx.project_id,
                job_id,
                json!({
                    "status": JobStatus::Completed,
                    "outputGcsUri": stored.gcs_uri,
                    "outputObjectName": stored.object_name,
                    "outputSignedUrl": signed_url,
                    "outputFileName": filename,
                    "remoteJobName": remote_job_id,
                }),
            )
            .await?;

        self.repoint_asset(
            ctx,
            &stored.gcs_uri,
            &stored.object_name,
            signed_url.as_deref(),
            &filename,
            output_format,
        )
        .await?;

        super::reextract_metadata(
            &self.deps,
            &ctx.user_id,
            &ctx.project_id,
            &ctx.asset.id,
            &stored.gcs_uri,
            ".png",
            "reextractedAfterConversion",
        )
        .await;

        Ok(PipelineResult::succeeded(metadata_map([
            (
                "message",
                json!(format!(
                    "Converted {} to {}",
                    input_format.to_uppercase(),
                    output_format.to_uppercase()
                )),
            ),
            ("jobId", json!(job_id)),
            ("remoteJobName", json!(remote_job_id)),
            ("inputFormat", json!(input_format)),
            ("outputFormat", json!(output_format)),
            ("outputGcsUri", json!(stored.gcs_uri)),
            ("outputSignedUrl", json!(signed_url)),
            ("outputFileName", json!(filename)),
            ("config", json!(config)),
        ])))
    }
}

#[async_trait]
impl StepRunner for ImageConvertStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        let Some(converter) = self.deps.converter.clone() else {
            info!("conversion service not configured, skipping");
            return Ok(PipelineResult::succeeded(metadata_map([(
                "message",
                json!("conversion service not configured, skipping"),
            )])));
        };

        let Some((input_format, output_format)) =
            needs_conversion(&ctx.asset.mime_type, &ctx.asset.file_name)
        else {
            return Ok(PipelineResult::succeeded(metadata_map([
                ("message", json!("no conversion needed")),
                ("format", json!(ctx.asset.mime_type)),
            ])));
        };

        info!(
            asset_id = %ctx.asset.id,
            from = input_format,
            to = output_format,
            "image conversion required"
        );

        let mut config = Map::new();
        config.insert("inputFormat".to_string(), json!(input_format));
        config.insert("outputFormat".to_string(), json!(output_format));
        let hash = config_hash(&config);

        let existing = self
            .deps
            .conversion_jobs
            .find_latest_for_asset(&ctx.user_id, &ctx.project_id, &ctx.asset.id, Some(&hash))
            .await?;

        if let Some(job) = existing {
            match job.status {
                JobStatus::Completed => {
                    info!(job_id = %job.id, "using existing completed conversion job");
                    if !ctx.asset.converted {
                        let filename = job
                            .output_file_name
                            .clone()
                            .unwrap_or_else(|| output_filename(&ctx.asset.name, output_format));
                        self.repoint_asset(
                            ctx,
                            job.output_gcs_uri.as_deref().unwrap_or_default(),
                            job.output_object_name.as_deref().unwrap_or_default(),
                            job.output_signed_url.as_deref(),
                            &filename,
                            output_format,
                        )
                        .await?;
                    }

                    return Ok(PipelineResult::succeeded(metadata_map([
                        ("message", json!("Conversion completed (cached)")),
                        ("jobId", json!(job.id)),
                        ("inputFormat", json!(input_format)),
                        ("outputFormat", json!(output_format)),
                        ("outputGcsUri", json!(job.output_gcs_uri)),
                        ("outputSignedUrl", json!(job.output_signed_url)),
                    ])));
                }
                JobStatus::Error => {
                    return Ok(PipelineResult::failed(
                        job.error
                            .clone()
                            .unwrap_or_else(|| "conversion failed previously".to_string()),
                        metadata_map([
                            ("message", json!("Conversion failed (previous attempt)")),
                            ("jobId", json!(job.id)),
                            ("error", json!(job.error)),
                        ]),
                    ));
                }
                JobStatus::Processing if job.remote_job_name.is_some() => {
                    info!(job_id = %job.id, "resuming poll for conversion job");
                    let remote = job.remote_job_name.clone().unwrap_or_default();
                    return self
                        .finish_conversion(
                            ctx,
                            &converter,
                            &job.id,
                            &remote,
                            input_format,
                            output_format,
                            &config,
                        )
                        .await;
                }
                _ => {}
            }
        }

        // Fresh signed URL for the input; the stored one may have expired.
        let input_url = match ctx.asset.object_name.as_deref() {
            Some(object_name) => self.deps.blobs.signed_read_url(object_name, None, None)?,
            None => match ctx.asset.signed_url.clone() {
                Some(url) => url,
                None => {
                    return Ok(PipelineResult::failed(
                        "cannot convert: no signed URL for input file",
                        metadata_map([("message", json!("No signed URL available for input"))]),
                    ))
                }
            },
        };

        let filename = output_filename(&ctx.asset.name, output_format);
        let remote_job_id = match converter
            .create_job(&input_url, input_format, output_format, &filename)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(asset_id = %ctx.asset.id, error = %e, "conversion job creation failed");
                return Ok(PipelineResult::failed(
                    e.to_string(),
                    metadata_map([("message", json!("Conversion failed"))]),
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
            input_gcs_uri: ctx.asset.gcs_uri.clone().unwrap_or_default(),
            status: JobStatus::Processing,
            remote_job_name: Some(remote_job_id.clone()),
            config: config.clone(),
            created_at: now.clone(),
            updated_at: now,
            user_id: ctx.user_id.clone(),
            project_id: ctx.project_id.clone(),
            ..Default::default()
        };
        self.deps.conversion_jobs.save(&job).await?;
        config.remove("hash");

        self.finish_conversion(
            ctx,
            &converter,
            &job.id,
            &remote_job_id,
            input_format,
            output_format,
            &config,
        )
        .await
    }
}
