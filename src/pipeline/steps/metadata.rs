//! Metadata extraction step.

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::error::Result;
use crate::pipeline::registry::StepRunner;
use crate::pipeline::types::{PipelineContext, PipelineResult};
use crate::probe::{classify_asset_type, extract_metadata};

pub struct MetadataStep;

impl MetadataStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MetadataStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepRunner for MetadataStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        let mut metadata = serde_json::Map::new();
        metadata.insert("mimeType".to_string(), json!(ctx.asset.mime_type));
        metadata.insert("size".to_string(), json!(ctx.asset.size));
        metadata.insert("uploadedAt".to_string(), json!(ctx.asset.uploaded_at));
        metadata.insert(
            "type".to_string(),
            json!(classify_asset_type(&ctx.asset.mime_type, Some(&ctx.asset.file_name)).as_str()),
        );

        // Probe failure is non-fatal: the step still succeeds with the basic
        // fields and records what went wrong.
        if ctx.asset_path.as_os_str().is_empty() || !ctx.asset_path.exists() {
            return Ok(PipelineResult::succeeded(metadata));
        }

        match extract_metadata(&ctx.asset_path).await {
            Ok(probed) => {
                if let Some(v) = probed.duration {
                    metadata.insert("duration".to_string(), json!(v));
                }
                if let Some(v) = probed.width {
                    metadata.insert("width".to_string(), json!(v));
                }
                if let Some(v) = probed.height {
                    metadata.insert("height".to_string(), json!(v));
                }
                if let Some(v) = probed.codec {
                    metadata.insert("videoCodec".to_string(), json!(v));
                }
                if let Some(v) = probed.audio_codec {
                    metadata.insert("audioCodec".to_string(), json!(v));
                }
                if let Some(v) = probed.sample_rate {
                    metadata.insert("sampleRate".to_string(), json!(v));
                }
                if let Some(v) = probed.channels {
                    metadata.insert("channels".to_string(), json!(v));
                }
                if let Some(v) = probed.bitrate {
                    metadata.insert("bitrate".to_string(), json!(v));
                }
                if let Some(v) = probed.format_name {
                    metadata.insert("formatName".to_string(), json!(v));
                }
                if let Some(v) = probed.size {
                    metadata.insert("fileSize".to_string(), json!(v));
                }
            }
            Err(e) => {
                warn!(asset_id = %ctx.asset.id, error = %e, "metadata probe failed");
                metadata.insert("metadataError".to_string(), json!(e.to_string()));
            }
        }

        Ok(PipelineResult::succeeded(metadata))
    }
}
