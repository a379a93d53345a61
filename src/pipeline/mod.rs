//! Pipeline engine, step registry, state store and step implementations.

pub mod engine;
pub mod registry;
pub mod state;
pub mod steps;
pub mod types;

use std::sync::Arc;

use crate::config::Config;
use crate::db::{AssetRepo, JobRepo};
use crate::keys::KeyRotator;
use crate::pipeline::state::PipelineStateStore;
use crate::services::cloudconvert::ConvertApi;
use crate::services::gemini::AnalysisModel;
use crate::services::speech::SpeechApi;
use crate::services::transcoder::TranscodeApi;
use crate::services::video_intelligence::VideoAnnotator;
use crate::storage::ObjectStore;

pub use engine::PipelineEngine;
pub use registry::{StepDefinition, StepRegistry, StepRunner};

/// Service handles shared by the step runners.
pub struct PipelineDeps {
    pub config: Arc<Config>,
    pub blobs: Arc<dyn ObjectStore>,
    pub assets: Arc<AssetRepo>,
    pub state: Arc<PipelineStateStore>,
    pub transcode_jobs: Arc<JobRepo>,
    pub conversion_jobs: Arc<JobRepo>,
    pub transcription_jobs: Arc<JobRepo>,
    pub transcoder: Arc<dyn TranscodeApi>,
    /// Absent when the conversion service is not configured; the
    /// image-convert step then reports a no-op success.
    pub converter: Option<Arc<dyn ConvertApi>>,
    pub speech: Arc<dyn SpeechApi>,
    pub annotator: Arc<dyn VideoAnnotator>,
    pub analyzer: Arc<dyn AnalysisModel>,
    pub keys: Arc<KeyRotator>,
}
