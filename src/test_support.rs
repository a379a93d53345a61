//! In-memory fakes shared by the unit tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use crate::config::Config;
use crate::db::{AssetRepo, DocumentStore, JobRepo};
use crate::error::{AppError, Result};
use crate::keys::KeyRotator;
use crate::models::{Asset, AssetType};
use crate::pipeline::registry::{StepDefinition, StepRegistry, StepRunner};
use crate::pipeline::state::PipelineStateStore;
use crate::pipeline::types::{PipelineContext, PipelineResult, StepState, StepStatus};
use crate::pipeline::PipelineDeps;
use crate::services::cloudconvert::{ConversionState, ConvertApi, ConvertPhase};
use crate::services::gemini::{AnalysisModel, AnalysisOutcome, AnalysisRequest};
use crate::services::pubsub::{EventSink, PipelineEvent};
use crate::services::speech::{SpeechApi, SpeechOperation};
use crate::services::transcoder::{RemoteJobState, RemotePhase, TranscodeApi, TranscodeSpec};
use crate::services::video_intelligence::{VideoAnnotator, VideoFeature};
use crate::storage::{parse_gcs_uri, ObjectStore, StoredObject};
use crate::tasks::queue::Broker;

/// In-memory document store.
#[derive(Default)]
pub struct MemoryDocs {
    docs: Mutex<HashMap<String, Value>>,
}

impl MemoryDocs {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocs {
    async fn get_doc(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.docs.lock().unwrap().get(path).cloned())
    }

    async fn set_doc(&self, path: &str, doc: Value) -> Result<()> {
        self.docs.lock().unwrap().insert(path.to_string(), doc);
        Ok(())
    }

    async fn merge_doc(&self, path: &str, fields: Value) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs
            .get_mut(path)
            .ok_or_else(|| AppError::NotFound(format!("document not found: {path}")))?;
        let target = doc.as_object_mut().expect("stored doc is an object");
        for (key, value) in fields.as_object().cloned().unwrap_or_default() {
            target.insert(key, value);
        }
        Ok(())
    }

    async fn delete_doc(&self, path: &str) -> Result<bool> {
        Ok(self.docs.lock().unwrap().remove(path).is_some())
    }

    async fn list_docs(&self, collection_path: &str) -> Result<Vec<Value>> {
        let prefix = format!("{collection_path}/");
        Ok(self
            .docs
            .lock()
            .unwrap()
            .iter()
            // Direct children only, not nested subcollections.
            .filter(|(path, _)| {
                path.starts_with(&prefix) && !path[prefix.len()..].contains('/')
            })
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobs {
    objects: Mutex<HashMap<String, Bytes>>,
    bucket: String,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            bucket: "test-bucket".to_string(),
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn contains(&self, object_name: &str) -> bool {
        self.objects.lock().unwrap().contains_key(object_name)
    }

    pub fn put(&self, object_name: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(object_name.to_string(), Bytes::copy_from_slice(data));
    }
}

#[async_trait]
impl ObjectStore for MemoryBlobs {
    async fn upload(
        &self,
        data: Bytes,
        object_name: &str,
        _mime_type: &str,
    ) -> Result<StoredObject> {
        self.objects
            .lock()
            .unwrap()
            .insert(object_name.to_string(), data);
        Ok(StoredObject {
            gcs_uri: format!("gs://{}/{}", self.bucket, object_name),
            bucket: self.bucket.clone(),
            object_name: object_name.to_string(),
        })
    }

    async fn download(&self, gcs_uri: &str) -> Result<Bytes> {
        let (_, object_name) = parse_gcs_uri(gcs_uri)?;
        self.objects
            .lock()
            .unwrap()
            .get(&object_name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("object not found: {gcs_uri}")))
    }

    fn signed_read_url(
        &self,
        object_name: &str,
        bucket: Option<&str>,
        _ttl: Option<Duration>,
    ) -> Result<String> {
        Ok(format!(
            "https://signed.test/{}/{}?sig=test",
            bucket.unwrap_or(&self.bucket),
            object_name
        ))
    }

    fn signed_write_url(
        &self,
        object_name: &str,
        _content_type: &str,
        _ttl: Option<Duration>,
    ) -> Result<String> {
        Ok(format!(
            "https://signed.test/put/{}/{}?sig=test",
            self.bucket, object_name
        ))
    }

    async fn delete(&self, gcs_uri: &str) -> Result<bool> {
        let (_, object_name) = parse_gcs_uri(gcs_uri)?;
        Ok(self.objects.lock().unwrap().remove(&object_name).is_some())
    }

    async fn exists(&self, gcs_uri: &str) -> Result<bool> {
        let (_, object_name) = parse_gcs_uri(gcs_uri)?;
        Ok(self.objects.lock().unwrap().contains_key(&object_name))
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Step runner with a canned outcome and a call counter.
pub struct StaticStep {
    behaviour: Behaviour,
    calls: AtomicUsize,
}

enum Behaviour {
    Result(StepStatus, Value),
    Error(String),
}

impl StaticStep {
    pub fn status(status: StepStatus) -> Self {
        Self {
            behaviour: Behaviour::Result(status, json!({})),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(metadata: Value) -> Self {
        Self {
            behaviour: Behaviour::Result(StepStatus::Succeeded, metadata),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn waiting(metadata: Value) -> Self {
        Self {
            behaviour: Behaviour::Result(StepStatus::Waiting, metadata),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn erroring(message: &str) -> Self {
        Self {
            behaviour: Behaviour::Error(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepRunner for StaticStep {
    async fn run(&self, _ctx: &PipelineContext) -> Result<PipelineResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Result(status, metadata) => Ok(PipelineResult {
                status: *status,
                metadata: metadata.as_object().cloned().unwrap_or_default(),
                error: None,
            }),
            Behaviour::Error(message) => Err(AppError::Internal(message.clone())),
        }
    }
}

/// Scripted transcode API: records created jobs, replays state responses.
#[derive(Default)]
pub struct FakeTranscoder {
    pub created: Mutex<Vec<(String, String)>>,
    states: Mutex<VecDeque<RemoteJobState>>,
}

impl FakeTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_state(&self, phase: RemotePhase, error: Option<&str>) {
        self.states.lock().unwrap().push_back(RemoteJobState {
            phase,
            error: error.map(str::to_string),
        });
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl TranscodeApi for FakeTranscoder {
    async fn create_job(
        &self,
        input_uri: &str,
        output_uri: &str,
        _spec: &TranscodeSpec,
    ) -> Result<String> {
        let mut created = self.created.lock().unwrap();
        created.push((input_uri.to_string(), output_uri.to_string()));
        Ok(format!(
            "projects/test/locations/us-central1/jobs/job-{}",
            created.len()
        ))
    }

    async fn job_state(&self, _job_name: &str) -> Result<RemoteJobState> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RemoteJobState {
                phase: RemotePhase::Succeeded,
                error: None,
            }))
    }
}

/// Scripted conversion API.
#[derive(Default)]
pub struct FakeConverter {
    pub created: Mutex<Vec<(String, String, String)>>,
    states: Mutex<VecDeque<ConversionState>>,
    pub output_bytes: Mutex<Vec<u8>>,
}

impl FakeConverter {
    pub fn new() -> Self {
        Self {
            output_bytes: Mutex::new(b"converted-png".to_vec()),
            ..Default::default()
        }
    }

    pub fn push_state(&self, state: ConversionState) {
        self.states.lock().unwrap().push_back(state);
    }

    pub fn finished(output_url: &str, filename: &str) -> ConversionState {
        ConversionState {
            phase: ConvertPhase::Finished,
            output_url: Some(output_url.to_string()),
            output_filename: Some(filename.to_string()),
            error: None,
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl ConvertApi for FakeConverter {
    async fn create_job(
        &self,
        input_url: &str,
        input_format: &str,
        output_format: &str,
        _filename: &str,
    ) -> Result<String> {
        let mut created = self.created.lock().unwrap();
        created.push((
            input_url.to_string(),
            input_format.to_string(),
            output_format.to_string(),
        ));
        Ok(format!("cc-job-{}", created.len()))
    }

    async fn job_state(&self, _job_id: &str) -> Result<ConversionState> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| FakeConverter::finished("https://cc.test/out.png", "photo.png")))
    }

    async fn fetch_output(&self, _url: &str) -> Result<Bytes> {
        Ok(Bytes::from(self.output_bytes.lock().unwrap().clone()))
    }
}

/// Scripted speech API.
#[derive(Default)]
pub struct FakeSpeech {
    pub started: Mutex<Vec<(String, Vec<String>)>>,
    operations: Mutex<VecDeque<Result<SpeechOperation>>>,
}

impl FakeSpeech {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_operation(&self, op: Result<SpeechOperation>) {
        self.operations.lock().unwrap().push_back(op);
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }
}

#[async_trait]
impl SpeechApi for FakeSpeech {
    async fn start_batch_recognize(
        &self,
        gcs_uri: &str,
        language_codes: &[String],
    ) -> Result<String> {
        let mut started = self.started.lock().unwrap();
        started.push((gcs_uri.to_string(), language_codes.to_vec()));
        Ok(format!("operations/speech-{}", started.len()))
    }

    async fn poll_operation(&self, _operation_name: &str) -> Result<SpeechOperation> {
        self.operations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(SpeechOperation {
                    done: false,
                    error: None,
                    response: None,
                })
            })
    }
}

/// Annotator returning a fixed payload per feature.
#[derive(Default)]
pub struct FakeAnnotator {
    pub responses: Mutex<HashMap<&'static str, Value>>,
    pub calls: Mutex<Vec<&'static str>>,
}

impl FakeAnnotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, feature: VideoFeature, payload: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(feature.as_str(), payload);
    }
}

#[async_trait]
impl VideoAnnotator for FakeAnnotator {
    async fn annotate(&self, _gcs_uri: &str, feature: VideoFeature) -> Result<Value> {
        self.calls.lock().unwrap().push(feature.as_str());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(feature.as_str())
            .cloned()
            .unwrap_or_else(|| json!({})))
    }
}

/// Analysis model driven by a script of per-call results.
#[derive(Default)]
pub struct FakeAnalyzer {
    script: Mutex<VecDeque<Result<AnalysisOutcome>>>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl FakeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: Result<AnalysisOutcome>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn push_ok(&self, analysis: &str) {
        self.push(Ok(AnalysisOutcome {
            analysis: analysis.to_string(),
            total_tokens: Some(100),
            ..Default::default()
        }));
    }

    pub fn push_quota_error(&self) {
        self.push(Err(AppError::QuotaExhausted(
            "429 RESOURCE_EXHAUSTED".to_string(),
        )));
    }

    /// `(api_key, model_id)` per call.
    pub fn call_log(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnalysisModel for FakeAnalyzer {
    async fn analyze(
        &self,
        _request: &AnalysisRequest,
        api_key: &str,
        model_id: &str,
    ) -> Result<AnalysisOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((api_key.to_string(), model_id.to_string()));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(AnalysisOutcome::default()))
    }
}

/// Event sink capturing published events.
#[derive(Default)]
pub struct MemoryEvents {
    pub published: Mutex<Vec<PipelineEvent>>,
}

impl MemoryEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for MemoryEvents {
    async fn publish(&self, event: &PipelineEvent) -> Result<String> {
        let mut published = self.published.lock().unwrap();
        published.push(event.clone());
        Ok(format!("msg-{}", published.len()))
    }
}

/// In-memory broker for worker tests.
#[derive(Default)]
pub struct MemoryBroker {
    queue: Mutex<VecDeque<String>>,
    statuses: Mutex<HashMap<String, String>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_json(&self, key: &str) -> Option<Value> {
        self.statuses
            .lock()
            .unwrap()
            .get(key)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, queue_key: &str, payload: &str) -> Result<()> {
        debug_assert_eq!(queue_key, crate::tasks::queue::PIPELINE_QUEUE);
        self.queue.lock().unwrap().push_front(payload.to_string());
        Ok(())
    }

    async fn pop(&self, queue_key: &str, timeout: Duration) -> Result<Option<String>> {
        debug_assert_eq!(queue_key, crate::tasks::queue::PIPELINE_QUEUE);
        if let Some(task) = self.queue.lock().unwrap().pop_back() {
            return Ok(Some(task));
        }
        // Emulate a blocking pop that times out quickly.
        tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
        Ok(self.queue.lock().unwrap().pop_back())
    }

    async fn put_status(&self, key: &str, payload: &str, _ttl: Duration) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .insert(key.to_string(), payload.to_string());
        Ok(())
    }

    async fn get_status(&self, key: &str) -> Result<Option<String>> {
        Ok(self.statuses.lock().unwrap().get(key).cloned())
    }
}

/// Configuration fixture (no environment involved).
pub fn test_config() -> Config {
    Config {
        google_project_id: "test-project".to_string(),
        service_account_key: None,
        asset_bucket: "test-bucket".to_string(),
        signed_url_ttl_secs: 3600,
        redis_url: "redis://localhost:6379/0".to_string(),
        worker_concurrency: 2,
        transcoder_location: "us-central1".to_string(),
        transcoder_project_id: None,
        transcode_target_height: Some(720),
        pipeline_event_topic: "pipeline-events".to_string(),
        gemini_api_keys: Some("k1,k2,k3".to_string()),
        analysis_model_ids: vec!["model-a".to_string(), "model-b".to_string()],
        speech_project_id: None,
        speech_location: "global".to_string(),
        speech_recognizer_id: "_".to_string(),
        speech_model: "chirp_3".to_string(),
        speech_language_codes: vec!["en-US".to_string()],
        cloudconvert_api_key: Some("cc-key".to_string()),
        cloudconvert_sandbox: false,
        face_detection_max_duration_secs: 120,
    }
}

/// Everything a step test needs: the deps bundle plus concrete handles to
/// the fakes inside it.
pub struct TestHarness {
    pub deps: Arc<PipelineDeps>,
    pub blobs: Arc<MemoryBlobs>,
    pub transcoder: Arc<FakeTranscoder>,
    pub converter: Arc<FakeConverter>,
    pub speech: Arc<FakeSpeech>,
    pub annotator: Arc<FakeAnnotator>,
    pub analyzer: Arc<FakeAnalyzer>,
}

pub fn harness() -> TestHarness {
    build_harness(true)
}

/// Harness with no conversion service configured.
pub fn harness_without_converter() -> TestHarness {
    build_harness(false)
}

fn build_harness(with_converter: bool) -> TestHarness {
    let config = Arc::new(test_config());
    let docs = Arc::new(MemoryDocs::new());
    let blobs = Arc::new(MemoryBlobs::new());
    let registry = test_registry(&[
        "metadata",
        "cloud-upload",
        "audio-extract",
        "thumbnail",
        "image-convert",
        "transcode",
        "transcription",
        "gemini-analysis",
    ]);

    let assets = Arc::new(AssetRepo::new(docs.clone()));
    let state = Arc::new(PipelineStateStore::new(docs.clone(), registry.clone()));
    let transcoder = Arc::new(FakeTranscoder::new());
    let converter = Arc::new(FakeConverter::new());
    let speech = Arc::new(FakeSpeech::new());
    let annotator = Arc::new(FakeAnnotator::new());
    let analyzer = Arc::new(FakeAnalyzer::new());

    let keys = Arc::new(KeyRotator::new());
    keys.init(config.gemini_api_keys.as_deref());

    let deps = Arc::new(PipelineDeps {
        config,
        blobs: blobs.clone(),
        assets,
        state,
        transcode_jobs: Arc::new(JobRepo::new(docs.clone(), crate::db::job_repo::TRANSCODE_JOBS)),
        conversion_jobs: Arc::new(JobRepo::new(
            docs.clone(),
            crate::db::job_repo::CONVERSION_JOBS,
        )),
        transcription_jobs: Arc::new(JobRepo::new(
            docs.clone(),
            crate::db::job_repo::TRANSCRIPTION_JOBS,
        )),
        transcoder: transcoder.clone(),
        converter: if with_converter {
            Some(converter.clone())
        } else {
            None
        },
        speech: speech.clone(),
        annotator: annotator.clone(),
        analyzer: analyzer.clone(),
        keys,
    });

    TestHarness {
        deps,
        blobs,
        transcoder,
        converter,
        speech,
        annotator,
        analyzer,
    }
}

/// Registry of no-op steps with the given ids.
pub fn test_registry(ids: &[&'static str]) -> Arc<StepRegistry> {
    let registry = Arc::new(StepRegistry::new());
    for id in ids {
        registry.register(StepDefinition {
            id,
            label: id,
            description: "",
            auto_start: true,
            supported_types: None,
            runner: Arc::new(StaticStep::status(StepStatus::Succeeded)),
        });
    }
    registry
}

/// A video asset already present in the blob store's namespace.
pub fn video_asset(id: &str) -> Asset {
    Asset {
        id: id.to_string(),
        name: "clip.mp4".to_string(),
        file_name: "clip.mp4".to_string(),
        mime_type: "video/mp4".to_string(),
        size: 1024,
        asset_type: Some(AssetType::Video),
        gcs_uri: Some(format!("gs://test-bucket/assets/{id}/clip.mp4")),
        bucket: Some("test-bucket".to_string()),
        object_name: Some(format!("assets/{id}/clip.mp4")),
        uploaded_at: "2024-01-01T00:00:00Z".to_string(),
        updated_at: "2024-01-01T00:00:00Z".to_string(),
        source: "api".to_string(),
        ..Default::default()
    }
}

/// A HEIC image asset.
pub fn heic_asset(id: &str) -> Asset {
    Asset {
        id: id.to_string(),
        name: "photo.heic".to_string(),
        file_name: "photo.heic".to_string(),
        mime_type: "image/heic".to_string(),
        size: 2048,
        asset_type: Some(AssetType::Image),
        gcs_uri: Some(format!("gs://test-bucket/assets/{id}/photo.heic")),
        bucket: Some("test-bucket".to_string()),
        object_name: Some(format!("assets/{id}/photo.heic")),
        uploaded_at: "2024-01-01T00:00:00Z".to_string(),
        updated_at: "2024-01-01T00:00:00Z".to_string(),
        source: "api".to_string(),
        ..Default::default()
    }
}

/// A pipeline context for the given asset with no local file.
pub fn test_context(asset: Asset) -> PipelineContext {
    let asset_type =
        crate::probe::classify_asset_type(&asset.mime_type, Some(&asset.file_name));
    PipelineContext {
        step_state: StepState::idle("test", "test"),
        asset_path: PathBuf::new(),
        asset_type,
        user_id: "u1".to_string(),
        project_id: "p1".to_string(),
        params: Value::Null,
        asset,
    }
}

/// Seed a step's persisted state for an asset.
pub async fn seed_step(
    deps: &Arc<PipelineDeps>,
    asset_id: &str,
    step_id: &str,
    status: StepStatus,
    metadata: Value,
) {
    let mut step = StepState::idle(step_id, step_id);
    step.status = status;
    step.metadata = metadata.as_object().cloned().unwrap_or_default();
    deps.state
        .update_step("u1", "p1", asset_id, step)
        .await
        .unwrap();
}
