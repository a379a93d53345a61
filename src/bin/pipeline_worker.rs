//! Pipeline worker process.
//!
//! Connects to the task broker, wires up the service graph, registers the
//! pipeline steps, and drains the task queue with a pool of concurrent
//! slots. SIGINT/SIGTERM flip a cooperative shutdown flag; in-flight tasks
//! finish their current call and the broker connection closes last.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use asset_service::auth::{GcpAuth, ServiceAccountKey};
use asset_service::config::Config;
use asset_service::db::{job_repo, AssetRepo, FirestoreClient, JobRepo};
use asset_service::keys::KeyRotator;
use asset_service::pipeline::engine::PipelineEngine;
use asset_service::pipeline::registry::StepRegistry;
use asset_service::pipeline::state::PipelineStateStore;
use asset_service::pipeline::{steps, PipelineDeps};
use asset_service::services::cloudconvert::CloudConvertClient;
use asset_service::services::gemini::GeminiClient;
use asset_service::services::pubsub::PubSubPublisher;
use asset_service::services::speech::{SpeechClient, SpeechEnv};
use asset_service::services::transcoder::TranscoderClient;
use asset_service::services::video_intelligence::VideoIntelligenceClient;
use asset_service::storage::GcsClient;
use asset_service::tasks::{RedisBroker, TaskQueue, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pipeline_worker=info".parse().expect("valid directive"))
                .add_directive("asset_service=info".parse().expect("valid directive")),
        )
        .init();

    info!("starting pipeline worker");

    let config = Arc::new(Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?);
    info!(
        bucket = %config.asset_bucket,
        concurrency = config.worker_concurrency,
        "configuration loaded"
    );

    let key_raw = config
        .service_account_key
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("GOOGLE_SERVICE_ACCOUNT_KEY not set"))?;
    let sa_key = ServiceAccountKey::load(key_raw).map_err(|e| anyhow::anyhow!("{e}"))?;
    let auth = Arc::new(GcpAuth::new(sa_key.clone()).map_err(|e| anyhow::anyhow!("{e}"))?);

    // Storage gateways.
    let blobs = Arc::new(
        GcsClient::new(
            &sa_key,
            &config.asset_bucket,
            Duration::from_secs(config.signed_url_ttl_secs),
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    let docs = Arc::new(
        FirestoreClient::new(auth.clone(), &config.google_project_id)
            .map_err(|e| anyhow::anyhow!("{e}"))?,
    );

    // Repositories.
    let assets = Arc::new(AssetRepo::new(docs.clone()));
    let transcode_jobs = Arc::new(JobRepo::new(docs.clone(), job_repo::TRANSCODE_JOBS));
    let conversion_jobs = Arc::new(JobRepo::new(docs.clone(), job_repo::CONVERSION_JOBS));
    let transcription_jobs = Arc::new(JobRepo::new(docs.clone(), job_repo::TRANSCRIPTION_JOBS));

    // Remote service clients.
    let transcoder = Arc::new(
        TranscoderClient::new(
            auth.clone(),
            config.effective_transcoder_project_id(),
            &config.transcoder_location,
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    let converter = match config.cloudconvert_api_key.as_deref() {
        Some(api_key) => Some(Arc::new(
            CloudConvertClient::new(api_key, config.cloudconvert_sandbox)
                .map_err(|e| anyhow::anyhow!("{e}"))?,
        ) as Arc<dyn asset_service::services::cloudconvert::ConvertApi>),
        None => {
            warn!("CLOUDCONVERT_API_KEY not set, image conversion disabled");
            None
        }
    };
    let speech = Arc::new(
        SpeechClient::new(
            auth.clone(),
            SpeechEnv {
                project_id: config.effective_speech_project_id().to_string(),
                location: config.speech_location.clone(),
                recognizer_id: config.speech_recognizer_id.clone(),
                model: config.speech_model.clone(),
            },
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    let annotator = Arc::new(
        VideoIntelligenceClient::new(auth.clone()).map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    let analyzer =
        Arc::new(GeminiClient::new(blobs.clone()).map_err(|e| anyhow::anyhow!("{e}"))?);
    let events = Arc::new(
        PubSubPublisher::new(
            auth.clone(),
            &config.google_project_id,
            &config.pipeline_event_topic,
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?,
    );

    let keys = Arc::new(KeyRotator::new());
    keys.init(config.gemini_api_keys.as_deref());

    // Registry and engine. Step registration must finish before the first
    // task is dequeued.
    let registry = Arc::new(StepRegistry::new());
    let state = Arc::new(PipelineStateStore::new(docs.clone(), registry.clone()));
    let deps = Arc::new(PipelineDeps {
        config: config.clone(),
        blobs: blobs.clone(),
        assets,
        state: state.clone(),
        transcode_jobs,
        conversion_jobs,
        transcription_jobs,
        transcoder,
        converter,
        speech,
        annotator,
        analyzer,
        keys,
    });
    steps::register_all(&registry, &deps);
    info!(steps = registry.len(), "pipeline steps registered");

    let engine = Arc::new(PipelineEngine::new(registry, state));

    // Broker connection; closed only after the pool drains.
    let broker = Arc::new(
        RedisBroker::connect(&config.redis_url)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    let queue = Arc::new(TaskQueue::new(broker));

    // Cooperative shutdown on SIGINT/SIGTERM.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let pool = Arc::new(WorkerPool::new(
        queue,
        engine,
        blobs,
        events,
        config.worker_concurrency,
        shutdown_rx,
    ));
    pool.run().await;

    info!("pipeline worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to listen for SIGTERM");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
