//! Worker pool.
//!
//! One process runs `worker_concurrency` slots; each slot loops on the
//! queue with a short dequeue timeout and checks the shutdown flag every
//! iteration. Assets are materialised into temp files that are removed on
//! every exit path; step runners are idempotent, which is what makes the
//! broker's at-least-once delivery safe.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{AppError, Result};
use crate::models::{Asset, Task, TaskKind, TaskStatus};
use crate::pipeline::engine::PipelineEngine;
use crate::services::pubsub::{EventSink, PipelineEvent};
use crate::storage::ObjectStore;
use crate::tasks::queue::TaskQueue;

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    engine: Arc<PipelineEngine>,
    blobs: Arc<dyn ObjectStore>,
    events: Arc<dyn EventSink>,
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        engine: Arc<PipelineEngine>,
        blobs: Arc<dyn ObjectStore>,
        events: Arc<dyn EventSink>,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            engine,
            blobs,
            events,
            concurrency: concurrency.clamp(1, 32),
            shutdown,
        }
    }

    /// Run all slots until the shutdown flag flips. Returns once every slot
    /// has drained; the caller closes the broker connection afterwards.
    pub async fn run(self: Arc<Self>) {
        info!(slots = self.concurrency, "worker pool starting");

        let handles: Vec<_> = (0..self.concurrency)
            .map(|slot| {
                let pool = self.clone();
                tokio::spawn(async move { pool.slot_loop(slot).await })
            })
            .collect();

        futures::future::join_all(handles).await;
        info!("worker pool stopped");
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn slot_loop(&self, slot: usize) {
        info!(slot, "worker slot started");

        loop {
            if self.shutting_down() {
                break;
            }

            let task = match self.queue.dequeue(DEQUEUE_TIMEOUT).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    warn!(slot, error = %e, "dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            info!(slot, task_id = %task.id, "processing task");
            self.process_task(task).await;
        }

        info!(slot, "worker slot exited");
    }

    /// Process one task, recording its terminal status unless the process is
    /// shutting down (a redelivery will settle it).
    pub(crate) async fn process_task(&self, task: Task) {
        let task_id = task.id.clone();
        if let Err(e) = self
            .queue
            .update_status(&task_id, TaskStatus::Running, None)
            .await
        {
            warn!(task_id = %task_id, error = %e, "failed to mark task running");
        }

        let outcome = match task.kind {
            TaskKind::Pipeline(payload) => self.run_pipeline_task(payload).await,
            TaskKind::Step(payload) => self.run_step_task(payload).await,
        };

        match outcome {
            Ok(()) => {
                if !self.shutting_down() {
                    let _ = self
                        .queue
                        .update_status(&task_id, TaskStatus::Completed, None)
                        .await;
                    info!(task_id = %task_id, "task completed");
                }
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "task failed");
                if !self.shutting_down() {
                    let _ = self
                        .queue
                        .update_status(&task_id, TaskStatus::Failed, Some(&e.to_string()))
                        .await;
                }
            }
        }
    }

    async fn run_pipeline_task(
        &self,
        payload: crate::models::PipelineTaskPayload,
    ) -> Result<()> {
        let asset: Asset = serde_json::from_value(payload.asset_data.clone())?;

        // Reuse a local file when the enqueuer provided one; otherwise
        // materialise the asset from the blob store. The temp file is
        // removed on drop, on every exit path.
        let provided = payload
            .asset_path
            .as_deref()
            .map(PathBuf::from)
            .filter(|p| p.exists());

        let _temp;
        let local_path = match provided {
            Some(path) => path,
            None => {
                let gcs_uri = asset.gcs_uri.as_deref().ok_or_else(|| {
                    AppError::Validation(
                        "no asset file available for pipeline processing".to_string(),
                    )
                })?;
                let temp = self.download_to_temp(gcs_uri, &asset.file_name).await?;
                let path = temp.path().to_path_buf();
                _temp = temp;
                path
            }
        };

        let state = self
            .engine
            .run_auto_steps(&payload.user_id, &payload.project_id, &asset, &local_path)
            .await?;

        // Terminal event, at-least-once; a publish failure never fails the
        // pipeline.
        let event = PipelineEvent::from_state(
            &payload.user_id,
            &payload.project_id,
            Some(asset.name.clone()),
            &state,
            payload.agent_metadata.clone(),
        );
        if let Err(e) = self.events.publish(&event).await {
            warn!(asset_id = %asset.id, error = %e, "failed to publish pipeline event");
        }

        Ok(())
    }

    async fn run_step_task(&self, payload: crate::models::StepTaskPayload) -> Result<()> {
        let asset: Asset = serde_json::from_value(payload.asset_data.clone())?;

        // Single-step runs always work from a fresh download.
        let gcs_uri = asset.gcs_uri.as_deref().ok_or_else(|| {
            AppError::Validation("no asset file available for step processing".to_string())
        })?;
        let temp = self.download_to_temp(gcs_uri, &asset.file_name).await?;

        let params = if payload.params.is_null() {
            Value::Object(Default::default())
        } else {
            payload.params.clone()
        };

        self.engine
            .run_step(
                &payload.user_id,
                &payload.project_id,
                &asset,
                temp.path(),
                &payload.step_id,
                params,
            )
            .await?;
        Ok(())
    }

    async fn download_to_temp(
        &self,
        gcs_uri: &str,
        file_name: &str,
    ) -> Result<tempfile::NamedTempFile> {
        let data = self.blobs.download(gcs_uri).await?;
        let suffix = file_name
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{ext}"))
            .unwrap_or_default();
        let temp = tempfile::Builder::new()
            .suffix(&suffix)
            .tempfile()
            .map_err(|e| AppError::Internal(format!("temp file: {e}")))?;
        tokio::fs::write(temp.path(), &data).await?;
        Ok(temp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PipelineTaskPayload, StepTaskPayload};
    use crate::pipeline::registry::{StepDefinition, StepRegistry};
    use crate::pipeline::state::PipelineStateStore;
    use crate::pipeline::types::StepStatus;
    use crate::services::pubsub::EVENT_PIPELINE_COMPLETED;
    use crate::test_support::{
        video_asset, MemoryBlobs, MemoryBroker, MemoryDocs, MemoryEvents, StaticStep,
    };
    use serde_json::json;

    struct Fixture {
        pool: Arc<WorkerPool>,
        queue: Arc<TaskQueue>,
        broker: Arc<MemoryBroker>,
        blobs: Arc<MemoryBlobs>,
        events: Arc<MemoryEvents>,
        shutdown_tx: watch::Sender<bool>,
        steps: Vec<Arc<StaticStep>>,
    }

    fn fixture(step_defs: Vec<(&'static str, Arc<StaticStep>)>) -> Fixture {
        let broker = Arc::new(MemoryBroker::new());
        let queue = Arc::new(TaskQueue::new(broker.clone()));
        let blobs = Arc::new(MemoryBlobs::new());
        let events = Arc::new(MemoryEvents::new());
        let docs = Arc::new(MemoryDocs::new());

        let registry = Arc::new(StepRegistry::new());
        let mut steps = Vec::new();
        for (id, runner) in step_defs {
            steps.push(runner.clone());
            registry.register(StepDefinition {
                id,
                label: id,
                description: "",
                auto_start: true,
                supported_types: None,
                runner,
            });
        }

        let state = Arc::new(PipelineStateStore::new(docs, registry.clone()));
        let engine = Arc::new(PipelineEngine::new(registry, state));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            engine,
            blobs.clone(),
            events.clone(),
            2,
            shutdown_rx,
        ));

        Fixture {
            pool,
            queue,
            broker,
            blobs,
            events,
            shutdown_tx,
            steps,
        }
    }

    fn pipeline_payload(asset: &crate::models::Asset) -> PipelineTaskPayload {
        PipelineTaskPayload {
            user_id: "u1".to_string(),
            project_id: "p1".to_string(),
            asset_id: asset.id.clone(),
            asset_data: serde_json::to_value(asset).unwrap(),
            asset_path: None,
            agent_metadata: Some(json!({"threadId": "t-1"})),
        }
    }

    #[tokio::test]
    async fn pipeline_task_runs_steps_and_publishes_one_event() {
        let runner = Arc::new(StaticStep::succeeding(json!({})));
        let fx = fixture(vec![("metadata", runner.clone())]);

        let asset = video_asset("a1");
        fx.blobs.put("assets/a1/clip.mp4", b"bytes");

        let id = fx
            .queue
            .enqueue_pipeline(pipeline_payload(&asset))
            .await
            .unwrap();
        let task = fx
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        fx.pool.process_task(task).await;

        assert_eq!(runner.calls(), 1);

        let status = fx.queue.get_status(&id).await.unwrap().unwrap();
        assert_eq!(status["status"], "completed");

        let events = fx.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_PIPELINE_COMPLETED);
        assert_eq!(events[0].asset_id, "a1");
        assert_eq!(events[0].metadata["agent"]["threadId"], "t-1");
    }

    #[tokio::test]
    async fn failing_pipeline_still_completes_the_task_with_failed_event() {
        let runner = Arc::new(StaticStep::erroring("step exploded"));
        let fx = fixture(vec![("metadata", runner)]);

        let asset = video_asset("a1");
        fx.blobs.put("assets/a1/clip.mp4", b"bytes");

        let id = fx
            .queue
            .enqueue_pipeline(pipeline_payload(&asset))
            .await
            .unwrap();
        let task = fx
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        fx.pool.process_task(task).await;

        // Auto-run tolerates failed steps, so the task itself completes and
        // the event reflects the failure.
        let status = fx.queue.get_status(&id).await.unwrap().unwrap();
        assert_eq!(status["status"], "completed");

        let events = fx.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "pipeline.failed");
    }

    #[tokio::test]
    async fn missing_blob_fails_the_task() {
        let fx = fixture(vec![("metadata", Arc::new(StaticStep::succeeding(json!({}))))]);

        let asset = video_asset("a1");
        // No bytes in the blob store.
        let id = fx
            .queue
            .enqueue_pipeline(pipeline_payload(&asset))
            .await
            .unwrap();
        let task = fx
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        fx.pool.process_task(task).await;

        let status = fx.queue.get_status(&id).await.unwrap().unwrap();
        assert_eq!(status["status"], "failed");
        assert!(status["error"].as_str().unwrap().contains("not found"));
        assert!(fx.events.events().is_empty());
    }

    #[tokio::test]
    async fn step_task_runs_one_step() {
        let runner = Arc::new(StaticStep::succeeding(json!({"ok": true})));
        let fx = fixture(vec![("transcode", runner.clone())]);

        let asset = video_asset("a1");
        fx.blobs.put("assets/a1/clip.mp4", b"bytes");

        let id = fx
            .queue
            .enqueue_step(StepTaskPayload {
                user_id: "u1".to_string(),
                project_id: "p1".to_string(),
                asset_id: "a1".to_string(),
                asset_data: serde_json::to_value(&asset).unwrap(),
                step_id: "transcode".to_string(),
                params: json!({"videoCodec": "h265"}),
            })
            .await
            .unwrap();

        let task = fx
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        fx.pool.process_task(task).await;

        assert_eq!(runner.calls(), 1);
        let status = fx.queue.get_status(&id).await.unwrap().unwrap();
        assert_eq!(status["status"], "completed");
        // Step tasks publish no pipeline event.
        assert!(fx.events.events().is_empty());
    }

    #[tokio::test]
    async fn unknown_step_fails_the_task() {
        let fx = fixture(vec![("metadata", Arc::new(StaticStep::succeeding(json!({}))))]);

        let asset = video_asset("a1");
        fx.blobs.put("assets/a1/clip.mp4", b"bytes");

        let id = fx
            .queue
            .enqueue_step(StepTaskPayload {
                user_id: "u1".to_string(),
                project_id: "p1".to_string(),
                asset_id: "a1".to_string(),
                asset_data: serde_json::to_value(&asset).unwrap(),
                step_id: "does-not-exist".to_string(),
                params: json!({}),
            })
            .await
            .unwrap();

        let task = fx
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        fx.pool.process_task(task).await;

        let status = fx.queue.get_status(&id).await.unwrap().unwrap();
        assert_eq!(status["status"], "failed");
    }

    #[tokio::test]
    async fn shutdown_does_not_overwrite_task_status() {
        let fx = fixture(vec![("metadata", Arc::new(StaticStep::succeeding(json!({}))))]);

        let asset = video_asset("a1");
        fx.blobs.put("assets/a1/clip.mp4", b"bytes");
        let id = fx
            .queue
            .enqueue_pipeline(pipeline_payload(&asset))
            .await
            .unwrap();
        let task = fx
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        // Shutdown arrives while the task is in flight.
        fx.shutdown_tx.send(true).unwrap();
        fx.pool.process_task(task).await;

        // The record still says running: the redelivery will settle it.
        let status = fx.queue.get_status(&id).await.unwrap().unwrap();
        assert_eq!(status["status"], "running");
        assert_eq!(fx.steps[0].calls(), 1);
    }

    #[tokio::test]
    async fn pool_drains_and_exits_on_shutdown() {
        let runner = Arc::new(StaticStep::succeeding(json!({})));
        let fx = fixture(vec![("metadata", runner.clone())]);

        let asset = video_asset("a1");
        fx.blobs.put("assets/a1/clip.mp4", b"bytes");
        fx.queue
            .enqueue_pipeline(pipeline_payload(&asset))
            .await
            .unwrap();

        let pool = fx.pool.clone();
        let run = tokio::spawn(pool.run());

        // Give the slots a moment to pick up the task, then shut down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("pool exited after shutdown")
            .unwrap();

        assert_eq!(runner.calls(), 1);
        assert_eq!(fx.broker.queue_len(), 0);
    }
}
