//! Redis-backed task queue.
//!
//! One logical FIFO (`LPUSH` / `BRPOP`) plus a TTL'd status record per task.
//! Both survive process restarts; parallelism comes from worker slots, not
//! from multiple queues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    now_iso, PipelineTaskPayload, StepTaskPayload, Task, TaskKind, TaskStatus,
};

pub const PIPELINE_QUEUE: &str = "pipeline_tasks";
pub const TASK_STATUS_PREFIX: &str = "task_status:";
/// Status records expire after a day.
const STATUS_TTL: Duration = Duration::from_secs(60 * 60 * 24);

/// Narrow interface over the broker primitives the queue needs.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn push(&self, queue_key: &str, payload: &str) -> Result<()>;
    /// Blocking pop from the right of the list; `None` on timeout.
    async fn pop(&self, queue_key: &str, timeout: Duration) -> Result<Option<String>>;
    async fn put_status(&self, key: &str, payload: &str, ttl: Duration) -> Result<()>;
    async fn get_status(&self, key: &str) -> Result<Option<String>>;
}

/// Redis implementation of [`Broker`].
pub struct RedisBroker {
    conn: Mutex<ConnectionManager>,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %redis_url, "connected to task broker");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, queue_key: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.lpush::<_, _, ()>(queue_key, payload).await?;
        Ok(())
    }

    async fn pop(&self, queue_key: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        let result: Option<(String, String)> =
            conn.brpop(queue_key, timeout.as_secs_f64()).await?;
        Ok(result.map(|(_, payload)| payload))
    }

    async fn put_status(&self, key: &str, payload: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.set_ex::<_, _, ()>(key, payload, ttl.as_secs()).await?;
        Ok(())
    }

    async fn get_status(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        Ok(conn.get(key).await?)
    }
}

/// Task queue over a [`Broker`].
#[derive(Clone)]
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
}

impl TaskQueue {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Enqueue a full-pipeline task; returns the task id.
    pub async fn enqueue_pipeline(&self, payload: PipelineTaskPayload) -> Result<String> {
        let asset_id = payload.asset_id.clone();
        let id = self.enqueue(TaskKind::Pipeline(payload)).await?;
        info!(task_id = %id, asset_id = %asset_id, "enqueued pipeline task");
        Ok(id)
    }

    /// Enqueue a single-step task; returns the task id.
    pub async fn enqueue_step(&self, payload: StepTaskPayload) -> Result<String> {
        let asset_id = payload.asset_id.clone();
        let step_id = payload.step_id.clone();
        let id = self.enqueue(TaskKind::Step(payload)).await?;
        info!(task_id = %id, asset_id = %asset_id, step_id = %step_id, "enqueued step task");
        Ok(id)
    }

    async fn enqueue(&self, kind: TaskKind) -> Result<String> {
        let now = now_iso();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            kind,
            status: TaskStatus::Pending,
            created_at: now.clone(),
        };

        self.broker
            .put_status(
                &status_key(&task.id),
                &serde_json::to_string(&json!({"status": TaskStatus::Pending, "createdAt": now}))?,
                STATUS_TTL,
            )
            .await?;

        self.broker
            .push(PIPELINE_QUEUE, &serde_json::to_string(&task)?)
            .await?;

        Ok(task.id)
    }

    /// Blocking dequeue; `None` when nothing arrived within the timeout.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>> {
        match self.broker.pop(PIPELINE_QUEUE, timeout).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut record = json!({"status": status, "updatedAt": now_iso()});
        if let Some(error) = error {
            record["error"] = json!(error);
        }

        self.broker
            .put_status(&status_key(task_id), &serde_json::to_string(&record)?, STATUS_TTL)
            .await
    }

    pub async fn get_status(&self, task_id: &str) -> Result<Option<Value>> {
        match self.broker.get_status(&status_key(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

pub fn status_key(task_id: &str) -> String {
    format!("{TASK_STATUS_PREFIX}{task_id}")
}
