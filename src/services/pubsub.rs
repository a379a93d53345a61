//! Pipeline completion event publishing.
//!
//! One JSON message per terminal pipeline run. Delivery is at-least-once;
//! publish failures are logged by the caller and never fail the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::auth::GcpAuth;
use crate::error::{AppError, Result};
use crate::models::now_iso;
use crate::pipeline::types::{PipelineState, StepStatus};

pub const EVENT_PIPELINE_COMPLETED: &str = "pipeline.completed";
pub const EVENT_PIPELINE_FAILED: &str = "pipeline.failed";

/// Per-step outcome carried in the event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub id: String,
    pub label: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal pipeline event, one per asset run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_id: String,
    pub project_id: String,
    pub asset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_name: Option<String>,
    pub steps_summary: Vec<StepSummary>,
    pub metadata: Value,
    pub timestamp: String,
}

impl PipelineEvent {
    /// Build the terminal event from a finished pipeline state. Steps that
    /// never left `idle` (unsupported for the asset type) are omitted.
    pub fn from_state(
        user_id: &str,
        project_id: &str,
        asset_name: Option<String>,
        state: &PipelineState,
        agent_metadata: Option<Value>,
    ) -> Self {
        let steps_summary: Vec<StepSummary> = state
            .steps
            .iter()
            .filter(|s| s.status != StepStatus::Idle)
            .map(|s| StepSummary {
                id: s.id.clone(),
                label: s.label.clone(),
                status: s.status,
                error: s.error.clone(),
            })
            .collect();

        let failed = steps_summary.iter().any(|s| s.status == StepStatus::Failed);
        let event_type = if failed {
            EVENT_PIPELINE_FAILED
        } else {
            EVENT_PIPELINE_COMPLETED
        };

        let mut metadata = serde_json::Map::new();
        if let Some(agent) = agent_metadata {
            metadata.insert("agent".to_string(), agent);
        }

        Self {
            event_type: event_type.to_string(),
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            asset_id: state.asset_id.clone(),
            asset_name,
            steps_summary,
            metadata: Value::Object(metadata),
            timestamp: now_iso(),
        }
    }
}

/// Narrow interface over the event topic.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish an event, returning the broker's message id.
    async fn publish(&self, event: &PipelineEvent) -> Result<String>;
}

pub struct PubSubPublisher {
    auth: std::sync::Arc<GcpAuth>,
    http: reqwest::Client,
    topic_path: String,
}

impl PubSubPublisher {
    pub fn new(auth: std::sync::Arc<GcpAuth>, project_id: &str, topic: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Backend(format!("http client: {e}")))?;

        Ok(Self {
            auth,
            http,
            topic_path: format!("projects/{project_id}/topics/{topic}"),
        })
    }
}

#[async_trait]
impl EventSink for PubSubPublisher {
    async fn publish(&self, event: &PipelineEvent) -> Result<String> {
        let data = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(event)?);

        let token = self.auth.access_token().await?;
        let response = self
            .http
            .post(format!(
                "https://pubsub.googleapis.com/v1/{}:publish",
                self.topic_path
            ))
            .bearer_auth(token)
            .json(&serde_json::json!({"messages": [{"data": data}]}))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "pubsub publish failed with {status}: {body}"
            )));
        }

        let body: Value = response.json().await?;
        let message_id = body
            .get("messageIds")
            .and_then(Value::as_array)
            .and_then(|ids| ids.first())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        info!(
            event_type = %event.event_type,
            asset_id = %event.asset_id,
            message_id = %message_id,
            "published pipeline event"
        );
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::StepState;
    use serde_json::json;

    fn state_with(statuses: &[(&str, StepStatus, Option<&str>)]) -> PipelineState {
        PipelineState {
            asset_id: "a1".to_string(),
            steps: statuses
                .iter()
                .map(|(id, status, error)| {
                    let mut step = StepState::idle(id, id);
                    step.status = *status;
                    step.error = error.map(str::to_string);
                    step
                })
                .collect(),
            updated_at: now_iso(),
        }
    }

    #[test]
    fn all_succeeded_is_a_completed_event() {
        let state = state_with(&[
            ("metadata", StepStatus::Succeeded, None),
            ("image-convert", StepStatus::Idle, None),
            ("transcription", StepStatus::Waiting, None),
        ]);

        let event = PipelineEvent::from_state("u1", "p1", Some("clip.mp4".to_string()), &state, None);
        assert_eq!(event.event_type, EVENT_PIPELINE_COMPLETED);
        // Idle (unsupported) steps are not part of the summary.
        assert_eq!(event.steps_summary.len(), 2);
        assert_eq!(event.asset_id, "a1");
    }

    #[test]
    fn any_failure_flips_the_event_type() {
        let state = state_with(&[
            ("metadata", StepStatus::Succeeded, None),
            ("transcode", StepStatus::Failed, Some("remote job failed")),
        ]);

        let event = PipelineEvent::from_state("u1", "p1", None, &state, None);
        assert_eq!(event.event_type, EVENT_PIPELINE_FAILED);
        let failed = &event.steps_summary[1];
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("remote job failed"));
    }

    #[test]
    fn agent_metadata_rides_along() {
        let state = state_with(&[("metadata", StepStatus::Succeeded, None)]);
        let event = PipelineEvent::from_state(
            "u1",
            "p1",
            None,
            &state,
            Some(json!({"threadId": "t-9", "branchId": "b-2"})),
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["metadata"]["agent"]["threadId"], "t-9");
        assert_eq!(value["type"], EVENT_PIPELINE_COMPLETED);
        assert_eq!(value["stepsSummary"][0]["id"], "metadata");
    }
}
