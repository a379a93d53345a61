//! Pipeline type definitions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{now_iso, Asset, AssetType};

/// Status of a single pipeline step.
///
/// Only `Succeeded` and `Failed` are terminal; a `Waiting` step is eligible
/// to run again (it is how long-running external jobs re-enter the engine).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Idle,
    Running,
    Waiting,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }
}

/// Persisted state of one pipeline step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub id: String,
    pub label: String,
    pub status: StepStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

impl StepState {
    /// A fresh `idle` entry for a step that has never run.
    pub fn idle(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            status: StepStatus::Idle,
            metadata: Map::new(),
            error: None,
            started_at: None,
            updated_at: now_iso(),
        }
    }
}

/// Per-asset pipeline state document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub asset_id: String,
    pub steps: Vec<StepState>,
    pub updated_at: String,
}

impl PipelineState {
    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Metadata of a step, if it has any recorded.
    pub fn step_metadata(&self, step_id: &str) -> Option<&Map<String, Value>> {
        self.step(step_id).map(|s| &s.metadata)
    }
}

/// Context handed to a step runner.
#[derive(Clone, Debug)]
pub struct PipelineContext {
    pub asset: Asset,
    /// Local path of the materialised asset; may be empty for steps that only
    /// work against the blob store.
    pub asset_path: PathBuf,
    pub asset_type: AssetType,
    /// The step's persisted state as of the start of this run.
    pub step_state: StepState,
    pub user_id: String,
    pub project_id: String,
    /// Free-form caller parameters.
    pub params: Value,
}

impl PipelineContext {
    /// A string parameter, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Outcome a step runner reports back to the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineResult {
    pub status: StepStatus,
    pub metadata: Map<String, Value>,
    pub error: Option<String>,
}

impl PipelineResult {
    pub fn succeeded(metadata: Map<String, Value>) -> Self {
        Self {
            status: StepStatus::Succeeded,
            metadata,
            error: None,
        }
    }

    pub fn waiting(metadata: Map<String, Value>) -> Self {
        Self {
            status: StepStatus::Waiting,
            metadata,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            status: StepStatus::Failed,
            metadata,
            error: Some(error.into()),
        }
    }
}

/// Build a metadata map from `(key, value)` pairs.
pub fn metadata_map<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert(key.to_string(), value);
    }
    map
}
