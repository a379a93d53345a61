//! Pipeline state storage.
//!
//! One document per asset. Reads merge the persisted step list with the
//! registry's current set: registry order wins, unknown persisted steps are
//! dropped, missing ones are synthesised as `idle`. Writes always replace the
//! whole document so the step list is never torn by field-level merges.

use std::sync::Arc;

use tracing::debug;

use crate::db::{asset_collection, pipeline_state_doc, DocumentStore};
use crate::error::Result;
use crate::models::now_iso;
use crate::pipeline::registry::StepRegistry;
use crate::pipeline::types::{PipelineState, StepState};

#[derive(Clone)]
pub struct PipelineStateStore {
    docs: Arc<dyn DocumentStore>,
    registry: Arc<StepRegistry>,
}

impl PipelineStateStore {
    pub fn new(docs: Arc<dyn DocumentStore>, registry: Arc<StepRegistry>) -> Self {
        Self { docs, registry }
    }

    fn default_steps(&self) -> Vec<StepState> {
        self.registry
            .catalog()
            .into_iter()
            .map(|(id, label)| StepState::idle(id, label))
            .collect()
    }

    fn merge_with_registry(&self, mut state: PipelineState) -> PipelineState {
        let persisted: Vec<StepState> = std::mem::take(&mut state.steps);
        state.steps = self
            .registry
            .catalog()
            .into_iter()
            .map(|(id, label)| {
                persisted
                    .iter()
                    .find(|s| s.id == id)
                    .cloned()
                    .unwrap_or_else(|| StepState::idle(id, label))
            })
            .collect();
        state
    }

    /// Pipeline state for an asset, synthesising and persisting the default
    /// document on first read.
    pub async fn get(
        &self,
        user_id: &str,
        project_id: &str,
        asset_id: &str,
    ) -> Result<PipelineState> {
        let path = pipeline_state_doc(user_id, project_id, asset_id);

        match self.docs.get_doc(&path).await? {
            Some(doc) => {
                let state: PipelineState = serde_json::from_value(doc)?;
                Ok(self.merge_with_registry(state))
            }
            None => {
                let state = PipelineState {
                    asset_id: asset_id.to_string(),
                    steps: self.default_steps(),
                    updated_at: now_iso(),
                };
                self.docs
                    .set_doc(&path, serde_json::to_value(&state)?)
                    .await?;
                debug!(asset_id = %asset_id, "created default pipeline state");
                Ok(state)
            }
        }
    }

    /// Replace the full step list for an asset.
    pub async fn update_state(
        &self,
        user_id: &str,
        project_id: &str,
        asset_id: &str,
        steps: Vec<StepState>,
    ) -> Result<PipelineState> {
        let state = PipelineState {
            asset_id: asset_id.to_string(),
            steps,
            updated_at: now_iso(),
        };

        self.docs
            .set_doc(
                &pipeline_state_doc(user_id, project_id, asset_id),
                serde_json::to_value(&state)?,
            )
            .await?;
        Ok(state)
    }

    /// Replace one step entry (appending when the id is unknown) and write
    /// the document back whole.
    pub async fn update_step(
        &self,
        user_id: &str,
        project_id: &str,
        asset_id: &str,
        step: StepState,
    ) -> Result<PipelineState> {
        let state = self.get(user_id, project_id, asset_id).await?;

        let mut steps = state.steps;
        match steps.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => *existing = step,
            None => steps.push(step),
        }

        self.update_state(user_id, project_id, asset_id, steps).await
    }

    /// Pipeline states for every asset in a project.
    pub async fn list_for_project(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<Vec<PipelineState>> {
        let assets = self
            .docs
            .list_docs(&asset_collection(user_id, project_id))
            .await?;

        let mut states = Vec::with_capacity(assets.len());
        for asset in assets {
            if let Some(asset_id) = asset.get("id").and_then(|v| v.as_str()) {
                states.push(self.get(user_id, project_id, asset_id).await?);
            }
        }
        Ok(states)
    }

    /// Delete the state document. `Ok(true)` when it existed.
    pub async fn delete(&self, user_id: &str, project_id: &str, asset_id: &str) -> Result<bool> {
        self.docs
            .delete_doc(&pipeline_state_doc(user_id, project_id, asset_id))
            .await
    }
}
