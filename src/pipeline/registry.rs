//! Pipeline step registry.
//!
//! Steps register at worker startup; registration order defines display
//! order, default-state order and auto-run execution order. Registration must
//! be complete before the first task is processed.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::models::AssetType;
use crate::pipeline::types::{PipelineContext, PipelineResult};

/// A step's executable body.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult>;
}

/// Declaration of a pipeline step.
#[derive(Clone)]
pub struct StepDefinition {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    /// Included in `run_auto_steps`.
    pub auto_start: bool,
    /// `None` means every asset type is supported.
    pub supported_types: Option<Vec<AssetType>>,
    pub runner: Arc<dyn StepRunner>,
}

impl StepDefinition {
    pub fn supports(&self, asset_type: AssetType) -> bool {
        match &self.supported_types {
            Some(types) => types.contains(&asset_type),
            None => true,
        }
    }
}

/// Ordered set of registered steps.
#[derive(Default)]
pub struct StepRegistry {
    steps: RwLock<Vec<StepDefinition>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. Re-registering an id replaces the earlier definition
    /// in place, keeping its position.
    pub fn register(&self, step: StepDefinition) {
        let mut steps = self.steps.write().expect("registry lock poisoned");
        debug!(step_id = step.id, "registered pipeline step");
        if let Some(existing) = steps.iter_mut().find(|s| s.id == step.id) {
            *existing = step;
        } else {
            steps.push(step);
        }
    }

    /// All steps in registration order.
    pub fn steps(&self) -> Vec<StepDefinition> {
        self.steps.read().expect("registry lock poisoned").clone()
    }

    /// `(id, label)` pairs in registration order, for default-state synthesis.
    pub fn catalog(&self) -> Vec<(&'static str, &'static str)> {
        self.steps
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|s| (s.id, s.label))
            .collect()
    }

    pub fn get(&self, step_id: &str) -> Option<StepDefinition> {
        self.steps
            .read()
            .expect("registry lock poisoned")
            .iter()
            .find(|s| s.id == step_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.steps.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
