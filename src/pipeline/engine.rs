//! Pipeline engine: drives step execution against the state store.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{AppError, Result};
use crate::models::{now_iso, Asset};
use crate::pipeline::registry::StepRegistry;
use crate::pipeline::state::PipelineStateStore;
use crate::pipeline::types::{PipelineContext, PipelineState, StepState, StepStatus};
use crate::probe::classify_asset_type;

#[derive(Clone)]
pub struct PipelineEngine {
    registry: Arc<StepRegistry>,
    state: Arc<PipelineStateStore>,
}

impl PipelineEngine {
    pub fn new(registry: Arc<StepRegistry>, state: Arc<PipelineStateStore>) -> Self {
        Self { registry, state }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn state_store(&self) -> &PipelineStateStore {
        &self.state
    }

    /// Run a single step for an asset and return the fresh pipeline state.
    ///
    /// The step transitions `running` → terminal (or `waiting`). A runner
    /// error is persisted as `failed` and re-raised to the caller; the worker
    /// records the task failure while the state document already carries the
    /// per-step detail.
    pub async fn run_step(
        &self,
        user_id: &str,
        project_id: &str,
        asset: &Asset,
        asset_path: &Path,
        step_id: &str,
        params: Value,
    ) -> Result<PipelineState> {
        let step = self
            .registry
            .get(step_id)
            .ok_or_else(|| AppError::Validation(format!("unknown pipeline step: {step_id}")))?;

        let asset_type = classify_asset_type(&asset.mime_type, Some(&asset.file_name));
        if !step.supports(asset_type) {
            return Err(AppError::Validation(format!(
                "step '{}' does not support {asset_type} assets",
                step.label
            )));
        }

        let state = self.state.get(user_id, project_id, &asset.id).await?;
        let prior = state
            .step(step_id)
            .cloned()
            .unwrap_or_else(|| StepState::idle(step.id, step.label));

        let now = now_iso();
        self.state
            .update_step(
                user_id,
                project_id,
                &asset.id,
                StepState {
                    id: step.id.to_string(),
                    label: step.label.to_string(),
                    status: StepStatus::Running,
                    metadata: serde_json::Map::new(),
                    error: None,
                    started_at: Some(now.clone()),
                    updated_at: now,
                },
            )
            .await?;

        let ctx = PipelineContext {
            asset: asset.clone(),
            asset_path: asset_path.to_path_buf(),
            asset_type,
            step_state: prior,
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            params,
        };

        info!(step_id = %step_id, asset_id = %asset.id, "running pipeline step");

        let result = match step.runner.run(&ctx).await {
            Ok(result) => result,
            Err(e) => {
                error!(step_id = %step_id, asset_id = %asset.id, error = %e, "pipeline step raised");
                self.state
                    .update_step(
                        user_id,
                        project_id,
                        &asset.id,
                        StepState {
                            id: step.id.to_string(),
                            label: step.label.to_string(),
                            status: StepStatus::Failed,
                            metadata: serde_json::Map::new(),
                            error: Some(e.to_string()),
                            started_at: None,
                            updated_at: now_iso(),
                        },
                    )
                    .await?;
                return Err(e);
            }
        };

        self.state
            .update_step(
                user_id,
                project_id,
                &asset.id,
                StepState {
                    id: step.id.to_string(),
                    label: step.label.to_string(),
                    status: result.status,
                    metadata: result.metadata,
                    error: result.error,
                    started_at: None,
                    updated_at: now_iso(),
                },
            )
            .await?;

        self.state.get(user_id, project_id, &asset.id).await
    }

    /// Run every auto-start step whose supported types include the asset's
    /// type, in registry order.
    ///
    /// Steps already `succeeded`, `running` or `waiting` are skipped; that
    /// no-re-run gate is what makes at-least-once task delivery safe. A
    /// failed step does not abort the remaining steps.
    pub async fn run_auto_steps(
        &self,
        user_id: &str,
        project_id: &str,
        asset: &Asset,
        asset_path: &Path,
    ) -> Result<PipelineState> {
        let asset_type = classify_asset_type(&asset.mime_type, Some(&asset.file_name));
        let mut state = self.state.get(user_id, project_id, &asset.id).await?;

        for step in self.registry.steps() {
            if !step.auto_start || !step.supports(asset_type) {
                continue;
            }

            if let Some(current) = state.step(step.id) {
                if matches!(
                    current.status,
                    StepStatus::Succeeded | StepStatus::Running | StepStatus::Waiting
                ) {
                    continue;
                }
            }

            state = match self
                .run_step(user_id, project_id, asset, asset_path, step.id, Value::Null)
                .await
            {
                Ok(state) => state,
                Err(e) => {
                    // The failure is already persisted on the step; keep
                    // going so independent steps still run.
                    warn!(step_id = step.id, asset_id = %asset.id, error = %e, "auto step failed");
                    self.state.get(user_id, project_id, &asset.id).await?
                }
            };
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetType;
    use crate::pipeline::registry::StepDefinition;
    use crate::test_support::{video_asset, MemoryDocs, StaticStep};
    use serde_json::json;

    struct Fixture {
        engine: PipelineEngine,
        steps: Vec<Arc<StaticStep>>,
    }

    fn fixture(defs: Vec<(&'static str, bool, Option<Vec<AssetType>>, Arc<StaticStep>)>) -> Fixture {
        let registry = Arc::new(StepRegistry::new());
        let mut steps = Vec::new();
        for (id, auto, types, runner) in defs {
            steps.push(runner.clone());
            registry.register(StepDefinition {
                id,
                label: id,
                description: "",
                auto_start: auto,
                supported_types: types,
                runner,
            });
        }
        let state = Arc::new(PipelineStateStore::new(
            Arc::new(MemoryDocs::new()),
            registry.clone(),
        ));
        Fixture {
            engine: PipelineEngine::new(registry, state),
            steps,
        }
    }

    #[tokio::test]
    async fn run_step_persists_terminal_status() {
        let runner = Arc::new(StaticStep::succeeding(json!({"width": 1920})));
        let fx = fixture(vec![("metadata", true, None, runner)]);
        let asset = video_asset("a1");

        let state = fx
            .engine
            .run_step("u1", "p1", &asset, Path::new(""), "metadata", Value::Null)
            .await
            .unwrap();

        let entry = state.step("metadata").unwrap();
        assert_eq!(entry.status, StepStatus::Succeeded);
        assert_eq!(entry.metadata["width"], 1920);
        assert_eq!(state.steps.iter().filter(|s| s.id == "metadata").count(), 1);
        assert_eq!(fx.steps[0].calls(), 1);
    }

    #[tokio::test]
    async fn unknown_step_is_a_validation_error() {
        let fx = fixture(vec![]);
        let err = fx
            .engine
            .run_step(
                "u1",
                "p1",
                &video_asset("a1"),
                Path::new(""),
                "nope",
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn unsupported_type_is_a_validation_error() {
        let runner = Arc::new(StaticStep::succeeding(json!({})));
        let fx = fixture(vec![(
            "frame-sampling",
            true,
            Some(vec![AssetType::Video]),
            runner,
        )]);

        let mut asset = video_asset("a1");
        asset.mime_type = "image/png".to_string();
        asset.file_name = "pic.png".to_string();

        let err = fx
            .engine
            .run_step(
                "u1",
                "p1",
                &asset,
                Path::new(""),
                "frame-sampling",
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(fx.steps[0].calls(), 0);
    }

    #[tokio::test]
    async fn runner_error_is_persisted_and_reraised() {
        let runner = Arc::new(StaticStep::erroring("probe exploded"));
        let fx = fixture(vec![("metadata", true, None, runner)]);
        let asset = video_asset("a1");

        let err = fx
            .engine
            .run_step("u1", "p1", &asset, Path::new(""), "metadata", Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("probe exploded"));

        let state = fx
            .engine
            .state_store()
            .get("u1", "p1", "a1")
            .await
            .unwrap();
        let entry = state.step("metadata").unwrap();
        assert_eq!(entry.status, StepStatus::Failed);
        assert!(entry.error.as_deref().unwrap().contains("probe exploded"));
    }

    #[tokio::test]
    async fn auto_steps_skip_unsupported_and_continue_past_failures() {
        let ok = Arc::new(StaticStep::succeeding(json!({})));
        let boom = Arc::new(StaticStep::erroring("boom"));
        let image_only = Arc::new(StaticStep::succeeding(json!({})));
        let tail = Arc::new(StaticStep::succeeding(json!({})));

        let fx = fixture(vec![
            ("metadata", true, None, ok),
            ("thumbnail", true, None, boom),
            ("image-convert", true, Some(vec![AssetType::Image]), image_only),
            ("waveform", true, Some(vec![AssetType::Video, AssetType::Audio]), tail),
        ]);

        let asset = video_asset("a1");
        let state = fx
            .engine
            .run_auto_steps("u1", "p1", &asset, Path::new(""))
            .await
            .unwrap();

        assert_eq!(state.step("metadata").unwrap().status, StepStatus::Succeeded);
        assert_eq!(state.step("thumbnail").unwrap().status, StepStatus::Failed);
        // Unsupported for video: untouched.
        assert_eq!(state.step("image-convert").unwrap().status, StepStatus::Idle);
        // Still ran despite the earlier failure.
        assert_eq!(state.step("waveform").unwrap().status, StepStatus::Succeeded);
        assert_eq!(fx.steps[2].calls(), 0);
        assert_eq!(fx.steps[3].calls(), 1);
    }

    #[tokio::test]
    async fn auto_steps_do_not_rerun_settled_steps() {
        let a = Arc::new(StaticStep::succeeding(json!({})));
        let b = Arc::new(StaticStep::waiting(json!({"jobId": "j1"})));
        let fx = fixture(vec![
            ("metadata", true, None, a.clone()),
            ("transcription", true, None, b.clone()),
        ]);

        let asset = video_asset("a1");
        let first = fx
            .engine
            .run_auto_steps("u1", "p1", &asset, Path::new(""))
            .await
            .unwrap();
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(
            first.step("transcription").unwrap().status,
            StepStatus::Waiting
        );

        // Second run: succeeded steps are skipped; waiting steps are also
        // skipped inside a single auto-run pass.
        let second = fx
            .engine
            .run_auto_steps("u1", "p1", &asset, Path::new(""))
            .await
            .unwrap();
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(second.steps, first.steps);
    }

    #[tokio::test]
    async fn failed_steps_are_retried_on_the_next_auto_run() {
        let flaky = Arc::new(StaticStep::erroring("transient"));
        let fx = fixture(vec![("metadata", true, None, flaky.clone())]);
        let asset = video_asset("a1");

        fx.engine
            .run_auto_steps("u1", "p1", &asset, Path::new(""))
            .await
            .unwrap();
        assert_eq!(flaky.calls(), 1);

        fx.engine
            .run_auto_steps("u1", "p1", &asset, Path::new(""))
            .await
            .unwrap();
        assert_eq!(flaky.calls(), 2);
    }
}
