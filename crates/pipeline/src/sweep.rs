//! Axis-sweep orchestrator.
//!
//! One invocation explores one target axis end to end:
//!
//! 1. [`AxisSweepRunner::preflight`] checks the workflow has every
//!    required node and the server answers.
//! 2. [`AxisSweepRunner::plan`] picks the target from the axes not yet
//!    explored and counts the submissions.
//! 3. [`AxisSweepRunner::execute`] walks the combinations in order, one
//!    submission at a time, then marks the axis used.
//!
//! A failed submission is recorded and counted; it never stops the sweep.

use std::path::Path;
use std::time::{Duration, Instant};

use axisweep_comfyui::client::{ExecutionBackend, RemoteOutcome, WaitPolicy};
use axisweep_core::combination::{
    count_combinations, enumerate_combinations, GenerationParams, LoraChoices, SamplerChoices,
};
use axisweep_core::config::{Config, TargetSelection};
use axisweep_core::error::CoreError;
use axisweep_core::exploration::{ExplorationProgress, ExplorationState};
use axisweep_core::naming::{axis_run_id, render_prefix, PrefixVars};
use axisweep_core::seed::SeedAllocator;
use axisweep_core::types::Seed;
use axisweep_core::workflow::{Binding, SweepMode, WorkflowTemplate};
use rand::seq::IndexedRandom;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::progress::{ProgressTracker, RunSummary};
use crate::record::{AttemptRecord, RunRecord};

/// What one invocation is about to do.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub target_axis: String,
    pub combinations: usize,
    pub repeats: u32,
}

impl SweepPlan {
    pub fn total_runs(&self) -> usize {
        self.combinations * self.repeats as usize
    }
}

/// Wait policy from the execution section.
pub(crate) fn wait_policy(config: &Config) -> WaitPolicy {
    WaitPolicy::new(
        Duration::from_secs_f64(config.execution.poll_interval_secs),
        config.execution.max_wait_secs.map(Duration::from_secs_f64),
    )
}

/// Submit `workflow`, giving up locally when `cancel` fires.
pub(crate) async fn submit_or_cancel<B: ExecutionBackend>(
    backend: &B,
    workflow: &serde_json::Value,
    policy: WaitPolicy,
    cancel: &CancellationToken,
) -> Option<RemoteOutcome> {
    tokio::select! {
        outcome = backend.execute(workflow, policy) => Some(outcome),
        _ = cancel.cancelled() => None,
    }
}

/// Drives axis sweeps against an [`ExecutionBackend`].
pub struct AxisSweepRunner<B> {
    config: Config,
    backend: B,
    workflow: WorkflowTemplate,
    state: ExplorationState,
    dry_run: bool,
}

impl<B: ExecutionBackend> AxisSweepRunner<B> {
    /// Validate `config` for axis sweeps, load the base workflow and the
    /// exploration state.
    pub fn new(config: Config, backend: B, dry_run: bool) -> Result<Self, PipelineError> {
        config.validate_for(SweepMode::Axis)?;
        let workflow = WorkflowTemplate::load(&config.workflow.json_path)?;
        let state = ExplorationState::load(&config.execution.state_file);
        Ok(Self {
            config,
            backend,
            workflow,
            state,
            dry_run,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &ExplorationState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ExplorationState {
        &mut self.state
    }

    pub fn axis_names(&self) -> Vec<String> {
        self.config.prompt_template.axis_names()
    }

    pub fn progress(&self) -> ExplorationProgress {
        self.state.progress(&self.axis_names())
    }

    /// Fail before any submission when the workflow lacks a required node
    /// or the server does not answer. The health check is skipped in
    /// dry-run mode.
    pub async fn preflight(&self) -> Result<(), PipelineError> {
        let nodes = &self.config.workflow.nodes;
        if !self.workflow.validate(
            &nodes.required_nodes(SweepMode::Axis),
            &nodes.optional_nodes(SweepMode::Axis),
        ) {
            return Err(PipelineError::InvalidWorkflow(self.workflow.path().to_path_buf()));
        }

        if self.dry_run {
            tracing::info!("Dry run: skipping health check");
            return Ok(());
        }
        if !self.backend.health_check().await {
            return Err(PipelineError::Unreachable(self.config.server.url.clone()));
        }
        Ok(())
    }

    /// Pick the next target axis and count the work. `Ok(None)` means every
    /// axis has been explored.
    pub fn plan(&self) -> Result<Option<SweepPlan>, PipelineError> {
        let remaining = self.state.remaining(&self.axis_names());
        let target = match self.config.execution.target_selection {
            TargetSelection::First => remaining.first(),
            TargetSelection::Random => remaining.choose(&mut rand::rng()),
        };
        let Some(target) = target else {
            tracing::info!("Every axis has been explored; nothing to do");
            return Ok(None);
        };
        self.plan_for(target).map(Some)
    }

    /// Count the work for an explicit target axis.
    pub fn plan_for(&self, target_axis: &str) -> Result<SweepPlan, PipelineError> {
        let (sampler, lora) = self.choice_lists()?;
        let combinations =
            count_combinations(&self.config.prompt_template, target_axis, sampler, lora)?;
        let plan = SweepPlan {
            target_axis: target_axis.to_string(),
            combinations,
            repeats: self.config.execution.repeats,
        };
        tracing::info!(
            axis = %plan.target_axis,
            combinations = plan.combinations,
            repeats = plan.repeats,
            total_runs = plan.total_runs(),
            "Planned sweep"
        );
        Ok(plan)
    }

    /// Run every combination of `plan`. The target axis is marked used
    /// only when the sweep ran to the end outside dry-run mode.
    pub async fn execute(
        &mut self,
        plan: &SweepPlan,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary {
            target_axis: Some(plan.target_axis.clone()),
            planned: plan.total_runs(),
            dry_run: self.dry_run,
            ..RunSummary::default()
        };
        let started = Instant::now();
        let mut seeds = SeedAllocator::new(
            self.config.execution.seed_strategy(),
            self.config.execution.seed_base,
        );
        let mut tracker = ProgressTracker::start(plan.combinations);

        {
            let (sampler, lora) = self.choice_lists()?;
            let combinations = {
                let mut rng = rand::rng();
                enumerate_combinations(
                    &self.config.prompt_template,
                    &plan.target_axis,
                    sampler,
                    lora,
                    self.config.execution.randomize_non_target,
                    &mut rng,
                )?
            };

            for (i, params) in combinations.enumerate() {
                if cancel.is_cancelled() {
                    summary.interrupted = true;
                    break;
                }
                let index = i + 1;
                let mut record = RunRecord::new(axis_run_id(index), index, params, self.dry_run);
                record.write(&self.config.workflow.output_root)?;
                let value = record
                    .params
                    .axis_values
                    .get(&plan.target_axis)
                    .map(String::as_str)
                    .unwrap_or_default();
                tracing::info!(
                    run_id = %record.run_id,
                    index,
                    total = plan.combinations,
                    axis = %plan.target_axis,
                    value,
                    "Starting combination"
                );

                for repeat in 0..plan.repeats {
                    if cancel.is_cancelled() {
                        summary.interrupted = true;
                        break;
                    }
                    let attempt = self
                        .run_attempt(&record, repeat, seeds.next_seed(), cancel)
                        .await?;
                    match (attempt.success, attempt.interrupted) {
                        (_, true) => summary.interrupted = true,
                        (true, _) => summary.succeeded += 1,
                        (false, _) if !self.dry_run => summary.failed += 1,
                        _ => {}
                    }
                    record.attempts.push(attempt);
                    record.write(&self.config.workflow.output_root)?;
                }

                if summary.interrupted {
                    break;
                }
                tracker.advance("Combination");
            }
        }

        summary.elapsed = started.elapsed();
        if summary.interrupted {
            tracing::warn!(axis = %plan.target_axis, "Sweep interrupted; axis not marked used");
        } else if self.dry_run {
            tracing::info!(axis = %plan.target_axis, "Dry run; axis not marked used");
        } else {
            self.state.mark_used(&plan.target_axis)?;
        }
        summary.log();
        Ok(summary)
    }

    /// Bind, submit and time one repeat of one combination.
    async fn run_attempt(
        &self,
        record: &RunRecord,
        repeat: u32,
        seed: Seed,
        cancel: &CancellationToken,
    ) -> Result<AttemptRecord, PipelineError> {
        let params = record.params.with_seed(seed);
        let prefix = self.filename_prefix(&record.run_id, &params)?;
        let bindings = self.bindings(&params, &prefix);
        let (graph, report) = self.workflow.instantiate(&bindings);

        let mut attempt = AttemptRecord {
            repeat,
            seed,
            prompt_id: None,
            success: false,
            error: None,
            interrupted: false,
            duration_ms: 0,
            workflow_fingerprint: graph.fingerprint(),
            filename_prefix: Some(prefix),
            skipped_bindings: report
                .skipped
                .iter()
                .map(|s| format!("{}.{}: {}", s.node_id, s.input_name, s.reason))
                .collect(),
            started_at: chrono::Utc::now(),
        };

        if self.dry_run {
            tracing::info!(
                run_id = %record.run_id,
                repeat,
                seed,
                prefix = attempt.filename_prefix.as_deref().unwrap_or_default(),
                "Dry run: would submit"
            );
            return Ok(attempt);
        }

        let started = Instant::now();
        let outcome = submit_or_cancel(
            &self.backend,
            &graph.to_value(),
            wait_policy(&self.config),
            cancel,
        )
        .await;
        attempt.duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            None => {
                tracing::warn!(run_id = %record.run_id, repeat, "Wait abandoned; remote job keeps running");
                attempt.interrupted = true;
                attempt.error = Some("Interrupted".to_string());
            }
            Some(outcome) => {
                attempt.prompt_id = outcome.prompt_id().map(str::to_string);
                attempt.success = outcome.success;
                attempt.error = outcome.error_message;
                if attempt.success {
                    tracing::info!(run_id = %record.run_id, repeat, seed, "Run completed");
                } else {
                    tracing::error!(
                        run_id = %record.run_id,
                        repeat,
                        seed,
                        error = attempt.error.as_deref().unwrap_or_default(),
                        "Run failed"
                    );
                }
            }
        }
        Ok(attempt)
    }

    fn filename_prefix(&self, run_id: &str, params: &GenerationParams) -> Result<String, CoreError> {
        let lora_stem = Path::new(&params.lora.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&params.lora.name);
        let vars = PrefixVars::new(run_id, params.sampler.seed)
            .text("axis", &params.target_axis)
            .text("lora", lora_stem)
            .sampler(&params.sampler);
        render_prefix(self.config.prefix_template(SweepMode::Axis), &vars)
    }

    fn bindings(&self, params: &GenerationParams, prefix: &str) -> Vec<Binding> {
        let nodes = &self.config.workflow.nodes;
        let mut bindings = nodes.prompt_bindings(&params.positive, &params.negative);
        bindings.extend(nodes.sampler_bindings(&params.sampler));
        bindings.extend(nodes.lora_bindings(&params.lora));
        bindings.extend(nodes.seed_binding(params.sampler.seed));
        bindings.extend(nodes.filename_prefix_binding(prefix));
        bindings
    }

    fn choice_lists(&self) -> Result<(&SamplerChoices, &LoraChoices), CoreError> {
        match (&self.config.sampler_choices, &self.config.lora_choices) {
            (Some(s), Some(l)) => Ok((s, l)),
            _ => Err(CoreError::config_field(
                "sampler_choices",
                "sampler_choices and lora_choices are required for axis sweeps",
            )),
        }
    }
}
