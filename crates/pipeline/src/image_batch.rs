//! Image-driven expression batches.
//!
//! For every image in a directory: upload it, then run each configured
//! expression across the sampler sweep (when one is configured), `repeats`
//! times each. Every run gets its own id, seed, filename prefix and
//! `meta.json`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use axisweep_comfyui::client::ExecutionBackend;
use axisweep_core::combination::SamplerParams;
use axisweep_core::config::Config;
use axisweep_core::naming::{
    batch_run_id, render_prefix, safe_filename, PrefixVars, SAFE_FILENAME_MAX_LEN,
};
use axisweep_core::seed::SeedAllocator;
use axisweep_core::types::Seed;
use axisweep_core::workflow::{Binding, SweepMode, WorkflowTemplate};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::PipelineError;
use crate::progress::{ProgressTracker, RunSummary};
use crate::record::{write_json, BatchRecord, InputImage, BATCH_RECORD_FILE};
use crate::sweep::{submit_or_cancel, wait_policy};

/// Extensions picked up from the images directory, compared
/// case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

const TOOL_NAME: &str = "image_batch";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageBatchOptions {
    pub images_dir: PathBuf,
    pub recursive: bool,
    /// Keep only the first N images (after sorting).
    pub limit: Option<usize>,
    pub dry_run: bool,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Image files under `dir`, sorted by path.
pub fn collect_images(
    dir: &Path,
    recursive: bool,
    limit: Option<usize>,
) -> Result<Vec<PathBuf>, PipelineError> {
    if !dir.is_dir() {
        return Err(PipelineError::ImagesDir(dir.to_path_buf()));
    }
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut images = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).max_depth(max_depth) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            PipelineError::io(path, e.into())
        })?;
        if entry.file_type().is_file() && is_image(entry.path()) {
            images.push(entry.into_path());
        }
    }
    images.sort();
    if let Some(limit) = limit.filter(|l| *l > 0) {
        images.truncate(limit);
    }
    Ok(images)
}

/// What a batch is about to do.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    pub images: Vec<PathBuf>,
    pub expressions: usize,
    /// Sampler combinations per expression; 1 without a sampler sweep.
    pub sampler_combinations: usize,
    pub repeats: u32,
}

impl BatchPlan {
    pub fn runs_per_image(&self) -> usize {
        self.expressions * self.sampler_combinations * self.repeats as usize
    }

    pub fn total_runs(&self) -> usize {
        self.images.len() * self.runs_per_image()
    }
}

/// One submission: an image, an expression, an optional sampler setting
/// and a repeat.
struct BatchUnit<'a> {
    image: &'a Path,
    uploaded_name: &'a str,
    expression: &'a str,
    sampler: Option<&'a SamplerParams>,
    repeat: u32,
    seed: Seed,
}

/// Drives image batches against an [`ExecutionBackend`].
pub struct ImageBatchRunner<B> {
    config: Config,
    backend: B,
    workflow: WorkflowTemplate,
    options: ImageBatchOptions,
}

impl<B: ExecutionBackend> ImageBatchRunner<B> {
    pub fn new(config: Config, backend: B, options: ImageBatchOptions) -> Result<Self, PipelineError> {
        config.validate_for(SweepMode::ImageBatch)?;
        let workflow = WorkflowTemplate::load(&config.workflow.json_path)?;
        Ok(Self {
            config,
            backend,
            workflow,
            options,
        })
    }

    pub fn options(&self) -> &ImageBatchOptions {
        &self.options
    }

    pub async fn preflight(&self) -> Result<(), PipelineError> {
        let nodes = &self.config.workflow.nodes;
        if !self.workflow.validate(
            &nodes.required_nodes(SweepMode::ImageBatch),
            &nodes.optional_nodes(SweepMode::ImageBatch),
        ) {
            return Err(PipelineError::InvalidWorkflow(self.workflow.path().to_path_buf()));
        }
        if self.options.dry_run {
            tracing::info!("Dry run: skipping health check");
            return Ok(());
        }
        if !self.backend.health_check().await {
            return Err(PipelineError::Unreachable(self.config.server.url.clone()));
        }
        Ok(())
    }

    pub fn plan(&self) -> Result<BatchPlan, PipelineError> {
        let images = collect_images(
            &self.options.images_dir,
            self.options.recursive,
            self.options.limit,
        )?;
        let plan = BatchPlan {
            images,
            expressions: self.config.expressions.len(),
            sampler_combinations: self.sampler_sweep().len(),
            repeats: self.config.execution.repeats,
        };
        if plan.images.is_empty() {
            tracing::warn!(dir = %self.options.images_dir.display(), "No image files found");
        }
        tracing::info!(
            images = plan.images.len(),
            expressions = plan.expressions,
            sampler_combinations = plan.sampler_combinations,
            repeats = plan.repeats,
            total_runs = plan.total_runs(),
            "Planned image batch"
        );
        Ok(plan)
    }

    pub async fn execute(
        &self,
        plan: &BatchPlan,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary {
            planned: plan.total_runs(),
            dry_run: self.options.dry_run,
            ..RunSummary::default()
        };
        let started = Instant::now();
        let mut seeds = SeedAllocator::new(
            self.config.execution.seed_strategy(),
            self.config.execution.seed_base,
        );
        let mut tracker = ProgressTracker::start(plan.images.len());
        let sweep = self.sampler_sweep();

        'images: for image in &plan.images {
            if cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            tracing::info!(image = %image.display(), "Processing image");

            let Some(uploaded_name) = self.stage_input(image).await else {
                summary.skipped += plan.runs_per_image();
                continue;
            };

            for expression in &self.config.expressions {
                for sampler in &sweep {
                    for repeat in 0..plan.repeats {
                        if cancel.is_cancelled() {
                            summary.interrupted = true;
                            break 'images;
                        }
                        let unit = BatchUnit {
                            image,
                            uploaded_name: &uploaded_name,
                            expression,
                            sampler: sampler.as_ref(),
                            repeat,
                            seed: seeds.next_seed(),
                        };
                        let record = self.run_once(unit, cancel).await?;
                        match (record.success, record.interrupted) {
                            (_, true) => {
                                summary.interrupted = true;
                                break 'images;
                            }
                            (Some(true), _) => summary.succeeded += 1,
                            (Some(false), _) => summary.failed += 1,
                            (None, _) => {}
                        }
                    }
                }
            }
            tracker.advance("Image");
        }

        summary.elapsed = started.elapsed();
        summary.log();
        Ok(summary)
    }

    /// Upload the image, or use its bare file name when uploads are off or
    /// in dry-run mode. `None` means the image must be skipped.
    async fn stage_input(&self, image: &Path) -> Option<String> {
        let file_name = image.file_name()?.to_string_lossy().into_owned();
        let input = &self.config.input_image;
        if !input.upload || self.options.dry_run {
            return Some(file_name);
        }

        let outcome = self
            .backend
            .upload_input(image, &input.subfolder, input.overwrite)
            .await;
        if !outcome.success {
            tracing::error!(
                image = %image.display(),
                error = outcome.error_message.as_deref().unwrap_or_default(),
                "Upload failed; skipping image"
            );
            return None;
        }
        match outcome.data_str("name") {
            Some(name) if !name.is_empty() => Some(name.to_string()),
            _ => {
                tracing::error!(image = %image.display(), "Upload response has no stored name; skipping image");
                None
            }
        }
    }

    async fn run_once(
        &self,
        unit: BatchUnit<'_>,
        cancel: &CancellationToken,
    ) -> Result<BatchRecord, PipelineError> {
        let BatchUnit {
            image,
            uploaded_name,
            expression,
            sampler,
            repeat,
            seed,
        } = unit;
        let run_id = batch_run_id();
        let image_stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sampler = sampler.map(|s| SamplerParams {
            seed,
            ..s.clone()
        });

        let mut vars = PrefixVars::new(&run_id, seed)
            .text("image", &image_stem)
            .text("expr", expression);
        if let Some(s) = &sampler {
            vars = vars.sampler(s);
        }
        let prefix = render_prefix(self.config.prefix_template(SweepMode::ImageBatch), &vars)?;

        let nodes = &self.config.workflow.nodes;
        let mut bindings: Vec<Binding> = Vec::new();
        bindings.extend(nodes.input_image_binding(uploaded_name));
        bindings.extend(nodes.expression_binding(expression));
        bindings.extend(nodes.seed_binding(seed));
        bindings.extend(nodes.filename_prefix_binding(&prefix));
        if let Some(s) = &sampler {
            bindings.extend(nodes.sampler_bindings(s));
        }
        let (graph, _) = self.workflow.instantiate(&bindings);

        let mut record = BatchRecord {
            tool: TOOL_NAME.to_string(),
            run_id: run_id.clone(),
            input: InputImage {
                local_path: image.to_path_buf(),
                uploaded_name: uploaded_name.to_string(),
            },
            expression: expression.to_string(),
            repeat_index: repeat,
            seed,
            sampler,
            filename_prefix: prefix,
            workflow_json: self.workflow.path().to_path_buf(),
            workflow_fingerprint: graph.fingerprint(),
            dry_run: self.options.dry_run,
            success: None,
            prompt_id: None,
            error: None,
            interrupted: false,
            history: None,
            duration_ms: None,
            created_at: chrono::Utc::now(),
        };
        let path = self
            .config
            .workflow
            .output_root
            .join(safe_filename(&image_stem, SAFE_FILENAME_MAX_LEN))
            .join(safe_filename(expression, SAFE_FILENAME_MAX_LEN))
            .join(safe_filename(&run_id, SAFE_FILENAME_MAX_LEN))
            .join(BATCH_RECORD_FILE);

        if self.options.dry_run {
            tracing::info!(
                expression = %expression,
                seed,
                prefix = %record.filename_prefix,
                "Dry run: would submit"
            );
            write_json(&path, &record)?;
            return Ok(record);
        }

        let started = Instant::now();
        let outcome = submit_or_cancel(
            &self.backend,
            &graph.to_value(),
            wait_policy(&self.config),
            cancel,
        )
        .await;
        record.duration_ms = Some(started.elapsed().as_millis() as u64);

        match outcome {
            None => {
                tracing::warn!(run_id = %run_id, "Wait abandoned; remote job keeps running");
                record.interrupted = true;
                record.success = Some(false);
                record.error = Some("Interrupted".to_string());
            }
            Some(outcome) => {
                record.prompt_id = outcome.prompt_id().map(str::to_string);
                record.success = Some(outcome.success);
                if outcome.success {
                    tracing::info!(expression = %expression, seed, "Run completed");
                    record.history = outcome.data.and_then(|d| d.get("outputs").cloned());
                } else {
                    tracing::error!(
                        expression = %expression,
                        seed,
                        error = outcome.error_message.as_deref().unwrap_or_default(),
                        "Run failed"
                    );
                    record.error = outcome.error_message;
                }
            }
        }

        write_json(&path, &record)?;
        Ok(record)
    }

    /// Sampler combinations, or a single `None` when no sweep is configured.
    fn sampler_sweep(&self) -> Vec<Option<SamplerParams>> {
        match &self.config.sampler_choices {
            Some(choices) if self.config.workflow.nodes.sampler.is_some() => {
                choices.iter().map(Some).collect()
            }
            _ => vec![None],
        }
    }
}
