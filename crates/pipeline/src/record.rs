//! Per-run metadata files.
//!
//! Axis sweeps write `{output_root}/{run_id}/params.json` and rewrite it
//! after every attempt. Image batches write one `meta.json` per run under
//! `{output_root}/{image}/{expr}/{run_id}/`.

use std::path::{Path, PathBuf};

use axisweep_core::combination::{GenerationParams, SamplerParams};
use axisweep_core::types::{Seed, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

/// File name of an axis-sweep run record.
pub const RUN_RECORD_FILE: &str = "params.json";
/// File name of an image-batch run record.
pub const BATCH_RECORD_FILE: &str = "meta.json";

/// Write `value` as pretty JSON, creating parent directories. The file is
/// replaced wholesale.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    std::fs::write(path, body).map_err(|e| PipelineError::io(path, e))
}

// ---------------------------------------------------------------------------
// Axis sweep
// ---------------------------------------------------------------------------

/// One submission of one combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 0-based repeat index within the combination.
    pub repeat: u32,
    /// Seed bound into the graph for this attempt.
    pub seed: Seed,
    /// Server-assigned id, present once the workflow was queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    /// Whether the server reported completion. Always `false` in dry-run.
    pub success: bool,
    /// Submission, execution or timeout error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The wait was abandoned locally; the remote job may still finish.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
    /// Wall time from submission to outcome.
    pub duration_ms: u64,
    /// SHA-256 of the submitted graph.
    pub workflow_fingerprint: String,
    /// Rendered output prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_prefix: Option<String>,
    /// Bindings that could not be applied to the graph.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_bindings: Vec<String>,
    /// When the attempt began (UTC).
    pub started_at: Timestamp,
}

/// `params.json`: the combination plus every attempt made for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Directory name under the output root.
    pub run_id: String,
    /// 1-based combination index.
    pub index: usize,
    /// Written by a dry run: nothing was submitted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    pub created_at: Timestamp,
    /// Prompts, sampler, LoRA and axis values, inlined at the top level.
    #[serde(flatten)]
    pub params: GenerationParams,
    /// One entry per repeat, in submission order.
    pub attempts: Vec<AttemptRecord>,
}

impl RunRecord {
    pub fn new(run_id: String, index: usize, params: GenerationParams, dry_run: bool) -> Self {
        Self {
            run_id,
            index,
            dry_run,
            created_at: chrono::Utc::now(),
            params,
            attempts: Vec::new(),
        }
    }

    /// `{output_root}/{run_id}/params.json`.
    pub fn path_in(&self, output_root: &Path) -> PathBuf {
        output_root.join(&self.run_id).join(RUN_RECORD_FILE)
    }

    pub fn write(&self, output_root: &Path) -> Result<PathBuf, PipelineError> {
        let path = self.path_in(output_root);
        write_json(&path, self)?;
        Ok(path)
    }

    /// Number of successful attempts.
    pub fn succeeded(&self) -> usize {
        self.attempts.iter().filter(|a| a.success).count()
    }
}

// ---------------------------------------------------------------------------
// Image batch
// ---------------------------------------------------------------------------

/// The input image of an image-batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputImage {
    /// Path on this machine.
    pub local_path: PathBuf,
    /// Name the `LoadImage` node refers to: the stored upload name, or the
    /// bare file name when uploads are disabled or in dry-run.
    pub uploaded_name: String,
}

/// `meta.json` for one image-batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Always `image_batch`.
    pub tool: String,
    /// 8 hex chars, unique per repeat.
    pub run_id: String,
    pub input: InputImage,
    /// Expression preset selected for this run.
    pub expression: String,
    /// 0-based repeat index.
    pub repeat_index: u32,
    pub seed: Seed,
    /// Sampler settings, when a sampler sweep is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler: Option<SamplerParams>,
    pub filename_prefix: String,
    /// Path of the base workflow graph.
    pub workflow_json: PathBuf,
    /// SHA-256 of the submitted graph.
    pub workflow_fingerprint: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    /// `None` in dry-run, where nothing was submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    /// Submission, execution or timeout error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The wait was abandoned locally; the remote job may still finish.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
    /// The completed `/history` outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Value>,
    /// Wall time from submission to outcome; absent in dry-run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub created_at: Timestamp,
}
