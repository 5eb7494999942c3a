//! Sweep configuration.
//!
//! One YAML or JSON document describes the server, the workflow and its
//! node mapping, execution policy, prompt axes and the sampler/LoRA choice
//! lists. Loading parses the document, applies environment overrides,
//! resolves relative paths against the config file's directory and then
//! validates every field, reporting all violations together.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::axis::PromptTemplate;
use crate::combination::{LoraChoices, SamplerChoices, SamplerParams, UNASSIGNED_SEED};
use crate::error::{CoreError, FieldError};
use crate::naming::{
    render_prefix, PrefixVars, DEFAULT_AXIS_PREFIX_TEMPLATE, DEFAULT_IMAGE_PREFIX_TEMPLATE,
};
use crate::seed::SeedStrategy;
use crate::types::Seed;
use crate::workflow::{NodeMapping, SweepMode};

/// Environment variable overriding `server.url`.
pub const SERVER_URL_ENV: &str = "AXISWEEP_SERVER_URL";

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8188";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVER_URL.to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub json_path: PathBuf,
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Falls back to the mode's default template when unset.
    #[serde(default)]
    pub filename_prefix_template: Option<String>,
    #[serde(default)]
    pub nodes: NodeMapping,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("output")
}

/// How the next target axis is picked from the remaining ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSelection {
    #[default]
    Random,
    First,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub repeats: u32,
    pub randomize_non_target: bool,
    pub state_file: PathBuf,
    pub poll_interval_secs: f64,
    pub max_wait_secs: Option<f64>,
    /// Kept as text so an unknown name is reported with the other field
    /// errors; see [`ExecutionConfig::seed_strategy`].
    #[serde(rename = "seed_strategy")]
    pub seed_strategy_name: String,
    pub seed_base: Seed,
    pub target_selection: TargetSelection,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            repeats: 1,
            randomize_non_target: true,
            state_file: PathBuf::from("axis_state.json"),
            poll_interval_secs: 1.0,
            max_wait_secs: None,
            seed_strategy_name: SeedStrategy::Time.to_string(),
            seed_base: 0,
            target_selection: TargetSelection::Random,
        }
    }
}

impl ExecutionConfig {
    /// Parsed seed strategy. Validation guarantees the name is known.
    pub fn seed_strategy(&self) -> SeedStrategy {
        self.seed_strategy_name.parse().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputImageConfig {
    /// Upload each image before use; otherwise the bare file name is bound.
    pub upload: bool,
    pub subfolder: String,
    pub overwrite: bool,
}

impl Default for InputImageConfig {
    fn default() -> Self {
        Self {
            upload: true,
            subfolder: String::new(),
            overwrite: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub prompt_template: PromptTemplate,
    #[serde(default)]
    pub sampler_choices: Option<SamplerChoices>,
    #[serde(default)]
    pub lora_choices: Option<LoraChoices>,
    #[serde(default)]
    pub expressions: Vec<String>,
    #[serde(default)]
    pub input_image: InputImageConfig,
}

impl Config {
    /// Load, override, resolve and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::config_field(
                "<file>",
                format!("cannot read {}: {e}", path.display()),
            )
        })?;

        let mut config = Self::parse(&raw, path)?;
        config.apply_env_overrides();
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        config.validate()?;

        tracing::info!(
            path = %path.display(),
            axes = config.prompt_template.axes.len(),
            expressions = config.expressions.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse by file extension: `.yaml`/`.yml` or `.json`.
    pub fn parse(raw: &str, path: &Path) -> Result<Self, CoreError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(raw)
                .map_err(|e| CoreError::config_field("<document>", e.to_string())),
            "json" => serde_json::from_str(raw)
                .map_err(|e| CoreError::config_field("<document>", e.to_string())),
            other => Err(CoreError::config_field(
                "<file>",
                format!("unsupported config extension '{other}' (expected .yaml, .yml or .json)"),
            )),
        }
    }

    /// Apply `AXISWEEP_SERVER_URL` when set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            let url = url.trim();
            if !url.is_empty() {
                tracing::debug!(url = %url, "Server URL overridden from environment");
                self.server.url = url.to_string();
            }
        }
    }

    /// Make relative paths relative to `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        for path in [
            &mut self.workflow.json_path,
            &mut self.workflow.output_root,
            &mut self.execution.state_file,
        ] {
            if path.is_relative() && !path.as_os_str().is_empty() {
                *path = base_dir.join(&*path);
            }
        }
    }

    /// Mode-independent checks.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        into_result(errors)
    }

    /// Checks for running in `mode`, including everything [`Config::validate`]
    /// covers.
    pub fn validate_for(&self, mode: SweepMode) -> Result<(), CoreError> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        self.workflow.nodes.check_for(mode, &mut errors);

        match mode {
            SweepMode::Axis => {
                self.prompt_template.validate(&mut errors);
                if self.sampler_choices.is_none() {
                    errors.push(FieldError::new("sampler_choices", "is required"));
                }
                if self.lora_choices.is_none() {
                    errors.push(FieldError::new("lora_choices", "is required"));
                }
            }
            SweepMode::ImageBatch => {
                if self.expressions.is_empty() {
                    errors.push(FieldError::new("expressions", "must not be empty"));
                }
            }
        }

        if let Err(e) = render_prefix(self.prefix_template(mode), &self.sample_prefix_vars(mode)) {
            errors.push(FieldError::new(
                "workflow.filename_prefix_template",
                e.to_string(),
            ));
        }

        into_result(errors)
    }

    /// Configured prefix template, or the default for `mode`.
    pub fn prefix_template(&self, mode: SweepMode) -> &str {
        match (&self.workflow.filename_prefix_template, mode) {
            (Some(t), _) => t,
            (None, SweepMode::Axis) => DEFAULT_AXIS_PREFIX_TEMPLATE,
            (None, SweepMode::ImageBatch) => DEFAULT_IMAGE_PREFIX_TEMPLATE,
        }
    }

    /// A full variable set for `mode`, used to check the template up front.
    /// Image batches only expose sampler variables when the sampler node is
    /// bound, matching the runs they will actually produce.
    fn sample_prefix_vars(&self, mode: SweepMode) -> PrefixVars {
        let mut vars = PrefixVars::new("0001_abcdef", 0);
        vars = match mode {
            SweepMode::Axis => vars.text("axis", "axis").text("lora", "lora"),
            SweepMode::ImageBatch => vars.text("image", "image").text("expr", "expr"),
        };
        let sampler_bound = match mode {
            SweepMode::Axis => true,
            SweepMode::ImageBatch => self.workflow.nodes.sampler.is_some(),
        };
        if let Some(s) = self.sampler_choices.as_ref().filter(|_| sampler_bound) {
            vars = vars.sampler(&SamplerParams {
                steps: 1,
                cfg: 1.0,
                sampler_name: "sampler".into(),
                scheduler: "scheduler".into(),
                seed: UNASSIGNED_SEED,
                denoise: s.denoise.first().copied(),
            });
        }
        vars
    }

    fn collect_errors(&self, errors: &mut Vec<FieldError>) {
        let url = self.server.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(FieldError::new(
                "server.url",
                format!("must start with http:// or https://, got '{url}'"),
            ));
        }
        if self.server.request_timeout_secs == 0 {
            errors.push(FieldError::new("server.request_timeout_secs", "must be > 0"));
        }

        if self.workflow.json_path.as_os_str().is_empty() {
            errors.push(FieldError::new("workflow.json_path", "must not be empty"));
        }

        let exec = &self.execution;
        if exec.repeats == 0 {
            errors.push(FieldError::new("execution.repeats", "must be > 0"));
        }
        if !exec.poll_interval_secs.is_finite() || exec.poll_interval_secs <= 0.0 {
            errors.push(FieldError::new(
                "execution.poll_interval_secs",
                format!("must be > 0, got {}", exec.poll_interval_secs),
            ));
        }
        if let Some(max_wait) = exec.max_wait_secs {
            if !max_wait.is_finite() || max_wait <= 0.0 {
                errors.push(FieldError::new(
                    "execution.max_wait_secs",
                    format!("must be > 0 when set, got {max_wait}"),
                ));
            }
        }
        if let Err(CoreError::Config(mut e)) = exec.seed_strategy_name.parse::<SeedStrategy>() {
            errors.append(&mut e);
        }
        if exec.seed_base < -1 {
            errors.push(FieldError::new(
                "execution.seed_base",
                format!("must be >= -1, got {}", exec.seed_base),
            ));
        }

        if let Some(s) = &self.sampler_choices {
            s.validate("sampler_choices", errors);
        }
        if let Some(l) = &self.lora_choices {
            l.validate("lora_choices", errors);
        }
        for (i, expr) in self.expressions.iter().enumerate() {
            if expr.trim().is_empty() {
                errors.push(FieldError::new(
                    format!("expressions[{i}]"),
                    "must not be empty",
                ));
            }
        }
    }
}

fn into_result(errors: Vec<FieldError>) -> Result<(), CoreError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CoreError::Config(errors))
    }
}
