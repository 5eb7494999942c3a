//! Combination generator.
//!
//! A sweep explores one target axis exhaustively while every other axis is
//! collapsed to a single value. The Cartesian product runs over
//! `target values x steps x cfg x sampler x scheduler x denoise x lora name x
//! model strength x clip strength`. Items are produced lazily by decomposing
//! a running index into mixed-radix digits, so [`count_combinations`] and the
//! iterator always agree without materializing the sequence.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::axis::PromptTemplate;
use crate::error::{CoreError, FieldError};
use crate::types::Seed;

/// LoRA file extensions accepted as model-weight files.
pub const LORA_EXTENSIONS: &[&str] = &[".safetensors", ".ckpt", ".pt"];

/// Seed placeholder until the orchestrator assigns a real one.
pub const UNASSIGNED_SEED: Seed = -1;

// ---------------------------------------------------------------------------
// Choice lists
// ---------------------------------------------------------------------------

/// Candidate sampler settings. Every list is swept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerChoices {
    pub steps: Vec<u32>,
    pub cfg: Vec<f64>,
    pub sampler_name: Vec<String>,
    pub scheduler: Vec<String>,
    /// Optional; an empty list leaves the workflow's own denoise untouched.
    #[serde(default)]
    pub denoise: Vec<f64>,
}

impl SamplerChoices {
    /// Number of sampler combinations (denoise counts as 1 when absent).
    pub fn count(&self) -> usize {
        self.radices().iter().product()
    }

    fn radices(&self) -> [usize; 5] {
        [
            self.steps.len(),
            self.cfg.len(),
            self.sampler_name.len(),
            self.scheduler.len(),
            self.denoise.len().max(1),
        ]
    }

    /// Sampler parameters for the given digits (same order as `radices`).
    fn params_at(&self, digits: &[usize]) -> SamplerParams {
        SamplerParams {
            steps: self.steps[digits[0]],
            cfg: self.cfg[digits[1]],
            sampler_name: self.sampler_name[digits[2]].clone(),
            scheduler: self.scheduler[digits[3]].clone(),
            seed: UNASSIGNED_SEED,
            denoise: self.denoise.get(digits[4]).copied(),
        }
    }

    /// Every sampler combination in sweep order.
    pub fn iter(&self) -> impl Iterator<Item = SamplerParams> + '_ {
        let radices = self.radices();
        (0..self.count()).map(move |i| self.params_at(&mixed_radix_digits(i, &radices)))
    }

    pub fn validate(&self, prefix: &str, errors: &mut Vec<FieldError>) {
        non_empty(prefix, "steps", self.steps.len(), errors);
        non_empty(prefix, "cfg", self.cfg.len(), errors);
        non_empty(prefix, "sampler_name", self.sampler_name.len(), errors);
        non_empty(prefix, "scheduler", self.scheduler.len(), errors);

        for (i, steps) in self.steps.iter().enumerate() {
            if *steps == 0 {
                errors.push(FieldError::new(
                    format!("{prefix}.steps[{i}]"),
                    "must be > 0",
                ));
            }
        }
        for (i, cfg) in self.cfg.iter().enumerate() {
            if !cfg.is_finite() || *cfg <= 0.0 {
                errors.push(FieldError::new(
                    format!("{prefix}.cfg[{i}]"),
                    format!("must be > 0, got {cfg}"),
                ));
            }
        }
        for (i, d) in self.denoise.iter().enumerate() {
            if !d.is_finite() || *d < 0.0 || *d > 1.0 {
                errors.push(FieldError::new(
                    format!("{prefix}.denoise[{i}]"),
                    format!("must be within [0, 1], got {d}"),
                ));
            }
        }
        for (field, names) in [
            ("sampler_name", &self.sampler_name),
            ("scheduler", &self.scheduler),
        ] {
            for (i, name) in names.iter().enumerate() {
                if name.trim().is_empty() {
                    errors.push(FieldError::new(
                        format!("{prefix}.{field}[{i}]"),
                        "must not be empty",
                    ));
                }
            }
        }
    }
}

/// Candidate LoRA settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraChoices {
    pub names: Vec<String>,
    pub model_strength: Vec<f64>,
    pub clip_strength: Vec<f64>,
}

impl LoraChoices {
    pub fn count(&self) -> usize {
        self.radices().iter().product()
    }

    fn radices(&self) -> [usize; 3] {
        [
            self.names.len(),
            self.model_strength.len(),
            self.clip_strength.len(),
        ]
    }

    fn params_at(&self, digits: &[usize]) -> LoraParams {
        LoraParams {
            name: self.names[digits[0]].clone(),
            model_strength: self.model_strength[digits[1]],
            clip_strength: self.clip_strength[digits[2]],
        }
    }

    pub fn validate(&self, prefix: &str, errors: &mut Vec<FieldError>) {
        non_empty(prefix, "names", self.names.len(), errors);
        non_empty(prefix, "model_strength", self.model_strength.len(), errors);
        non_empty(prefix, "clip_strength", self.clip_strength.len(), errors);

        for (i, name) in self.names.iter().enumerate() {
            if !is_lora_file(name) {
                errors.push(FieldError::new(
                    format!("{prefix}.names[{i}]"),
                    format!(
                        "'{name}' is not a model-weight file (expected one of {})",
                        LORA_EXTENSIONS.join(", ")
                    ),
                ));
            }
        }
        for (field, values) in [
            ("model_strength", &self.model_strength),
            ("clip_strength", &self.clip_strength),
        ] {
            for (i, v) in values.iter().enumerate() {
                if !v.is_finite() {
                    errors.push(FieldError::new(
                        format!("{prefix}.{field}[{i}]"),
                        "must be a finite number",
                    ));
                }
            }
        }
    }
}

/// Whether `name` carries a recognised model-weight file extension.
pub fn is_lora_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    LORA_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn non_empty(prefix: &str, field: &str, len: usize, errors: &mut Vec<FieldError>) {
    if len == 0 {
        errors.push(FieldError::new(
            format!("{prefix}.{field}"),
            "must not be empty",
        ));
    }
}

// ---------------------------------------------------------------------------
// Generated parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerParams {
    pub steps: u32,
    pub cfg: f64,
    pub sampler_name: String,
    pub scheduler: String,
    pub seed: Seed,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denoise: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraParams {
    pub name: String,
    pub model_strength: f64,
    pub clip_strength: f64,
}

/// Everything needed to inject and submit one combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub positive: String,
    pub negative: String,
    pub sampler: SamplerParams,
    pub lora: LoraParams,
    pub target_axis: String,
    pub axis_values: BTreeMap<String, String>,
}

impl GenerationParams {
    /// Copy with the seed filled in; the only post-creation change allowed.
    pub fn with_seed(&self, seed: Seed) -> Self {
        let mut params = self.clone();
        params.sampler.seed = seed;
        params
    }
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

/// Split `index` into digits for the given radices; the last digit varies
/// fastest.
fn mixed_radix_digits(mut index: usize, radices: &[usize]) -> Vec<usize> {
    let mut digits = vec![0; radices.len()];
    for (slot, radix) in digits.iter_mut().zip(radices).rev() {
        if *radix == 0 {
            continue;
        }
        *slot = index % radix;
        index /= radix;
    }
    digits
}

/// Closed-form number of combinations a sweep over `target_axis` yields.
pub fn count_combinations(
    template: &PromptTemplate,
    target_axis: &str,
    sampler: &SamplerChoices,
    lora: &LoraChoices,
) -> Result<usize, CoreError> {
    template.axis(target_axis)?;
    let axes: usize = template
        .axes
        .iter()
        .map(|a| a.sweep_len(a.name == target_axis))
        .product();
    Ok(axes * sampler.count() * lora.count())
}

/// Lazily enumerate every combination for a sweep over `target_axis`.
///
/// Non-target axes are collapsed once, up front, so every combination of
/// one sweep shares the same non-target values.
pub fn enumerate_combinations<'a, R: Rng + ?Sized>(
    template: &'a PromptTemplate,
    target_axis: &str,
    sampler: &'a SamplerChoices,
    lora: &'a LoraChoices,
    randomize_non_target: bool,
    rng: &mut R,
) -> Result<Combinations<'a>, CoreError> {
    template.axis(target_axis)?;

    let axis_values: Vec<(String, Vec<String>)> = template
        .axes
        .iter()
        .map(|axis| {
            let is_target = axis.name == target_axis;
            let values = axis.sweep_values(is_target, randomize_non_target, rng);
            tracing::debug!(
                axis = %axis.name,
                target = is_target,
                values = values.len(),
                "Resolved axis values"
            );
            (axis.name.clone(), values)
        })
        .collect();

    let mut radices: Vec<usize> = axis_values.iter().map(|(_, v)| v.len()).collect();
    radices.extend(sampler.radices());
    radices.extend(lora.radices());
    let total: usize = radices.iter().product();

    Ok(Combinations {
        template,
        target_axis: target_axis.to_string(),
        axis_values,
        sampler,
        lora,
        radices,
        next: 0,
        total,
    })
}

/// Iterator returned by [`enumerate_combinations`].
#[derive(Debug, Clone)]
pub struct Combinations<'a> {
    template: &'a PromptTemplate,
    target_axis: String,
    axis_values: Vec<(String, Vec<String>)>,
    sampler: &'a SamplerChoices,
    lora: &'a LoraChoices,
    radices: Vec<usize>,
    next: usize,
    total: usize,
}

impl Combinations<'_> {
    pub fn total(&self) -> usize {
        self.total
    }

    fn build(&self, index: usize) -> GenerationParams {
        let digits = mixed_radix_digits(index, &self.radices);
        let n_axes = self.axis_values.len();
        let (axis_digits, rest) = digits.split_at(n_axes);
        let (sampler_digits, lora_digits) = rest.split_at(5);

        let chosen: Vec<(&str, &str)> = self
            .axis_values
            .iter()
            .zip(axis_digits)
            .map(|((name, values), d)| (name.as_str(), values[*d].as_str()))
            .collect();

        GenerationParams {
            positive: self
                .template
                .positive_prompt(chosen.iter().map(|(_, v)| *v)),
            negative: self.template.negative_prompt(),
            sampler: self.sampler.params_at(sampler_digits),
            lora: self.lora.params_at(lora_digits),
            target_axis: self.target_axis.clone(),
            axis_values: chosen
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl Iterator for Combinations<'_> {
    type Item = GenerationParams;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let item = self.build(self.next);
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Combinations<'_> {}
