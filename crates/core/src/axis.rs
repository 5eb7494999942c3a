//! Prompt axes and templates.
//!
//! An [`Axis`] is one named dimension of prompt variation (hair style,
//! expression, pose, ...). A [`PromptTemplate`] combines several axes
//! with fixed positive and negative text.

use std::collections::HashSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::choice::{pick_with, Choice};
use crate::error::{CoreError, FieldError};

/// One sweep dimension: a named, ordered list of candidate values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub choices: Vec<Choice>,
}

impl Axis {
    pub fn new(name: impl Into<String>, choices: Vec<Choice>) -> Self {
        Self {
            name: name.into(),
            choices,
        }
    }

    /// All candidate values in declared order, weights dropped.
    pub fn values(&self) -> Vec<String> {
        self.choices.iter().map(|c| c.value.clone()).collect()
    }

    /// Value sequence this axis contributes to a sweep.
    ///
    /// - target axis: every value, in declared order (weights ignored).
    /// - other axes, randomized: one weighted draw.
    /// - other axes, not randomized: the first declared value.
    pub fn sweep_values<R: Rng + ?Sized>(
        &self,
        is_target: bool,
        randomize_non_target: bool,
        rng: &mut R,
    ) -> Vec<String> {
        if is_target {
            return self.values();
        }

        let picked = if randomize_non_target {
            pick_with(&self.choices, rng)
        } else {
            self.choices.first().map(|c| c.value.as_str())
        };

        picked.map(|v| vec![v.to_string()]).unwrap_or_default()
    }

    /// Number of values this axis contributes (see [`Axis::sweep_values`]).
    pub fn sweep_len(&self, is_target: bool) -> usize {
        if is_target {
            self.choices.len()
        } else {
            usize::from(!self.choices.is_empty())
        }
    }
}

/// Fixed prompt text plus the axes varied between runs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub fixed_positive: Vec<String>,
    #[serde(default)]
    pub axes: Vec<Axis>,
    #[serde(default)]
    pub negative: Vec<String>,
}

impl PromptTemplate {
    pub fn axis(&self, name: &str) -> Result<&Axis, CoreError> {
        self.axes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| CoreError::UnknownAxis(name.to_string()))
    }

    pub fn axis_names(&self) -> Vec<String> {
        self.axes.iter().map(|a| a.name.clone()).collect()
    }

    /// Positive prompt: fixed parts followed by the axis values in the
    /// order given.
    pub fn positive_prompt<'a>(
        &'a self,
        axis_values: impl IntoIterator<Item = &'a str>,
    ) -> String {
        let parts = self
            .fixed_positive
            .iter()
            .map(String::as_str)
            .chain(axis_values);
        join_prompts(parts)
    }

    pub fn negative_prompt(&self) -> String {
        join_prompts(self.negative.iter().map(String::as_str))
    }

    /// Check structural invariants, collecting one [`FieldError`] per
    /// violation under the `prompt_template` prefix.
    pub fn validate(&self, errors: &mut Vec<FieldError>) {
        if self.axes.is_empty() {
            errors.push(FieldError::new(
                "prompt_template.axes",
                "at least one axis is required",
            ));
        }

        let mut seen = HashSet::new();
        for (i, axis) in self.axes.iter().enumerate() {
            let field = format!("prompt_template.axes[{i}]");
            if axis.name.trim().is_empty() {
                errors.push(FieldError::new(
                    format!("{field}.name"),
                    "must not be empty",
                ));
            } else if !seen.insert(axis.name.as_str()) {
                errors.push(FieldError::new(
                    format!("{field}.name"),
                    format!("duplicate axis name '{}'", axis.name),
                ));
            }

            if axis.choices.is_empty() {
                errors.push(FieldError::new(
                    format!("{field}.choices"),
                    "must not be empty",
                ));
            }
            for (j, choice) in axis.choices.iter().enumerate() {
                if !choice.weight.is_finite() || choice.weight < 0.0 {
                    errors.push(FieldError::new(
                        format!("{field}.choices[{j}].weight"),
                        format!("must be a finite number >= 0, got {}", choice.weight),
                    ));
                }
            }
        }
    }
}

/// Join prompt fragments with `", "`, trimming each and dropping empties.
pub fn join_prompts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn axis(name: &str, values: &[&str]) -> Axis {
        Axis::new(name, values.iter().map(|v| Choice::unweighted(*v)).collect())
    }

    fn template() -> PromptTemplate {
        PromptTemplate {
            fixed_positive: vec!["1girl".into(), "masterpiece".into()],
            axes: vec![
                axis("hair", &["long hair", "short hair"]),
                axis("color", &["black hair", "blonde hair"]),
            ],
            negative: vec!["lowres".into(), "".into(), " blurry ".into()],
        }
    }

    #[test]
    fn target_axis_returns_every_value_in_order() {
        let a = axis("hair", &["long", "short", "bob"]);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(a.sweep_values(true, true, &mut rng), vec!["long", "short", "bob"]);
        assert_eq!(a.sweep_len(true), 3);
    }

    #[test]
    fn non_target_without_randomization_pins_first_value() {
        let a = axis("color", &["black", "blonde"]);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            assert_eq!(a.sweep_values(false, false, &mut rng), vec!["black"]);
        }
        assert_eq!(a.sweep_len(false), 1);
    }

    #[test]
    fn non_target_with_randomization_picks_one_declared_value() {
        let a = axis("color", &["black", "blonde", "red"]);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let picked = a.sweep_values(false, true, &mut rng);
            assert_eq!(picked.len(), 1);
            assert!(a.values().contains(&picked[0]));
        }
    }

    #[test]
    fn prompts_are_joined_and_cleaned() {
        let t = template();
        assert_eq!(
            t.positive_prompt(["long hair", "black hair"]),
            "1girl, masterpiece, long hair, black hair"
        );
        assert_eq!(t.negative_prompt(), "lowres, blurry");
    }

    #[test]
    fn prompt_accepts_values_borrowed_from_a_shorter_scope() {
        let t = template();
        let rendered = {
            let owned = vec![String::from(" wavy hair "), String::new()];
            t.positive_prompt(owned.iter().map(String::as_str))
        };
        assert_eq!(rendered, "1girl, masterpiece, wavy hair");
    }

    #[test]
    fn unknown_axis_is_an_error() {
        let err = template().axis("pose").unwrap_err();
        assert!(matches!(err, CoreError::UnknownAxis(name) if name == "pose"));
    }

    #[test]
    fn validate_flags_duplicates_empties_and_bad_weights() {
        let mut t = template();
        t.axes.push(axis("hair", &[]));
        t.axes[0].choices[1].weight = -1.0;

        let mut errors = Vec::new();
        t.validate(&mut errors);

        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"prompt_template.axes[2].name"));
        assert!(fields.contains(&"prompt_template.axes[2].choices"));
        assert!(fields.contains(&"prompt_template.axes[0].choices[1].weight"));
    }
}
