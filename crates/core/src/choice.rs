//! Weighted random choice.
//!
//! Candidate lists come from configuration either as plain strings or as
//! `{text, weight}` objects. Both end up as [`Choice`] values; a plain
//! string is simply a choice with weight `1.0`.

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Weight assigned to choices declared without an explicit weight.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// One candidate value together with its relative selection weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ChoiceRepr")]
pub struct Choice {
    pub value: String,
    pub weight: f64,
}

impl Choice {
    pub fn new(value: impl Into<String>, weight: f64) -> Self {
        Self {
            value: value.into(),
            weight,
        }
    }

    /// A choice with the default weight.
    pub fn unweighted(value: impl Into<String>) -> Self {
        Self::new(value, DEFAULT_WEIGHT)
    }
}

impl From<&str> for Choice {
    fn from(value: &str) -> Self {
        Self::unweighted(value)
    }
}

/// Accepted on-disk shapes for a choice.
#[derive(Deserialize)]
#[serde(untagged)]
enum ChoiceRepr {
    Plain(String),
    Weighted {
        #[serde(alias = "value")]
        text: String,
        #[serde(default = "default_weight")]
        weight: f64,
    },
}

fn default_weight() -> f64 {
    DEFAULT_WEIGHT
}

impl From<ChoiceRepr> for Choice {
    fn from(repr: ChoiceRepr) -> Self {
        match repr {
            ChoiceRepr::Plain(text) => Self::unweighted(text),
            ChoiceRepr::Weighted { text, weight } => Self::new(text, weight),
        }
    }
}

/// Draw an index proportionally to `weights`.
///
/// Returns `None` for an empty slice. When every weight is zero the draw
/// is uniform: an all-zero list means "no preference", not "nothing
/// selectable".
pub fn choose_index<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }

    if weights.iter().all(|w| *w == 0.0) {
        return Some(rng.random_range(0..weights.len()));
    }

    match WeightedIndex::new(weights) {
        Ok(dist) => Some(dist.sample(rng)),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid choice weights, falling back to uniform choice");
            Some(rng.random_range(0..weights.len()))
        }
    }
}

/// Pick one value from weighted choices using the given RNG.
pub fn pick_with<'a, R: Rng + ?Sized>(choices: &'a [Choice], rng: &mut R) -> Option<&'a str> {
    let weights: Vec<f64> = choices.iter().map(|c| c.weight).collect();
    choose_index(&weights, rng).map(|i| choices[i].value.as_str())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn empty_choices_yield_none() {
        assert_eq!(pick_with(&[], &mut rng()), None);
    }

    #[test]
    fn picks_only_declared_values() {
        let choices = vec![
            Choice::new("a", 2.0),
            Choice::new("b", 1.0),
            Choice::new("c", 0.5),
        ];
        let mut rng = rng();
        for _ in 0..500 {
            let v = pick_with(&choices, &mut rng).unwrap();
            assert!(["a", "b", "c"].contains(&v));
        }
    }

    #[test]
    fn zero_weight_entry_is_never_picked_when_others_are_positive() {
        let choices = vec![Choice::new("never", 0.0), Choice::new("always", 1.0)];
        let mut rng = rng();
        for _ in 0..200 {
            assert_eq!(pick_with(&choices, &mut rng), Some("always"));
        }
    }

    #[test]
    fn all_zero_weights_are_uniform() {
        let choices = vec![
            Choice::new("x", 0.0),
            Choice::new("y", 0.0),
            Choice::new("z", 0.0),
        ];
        let mut rng = rng();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let draws = 9_000;
        for _ in 0..draws {
            *counts.entry(pick_with(&choices, &mut rng).unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for (_, n) in counts {
            // Expected 3000 each; allow a generous band.
            assert!((2_500..3_500).contains(&n), "count {n} outside uniform band");
        }
    }

    #[test]
    fn heavier_weight_wins_more_often() {
        let choices = vec![Choice::new("heavy", 9.0), Choice::new("light", 1.0)];
        let mut rng = rng();
        let heavy = (0..2_000)
            .filter(|_| pick_with(&choices, &mut rng) == Some("heavy"))
            .count();
        assert!(heavy > 1_500, "heavy picked only {heavy} times");
    }

    #[test]
    fn single_choice_is_always_picked() {
        let choices = vec![Choice::new("only", 0.3)];
        assert_eq!(pick_with(&choices, &mut rng()), Some("only"));
    }

    #[test]
    fn deserializes_plain_and_weighted_shapes() {
        let parsed: Vec<Choice> =
            serde_json::from_str(r#"["smile", {"text": "wink", "weight": 2.5}, {"text": "pout"}]"#)
                .unwrap();
        assert_eq!(
            parsed,
            vec![
                Choice::new("smile", 1.0),
                Choice::new("wink", 2.5),
                Choice::new("pout", 1.0),
            ]
        );
    }
}
