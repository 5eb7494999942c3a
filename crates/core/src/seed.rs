//! Seed allocation strategies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Seed;

/// Upper bound (exclusive) for time-derived seeds.
pub const TIME_SEED_MODULUS: i64 = 2_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedStrategy {
    /// Current epoch milliseconds modulo [`TIME_SEED_MODULUS`].
    #[default]
    Time,
    /// Always the configured base.
    Fixed,
    /// Base plus the number of seeds handed out so far.
    Increment,
}

impl SeedStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Fixed => "fixed",
            Self::Increment => "increment",
        }
    }
}

impl fmt::Display for SeedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeedStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "time" => Ok(Self::Time),
            "fixed" => Ok(Self::Fixed),
            "increment" => Ok(Self::Increment),
            other => Err(CoreError::config_field(
                "execution.seed_strategy",
                format!("unknown seed strategy '{other}' (expected time, fixed or increment)"),
            )),
        }
    }
}

/// Hands out one seed per submission. The counter spans the whole
/// invocation, so `increment` never repeats a seed across combinations.
#[derive(Debug, Clone)]
pub struct SeedAllocator {
    strategy: SeedStrategy,
    base: Seed,
    issued: i64,
}

impl SeedAllocator {
    pub fn new(strategy: SeedStrategy, base: Seed) -> Self {
        Self {
            strategy,
            base,
            issued: 0,
        }
    }

    pub fn strategy(&self) -> SeedStrategy {
        self.strategy
    }

    /// Number of seeds handed out so far.
    pub fn issued(&self) -> i64 {
        self.issued
    }

    pub fn next_seed(&mut self) -> Seed {
        let seed = match self.strategy {
            SeedStrategy::Time => time_seed(),
            SeedStrategy::Fixed => self.base,
            SeedStrategy::Increment => self.base.saturating_add(self.issued),
        };
        self.issued += 1;
        seed
    }
}

/// Seed derived from the wall clock.
pub fn time_seed() -> Seed {
    chrono::Utc::now().timestamp_millis().rem_euclid(TIME_SEED_MODULUS)
}
