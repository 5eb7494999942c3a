//! Progress accounting and the end-of-run summary.

use std::time::Duration;

use serde::Serialize;

/// `1h 02m 03s`, `4m 05s` or `7s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Linear extrapolation from the average time per finished unit. `None`
/// until at least one unit has finished.
pub fn estimate_remaining(elapsed: Duration, done: usize, total: usize) -> Option<Duration> {
    if done == 0 {
        return None;
    }
    let left = total.saturating_sub(done) as u32;
    Some(elapsed / done as u32 * left)
}

/// Tracks completed units against a planned total.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    started: std::time::Instant,
    done: usize,
    total: usize,
}

impl ProgressTracker {
    pub fn start(total: usize) -> Self {
        Self {
            started: std::time::Instant::now(),
            done: 0,
            total,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record one finished unit and log where the run stands.
    pub fn advance(&mut self, label: &str) {
        self.done += 1;
        let eta = estimate_remaining(self.elapsed(), self.done, self.total)
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        tracing::info!(
            done = self.done,
            total = self.total,
            eta = %eta,
            "{label} finished"
        );
    }
}

/// Aggregate outcome of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_axis: Option<String>,
    /// Submissions the plan called for.
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Units skipped before submission, e.g. images whose upload failed.
    pub skipped: usize,
    pub interrupted: bool,
    pub dry_run: bool,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl RunSummary {
    pub fn submitted(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn log(&self) {
        tracing::info!(
            target_axis = self.target_axis.as_deref().unwrap_or("-"),
            planned = self.planned,
            succeeded = self.succeeded,
            failed = self.failed,
            skipped = self.skipped,
            interrupted = self.interrupted,
            dry_run = self.dry_run,
            elapsed = %format_duration(self.elapsed),
            "Sweep finished"
        );
    }
}
