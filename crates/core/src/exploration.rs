//! Exploration state: which axes have already been swept end-to-end.
//!
//! The state lives in a small JSON file that is rewritten whole on every
//! change (write to a sibling temp file, then rename). A missing or
//! unreadable file never fails a load; it simply means nothing has been
//! explored yet.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Timestamp;

/// Schema version written to, and expected in, the state file.
pub const STATE_VERSION: &str = "1.0";

/// On-disk shape of the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    used_axes: Vec<String>,
    #[serde(default)]
    last_updated: Option<Timestamp>,
    #[serde(default)]
    total_used: Option<usize>,
}

/// Summary returned by [`ExplorationState::progress`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplorationProgress {
    pub used_count: usize,
    pub total_count: usize,
    pub percentage: f64,
    pub remaining: Vec<String>,
}

/// Persisted set of already-explored axis names.
#[derive(Debug, Clone)]
pub struct ExplorationState {
    path: PathBuf,
    used: BTreeSet<String>,
    last_updated: Option<Timestamp>,
}

impl ExplorationState {
    /// Load state from `path`. Never fails: a missing file starts empty, a
    /// corrupt one is logged and also starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let empty = |path: PathBuf| Self {
            path,
            used: BTreeSet::new(),
            last_updated: None,
        };

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No exploration state file, starting fresh");
                return empty(path);
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read exploration state, treating as empty",
                );
                return empty(path);
            }
        };

        let file: StateFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Corrupt exploration state file, treating as empty",
                );
                return empty(path);
            }
        };

        match file.version.as_deref() {
            Some(STATE_VERSION) => {}
            other => tracing::warn!(
                path = %path.display(),
                found = ?other,
                expected = STATE_VERSION,
                "Exploration state version mismatch, loading anyway",
            ),
        }

        let used: BTreeSet<String> = file.used_axes.into_iter().collect();
        tracing::info!(
            path = %path.display(),
            used = used.len(),
            "Loaded exploration state"
        );

        Self {
            path,
            used,
            last_updated: file.last_updated,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_updated(&self) -> Option<Timestamp> {
        self.last_updated
    }

    /// Used axis names in sorted order.
    pub fn used_axes(&self) -> impl Iterator<Item = &str> {
        self.used.iter().map(String::as_str)
    }

    pub fn is_used(&self, axis: &str) -> bool {
        self.used.contains(axis)
    }

    /// `all_axes` minus the used set, preserving input order.
    pub fn remaining<S: AsRef<str>>(&self, all_axes: &[S]) -> Vec<String> {
        all_axes
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| !self.used.contains(*name))
            .map(str::to_string)
            .collect()
    }

    pub fn is_all_used<S: AsRef<str>>(&self, all_axes: &[S]) -> bool {
        self.remaining(all_axes).is_empty()
    }

    /// Progress over the currently declared axes. Used names that are no
    /// longer declared do not count.
    pub fn progress<S: AsRef<str>>(&self, all_axes: &[S]) -> ExplorationProgress {
        let remaining = self.remaining(all_axes);
        let total_count = all_axes.len();
        let used_count = total_count - remaining.len();
        let percentage = if total_count == 0 {
            0.0
        } else {
            used_count as f64 / total_count as f64 * 100.0
        };

        ExplorationProgress {
            used_count,
            total_count,
            percentage,
            remaining,
        }
    }

    /// Record `axis` as explored and persist immediately.
    pub fn mark_used(&mut self, axis: &str) -> Result<(), CoreError> {
        if !self.used.insert(axis.to_string()) {
            tracing::warn!(axis = %axis, "Axis already marked as used");
        }
        self.save()?;
        tracing::info!(axis = %axis, total_used = self.used.len(), "Marked axis as used");
        Ok(())
    }

    /// Forget one axis. Absent names are a warning, not an error.
    pub fn remove(&mut self, axis: &str) -> Result<(), CoreError> {
        if !self.used.remove(axis) {
            tracing::warn!(axis = %axis, "Axis not in exploration state, nothing to remove");
            return Ok(());
        }
        self.save()?;
        tracing::info!(axis = %axis, "Removed axis from exploration state");
        Ok(())
    }

    /// Forget every axis.
    pub fn reset(&mut self) -> Result<(), CoreError> {
        let cleared = self.used.len();
        self.used.clear();
        self.save()?;
        tracing::info!(cleared, "Reset exploration state");
        Ok(())
    }

    /// Overwrite the state file with the in-memory set.
    fn save(&mut self) -> Result<(), CoreError> {
        let now = chrono::Utc::now();
        let file = StateFile {
            version: Some(STATE_VERSION.to_string()),
            used_axes: self.used.iter().cloned().collect(),
            last_updated: Some(now),
            total_used: Some(self.used.len()),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| CoreError::Internal(format!("Failed to encode exploration state: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| CoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CoreError::io(&self.path, e))?;

        self.last_updated = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AXES: [&str; 3] = ["hair", "pose", "outfit"];

    fn state_in(dir: &tempfile::TempDir) -> ExplorationState {
        ExplorationState::load(dir.path().join("axis_state.json"))
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(&dir);
        assert_eq!(state.remaining(&AXES), vec!["hair", "pose", "outfit"]);
        assert!(state.last_updated().is_none());
    }

    #[test]
    fn mark_used_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(&dir);
        state.mark_used("pose").unwrap();

        let reloaded = state_in(&dir);
        assert!(reloaded.is_used("pose"));
        assert_eq!(reloaded.remaining(&AXES), vec!["hair", "outfit"]);
        assert!(reloaded.last_updated().is_some());
    }

    #[test]
    fn persisted_document_is_sorted_and_versioned() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(&dir);
        state.mark_used("pose").unwrap();
        state.mark_used("hair").unwrap();

        let raw = std::fs::read_to_string(state.path()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["version"], "1.0");
        assert_eq!(doc["used_axes"], serde_json::json!(["hair", "pose"]));
        assert_eq!(doc["total_used"], 2);
        assert!(doc["last_updated"].is_string());
    }

    #[test]
    fn marking_twice_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(&dir);
        state.mark_used("hair").unwrap();
        state.mark_used("hair").unwrap();
        assert_eq!(state.used_axes().count(), 1);
    }

    #[test]
    fn corrupt_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("axis_state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let state = ExplorationState::load(&path);
        assert_eq!(state.used_axes().count(), 0);
    }

    #[test]
    fn version_mismatch_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("axis_state.json");
        std::fs::write(&path, r#"{"version": "0.1", "used_axes": ["hair"]}"#).unwrap();

        let state = ExplorationState::load(&path);
        assert!(state.is_used("hair"));
    }

    #[test]
    fn remove_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(&dir);
        state.mark_used("hair").unwrap();
        state.mark_used("pose").unwrap();

        state.remove("outfit").unwrap();
        state.remove("hair").unwrap();
        assert_eq!(state_in(&dir).remaining(&AXES), vec!["hair", "outfit"]);

        state.reset().unwrap();
        assert!(!state_in(&dir).is_all_used(&AXES));
        assert_eq!(state_in(&dir).used_axes().count(), 0);
    }

    #[test]
    fn progress_ignores_undeclared_axes() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(&dir);
        state.mark_used("hair").unwrap();
        state.mark_used("retired_axis").unwrap();

        let progress = state.progress(&AXES);
        assert_eq!(progress.used_count, 1);
        assert_eq!(progress.total_count, 3);
        assert!((progress.percentage - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(progress.remaining, vec!["pose", "outfit"]);
    }

    #[test]
    fn all_used_once_every_axis_is_marked() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(&dir);
        for axis in AXES {
            state.mark_used(axis).unwrap();
        }
        assert!(state.is_all_used(&AXES));
        assert_eq!(state.progress(&AXES).percentage, 100.0);
    }
}
