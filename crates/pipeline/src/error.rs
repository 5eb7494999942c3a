use std::path::PathBuf;

use axisweep_core::error::CoreError;

/// Errors that stop a sweep before or between submissions.
///
/// Per-submission failures never show up here; they are recorded in the
/// run's metadata file and counted in the summary.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("ComfyUI is not reachable at {0}")]
    Unreachable(String),

    #[error("Workflow {} is missing required nodes", .0.display())]
    InvalidWorkflow(PathBuf),

    #[error("Images directory not found or not a directory: {}", .0.display())]
    ImagesDir(PathBuf),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the invocation was misconfigured (as opposed to the server
    /// being down or an unexpected failure).
    pub fn is_config(&self) -> bool {
        match self {
            Self::Core(e) => e.is_config(),
            Self::InvalidWorkflow(_) | Self::ImagesDir(_) => true,
            Self::Unreachable(_) | Self::Io { .. } | Self::Encode(_) => false,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}
