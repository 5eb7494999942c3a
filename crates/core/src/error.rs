use std::fmt;
use std::path::PathBuf;

/// A single configuration violation, addressed by its dotted field path
/// (e.g. `sampler_choices.cfg[2]`).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid configuration: {}", join_field_errors(.0))]
    Config(Vec<FieldError>),

    #[error("Unknown axis: {0}")]
    UnknownAxis(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a configuration error with a single offending field.
    pub fn config_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config(vec![FieldError::new(field, message)])
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error belongs to the "fix your config" category.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::UnknownAxis(_) | Self::Template(_) | Self::Workflow(_)
        )
    }
}
