use std::time::Duration;

use thiserror::Error;

use crate::state::BuildState;

/// A3S Bake error types
#[derive(Error, Debug)]
pub enum BakeError {
    /// Base image reference malformed or unreachable
    #[error("Resolution error: {reference} - {message}")]
    Resolution { reference: String, message: String },

    /// Package fetch, conflict or prompt failure
    #[error("Install error: {package} - {cause}")]
    Install { package: String, cause: String },

    /// Configuration patch target missing or pattern not found
    #[error("Patch error: {path} - {reason}")]
    Patch { path: String, reason: String },

    /// Referenced artifact absent from the build context
    #[error("Artifact missing from build context: {source_name}")]
    ArtifactMissing { source_name: String },

    /// A network-bound step exceeded its deadline
    #[error("Timeout: {operation} did not finish within {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Directive failed structural validation
    #[error("Invalid directive: {0}")]
    InvalidDirective(String),

    /// Exposed port does not match the configured listening port
    #[error("Inconsistent image: exposed port {exposed} is not among the configured listening ports {declared:?}")]
    Consistency { exposed: u16, declared: Vec<u16> },

    /// Recipe text could not be parsed
    #[error("Recipe error: line {line}: {message}")]
    Recipe { line: usize, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// OCI layout export error
    #[error("Export error: {0}")]
    Export(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A pipeline step failed; the chain halted in `state`
    #[error("step {index} ({step}) failed in state {state}: {source}")]
    StepFailed {
        index: usize,
        step: String,
        state: BuildState,
        #[source]
        source: Box<BakeError>,
    },
}

/// Flat classification of [`BakeError`], with step failures unwrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Resolution,
    Install,
    Patch,
    ArtifactMissing,
    Timeout,
    InvalidDirective,
    Consistency,
    Recipe,
    Config,
    Export,
    Io,
    Serialization,
}

impl BakeError {
    /// Wrap `self` with the step that produced it.
    pub fn at_step(self, index: usize, step: impl Into<String>, state: BuildState) -> Self {
        BakeError::StepFailed {
            index,
            step: step.into(),
            state,
            source: Box::new(self),
        }
    }

    /// Root classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BakeError::Resolution { .. } => ErrorKind::Resolution,
            BakeError::Install { .. } => ErrorKind::Install,
            BakeError::Patch { .. } => ErrorKind::Patch,
            BakeError::ArtifactMissing { .. } => ErrorKind::ArtifactMissing,
            BakeError::Timeout { .. } => ErrorKind::Timeout,
            BakeError::InvalidDirective(_) => ErrorKind::InvalidDirective,
            BakeError::Consistency { .. } => ErrorKind::Consistency,
            BakeError::Recipe { .. } => ErrorKind::Recipe,
            BakeError::ConfigError(_) => ErrorKind::Config,
            BakeError::Export(_) => ErrorKind::Export,
            BakeError::IoError(_) => ErrorKind::Io,
            BakeError::SerializationError(_) => ErrorKind::Serialization,
            BakeError::StepFailed { source, .. } => source.kind(),
        }
    }

    /// The state a failed build halted in, if this is a step failure.
    pub fn halted_state(&self) -> Option<BuildState> {
        match self {
            BakeError::StepFailed { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// The innermost error, with step context removed.
    pub fn root(&self) -> &BakeError {
        match self {
            BakeError::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for BakeError {
    fn from(err: serde_json::Error) -> Self {
        BakeError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BakeError {
    fn from(err: serde_yaml::Error) -> Self {
        BakeError::SerializationError(err.to_string())
    }
}

/// Result type alias for A3S Bake operations
pub type Result<T> = std::result::Result<T, BakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_error_display() {
        let error = BakeError::Resolution {
            reference: "base-os:20.04".to_string(),
            message: "not found".to_string(),
        };
        assert_eq!(error.to_string(), "Resolution error: base-os:20.04 - not found");
    }

    #[test]
    fn test_install_error_display() {
        let error = BakeError::Install {
            package: "httpd".to_string(),
            cause: "package not found".to_string(),
        };
        assert_eq!(error.to_string(), "Install error: httpd - package not found");
    }

    #[test]
    fn test_artifact_missing_display() {
        let error = BakeError::ArtifactMissing {
            source_name: "register.php".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Artifact missing from build context: register.php"
        );
    }

    #[test]
    fn test_timeout_display() {
        let error = BakeError::Timeout {
            operation: "resolve base-os:20.04".to_string(),
            after: Duration::from_secs(30),
        };
        assert_eq!(
            error.to_string(),
            "Timeout: resolve base-os:20.04 did not finish within 30s"
        );
    }

    #[test]
    fn test_step_failed_carries_context() {
        let error = BakeError::ArtifactMissing {
            source_name: "register.php".to_string(),
        }
        .at_step(5, "COPY index.php /srv/www/index.php", BuildState::Patched);

        assert_eq!(error.kind(), ErrorKind::ArtifactMissing);
        assert_eq!(error.halted_state(), Some(BuildState::Patched));
        assert!(error.to_string().starts_with("step 5 (COPY index.php"));
        assert!(error.to_string().contains("failed in state patched"));
        assert!(matches!(error.root(), BakeError::ArtifactMissing { .. }));
    }

    #[test]
    fn test_kind_without_step_context() {
        let error = BakeError::Patch {
            path: "/ports.conf".to_string(),
            reason: "pattern not found".to_string(),
        };
        assert_eq!(error.kind(), ErrorKind::Patch);
        assert_eq!(error.halted_state(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let bake_error: BakeError = io_error.into();
        assert!(matches!(bake_error, BakeError::IoError(_)));
        assert_eq!(bake_error.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let bake_error: BakeError = result.unwrap_err().into();
        assert!(matches!(bake_error, BakeError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let bake_error: BakeError = result.unwrap_err().into();
        assert!(matches!(bake_error, BakeError::SerializationError(_)));
    }
}
