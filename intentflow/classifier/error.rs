use std::path::PathBuf;

use intentflow_routing::RoutingError;
use thiserror::Error;

/// Errors raised while training or running the confidence-routed classifier.
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// Routing lookup failed.
    #[error(transparent)]
    Routing(#[from] RoutingError),
    /// A required artifact file is absent (the context was never trained).
    #[error("missing classifier artifact {}", .0.display())]
    MissingArtifact(PathBuf),
    /// Artifacts in one directory come from different training runs.
    #[error("artifact {} belongs to run {found}, expected {expected}", .path.display())]
    InconsistentArtifacts {
        /// Offending file.
        path: PathBuf,
        /// Run id of the model weights.
        expected: String,
        /// Run id found in the file.
        found: String,
    },
    /// Not enough examples to train and validate a context.
    #[error("insufficient data for context {context}: {reason}")]
    InsufficientData {
        /// Context being trained.
        context: String,
        /// What was missing.
        reason: String,
    },
    /// Model, encoder or input dimensions disagree.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// A label unknown to the encoder.
    #[error("unknown label: {0}")]
    UnknownLabel(String),
    /// Filesystem failure.
    #[error("io error at {}: {source}", .path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Malformed artifact or corpus JSON.
    #[error("invalid json in {}: {source}", .path.display())]
    Json {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl ClassifierError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for classifier operations.
pub type Result<T> = std::result::Result<T, ClassifierError>;
