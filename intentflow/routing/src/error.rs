use std::{fmt, path::PathBuf};

use thiserror::Error;

/// Which context relation a cycle was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Command inheritance (`base`).
    Inheritance,
    /// Structural ancestry (`parent`).
    Hierarchy,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inheritance => f.write_str("inheritance"),
            Self::Hierarchy => f.write_str("hierarchy"),
        }
    }
}

/// Errors raised while discovering, resolving or dispatching commands.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// The workflow root has no `_commands` folder.
    #[error("workflow {} has no _commands directory", .0.display())]
    MissingCommandsDir(PathBuf),
    /// A context folder holds no eligible command files.
    #[error("context folder {} ({context}) contains no command files", .path.display())]
    EmptyContextFolder {
        /// Context name.
        context: String,
        /// Folder path.
        path: PathBuf,
    },
    /// A relation contains a cycle; `chain` ends with the re-entered context.
    #[error("{relation} cycle detected: {}", .chain.join(" -> "))]
    CycleDetected {
        /// Relation the cycle was found in.
        relation: Relation,
        /// Contexts on the cycle, in visiting order.
        chain: Vec<String>,
    },
    /// An inheritance entry without `base` for a context with no commands.
    #[error("context {0} declares no base and has no commands")]
    MissingBase(String),
    /// An inheritance entry names a base context nobody defines.
    #[error("context {context} inherits from unknown context {base}")]
    UnknownBase {
        /// Declaring context.
        context: String,
        /// Missing base.
        base: String,
    },
    /// Lookup of a context that does not exist.
    #[error("unknown context: {0}")]
    UnknownContext(String),
    /// Lookup of a command that was never discovered.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// A command file could not be loaded.
    #[error("failed to load command {command}: {reason}")]
    CommandLoad {
        /// Qualified command name.
        command: String,
        /// Human readable cause.
        reason: String,
    },
    /// No handler is registered for a routed command.
    #[error("no handler registered for command {0}")]
    MissingHandler(String),
    /// A handler failed while generating a response.
    #[error("handler for {command} failed: {reason}")]
    Handler {
        /// Qualified command name.
        command: String,
        /// Failure description.
        reason: String,
    },
    /// Intent prediction failed.
    #[error("prediction failed: {0}")]
    Prediction(String),
    /// Filesystem failure.
    #[error("io error at {}: {source}", .path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Malformed JSON in a model file or sidecar.
    #[error("invalid json in {}: {source}", .path.display())]
    Json {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl RoutingError {
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

/// Result alias for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;
