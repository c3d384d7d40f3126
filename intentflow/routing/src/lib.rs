#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Intentflow routing: command discovery, context resolution, routing definitions and dispatch.

/// Context inheritance and ancestry resolution.
pub mod context_model;
/// Class declaration scanning for command files.
pub mod declarations;
/// Command directory discovery and hydration.
pub mod directory;
/// Routing error types.
pub mod error;
/// Prediction-driven dispatch.
pub mod executor;
/// Command handler plugins.
pub mod handlers;
/// Qualified names and core commands.
pub mod names;
/// Generation-scoped caches.
pub mod registry;
/// Routing definition build/load and queries.
pub mod routing;
/// Workflow stack and keep-alive session worker.
pub mod session;
/// Telemetry helpers for logging/event emission.
pub mod telemetry;

pub use context_model::{ContextCommandSource, ContextModel};
pub use directory::{
    ClassRef, CommandDirectory, CommandLoadFailure, CommandMetadata, CommandModule,
    CommandSource, ContextMetadata, DirectoryConfig, ParameterSpec,
};
pub use error::{Relation, Result, RoutingError};
pub use executor::{CommandExecutor, DispatchOutcome, IntentPredictor, Prediction};
pub use handlers::{
    CommandHandler, CommandResponse, ExecutionContext, ExtractedParameters, HandlerRegistry,
    ParameterExtractor, ParameterObject, ResponseGenerator,
};
pub use names::{CoreCommands, WILDCARD_COMMAND, WILDCARD_CONTEXT};
pub use registry::{Generation, Registry, RoutingRegistry};
pub use routing::{CommandClass, ModuleType, RoutingDefinition, RoutingOptions};
pub use session::{ActiveWorkflow, KeepAliveSession, WorkflowStack};
pub use telemetry::{Telemetry, TelemetryBuilder};
