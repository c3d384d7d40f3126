//! Rust-side bindings for command implementations.

use std::{path::PathBuf, sync::Arc};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::Result,
    names::{self, CoreCommands, WILDCARD_COMMAND},
};

/// Extracted parameters handed to a response generator.
pub type ParameterObject = IndexMap<String, Value>;

/// State visible to a response generator for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Absolute workflow root.
    pub workflow: PathBuf,
    /// Active context.
    pub context: String,
    /// Qualified command being executed.
    pub command: String,
}

/// Structured response of a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Whether the command succeeded.
    pub success: bool,
    /// Human readable text.
    pub text: String,
    /// Named artifacts produced by the command.
    #[serde(default)]
    pub artifacts: IndexMap<String, Value>,
}

impl CommandResponse {
    /// Successful response.
    #[must_use]
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
            artifacts: IndexMap::new(),
        }
    }

    /// Failed response.
    #[must_use]
    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            success: false,
            text: text.into(),
            artifacts: IndexMap::new(),
        }
    }

    /// Adds an artifact.
    #[must_use]
    pub fn with_artifact(mut self, key: impl Into<String>, value: Value) -> Self {
        self.artifacts.insert(key.into(), value);
        self
    }
}

/// Output of a parameter extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedParameters {
    /// Parameter values.
    pub parameters: ParameterObject,
    /// False when the utterance lacks required parameters.
    pub is_valid: bool,
    /// Message for the user when invalid.
    pub error: Option<String>,
}

impl ExtractedParameters {
    /// Valid extraction.
    #[must_use]
    pub const fn valid(parameters: ParameterObject) -> Self {
        Self {
            parameters,
            is_valid: true,
            error: None,
        }
    }

    /// Invalid extraction with a user-facing message.
    #[must_use]
    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            parameters: ParameterObject::new(),
            is_valid: false,
            error: Some(error.into()),
        }
    }
}

/// Produces the response of a command.
pub trait ResponseGenerator: Send + Sync {
    /// Generates a response for `raw` with optional extracted parameters.
    fn generate(
        &self,
        context: &ExecutionContext,
        raw: &str,
        parameters: Option<&ParameterObject>,
    ) -> Result<CommandResponse>;
}

impl<F> ResponseGenerator for F
where
    F: Fn(&ExecutionContext, &str, Option<&ParameterObject>) -> Result<CommandResponse>
        + Send
        + Sync,
{
    fn generate(
        &self,
        context: &ExecutionContext,
        raw: &str,
        parameters: Option<&ParameterObject>,
    ) -> Result<CommandResponse> {
        self(context, raw, parameters)
    }
}

/// Extracts parameters from raw command text.
pub trait ParameterExtractor: Send + Sync {
    /// Extracts parameters from `raw`.
    fn extract(&self, raw: &str) -> Result<ExtractedParameters>;
}

/// Generator plus optional extractor bound to one command.
#[derive(Clone)]
pub struct CommandHandler {
    /// Response generator.
    pub generator: Arc<dyn ResponseGenerator>,
    /// Parameter extractor, required when the module declares a `Signature`.
    pub extractor: Option<Arc<dyn ParameterExtractor>>,
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("extractor", &self.extractor.is_some())
            .finish_non_exhaustive()
    }
}

struct AbortHandler;

impl ResponseGenerator for AbortHandler {
    fn generate(
        &self,
        context: &ExecutionContext,
        _raw: &str,
        _parameters: Option<&ParameterObject>,
    ) -> Result<CommandResponse> {
        Ok(CommandResponse::ok("Aborted.")
            .with_artifact("aborted_context", Value::String(context.context.clone())))
    }
}

struct WildcardHandler;

impl ResponseGenerator for WildcardHandler {
    fn generate(
        &self,
        context: &ExecutionContext,
        raw: &str,
        _parameters: Option<&ParameterObject>,
    ) -> Result<CommandResponse> {
        Ok(CommandResponse::failure(format!(
            "\"{raw}\" is not something I can do in {}.",
            context.context
        ))
        .with_artifact("unrecognized", Value::String(raw.to_string())))
    }
}

/// Registry of command handlers keyed by qualified name.
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    inner: Arc<RwLock<IndexMap<String, CommandHandler>>>,
    core: CoreCommands,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let registry = Self::empty();
        registry.register("abort", Arc::new(AbortHandler));
        registry.register(WILDCARD_COMMAND, Arc::new(WildcardHandler));
        registry
    }
}

impl HandlerRegistry {
    /// Registry with the built-in `abort` and `wildcard` handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry without any handler.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(IndexMap::new())),
            core: CoreCommands::default(),
        }
    }

    /// Replaces the core set whose bare handlers serve qualified forms.
    #[must_use]
    pub fn with_core_commands(mut self, core: CoreCommands) -> Self {
        self.core = core;
        self
    }

    /// Binds a generator to `command`, replacing any previous binding.
    pub fn register(&self, command: impl Into<String>, generator: Arc<dyn ResponseGenerator>) {
        self.inner.write().insert(
            command.into(),
            CommandHandler {
                generator,
                extractor: None,
            },
        );
    }

    /// Binds a generator and an extractor to `command`.
    pub fn register_with_extractor(
        &self,
        command: impl Into<String>,
        generator: Arc<dyn ResponseGenerator>,
        extractor: Arc<dyn ParameterExtractor>,
    ) {
        self.inner.write().insert(
            command.into(),
            CommandHandler {
                generator,
                extractor: Some(extractor),
            },
        );
    }

    /// Handler for `command`; bare core names also match their qualified forms.
    #[must_use]
    pub fn get(&self, command: &str) -> Option<CommandHandler> {
        let inner = self.inner.read();
        if let Some(handler) = inner.get(command) {
            return Some(handler.clone());
        }
        let simple = names::simple_name(command);
        if self.core.contains(simple) {
            inner.get(simple).cloned()
        } else {
            None
        }
    }

    /// True when `command` has a handler.
    #[must_use]
    pub fn contains(&self, command: &str) -> bool {
        self.get(command).is_some()
    }

    /// Registered command names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            workflow: PathBuf::from("/tmp/wf"),
            context: "Order".into(),
            command: "abort".into(),
        }
    }

    #[test]
    fn core_handlers_are_built_in() {
        let registry = HandlerRegistry::new();
        assert_eq!(registry.names(), vec!["abort", "wildcard"]);
        let abort = registry.get("abort").unwrap();
        let response = abort.generator.generate(&ctx(), "stop", None).unwrap();
        assert!(response.success);
        assert_eq!(response.artifacts["aborted_context"], "Order");
    }

    #[test]
    fn closures_register_as_generators() {
        let registry = HandlerRegistry::empty();
        registry.register(
            "Order/cancel",
            Arc::new(
                |_: &ExecutionContext, raw: &str, params: Option<&ParameterObject>| -> Result<CommandResponse> {
                    let id = params
                        .and_then(|p| p.get("order_id"))
                        .and_then(Value::as_str)
                        .unwrap_or("?");
                    Ok(CommandResponse::ok(format!("cancelled {id} ({raw})")))
                },
            ),
        );
        let mut params = ParameterObject::new();
        params.insert("order_id".into(), Value::from("A-1"));
        let handler = registry.get("Order/cancel").unwrap();
        let response = handler
            .generator
            .generate(&ctx(), "cancel A-1", Some(&params))
            .unwrap();
        assert_eq!(response.text, "cancelled A-1 (cancel A-1)");
        assert!(registry.get("Order/track").is_none());
    }

    #[test]
    fn bare_names_only_stand_in_for_core_commands() {
        let registry = HandlerRegistry::new();
        registry.register(
            "track",
            Arc::new(
                |_: &ExecutionContext, _: &str, _: Option<&ParameterObject>| -> Result<CommandResponse> {
                    Ok(CommandResponse::ok("global track"))
                },
            ),
        );
        assert!(registry.contains("track"));
        assert!(registry.get("Order/track").is_none());
        assert!(registry.get("Order/abort").is_some());

        let narrowed = HandlerRegistry::new().with_core_commands(CoreCommands::new([WILDCARD_COMMAND]));
        assert!(narrowed.get("Order/abort").is_none());
        assert!(narrowed.get("Order/wildcard").is_some());
    }

    #[test]
    fn extraction_helpers_set_validity() {
        let invalid = ExtractedParameters::invalid("which order?");
        assert!(!invalid.is_valid);
        assert_eq!(invalid.error.as_deref(), Some("which order?"));
        assert!(ExtractedParameters::valid(ParameterObject::new()).is_valid);
    }
}
