//! Dispatch: utterance -> prediction -> resolved command -> handler.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    error::{Result, RoutingError},
    handlers::{CommandResponse, ExecutionContext, HandlerRegistry},
    names::{self, WILDCARD_COMMAND},
    routing::{ModuleType, RoutingDefinition},
    telemetry::{self, Telemetry},
};

/// Output of an intent predictor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prediction {
    /// Confident top-1 label.
    Single(String),
    /// Uncertain match; top-k labels, best first.
    Candidates(Vec<String>),
}

impl Prediction {
    /// Top-1 label in either case.
    #[must_use]
    pub fn best(&self) -> Option<&str> {
        match self {
            Self::Single(label) => Some(label),
            Self::Candidates(labels) => labels.first().map(String::as_str),
        }
    }
}

/// Maps utterances to command labels within a context.
pub trait IntentPredictor: Send + Sync {
    /// Predicts the command for `utterance` in `context`.
    fn predict(&self, context: &str, utterance: &str) -> Result<Prediction>;
}

/// Result of [`CommandExecutor::dispatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// A command ran.
    Executed {
        /// Qualified command name.
        command: String,
        /// Handler response.
        response: CommandResponse,
    },
    /// The match was ambiguous; the caller should offer these commands (never empty).
    Clarify {
        /// Visible simple names, best first.
        candidates: Vec<String>,
    },
}

/// Runs commands of one workflow.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    definition: Arc<RoutingDefinition>,
    handlers: HandlerRegistry,
    telemetry: Option<Telemetry>,
}

impl CommandExecutor {
    /// Executor over `definition` using `handlers`.
    #[must_use]
    pub const fn new(definition: Arc<RoutingDefinition>, handlers: HandlerRegistry) -> Self {
        Self {
            definition,
            handlers,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Routing definition in use.
    #[must_use]
    pub fn definition(&self) -> &RoutingDefinition {
        &self.definition
    }

    /// Predicts, then executes a confident match or asks for clarification.
    pub fn dispatch(
        &self,
        context: &str,
        utterance: &str,
        predictor: &dyn IntentPredictor,
    ) -> Result<DispatchOutcome> {
        match predictor.predict(context, utterance)? {
            Prediction::Single(label) => {
                let command = self.definition.resolve_command(context, &label)?;
                let response = self.execute(context, &command, utterance)?;
                Ok(DispatchOutcome::Executed { command, response })
            }
            Prediction::Candidates(labels) => {
                let mut candidates: Vec<String> = Vec::with_capacity(labels.len());
                for label in &labels {
                    let simple = names::simple_name(label);
                    if simple != WILDCARD_COMMAND && !candidates.iter().any(|c| c == simple) {
                        candidates.push(simple.to_string());
                    }
                }
                if candidates.is_empty() {
                    let command = self.definition.resolve_command(context, WILDCARD_COMMAND)?;
                    let response = self.execute(context, &command, utterance)?;
                    return Ok(DispatchOutcome::Executed { command, response });
                }
                telemetry::log(
                    self.telemetry.as_ref(),
                    LogLevel::Info,
                    "dispatch.clarify",
                    json!({ "context": context, "candidates": candidates }),
                );
                Ok(DispatchOutcome::Clarify { candidates })
            }
        }
    }

    /// Executes `command` (simple or qualified) in `context` with `raw` text.
    pub fn execute(&self, context: &str, command: &str, raw: &str) -> Result<CommandResponse> {
        let qualified = self.definition.resolve_command(context, command)?;
        let handler = self
            .handlers
            .get(&qualified)
            .ok_or_else(|| RoutingError::MissingHandler(qualified.clone()))?;
        let exec_ctx = ExecutionContext {
            workflow: self.definition.root().to_path_buf(),
            context: context.to_string(),
            command: qualified.clone(),
        };

        let declares_parameters = self
            .definition
            .get_command_class(&qualified, ModuleType::ParameterInput)
            .is_some();
        let response = match (&handler.extractor, declares_parameters) {
            (Some(extractor), _) => {
                let extracted = extractor.extract(raw)?;
                if extracted.is_valid {
                    handler
                        .generator
                        .generate(&exec_ctx, raw, Some(&extracted.parameters))?
                } else {
                    CommandResponse::failure(
                        extracted
                            .error
                            .unwrap_or_else(|| "could not extract parameters".to_string()),
                    )
                }
            }
            (None, true) => {
                return Err(RoutingError::Handler {
                    command: qualified,
                    reason: "module declares parameters but no extractor is registered".into(),
                })
            }
            (None, false) => handler.generator.generate(&exec_ctx, raw, None)?,
        };

        telemetry::event(
            self.telemetry.as_ref(),
            "dispatch.completed",
            json!({ "context": context, "command": qualified, "success": response.success }),
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fixtures::{write, GENERATOR, WITH_SIGNATURE};
    use crate::handlers::{ExtractedParameters, ParameterExtractor, ParameterObject};
    use serde_json::Value;
    use shared_event_bus::MemoryEventBus;
    use tempfile::{tempdir, TempDir};

    struct Fixed(Prediction);

    impl IntentPredictor for Fixed {
        fn predict(&self, _context: &str, _utterance: &str) -> Result<Prediction> {
            Ok(self.0.clone())
        }
    }

    struct OrderId;

    impl ParameterExtractor for OrderId {
        fn extract(&self, raw: &str) -> Result<ExtractedParameters> {
            Ok(raw.split_whitespace().find(|w| w.starts_with("A-")).map_or_else(
                || ExtractedParameters::invalid("Which order?"),
                |id| {
                    let mut params = ParameterObject::new();
                    params.insert("order_id".into(), Value::from(id));
                    ExtractedParameters::valid(params)
                },
            ))
        }
    }

    fn workflow() -> (TempDir, Arc<RoutingDefinition>) {
        let tmp = tempdir().unwrap();
        write(tmp.path(), "_commands/Order/cancel.py", WITH_SIGNATURE);
        write(tmp.path(), "_commands/Order/track.py", GENERATOR);
        let definition = Arc::new(RoutingDefinition::build(tmp.path()).unwrap());
        (tmp, definition)
    }

    fn handlers() -> HandlerRegistry {
        let handlers = HandlerRegistry::new();
        handlers.register_with_extractor(
            "Order/cancel",
            Arc::new(
                |_: &ExecutionContext, _: &str, params: Option<&ParameterObject>| -> Result<CommandResponse> {
                    let id = params.and_then(|p| p["order_id"].as_str()).unwrap_or_default();
                    Ok(CommandResponse::ok(format!("Order {id} cancelled")))
                },
            ),
            Arc::new(OrderId),
        );
        handlers
    }

    #[test]
    fn single_prediction_executes_with_parameters() {
        let (_tmp, definition) = workflow();
        let bus = Arc::new(MemoryEventBus::new(4));
        let telemetry = Telemetry::builder("dispatch")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let executor = CommandExecutor::new(definition, handlers()).with_telemetry(telemetry);

        let outcome = executor
            .dispatch("Order", "please cancel A-7", &Fixed(Prediction::Single("cancel".into())))
            .unwrap();
        match outcome {
            DispatchOutcome::Executed { command, response } => {
                assert_eq!(command, "Order/cancel");
                assert_eq!(response.text, "Order A-7 cancelled");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(bus.of_type("dispatch.completed").len(), 1);
    }

    #[test]
    fn invalid_extraction_fails_softly() {
        let (_tmp, definition) = workflow();
        let executor = CommandExecutor::new(definition, handlers());
        let response = executor.execute("Order", "cancel", "cancel it").unwrap();
        assert!(!response.success);
        assert_eq!(response.text, "Which order?");
    }

    #[test]
    fn candidates_ask_for_clarification() {
        let (_tmp, definition) = workflow();
        let executor = CommandExecutor::new(definition, handlers());
        let predictor = Fixed(Prediction::Candidates(vec![
            "Order/track".into(),
            "wildcard".into(),
            "Order/cancel".into(),
        ]));
        assert_eq!(
            executor.dispatch("Order", "hmm", &predictor).unwrap(),
            DispatchOutcome::Clarify {
                candidates: vec!["track".into(), "cancel".into()]
            }
        );
    }

    #[test]
    fn wildcard_only_candidates_run_the_wildcard_handler() {
        let (_tmp, definition) = workflow();
        let executor = CommandExecutor::new(definition, handlers());
        let predictor = Fixed(Prediction::Candidates(vec!["wildcard".into()]));
        match executor.dispatch("Order", "sing a song", &predictor).unwrap() {
            DispatchOutcome::Executed { command, response } => {
                assert_eq!(command, "wildcard");
                assert!(!response.success);
                assert_eq!(response.artifacts["unrecognized"], "sing a song");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bare_handler_does_not_serve_context_command() {
        let (_tmp, definition) = workflow();
        let handlers = HandlerRegistry::new();
        handlers.register(
            "track",
            Arc::new(
                |_: &ExecutionContext, _: &str, _: Option<&ParameterObject>| -> Result<CommandResponse> {
                    Ok(CommandResponse::ok("global track"))
                },
            ),
        );
        let executor = CommandExecutor::new(definition, handlers);
        assert!(matches!(
            executor.execute("Order", "track", "where"),
            Err(RoutingError::MissingHandler(ref c)) if c == "Order/track"
        ));
        assert!(executor.execute("Order", "abort", "stop").unwrap().success);
    }

    #[test]
    fn missing_handler_and_missing_extractor_are_errors() {
        let (_tmp, definition) = workflow();
        let executor = CommandExecutor::new(definition, HandlerRegistry::new());
        assert!(matches!(
            executor.execute("Order", "track", "where is it"),
            Err(RoutingError::MissingHandler(ref c)) if c == "Order/track"
        ));

        let bare = HandlerRegistry::new();
        bare.register(
            "Order/cancel",
            Arc::new(
                |_: &ExecutionContext, _: &str, _: Option<&ParameterObject>| -> Result<CommandResponse> {
                    Ok(CommandResponse::ok("done"))
                },
            ),
        );
        let (_tmp2, definition) = workflow();
        let executor = CommandExecutor::new(definition, bare);
        assert!(matches!(
            executor.execute("Order", "cancel", "cancel A-1"),
            Err(RoutingError::Handler { .. })
        ));
    }

    #[test]
    fn core_commands_dispatch_everywhere() {
        let (_tmp, definition) = workflow();
        let executor = CommandExecutor::new(definition, HandlerRegistry::new());
        let aborted = executor.execute("Order", "abort", "stop").unwrap();
        assert!(aborted.success);
        let unknown = executor.execute("*", "wildcard", "sing a song").unwrap();
        assert!(!unknown.success);
    }
}
