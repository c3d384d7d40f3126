use std::{path::PathBuf, sync::Arc};

use intentflow_routing::{
    telemetry::{self, Telemetry},
    Generation, IntentPredictor, Prediction, Registry, RoutingDefinition, RoutingError,
};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    artifacts::artifact_dir,
    error::{ClassifierError, Result},
    pipeline::{DualModelPipeline, PipelinePrediction},
};

/// Loaded pipelines keyed by artifact directory.
#[derive(Debug, Default)]
pub struct RouterCache {
    pipelines: Registry<PathBuf, Arc<DualModelPipeline>>,
}

impl RouterCache {
    /// Cache following `generation`; pass the routing registry's token to clear both at once.
    #[must_use]
    pub fn new(generation: Generation) -> Self {
        Self {
            pipelines: Registry::new(generation),
        }
    }

    /// Token this cache follows.
    #[must_use]
    pub const fn generation(&self) -> &Generation {
        self.pipelines.generation()
    }

    /// Cached pipeline of `dir`, loading it on first use.
    pub fn get_or_load(&self, dir: PathBuf) -> Result<Arc<DualModelPipeline>> {
        let path = dir.clone();
        self.pipelines
            .get_or_build(dir, || DualModelPipeline::load(&path).map(Arc::new))
    }

    /// Drops every cached pipeline.
    pub fn clear(&self) {
        self.pipelines.generation().bump();
    }

    /// Number of live pipelines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

/// Per-context confidence routing for one workflow.
#[derive(Debug, Clone)]
pub struct ConfidenceRouter {
    definition: Arc<RoutingDefinition>,
    cache: Arc<RouterCache>,
    telemetry: Option<Telemetry>,
}

impl ConfidenceRouter {
    /// Router over `definition`'s artifact directories.
    #[must_use]
    pub const fn new(definition: Arc<RoutingDefinition>, cache: Arc<RouterCache>) -> Self {
        Self {
            definition,
            cache,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Artifact directory of `context`.
    pub fn artifact_dir(&self, context: &str) -> Result<PathBuf> {
        self.definition.commands(context)?;
        Ok(artifact_dir(self.definition.root(), context))
    }

    /// Pipeline of `context`; fails when the context was never trained.
    pub fn pipeline(&self, context: &str) -> Result<Arc<DualModelPipeline>> {
        self.cache.get_or_load(self.artifact_dir(context)?)
    }

    /// Predicts within `context`, reporting which model answered.
    pub fn classify(&self, context: &str, utterance: &str) -> Result<PipelinePrediction> {
        let outcome = self.pipeline(context)?.classify(utterance)?;
        telemetry::log(
            self.telemetry.as_ref(),
            LogLevel::Debug,
            "classifier.predicted",
            json!({
                "context": context,
                "model": outcome.model,
                "confidence": outcome.confidence,
                "prediction": outcome.prediction,
            }),
        );
        Ok(outcome)
    }
}

impl IntentPredictor for ConfidenceRouter {
    fn predict(
        &self,
        context: &str,
        utterance: &str,
    ) -> intentflow_routing::Result<Prediction> {
        self.classify(context, utterance)
            .map(|outcome| outcome.prediction)
            .map_err(|err| match err {
                ClassifierError::Routing(err) => err,
                other => RoutingError::Prediction(other.to_string()),
            })
    }
}
