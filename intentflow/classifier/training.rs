//! Per-context training of the dual-model classifier across a workflow.

use std::{fmt, path::PathBuf, sync::Arc};

use chrono::Utc;
use intentflow_routing::{
    telemetry::{self, Telemetry},
    RoutingDefinition,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use uuid::Uuid;

use crate::{
    artifacts::{artifact_dir, ClassifierArtifacts, TrainingSummary},
    dataset::{stratified_split, ContextDataset, LabeledUtterance, UtteranceCorpus},
    error::{ClassifierError, Result},
    features::fnv1a,
    label_encoder::LabelEncoder,
    model::ModelKind,
    thresholds::{
        ambiguous_threshold, search_threshold, DoublingOverage, PipelineThresholds, UsagePenalty,
    },
    trainer::{ModelTrainer, TrainingConfig},
};

/// A context whose artifacts were written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedContext {
    /// Where the artifacts live.
    pub artifact_dir: PathBuf,
    /// Metrics of the run.
    pub summary: TrainingSummary,
}

/// A context that was left untrained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedContext {
    /// Context name.
    pub context: String,
    /// Why training was skipped.
    pub reason: String,
}

/// Outcome of [`WorkflowTrainer::train_workflow`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTrainingReport {
    /// Trained contexts, in context order.
    pub trained: Vec<TrainedContext>,
    /// Contexts skipped for lack of data.
    pub skipped: Vec<SkippedContext>,
}

/// Trains every context of one routing definition.
pub struct WorkflowTrainer {
    definition: Arc<RoutingDefinition>,
    corpus: UtteranceCorpus,
    config: TrainingConfig,
    penalty: Arc<dyn UsagePenalty>,
    telemetry: Option<Telemetry>,
}

impl fmt::Debug for WorkflowTrainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowTrainer")
            .field("root", &self.definition.root())
            .field("config", &self.config)
            .field("penalty", &self.penalty)
            .finish_non_exhaustive()
    }
}

impl WorkflowTrainer {
    /// Trainer using the [`DoublingOverage`] threshold penalty.
    #[must_use]
    pub fn new(
        definition: Arc<RoutingDefinition>,
        corpus: UtteranceCorpus,
        config: TrainingConfig,
    ) -> Self {
        Self {
            definition,
            corpus,
            config,
            penalty: Arc::new(DoublingOverage),
            telemetry: None,
        }
    }

    /// Replaces the threshold score penalty.
    #[must_use]
    pub fn with_penalty(mut self, penalty: Arc<dyn UsagePenalty>) -> Self {
        self.penalty = penalty;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Trains every context; contexts without enough data are skipped with a warning.
    pub fn train_workflow(&self) -> Result<WorkflowTrainingReport> {
        let mut report = WorkflowTrainingReport::default();
        for context in self.definition.contexts().keys() {
            match self.train_context(context) {
                Ok(trained) => report.trained.push(trained),
                Err(err @ (ClassifierError::InsufficientData { .. } | ClassifierError::Shape(_))) => {
                    let reason = err.to_string();
                    telemetry::log(
                        self.telemetry.as_ref(),
                        LogLevel::Warn,
                        "classifier.context_skipped",
                        json!({ "context": context, "reason": reason }),
                    );
                    telemetry::event(
                        self.telemetry.as_ref(),
                        "classifier.context.skipped",
                        json!({ "context": context, "reason": reason }),
                    );
                    report.skipped.push(SkippedContext {
                        context: context.clone(),
                        reason,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    /// Trains one context and writes its artifacts.
    pub fn train_context(&self, context: &str) -> Result<TrainedContext> {
        let dataset = ContextDataset::build(&self.definition, &self.corpus, context)?;
        let labels = dataset.labels();
        if labels.len() < 2 {
            return Err(insufficient(context, format!("{} label(s), need 2", labels.len())));
        }
        if dataset.len() < self.config.min_examples {
            return Err(insufficient(
                context,
                format!(
                    "{} example(s), need {}",
                    dataset.len(),
                    self.config.min_examples
                ),
            ));
        }

        let encoder = LabelEncoder::fit(labels);
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed ^ fnv1a(context.as_bytes()));
        let split = stratified_split(&dataset.examples, self.config.test_ratio, &mut rng);
        if split.validation.is_empty() {
            return Err(insufficient(context, "empty validation split".to_string()));
        }
        let train = encode(&encoder, &split.train)?;
        let validation = encode(&encoder, &split.validation)?;

        let tiny = ModelTrainer::new(ModelKind::Tiny, self.config.tiny.clone()).train(
            &train,
            &validation,
            encoder.len(),
            &mut rng,
        )?;
        let large = ModelTrainer::new(ModelKind::Large, self.config.large.clone()).train(
            &train,
            &validation,
            encoder.len(),
            &mut rng,
        )?;

        let choice = search_threshold(
            &tiny.evaluation,
            &large.evaluation,
            &self.config.thresholds,
            self.penalty.as_ref(),
        )?;
        let thresholds = PipelineThresholds {
            confidence: choice.threshold,
            tiny_ambiguous: ambiguous_threshold(&tiny.evaluation),
            large_ambiguous: ambiguous_threshold(&large.evaluation),
        };

        let run_id = Uuid::new_v4();
        let dir = artifact_dir(self.definition.root(), context);
        ClassifierArtifacts {
            run_id,
            tiny: tiny.model,
            large: large.model,
            encoder: encoder.clone(),
            thresholds,
        }
        .save(&dir)?;
        let summary = TrainingSummary {
            run_id,
            context: context.to_string(),
            trained_at: Utc::now(),
            classes: encoder.classes().map(ToOwned::to_owned).collect(),
            train_examples: train.len(),
            validation_examples: validation.len(),
            threshold: choice,
            tiny_ambiguous: thresholds.tiny_ambiguous,
            large_ambiguous: thresholds.large_ambiguous,
            tiny_history: tiny.history,
            large_history: large.history,
        };
        summary.save(&dir)?;

        let payload = json!({
            "context": context,
            "run_id": run_id,
            "classes": encoder.len(),
            "confidence_threshold": choice.threshold,
            "large_usage": choice.large_usage,
            "weighted_f1": choice.weighted_f1,
        });
        telemetry::log(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "classifier.context_trained",
            payload.clone(),
        );
        telemetry::event(self.telemetry.as_ref(), "classifier.context.trained", payload);

        Ok(TrainedContext {
            artifact_dir: dir,
            summary,
        })
    }
}

fn insufficient(context: &str, reason: String) -> ClassifierError {
    ClassifierError::InsufficientData {
        context: context.to_string(),
        reason,
    }
}

fn encode(encoder: &LabelEncoder, examples: &[LabeledUtterance]) -> Result<Vec<(String, usize)>> {
    examples
        .iter()
        .map(|example| Ok((example.text.clone(), encoder.encode(&example.label)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::DualModelPipeline;
    use shared_event_bus::MemoryEventBus;
    use shared_logging::MemoryLogger;
    use std::{fs, path::Path};

    fn write(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "class ResponseGenerator:\n    pass\n").unwrap();
    }

    fn corpus() -> UtteranceCorpus {
        serde_json::from_value(json!({
            "commands": {
                "Order/cancel": [
                    "cancel my order", "please cancel the order", "cancel it now",
                    "i want to cancel", "cancel this purchase"
                ],
                "Order/track": [
                    "where is my parcel", "track my parcel", "track the shipment",
                    "parcel location", "when does the parcel arrive"
                ]
            },
            "misunderstood": []
        }))
        .unwrap()
    }

    fn config() -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.tiny.epochs = 10;
        config.large.epochs = 5;
        config
    }

    #[test]
    fn trains_order_and_skips_label_starved_global() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "_commands/Order/cancel.py");
        write(tmp.path(), "_commands/Order/track.py");
        let definition = Arc::new(RoutingDefinition::build(tmp.path()).unwrap());

        let logger = Arc::new(MemoryLogger::new());
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = Telemetry::builder("classifier")
            .sink(logger.clone())
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let trainer = WorkflowTrainer::new(definition.clone(), corpus(), config())
            .with_telemetry(telemetry);
        let report = trainer.train_workflow().unwrap();

        assert_eq!(report.trained.len(), 1);
        assert_eq!(report.trained[0].summary.context, "Order");
        assert_eq!(
            report.trained[0].summary.classes,
            vec!["Order/cancel", "Order/track"]
        );
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].context, "*");
        assert!(logger.contains("classifier.context_skipped"));
        assert_eq!(bus.of_type("classifier.context.trained").len(), 1);
        assert_eq!(bus.of_type("classifier.context.skipped").len(), 1);

        let dir = artifact_dir(definition.root(), "Order");
        let artifacts = ClassifierArtifacts::load(&dir).unwrap();
        assert_eq!(artifacts.run_id, report.trained[0].summary.run_id);
        assert!(TrainingSummary::load(&dir).unwrap().is_some());
        assert!(!artifact_dir(definition.root(), "*").exists());
        DualModelPipeline::load(&dir).unwrap();
    }

    #[test]
    fn too_few_examples_is_insufficient() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "_commands/Order/cancel.py");
        write(tmp.path(), "_commands/Order/track.py");
        let definition = Arc::new(RoutingDefinition::build(tmp.path()).unwrap());
        let corpus: UtteranceCorpus = serde_json::from_value(json!({
            "commands": {"Order/cancel": ["cancel"], "Order/track": ["track"]}
        }))
        .unwrap();
        let trainer = WorkflowTrainer::new(definition, corpus, config());
        assert!(matches!(
            trainer.train_context("Order"),
            Err(ClassifierError::InsufficientData { .. })
        ));
    }

    #[derive(Debug)]
    struct NoLargeModel;

    impl UsagePenalty for NoLargeModel {
        fn factor(&self, large_usage: f32, _target: f32) -> f32 {
            if large_usage > 0.0 {
                0.0
            } else {
                1.0
            }
        }
    }

    #[test]
    fn injected_penalty_shapes_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "_commands/Order/cancel.py");
        write(tmp.path(), "_commands/Order/track.py");
        let definition = Arc::new(RoutingDefinition::build(tmp.path()).unwrap());
        let trainer = WorkflowTrainer::new(definition, corpus(), config())
            .with_penalty(Arc::new(NoLargeModel));
        let trained = trainer.train_context("Order").unwrap();
        assert!(trained.summary.threshold.large_usage.abs() < f32::EPSILON);
    }
}
