#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Intentflow classifier: per-context tiny/large text models with learned confidence routing.

/// Artifact layout and persistence.
#[path = "../artifacts.rs"]
pub mod artifacts;

/// Training corpus and per-context datasets.
#[path = "../dataset.rs"]
pub mod dataset;

/// Classifier error types.
#[path = "../error.rs"]
pub mod error;

/// Hashed n-gram features.
#[path = "../features.rs"]
pub mod features;

/// Label <-> id mapping.
#[path = "../label_encoder.rs"]
pub mod label_encoder;

/// Ranking and classification metrics.
#[path = "../metrics.rs"]
pub mod metrics;

/// Text classifiers over hashed features.
#[path = "../model.rs"]
pub mod model;

/// Dual-model inference.
#[path = "../pipeline.rs"]
pub mod pipeline;

/// Pipeline cache and intent predictor.
#[path = "../router.rs"]
pub mod router;

/// Threshold search and confidence analysis.
#[path = "../thresholds.rs"]
pub mod thresholds;

/// Single-model SGD training.
#[path = "../trainer.rs"]
pub mod trainer;

/// Workflow-wide training.
#[path = "../training.rs"]
pub mod training;

pub use artifacts::{artifact_dir, ClassifierArtifacts, TrainingSummary};
pub use dataset::{ContextDataset, LabeledUtterance, UtteranceCorpus};
pub use error::{ClassifierError, Result};
pub use features::{FeatureConfig, FeatureHasher};
pub use label_encoder::LabelEncoder;
pub use model::{HashedModel, ModelKind, Network, TextClassifier};
pub use pipeline::{DualModelPipeline, PipelinePrediction};
pub use router::{ConfidenceRouter, RouterCache};
pub use thresholds::{
    ConfidenceAnalysis, DoublingOverage, PipelineThresholds, ThresholdChoice,
    ThresholdSearchConfig, UsagePenalty,
};
pub use trainer::{EpochReport, Evaluation, ModelTrainer, ModelTrainingConfig, TrainingConfig};
pub use training::{SkippedContext, TrainedContext, WorkflowTrainer, WorkflowTrainingReport};
