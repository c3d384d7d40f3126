use std::{fs, path::Path};

use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ClassifierError, Result},
    features::{FeatureConfig, FeatureHasher, SparseVector},
    metrics::{argmax, default_k, ndcg_at_k, top_k, weighted_f1},
    model::{HashedModel, ModelKind, Network, TextClassifier},
    thresholds::ThresholdSearchConfig,
};

/// Hyperparameters of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTrainingConfig {
    /// Passes over the training split.
    pub epochs: usize,
    /// SGD step size.
    pub learning_rate: f32,
    /// Examples per gradient step.
    pub batch_size: usize,
    /// Hashed feature layout.
    pub features: FeatureConfig,
    /// Hidden width; `None` trains softmax regression.
    #[serde(default)]
    pub hidden: Option<usize>,
}

impl ModelTrainingConfig {
    /// Defaults for the primary model.
    #[must_use]
    pub const fn tiny() -> Self {
        Self {
            epochs: 40,
            learning_rate: 0.5,
            batch_size: 8,
            features: FeatureConfig::words(2048),
            hidden: None,
        }
    }

    /// Defaults for the escalation model: fewer epochs, wider features, one hidden layer.
    #[must_use]
    pub const fn large() -> Self {
        Self {
            epochs: 20,
            learning_rate: 0.1,
            batch_size: 8,
            features: FeatureConfig::words_and_chars(4096, 3, 5),
            hidden: Some(64),
        }
    }
}

/// Training configuration for every context of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Primary model.
    pub tiny: ModelTrainingConfig,
    /// Escalation model.
    pub large: ModelTrainingConfig,
    /// Share of each label held out for validation.
    pub test_ratio: f32,
    /// Base seed; each context derives its own stream from it.
    pub seed: u64,
    /// Contexts with fewer examples are skipped.
    pub min_examples: usize,
    /// Primary threshold search.
    pub thresholds: ThresholdSearchConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            tiny: ModelTrainingConfig::tiny(),
            large: ModelTrainingConfig::large(),
            test_ratio: 0.2,
            seed: 13,
            min_examples: 4,
            thresholds: ThresholdSearchConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Reads a JSON config; absent keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| ClassifierError::io(path, err))?;
        serde_json::from_str(&raw).map_err(|err| ClassifierError::json(path, err))
    }
}

/// Per-epoch training metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// 1-based epoch.
    pub epoch: usize,
    /// Mean training cross-entropy.
    pub loss: f32,
    /// Validation NDCG@k.
    pub ndcg: f32,
    /// Validation weighted F1.
    pub weighted_f1: f32,
}

/// Validation predictions of one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Top-1 class ids.
    pub predictions: Vec<usize>,
    /// True class ids.
    pub truth: Vec<usize>,
    /// Top-1 probabilities.
    pub confidences: Vec<f32>,
    /// Top-k class ids, best first.
    pub rankings: Vec<Vec<usize>>,
}

impl Evaluation {
    /// Scores `model` on `examples`.
    pub fn of(model: &dyn TextClassifier, examples: &[(String, usize)]) -> Self {
        let k = default_k(model.num_classes());
        let mut evaluation = Self::default();
        for (text, label) in examples {
            let probabilities = model.predict_proba(text);
            let (best, confidence) = argmax(probabilities.view());
            evaluation.predictions.push(best);
            evaluation.confidences.push(confidence);
            evaluation.rankings.push(top_k(probabilities.view(), k));
            evaluation.truth.push(*label);
        }
        evaluation
    }

    /// NDCG@k over the stored rankings.
    #[must_use]
    pub fn ndcg(&self) -> f32 {
        let k = self.rankings.first().map_or(0, Vec::len);
        ndcg_at_k(&self.rankings, &self.truth, k)
    }

    /// Weighted F1 of the top-1 predictions.
    #[must_use]
    pub fn weighted_f1(&self) -> f32 {
        weighted_f1(&self.predictions, &self.truth)
    }
}

/// A trained model with its history and the validation run of its best epoch.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    /// Weights of the best epoch.
    pub model: HashedModel,
    /// Every epoch, in order.
    pub history: Vec<EpochReport>,
    /// Epoch the weights come from.
    pub best_epoch: usize,
    /// Validation predictions of the kept weights.
    pub evaluation: Evaluation,
}

/// Mini-batch SGD trainer for one [`HashedModel`].
#[derive(Debug, Clone)]
pub struct ModelTrainer {
    kind: ModelKind,
    config: ModelTrainingConfig,
}

impl ModelTrainer {
    /// Trainer for `kind` with `config`.
    #[must_use]
    pub const fn new(kind: ModelKind, config: ModelTrainingConfig) -> Self {
        Self { kind, config }
    }

    /// Trains on `train`, keeping the epoch with the best validation weighted F1.
    pub fn train(
        &self,
        train: &[(String, usize)],
        validation: &[(String, usize)],
        classes: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<TrainedModel> {
        if train.is_empty() || classes == 0 {
            return Err(ClassifierError::Shape(format!(
                "{} model needs training data and classes",
                self.kind
            )));
        }
        let hasher = FeatureHasher::new(self.config.features.clone());
        let inputs: Vec<(SparseVector, usize)> = train
            .iter()
            .map(|(text, label)| (hasher.transform(text), *label))
            .collect();
        if let Some((_, label)) = inputs.iter().find(|(_, label)| *label >= classes) {
            return Err(ClassifierError::Shape(format!(
                "label id {label} out of range for {classes} classes"
            )));
        }

        let dimension = self.config.features.dimension;
        let mut network = match self.config.hidden {
            Some(hidden) => Network::mlp(dimension, hidden, classes, rng),
            None => Network::linear(dimension, classes),
        };
        let mut grads = network.zeros_like();
        let mut order: Vec<usize> = (0..inputs.len()).collect();
        let batch_size = self.config.batch_size.max(1);

        let mut history = Vec::with_capacity(self.config.epochs);
        let mut best: Option<(f32, usize, HashedModel, Evaluation)> = None;
        for epoch in 1..=self.config.epochs.max(1) {
            order.shuffle(rng);
            let mut total_loss = 0.0;
            for batch in order.chunks(batch_size) {
                grads.clear();
                for idx in batch {
                    let (input, label) = &inputs[*idx];
                    total_loss += network.accumulate(input, *label, &mut grads);
                }
                #[allow(clippy::cast_precision_loss)]
                let scale = self.config.learning_rate / batch.len() as f32;
                network.apply(&grads, scale);
            }

            let snapshot = HashedModel::new(self.kind, self.config.features.clone(), network.clone())?;
            let evaluation = Evaluation::of(&snapshot, validation);
            #[allow(clippy::cast_precision_loss)]
            let report = EpochReport {
                epoch,
                loss: total_loss / inputs.len() as f32,
                ndcg: evaluation.ndcg(),
                weighted_f1: evaluation.weighted_f1(),
            };
            history.push(report);
            if best
                .as_ref()
                .map_or(true, |(score, ..)| report.weighted_f1 > *score)
            {
                best = Some((report.weighted_f1, epoch, snapshot, evaluation));
            }
        }

        let (_, best_epoch, model, evaluation) = best.ok_or_else(|| {
            ClassifierError::Shape(format!("{} model produced no epochs", self.kind))
        })?;
        Ok(TrainedModel {
            model,
            history,
            best_epoch,
            evaluation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn data() -> (Vec<(String, usize)>, Vec<(String, usize)>) {
        let train = [
            ("cancel my order", 0),
            ("please cancel it", 0),
            ("cancel the purchase", 0),
            ("where is my parcel", 1),
            ("track my parcel", 1),
            ("parcel location", 1),
        ];
        let validation = [("cancel order now", 0), ("track the parcel", 1)];
        let own = |items: &[(&str, usize)]| {
            items
                .iter()
                .map(|(text, label)| ((*text).to_string(), *label))
                .collect::<Vec<_>>()
        };
        (own(&train), own(&validation))
    }

    #[test]
    fn tiny_model_separates_two_intents() {
        let (train, validation) = data();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let trained = ModelTrainer::new(ModelKind::Tiny, ModelTrainingConfig::tiny())
            .train(&train, &validation, 2, &mut rng)
            .unwrap();
        assert_eq!(trained.history.len(), 40);
        assert!((trained.evaluation.weighted_f1() - 1.0).abs() < 1e-6);
        assert!(trained.history.last().unwrap().loss < trained.history[0].loss);
        assert_eq!(trained.model.num_classes(), 2);
    }

    #[test]
    fn large_model_keeps_best_epoch() {
        let (train, validation) = data();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let config = ModelTrainingConfig {
            epochs: 30,
            learning_rate: 0.5,
            ..ModelTrainingConfig::large()
        };
        let trained = ModelTrainer::new(ModelKind::Large, config)
            .train(&train, &validation, 2, &mut rng)
            .unwrap();
        let best = trained.history[trained.best_epoch - 1];
        assert!(trained
            .history
            .iter()
            .all(|report| report.weighted_f1 <= best.weighted_f1));
        assert!((trained.evaluation.weighted_f1() - best.weighted_f1).abs() < 1e-6);
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let (train, validation) = data();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let err = ModelTrainer::new(ModelKind::Tiny, ModelTrainingConfig::tiny())
            .train(&train, &validation, 1, &mut rng);
        assert!(matches!(err, Err(ClassifierError::Shape(_))));
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("training.json");
        fs::write(&path, r#"{"seed": 99, "thresholds": {"target_large_usage": 0.5}}"#).unwrap();
        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.seed, 99);
        assert_eq!(config.tiny, ModelTrainingConfig::tiny());
        assert!((config.thresholds.target_large_usage - 0.5).abs() < f32::EPSILON);
        assert!((config.thresholds.floor - 0.5).abs() < f32::EPSILON);
    }
}
