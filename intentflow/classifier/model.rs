use ndarray::{Array1, Array2};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ClassifierError, Result},
    features::{FeatureConfig, FeatureHasher, SparseVector},
    metrics::softmax,
};

const LOG_EPSILON: f32 = 1e-9;

/// Scores an utterance against a fixed label set.
pub trait TextClassifier: Send + Sync {
    /// Softmax probabilities, one per class id.
    fn predict_proba(&self, text: &str) -> Array1<f32>;
    /// Number of classes.
    fn num_classes(&self) -> usize;
}

/// Which half of the dual pipeline a model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Fast primary model.
    Tiny,
    /// Slower escalation model.
    Large,
}

impl ModelKind {
    /// Weight directory name inside an artifact directory.
    #[must_use]
    pub const fn directory(self) -> &'static str {
        match self {
            Self::Tiny => "tinymodel.pth",
            Self::Large => "largemodel.pth",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tiny => f.write_str("tiny"),
            Self::Large => f.write_str("large"),
        }
    }
}

/// Network weights over hashed features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Network {
    /// Softmax regression.
    Linear {
        /// `(features, classes)`.
        weights: Array2<f32>,
        /// `(classes)`.
        bias: Array1<f32>,
    },
    /// One ReLU hidden layer followed by softmax.
    Mlp {
        /// `(features, hidden)`.
        hidden_weights: Array2<f32>,
        /// `(hidden)`.
        hidden_bias: Array1<f32>,
        /// `(hidden, classes)`.
        output_weights: Array2<f32>,
        /// `(classes)`.
        output_bias: Array1<f32>,
    },
}

impl Network {
    /// Zero-initialised softmax regression.
    #[must_use]
    pub fn linear(inputs: usize, classes: usize) -> Self {
        Self::Linear {
            weights: Array2::zeros((inputs, classes)),
            bias: Array1::zeros(classes),
        }
    }

    /// MLP with uniform Glorot initialisation drawn from `rng`.
    #[must_use]
    pub fn mlp(inputs: usize, hidden: usize, classes: usize, rng: &mut ChaCha8Rng) -> Self {
        let mut glorot = |fan_in: usize, fan_out: usize| {
            #[allow(clippy::cast_precision_loss)]
            let fan = (fan_in + fan_out).max(1) as f32;
            let limit = (6.0 / fan).sqrt();
            Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-limit..limit))
        };
        let hidden_weights = glorot(inputs, hidden);
        let output_weights = glorot(hidden, classes);
        Self::Mlp {
            hidden_weights,
            hidden_bias: Array1::zeros(hidden),
            output_weights,
            output_bias: Array1::zeros(classes),
        }
    }

    /// Zero tensor of the same shape, used to accumulate gradients.
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        match self {
            Self::Linear { weights, bias } => Self::Linear {
                weights: Array2::zeros(weights.raw_dim()),
                bias: Array1::zeros(bias.raw_dim()),
            },
            Self::Mlp {
                hidden_weights,
                hidden_bias,
                output_weights,
                output_bias,
            } => Self::Mlp {
                hidden_weights: Array2::zeros(hidden_weights.raw_dim()),
                hidden_bias: Array1::zeros(hidden_bias.raw_dim()),
                output_weights: Array2::zeros(output_weights.raw_dim()),
                output_bias: Array1::zeros(output_bias.raw_dim()),
            },
        }
    }

    /// Input dimension.
    #[must_use]
    pub fn inputs(&self) -> usize {
        match self {
            Self::Linear { weights, .. } => weights.nrows(),
            Self::Mlp { hidden_weights, .. } => hidden_weights.nrows(),
        }
    }

    /// Number of classes.
    #[must_use]
    pub fn classes(&self) -> usize {
        match self {
            Self::Linear { bias, .. } => bias.len(),
            Self::Mlp { output_bias, .. } => output_bias.len(),
        }
    }

    /// Class probabilities of `input`.
    #[must_use]
    pub fn forward(&self, input: &SparseVector) -> Array1<f32> {
        match self {
            Self::Linear { weights, bias } => softmax(linear_logits(weights, bias, input).view()),
            Self::Mlp {
                hidden_weights,
                hidden_bias,
                output_weights,
                output_bias,
            } => {
                let hidden =
                    linear_logits(hidden_weights, hidden_bias, input).mapv(|v| v.max(0.0));
                softmax((hidden.dot(output_weights) + output_bias).view())
            }
        }
    }

    /// Adds the cross-entropy gradient of one example to `grads`; returns its loss.
    pub fn accumulate(&self, input: &SparseVector, target: usize, grads: &mut Self) -> f32 {
        match (self, grads) {
            (Self::Linear { weights, bias }, Self::Linear { weights: gw, bias: gb }) => {
                let mut delta = softmax(linear_logits(weights, bias, input).view());
                let loss = -(delta[target] + LOG_EPSILON).ln();
                delta[target] -= 1.0;
                for (row, value) in input.entries() {
                    gw.row_mut(*row).scaled_add(*value, &delta);
                }
                *gb += &delta;
                loss
            }
            (
                Self::Mlp {
                    hidden_weights,
                    hidden_bias,
                    output_weights,
                    output_bias,
                },
                Self::Mlp {
                    hidden_weights: ghw,
                    hidden_bias: ghb,
                    output_weights: gow,
                    output_bias: gob,
                },
            ) => {
                let pre = linear_logits(hidden_weights, hidden_bias, input);
                let hidden = pre.mapv(|v| v.max(0.0));
                let mut delta = softmax((hidden.dot(output_weights) + output_bias).view());
                let loss = -(delta[target] + LOG_EPSILON).ln();
                delta[target] -= 1.0;

                for (j, activation) in hidden.iter().enumerate() {
                    if *activation > 0.0 {
                        gow.row_mut(j).scaled_add(*activation, &delta);
                    }
                }
                *gob += &delta;

                let mut back = output_weights.dot(&delta);
                back.zip_mut_with(&pre, |grad, pre| {
                    if *pre <= 0.0 {
                        *grad = 0.0;
                    }
                });
                for (row, value) in input.entries() {
                    ghw.row_mut(*row).scaled_add(*value, &back);
                }
                *ghb += &back;
                loss
            }
            _ => 0.0,
        }
    }

    /// `self -= scale * grads`.
    pub fn apply(&mut self, grads: &Self, scale: f32) {
        match (self, grads) {
            (Self::Linear { weights, bias }, Self::Linear { weights: gw, bias: gb }) => {
                weights.scaled_add(-scale, gw);
                bias.scaled_add(-scale, gb);
            }
            (
                Self::Mlp {
                    hidden_weights,
                    hidden_bias,
                    output_weights,
                    output_bias,
                },
                Self::Mlp {
                    hidden_weights: ghw,
                    hidden_bias: ghb,
                    output_weights: gow,
                    output_bias: gob,
                },
            ) => {
                hidden_weights.scaled_add(-scale, ghw);
                hidden_bias.scaled_add(-scale, ghb);
                output_weights.scaled_add(-scale, gow);
                output_bias.scaled_add(-scale, gob);
            }
            _ => {}
        }
    }

    /// Resets every weight to zero.
    pub fn clear(&mut self) {
        match self {
            Self::Linear { weights, bias } => {
                weights.fill(0.0);
                bias.fill(0.0);
            }
            Self::Mlp {
                hidden_weights,
                hidden_bias,
                output_weights,
                output_bias,
            } => {
                hidden_weights.fill(0.0);
                hidden_bias.fill(0.0);
                output_weights.fill(0.0);
                output_bias.fill(0.0);
            }
        }
    }
}

fn linear_logits(weights: &Array2<f32>, bias: &Array1<f32>, input: &SparseVector) -> Array1<f32> {
    let mut out = bias.clone();
    for (row, value) in input.entries() {
        out.scaled_add(*value, &weights.row(*row));
    }
    out
}

/// Hashed-feature classifier: a feature layout plus a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashedModel {
    kind: ModelKind,
    features: FeatureConfig,
    network: Network,
}

impl HashedModel {
    /// Pairs `network` with `features`, checking the input dimension.
    pub fn new(kind: ModelKind, features: FeatureConfig, network: Network) -> Result<Self> {
        if network.inputs() != features.dimension {
            return Err(ClassifierError::Shape(format!(
                "{kind} network expects {} inputs, features produce {}",
                network.inputs(),
                features.dimension
            )));
        }
        Ok(Self {
            kind,
            features,
            network,
        })
    }

    /// Role of the model.
    #[must_use]
    pub const fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Feature layout.
    #[must_use]
    pub const fn features(&self) -> &FeatureConfig {
        &self.features
    }

    /// Weights.
    #[must_use]
    pub const fn network(&self) -> &Network {
        &self.network
    }

    /// Hasher matching the feature layout.
    #[must_use]
    pub fn hasher(&self) -> FeatureHasher {
        FeatureHasher::new(self.features.clone())
    }
}

impl TextClassifier for HashedModel {
    fn predict_proba(&self, text: &str) -> Array1<f32> {
        self.network.forward(&self.hasher().transform(text))
    }

    fn num_classes(&self) -> usize {
        self.network.classes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sample(hasher: &FeatureHasher) -> Vec<(SparseVector, usize)> {
        vec![
            (hasher.transform("cancel my order"), 0),
            (hasher.transform("track the parcel"), 1),
        ]
    }

    fn fit(network: &mut Network, data: &[(SparseVector, usize)], steps: usize, lr: f32) {
        let mut grads = network.zeros_like();
        for _ in 0..steps {
            grads.clear();
            for (x, y) in data {
                network.accumulate(x, *y, &mut grads);
            }
            #[allow(clippy::cast_precision_loss)]
            let scale = lr / data.len() as f32;
            network.apply(&grads, scale);
        }
    }

    #[test]
    fn linear_network_learns_separable_data() {
        let hasher = FeatureHasher::new(FeatureConfig::words(64));
        let data = sample(&hasher);
        let mut network = Network::linear(64, 2);
        fit(&mut network, &data, 50, 1.0);
        assert!(network.forward(&data[0].0)[0] > 0.8);
        assert!(network.forward(&data[1].0)[1] > 0.8);
    }

    #[test]
    fn mlp_loss_decreases() {
        let hasher = FeatureHasher::new(FeatureConfig::words_and_chars(128, 3, 3));
        let data = sample(&hasher);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut network = Network::mlp(128, 16, 2, &mut rng);
        let loss = |net: &Network| -> f32 {
            let mut scratch = net.zeros_like();
            data.iter().map(|(x, y)| net.accumulate(x, *y, &mut scratch)).sum()
        };
        let before = loss(&network);
        fit(&mut network, &data, 100, 0.5);
        assert!(loss(&network) < before);
    }

    #[test]
    fn model_rejects_mismatched_dimensions() {
        let err = HashedModel::new(ModelKind::Tiny, FeatureConfig::words(32), Network::linear(16, 2));
        assert!(matches!(err, Err(ClassifierError::Shape(_))));
        let model =
            HashedModel::new(ModelKind::Tiny, FeatureConfig::words(16), Network::linear(16, 3))
                .unwrap();
        let probs = model.predict_proba("anything at all");
        assert_eq!(probs.len(), 3);
        assert!((probs.sum() - 1.0).abs() < 1e-5);
    }
}
