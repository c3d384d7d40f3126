use std::{fmt, path::Path, sync::Arc};

use intentflow_routing::Prediction;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::{
    artifacts::ClassifierArtifacts,
    error::{ClassifierError, Result},
    label_encoder::LabelEncoder,
    metrics::{argmax, default_k, top_k},
    model::{ModelKind, TextClassifier},
    thresholds::PipelineThresholds,
};

/// Prediction plus the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePrediction {
    /// Single label or top-k candidates.
    pub prediction: Prediction,
    /// Model whose output was accepted.
    pub model: ModelKind,
    /// Top-1 probability of that model.
    pub confidence: f32,
}

/// Tiny model first, large model below the primary threshold.
pub struct DualModelPipeline {
    tiny: Arc<dyn TextClassifier>,
    large: Arc<dyn TextClassifier>,
    encoder: LabelEncoder,
    thresholds: PipelineThresholds,
}

impl fmt::Debug for DualModelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualModelPipeline")
            .field("classes", &self.encoder.len())
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl DualModelPipeline {
    /// Assembles a pipeline; both models must score every encoder class.
    pub fn new(
        tiny: Arc<dyn TextClassifier>,
        large: Arc<dyn TextClassifier>,
        encoder: LabelEncoder,
        thresholds: PipelineThresholds,
    ) -> Result<Self> {
        for (kind, model) in [(ModelKind::Tiny, &tiny), (ModelKind::Large, &large)] {
            if model.num_classes() != encoder.len() {
                return Err(ClassifierError::Shape(format!(
                    "{kind} model scores {} classes, encoder has {}",
                    model.num_classes(),
                    encoder.len()
                )));
            }
        }
        Ok(Self {
            tiny,
            large,
            encoder,
            thresholds,
        })
    }

    /// Pipeline over a loaded artifact set.
    pub fn from_artifacts(artifacts: ClassifierArtifacts) -> Result<Self> {
        Self::new(
            Arc::new(artifacts.tiny),
            Arc::new(artifacts.large),
            artifacts.encoder,
            artifacts.thresholds,
        )
    }

    /// Loads the artifacts of `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        Self::from_artifacts(ClassifierArtifacts::load(dir)?)
    }

    /// Learned cutoffs.
    #[must_use]
    pub const fn thresholds(&self) -> &PipelineThresholds {
        &self.thresholds
    }

    /// Label mapping.
    #[must_use]
    pub const fn encoder(&self) -> &LabelEncoder {
        &self.encoder
    }

    /// Label, or top-k labels when the accepted model is unsure.
    pub fn predict(&self, text: &str) -> Result<Prediction> {
        self.classify(text).map(|outcome| outcome.prediction)
    }

    /// Like [`Self::predict`], also reporting which model answered.
    pub fn classify(&self, text: &str) -> Result<PipelinePrediction> {
        let tiny = self.scores(ModelKind::Tiny, text)?;
        let (tiny_best, tiny_confidence) = argmax(tiny.view());
        let (model, probabilities, best, confidence) =
            if tiny_confidence >= self.thresholds.confidence {
                (ModelKind::Tiny, tiny, tiny_best, tiny_confidence)
            } else {
                let large = self.scores(ModelKind::Large, text)?;
                let (best, confidence) = argmax(large.view());
                (ModelKind::Large, large, best, confidence)
            };

        let ambiguous = match model {
            ModelKind::Tiny => self.thresholds.tiny_ambiguous,
            ModelKind::Large => self.thresholds.large_ambiguous,
        };
        let prediction = if confidence > ambiguous {
            Prediction::Single(self.encoder.decode(best)?.to_string())
        } else {
            let candidates = top_k(probabilities.view(), default_k(self.encoder.len()))
                .into_iter()
                .map(|id| self.encoder.decode(id).map(ToOwned::to_owned))
                .collect::<Result<Vec<_>>>()?;
            Prediction::Candidates(candidates)
        };
        Ok(PipelinePrediction {
            prediction,
            model,
            confidence,
        })
    }

    fn scores(&self, kind: ModelKind, text: &str) -> Result<Array1<f32>> {
        let model = match kind {
            ModelKind::Tiny => &self.tiny,
            ModelKind::Large => &self.large,
        };
        let scores = model.predict_proba(text);
        if scores.len() == self.encoder.len() {
            Ok(scores)
        } else {
            Err(ClassifierError::Shape(format!(
                "{kind} model returned {} scores for {} classes",
                scores.len(),
                self.encoder.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        probabilities: Vec<f32>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(probabilities: &[f32]) -> Arc<Self> {
            Arc::new(Self {
                probabilities: probabilities.to_vec(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TextClassifier for Fixed {
        fn predict_proba(&self, _text: &str) -> Array1<f32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Array1::from(self.probabilities.clone())
        }

        fn num_classes(&self) -> usize {
            self.probabilities.len()
        }
    }

    fn encoder() -> LabelEncoder {
        LabelEncoder::fit(["Order/cancel", "Order/track", "abort", "wildcard"])
    }

    fn thresholds(confidence: f32, ambiguous: f32) -> PipelineThresholds {
        PipelineThresholds {
            confidence,
            tiny_ambiguous: ambiguous,
            large_ambiguous: ambiguous,
        }
    }

    #[test]
    fn confident_tiny_model_never_escalates() {
        let tiny = Fixed::new(&[0.1, 0.8, 0.05, 0.05]);
        let large = Fixed::new(&[0.7, 0.1, 0.1, 0.1]);
        let pipeline =
            DualModelPipeline::new(tiny.clone(), large.clone(), encoder(), thresholds(0.6, 0.5))
                .unwrap();
        for _ in 0..5 {
            let outcome = pipeline.classify("where is it").unwrap();
            assert_eq!(outcome.model, ModelKind::Tiny);
            assert_eq!(outcome.prediction, Prediction::Single("Order/track".into()));
        }
        assert_eq!(tiny.calls(), 5);
        assert_eq!(large.calls(), 0);
    }

    #[test]
    fn unsure_tiny_model_escalates() {
        let tiny = Fixed::new(&[0.4, 0.3, 0.2, 0.1]);
        let large = Fixed::new(&[0.05, 0.05, 0.85, 0.05]);
        let pipeline =
            DualModelPipeline::new(tiny, large.clone(), encoder(), thresholds(0.6, 0.5)).unwrap();
        let outcome = pipeline.classify("stop").unwrap();
        assert_eq!(outcome.model, ModelKind::Large);
        assert_eq!(outcome.prediction, Prediction::Single("abort".into()));
        assert_eq!(large.calls(), 1);
    }

    #[test]
    fn low_confidence_returns_top_k() {
        let tiny = Fixed::new(&[0.3, 0.1, 0.4, 0.2]);
        let large = Fixed::new(&[0.25; 4]);
        let pipeline = DualModelPipeline::new(tiny, large, encoder(), thresholds(0.0, 0.99)).unwrap();
        let prediction = pipeline.predict("anything").unwrap();
        assert_eq!(
            prediction,
            Prediction::Candidates(vec![
                "abort".into(),
                "Order/cancel".into(),
                "wildcard".into()
            ])
        );
    }

    #[test]
    fn class_count_mismatch_is_rejected() {
        let tiny = Fixed::new(&[0.5, 0.5]);
        let large = Fixed::new(&[0.25; 4]);
        let err = DualModelPipeline::new(tiny, large, encoder(), thresholds(0.5, 0.5));
        assert!(matches!(err, Err(ClassifierError::Shape(_))));
    }
}
