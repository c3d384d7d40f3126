//! Confidence analysis and threshold selection for the dual-model pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::{ClassifierError, Result},
    metrics::weighted_f1,
    trainer::Evaluation,
};

/// Grid and budget for the primary threshold search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSearchConfig {
    /// First candidate threshold.
    pub floor: f32,
    /// Grid increment.
    pub step: f32,
    /// Last candidate threshold (inclusive).
    pub ceiling: f32,
    /// Share of utterances the large model may handle before the score is penalised.
    pub target_large_usage: f32,
}

impl Default for ThresholdSearchConfig {
    fn default() -> Self {
        Self {
            floor: 0.5,
            step: 0.05,
            ceiling: 0.99,
            target_large_usage: 0.30,
        }
    }
}

impl ThresholdSearchConfig {
    /// Candidate thresholds in ascending order.
    #[must_use]
    pub fn grid(&self) -> Vec<f32> {
        let mut grid = Vec::new();
        if self.step <= 0.0 {
            grid.push(self.floor);
            return grid;
        }
        let mut index = 0u16;
        loop {
            let candidate = f32::from(index).mul_add(self.step, self.floor);
            if candidate > self.ceiling + 1e-6 {
                break;
            }
            grid.push(candidate);
            index += 1;
        }
        grid
    }
}

/// Multiplier applied to F1 for a given large-model usage rate.
pub trait UsagePenalty: Send + Sync + fmt::Debug {
    /// Factor in `[0, 1]`; `1.0` means no penalty.
    fn factor(&self, large_usage: f32, target: f32) -> f32;
}

/// `max(0, 1 - 2 * overage)` where overage is usage above the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoublingOverage;

impl UsagePenalty for DoublingOverage {
    fn factor(&self, large_usage: f32, target: f32) -> f32 {
        let overage = (large_usage - target).max(0.0);
        2.0f32.mul_add(-overage, 1.0).max(0.0)
    }
}

/// Confidence distributions of correct and incorrect validation predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAnalysis {
    /// Mean confidence of correct predictions (0 when none).
    pub correct_mean: f32,
    /// Mean confidence of incorrect predictions (0 when none).
    pub incorrect_mean: f32,
    /// Number of correct predictions.
    pub correct: usize,
    /// Number of incorrect predictions.
    pub incorrect: usize,
}

impl ConfidenceAnalysis {
    /// Splits `evaluation` by correctness.
    #[must_use]
    pub fn of(evaluation: &Evaluation) -> Self {
        let (mut correct_sum, mut incorrect_sum) = (0.0f32, 0.0f32);
        let (mut correct, mut incorrect) = (0usize, 0usize);
        for ((predicted, actual), confidence) in evaluation
            .predictions
            .iter()
            .zip(&evaluation.truth)
            .zip(&evaluation.confidences)
        {
            if predicted == actual {
                correct_sum += confidence;
                correct += 1;
            } else {
                incorrect_sum += confidence;
                incorrect += 1;
            }
        }
        Self {
            correct_mean: mean(correct_sum, correct),
            incorrect_mean: mean(incorrect_sum, incorrect),
            correct,
            incorrect,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(sum: f32, count: usize) -> f32 {
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Confidence cutoff for top-1 output: the mean confidence of the model's mistakes.
#[must_use]
pub fn ambiguous_threshold(evaluation: &Evaluation) -> f32 {
    ConfidenceAnalysis::of(evaluation).incorrect_mean
}

/// Outcome of [`search_threshold`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdChoice {
    /// Selected primary threshold.
    pub threshold: f32,
    /// Penalised score at that threshold.
    pub score: f32,
    /// Weighted F1 of the combined predictions.
    pub weighted_f1: f32,
    /// Share of validation utterances routed to the large model.
    pub large_usage: f32,
}

/// Primary and ambiguous thresholds of a trained pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineThresholds {
    /// Tiny-model confidence at or above which the large model is skipped.
    pub confidence: f32,
    /// Single-label cutoff for tiny-model predictions.
    pub tiny_ambiguous: f32,
    /// Single-label cutoff for large-model predictions.
    pub large_ambiguous: f32,
}

/// Picks the tiny-model cutoff maximising `weighted F1 * penalty(large usage)`.
///
/// Both evaluations must cover the same validation examples in the same order; a
/// length mismatch is a [`ClassifierError::Shape`]. Ties keep the smallest threshold.
pub fn search_threshold(
    tiny: &Evaluation,
    large: &Evaluation,
    config: &ThresholdSearchConfig,
    penalty: &dyn UsagePenalty,
) -> Result<ThresholdChoice> {
    let examples = tiny.truth.len();
    let lengths = [
        tiny.predictions.len(),
        tiny.confidences.len(),
        large.predictions.len(),
        large.truth.len(),
    ];
    if lengths.iter().any(|len| *len != examples) {
        return Err(ClassifierError::Shape(format!(
            "threshold search over mismatched evaluations: {examples} labels, lengths {lengths:?}"
        )));
    }
    let mut best: Option<ThresholdChoice> = None;
    for threshold in config.grid() {
        let mut combined = Vec::with_capacity(examples);
        let mut escalated = 0usize;
        for ((confidence, small), big) in tiny
            .confidences
            .iter()
            .zip(&tiny.predictions)
            .zip(&large.predictions)
        {
            if *confidence >= threshold {
                combined.push(*small);
            } else {
                escalated += 1;
                combined.push(*big);
            }
        }
        #[allow(clippy::cast_precision_loss)]
        let large_usage = if combined.is_empty() {
            0.0
        } else {
            escalated as f32 / combined.len() as f32
        };
        let f1 = weighted_f1(&combined, &tiny.truth);
        let score = f1 * penalty.factor(large_usage, config.target_large_usage);
        if best.map_or(true, |current| score > current.score) {
            best = Some(ThresholdChoice {
                threshold,
                score,
                weighted_f1: f1,
                large_usage,
            });
        }
    }
    Ok(best.unwrap_or(ThresholdChoice {
        threshold: config.floor,
        score: 0.0,
        weighted_f1: 0.0,
        large_usage: 0.0,
    }))
}
