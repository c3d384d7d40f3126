//! Scoring helpers shared by training and inference.

use std::collections::BTreeMap;

use ndarray::{Array1, ArrayView1};

/// Numerically stable softmax.
#[must_use]
pub fn softmax(logits: ArrayView1<'_, f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |acc, v| acc.max(*v));
    let exp = logits.mapv(|v| (v - max).exp());
    let total = exp.sum();
    if total > 0.0 {
        exp / total
    } else {
        #[allow(clippy::cast_precision_loss)]
        let classes = logits.len().max(1) as f32;
        Array1::from_elem(logits.len(), 1.0 / classes)
    }
}

/// Indices of the `k` largest probabilities, best first. Ties keep the lower index first.
#[must_use]
pub fn top_k(probabilities: ArrayView1<'_, f32>, k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..probabilities.len()).collect();
    order.sort_by(|a, b| {
        probabilities[*b]
            .total_cmp(&probabilities[*a])
            .then_with(|| a.cmp(b))
    });
    order.truncate(k);
    order
}

/// Winning class and its probability.
#[must_use]
pub fn argmax(probabilities: ArrayView1<'_, f32>) -> (usize, f32) {
    top_k(probabilities, 1)
        .first()
        .map_or((0, 0.0), |idx| (*idx, probabilities[*idx]))
}

/// `min(3, classes)`.
#[must_use]
pub fn default_k(classes: usize) -> usize {
    classes.min(3)
}

/// NDCG@k with a single relevant item per example (the true label).
#[must_use]
pub fn ndcg_at_k(ranked: &[Vec<usize>], truth: &[usize], k: usize) -> f32 {
    if truth.is_empty() {
        return 0.0;
    }
    let total: f32 = ranked
        .iter()
        .zip(truth)
        .map(|(ranking, label)| {
            ranking
                .iter()
                .take(k)
                .position(|candidate| candidate == label)
                .map_or(0.0, |pos| {
                    #[allow(clippy::cast_precision_loss)]
                    let rank = (pos + 2) as f32;
                    1.0 / rank.log2()
                })
        })
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let examples = truth.len() as f32;
    total / examples
}

/// Support-weighted F1 over the classes present in `truth`.
#[must_use]
pub fn weighted_f1(predicted: &[usize], truth: &[usize]) -> f32 {
    if truth.is_empty() {
        return 0.0;
    }
    #[derive(Default)]
    struct Counts {
        tp: f32,
        fp: f32,
        fn_: f32,
        support: f32,
    }
    let mut per_class: BTreeMap<usize, Counts> = BTreeMap::new();
    for (pred, actual) in predicted.iter().zip(truth) {
        per_class.entry(*actual).or_default().support += 1.0;
        if pred == actual {
            per_class.entry(*actual).or_default().tp += 1.0;
        } else {
            per_class.entry(*pred).or_default().fp += 1.0;
            per_class.entry(*actual).or_default().fn_ += 1.0;
        }
    }
    let total_support: f32 = per_class.values().map(|c| c.support).sum();
    per_class
        .values()
        .filter(|c| c.support > 0.0)
        .map(|c| {
            let denom = 2.0f32.mul_add(c.tp, c.fp + c.fn_);
            let f1 = if denom > 0.0 { 2.0 * c.tp / denom } else { 0.0 };
            f1 * c.support / total_support
        })
        .sum()
}

/// Fraction of matching predictions.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn accuracy(predicted: &[usize], truth: &[usize]) -> f32 {
    if truth.is_empty() {
        return 0.0;
    }
    let hits = predicted.iter().zip(truth).filter(|(p, t)| p == t).count();
    hits as f32 / truth.len() as f32
}
