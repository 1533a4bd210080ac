//! Threshold membership attack over entropy and confidence features.
//!
//! Retain-class samples are the positives (the model should still remember
//! them) and forget-class samples the negatives. A threshold classifier that
//! separates the two well means the forget class no longer looks like training
//! data, so the best advantage `tpr - fpr` doubles as the forgetting quality
//! score.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use super::{
    evaluator::{collect_activations, ActivationSet},
    mean_or_zero, round_to,
};
use crate::{
    data::Partition,
    error::EngineResult,
    model::{
        loss::{log_softmax, row_entropy, softmax},
        Classifier,
    },
    settings::AttackSettings,
};

/// Attack features of one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleFeatures {
    /// Softmax entropy at the entropy temperature.
    pub entropy: f64,
    /// `log p_y - log(1 - p_y)` at the confidence temperature.
    pub confidence: f64,
}

/// Computes attack features for each row of `logits`.
#[must_use]
pub fn sample_features(
    logits: ArrayView2<'_, f32>,
    labels: &[usize],
    settings: &AttackSettings,
) -> Vec<SampleFeatures> {
    let entropies = row_entropy(softmax(logits, settings.entropy_temperature).view());
    let log_probs = log_softmax(logits, settings.confidence_temperature);
    labels
        .iter()
        .enumerate()
        .zip(entropies)
        .map(|((row, &label), entropy)| {
            let log_p = f64::from(log_probs[[row, label]]);
            let rest = (1.0 - log_p.exp()).max(1e-12);
            SampleFeatures {
                entropy: f64::from(entropy),
                confidence: log_p - rest.ln(),
            }
        })
        .collect()
}

/// Per-sample attack record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackValue {
    /// Dataset index.
    pub img: usize,
    /// Entropy feature (3 dp).
    pub entropy: f64,
    /// Confidence feature (3 dp).
    pub confidence: f64,
    /// 1 for forget-class samples.
    pub forget: u8,
}

/// One point of a threshold sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    /// Feature threshold.
    pub threshold: f64,
    /// Balanced accuracy `1 - (fpr + fnr) / 2`.
    pub attack_score: f64,
    /// Forget samples flagged as remembered.
    pub fpr: f64,
    /// Retain samples missed.
    pub fnr: f64,
}

/// Sweeps for both features.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttackResults {
    /// Entropy sweep.
    pub entropy: Vec<ThresholdResult>,
    /// Confidence sweep.
    pub confidence: Vec<ThresholdResult>,
}

/// Attack output stored with a result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackReport {
    /// Per-sample features.
    pub values: Vec<AttackValue>,
    /// Threshold sweeps.
    pub results: AttackResults,
    /// Forgetting quality score in [0, 1].
    pub fqs: f64,
}

/// Raw feature distributions over the whole forget set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgetDistributions {
    /// Entropy per forget sample.
    pub entropy: Vec<f64>,
    /// Confidence per forget sample.
    pub confidence: Vec<f64>,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    /// Remembered when the feature is at or below the threshold.
    AtMost,
    /// Remembered when the feature is at or above the threshold.
    AtLeast,
}

impl Direction {
    fn flags(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::AtMost => value <= threshold,
            Self::AtLeast => value >= threshold,
        }
    }
}

/// Runs the attack on a fixed subset.
pub fn process_attack_metrics(
    model: &dyn Classifier,
    subset: &Partition,
    forget_class: usize,
    settings: &AttackSettings,
    batch_size: usize,
) -> EngineResult<AttackReport> {
    let activations = collect_activations(model, subset, batch_size)?;
    Ok(attack_from_activations(&activations, forget_class, settings))
}

/// Runs the attack on activations that were already collected.
#[must_use]
pub fn attack_from_activations(
    activations: &ActivationSet,
    forget_class: usize,
    settings: &AttackSettings,
) -> AttackReport {
    let features = sample_features(activations.logits(), &activations.labels, settings);
    let values = activations
        .indices
        .iter()
        .zip(&activations.labels)
        .zip(&features)
        .map(|((&img, &label), feature)| AttackValue {
            img,
            entropy: round_to(feature.entropy, 3),
            confidence: round_to(feature.confidence, 3),
            forget: u8::from(label == forget_class),
        })
        .collect();
    let flagged: Vec<(bool, SampleFeatures)> = activations
        .labels
        .iter()
        .map(|&label| label == forget_class)
        .zip(features)
        .collect();
    let (results, fqs) = forget_quality(&flagged, settings.thresholds);
    AttackReport {
        values,
        results,
        fqs,
    }
}

/// Threshold sweeps and forgetting quality for `(is_forget, features)` pairs.
#[must_use]
pub fn forget_quality(samples: &[(bool, SampleFeatures)], thresholds: usize) -> (AttackResults, f64) {
    let split = |pick: fn(&SampleFeatures) -> f64| {
        let mut retain = Vec::new();
        let mut forget = Vec::new();
        for (is_forget, features) in samples {
            if *is_forget {
                forget.push(pick(features));
            } else {
                retain.push(pick(features));
            }
        }
        (retain, forget)
    };
    let (retain_entropy, forget_entropy) = split(|f| f.entropy);
    let (retain_conf, forget_conf) = split(|f| f.confidence);
    if retain_entropy.is_empty() || forget_entropy.is_empty() {
        return (AttackResults::default(), 0.0);
    }
    let (entropy, entropy_adv) =
        sweep(&retain_entropy, &forget_entropy, thresholds, Direction::AtMost);
    let (confidence, confidence_adv) =
        sweep(&retain_conf, &forget_conf, thresholds, Direction::AtLeast);
    let fqs = round_to(
        mean_or_zero([entropy_adv.max(0.0), confidence_adv.max(0.0)]),
        3,
    );
    (AttackResults { entropy, confidence }, fqs.clamp(0.0, 1.0))
}

fn sweep(
    positives: &[f64],
    negatives: &[f64],
    thresholds: usize,
    direction: Direction,
) -> (Vec<ThresholdResult>, f64) {
    let (low, high) = positives
        .iter()
        .chain(negatives)
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !low.is_finite() || !high.is_finite() {
        return (Vec::new(), 0.0);
    }
    let steps = thresholds.max(2);
    let mut best = f64::NEG_INFINITY;
    let results: Vec<ThresholdResult> = (0..steps)
        .map(|step| {
            let threshold = low + (high - low) * step as f64 / (steps - 1) as f64;
            let tpr = rate(positives, threshold, direction);
            let fpr = rate(negatives, threshold, direction);
            best = best.max(tpr - fpr);
            let fnr = 1.0 - tpr;
            ThresholdResult {
                threshold: round_to(threshold, 3),
                attack_score: round_to(1.0 - (fpr + fnr) / 2.0, 3),
                fpr: round_to(fpr, 3),
                fnr: round_to(fnr, 3),
            }
        })
        .collect();
    (results, best)
}

fn rate(values: &[f64], threshold: f64, direction: Direction) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let hits = values
        .iter()
        .filter(|&&value| direction.flags(value, threshold))
        .count();
    hits as f64 / values.len() as f64
}

/// Feature distributions over every sample of `forget`.
pub fn forget_distributions(
    model: &dyn Classifier,
    forget: &Partition,
    settings: &AttackSettings,
    batch_size: usize,
) -> EngineResult<ForgetDistributions> {
    let activations = collect_activations(model, forget, batch_size)?;
    let features = sample_features(activations.logits(), &activations.labels, settings);
    Ok(ForgetDistributions {
        entropy: features.iter().map(|f| round_to(f.entropy, 3)).collect(),
        confidence: features.iter().map(|f| round_to(f.confidence, 3)).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::LabeledDataset, model::MlpClassifier};
    use ndarray::array;
    use std::sync::Arc;

    fn features(entropy: f64, confidence: f64) -> SampleFeatures {
        SampleFeatures {
            entropy,
            confidence,
        }
    }

    #[test]
    fn separable_forget_set_scores_one() {
        let samples = vec![
            (false, features(0.1, 5.0)),
            (false, features(0.2, 4.0)),
            (true, features(2.0, -3.0)),
            (true, features(2.1, -4.0)),
        ];
        let (results, fqs) = forget_quality(&samples, 10);
        assert!((fqs - 1.0).abs() < 1e-12);
        assert_eq!(results.entropy.len(), 10);
        assert!(results
            .entropy
            .iter()
            .any(|r| (r.attack_score - 1.0).abs() < 1e-12));
    }

    #[test]
    fn indistinguishable_forget_set_scores_zero() {
        let samples = vec![
            (false, features(0.5, 1.0)),
            (true, features(0.5, 1.0)),
            (false, features(0.7, 0.2)),
            (true, features(0.7, 0.2)),
        ];
        let (_, fqs) = forget_quality(&samples, 5);
        assert!(fqs.abs() < 1e-12);
    }

    #[test]
    fn one_sided_subset_has_no_results() {
        let samples = vec![(false, features(0.5, 1.0))];
        let (results, fqs) = forget_quality(&samples, 5);
        assert!(results.entropy.is_empty() && results.confidence.is_empty());
        assert!(fqs.abs() < f64::EPSILON);
    }

    #[test]
    fn confident_logits_have_low_entropy_high_confidence() {
        let logits = array![[8.0_f32, 0.0, 0.0], [0.1, 0.0, 0.05]];
        let settings = AttackSettings::default();
        let feats = sample_features(logits.view(), &[0, 0], &settings);
        assert!(feats[0].entropy < feats[1].entropy);
        assert!(feats[0].confidence > feats[1].confidence);
    }

    #[test]
    fn attack_is_deterministic_on_fixed_subset() {
        let data = Arc::new(LabeledDataset::synthetic("train", 3, 12, 4, 0.2, 5));
        let model = MlpClassifier::new(4, &[6], 3, 8);
        let subset = Partition::full(&data);
        let settings = AttackSettings::default();
        let first = process_attack_metrics(&model, &subset, 1, &settings, 8).unwrap();
        let second = process_attack_metrics(&model, &subset, 1, &settings, 8).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.values.len(), 36);
        assert_eq!(first.values.iter().filter(|v| v.forget == 1).count(), 12);
        assert!((0.0..=1.0).contains(&first.fqs));
    }
}
