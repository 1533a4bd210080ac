use std::collections::BTreeMap;

use indexmap::IndexMap;
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::{mean_or_zero, round_to};
use crate::{
    data::Partition,
    error::EngineResult,
    model::{
        loss::{predictions, softmax, CrossEntropyLoss},
        Classifier,
    },
};

/// Per-ground-truth-class rows over predicted classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    /// `rows[gt][class]`.
    pub rows: Vec<Vec<f64>>,
}

impl Distribution {
    /// Keyed as `gt_<class>`, values rounded to 3 decimals.
    #[must_use]
    pub fn format(&self) -> IndexMap<String, Vec<f64>> {
        self.rows
            .iter()
            .enumerate()
            .map(|(gt, row)| {
                (
                    format!("gt_{gt}"),
                    row.iter().map(|&value| round_to(value, 3)).collect(),
                )
            })
            .collect()
    }
}

/// Output of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Mean of per-batch losses.
    pub loss: f64,
    /// Overall accuracy.
    pub accuracy: f64,
    /// Accuracy of every class, including classes without samples (0.0).
    pub class_accuracies: BTreeMap<usize, f64>,
    /// Fraction of each class predicted as each class.
    pub label_dist: Distribution,
    /// Mean softmax probability per class, grouped by ground truth.
    pub conf_dist: Distribution,
    /// Samples seen.
    pub samples: usize,
}

impl EvaluationReport {
    /// Accuracy of one class.
    #[must_use]
    pub fn class_accuracy(&self, class: usize) -> f64 {
        self.class_accuracies.get(&class).copied().unwrap_or(0.0)
    }

    /// Mean accuracy over every class except `forget_class`.
    #[must_use]
    pub fn remaining_accuracy(&self, forget_class: usize) -> f64 {
        mean_or_zero(
            self.class_accuracies
                .iter()
                .filter(|(&class, _)| class != forget_class)
                .map(|(_, &acc)| acc),
        )
    }

    /// Per-class accuracies in class order.
    #[must_use]
    pub fn accuracy_vector(&self) -> Vec<f64> {
        self.class_accuracies.values().copied().collect()
    }
}

/// Evaluates `model` over `partition` without touching its parameters.
pub fn evaluate(
    model: &dyn Classifier,
    partition: &Partition,
    batch_size: usize,
    criterion: &CrossEntropyLoss,
) -> EngineResult<EvaluationReport> {
    let num_classes = model.num_classes();
    let mut loader = partition.loader(batch_size, false, 0);
    let mut batch_losses = Vec::with_capacity(loader.num_batches());
    let mut correct = vec![0_usize; num_classes];
    let mut totals = vec![0_usize; num_classes];
    let mut label_counts = vec![vec![0_usize; num_classes]; num_classes];
    let mut prob_sums = vec![vec![0.0_f64; num_classes]; num_classes];

    for batch in loader.epoch() {
        let pass = model.forward(batch.inputs.view())?;
        let logits = pass.logits();
        batch_losses.push(f64::from(criterion.compute(logits, &batch.labels).loss));
        let probs = softmax(logits, 1.0);
        for ((row, &label), pred) in batch.labels.iter().enumerate().zip(predictions(logits)) {
            if label >= num_classes {
                continue;
            }
            totals[label] += 1;
            if pred == label {
                correct[label] += 1;
            }
            if pred < num_classes {
                label_counts[label][pred] += 1;
            }
            for (class, sum) in prob_sums[label].iter_mut().enumerate() {
                *sum += f64::from(probs[[row, class]]);
            }
        }
    }

    let samples: usize = totals.iter().sum();
    let class_accuracies = (0..num_classes)
        .map(|class| (class, ratio(correct[class], totals[class])))
        .collect();
    let label_dist = Distribution {
        rows: label_counts
            .iter()
            .zip(&totals)
            .map(|(counts, &total)| counts.iter().map(|&count| ratio(count, total)).collect())
            .collect(),
    };
    let conf_dist = Distribution {
        rows: prob_sums
            .iter()
            .zip(&totals)
            .map(|(sums, &total)| {
                sums.iter()
                    .map(|&sum| if total == 0 { 0.0 } else { sum / total as f64 })
                    .collect()
            })
            .collect(),
    };
    Ok(EvaluationReport {
        loss: mean_or_zero(batch_losses),
        accuracy: ratio(correct.iter().sum(), samples),
        class_accuracies,
        label_dist,
        conf_dist,
        samples,
    })
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Forward outputs collected over a whole partition.
#[derive(Debug, Clone)]
pub struct ActivationSet {
    /// Dataset indices, in partition order.
    pub indices: Vec<usize>,
    /// Ground-truth labels.
    pub labels: Vec<usize>,
    /// Argmax predictions.
    pub predictions: Vec<usize>,
    /// Softmax probabilities.
    pub probabilities: Array2<f32>,
    /// Output of every layer; the last entry holds the logits.
    pub layers: Vec<Array2<f32>>,
}

impl ActivationSet {
    /// Logits.
    #[must_use]
    pub fn logits(&self) -> ArrayView2<'_, f32> {
        self.layers
            .last()
            .map_or_else(|| self.probabilities.view(), |layer| layer.view())
    }

    /// Representation feeding the classification head.
    #[must_use]
    pub fn penultimate(&self) -> ArrayView2<'_, f32> {
        match self.layers.len() {
            0 => self.probabilities.view(),
            1 => self.layers[0].view(),
            n => self.layers[n - 2].view(),
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// True when no samples were collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Runs `model` over `partition` in order and keeps every layer's output.
pub fn collect_activations(
    model: &dyn Classifier,
    partition: &Partition,
    batch_size: usize,
) -> EngineResult<ActivationSet> {
    let architecture = model.architecture();
    let mut loader = partition.loader(batch_size, false, 0);
    let mut indices = Vec::with_capacity(partition.len());
    let mut labels = Vec::with_capacity(partition.len());
    let mut per_layer: Vec<Vec<Array2<f32>>> = vec![Vec::new(); architecture.layers.len()];
    for batch in loader.epoch() {
        let pass = model.forward(batch.inputs.view())?;
        for (store, activation) in per_layer.iter_mut().zip(pass.activations) {
            store.push(activation);
        }
        indices.extend(batch.indices);
        labels.extend(batch.labels);
    }
    let layers = per_layer
        .into_iter()
        .zip(&architecture.layers)
        .map(|(chunks, spec)| stack_rows(&chunks, spec.width))
        .collect::<EngineResult<Vec<_>>>()?;
    let logits = layers
        .last()
        .cloned()
        .unwrap_or_else(|| Array2::zeros((0, architecture.num_classes())));
    let probabilities = softmax(logits.view(), 1.0);
    Ok(ActivationSet {
        indices,
        labels,
        predictions: predictions(logits.view()),
        probabilities,
        layers,
    })
}

fn stack_rows(chunks: &[Array2<f32>], width: usize) -> EngineResult<Array2<f32>> {
    if chunks.is_empty() {
        return Ok(Array2::zeros((0, width)));
    }
    let views: Vec<_> = chunks.iter().map(|chunk| chunk.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::LabeledDataset, model::MlpClassifier};
    use std::sync::Arc;

    fn fixture() -> (MlpClassifier, Arc<LabeledDataset>) {
        let data = Arc::new(LabeledDataset::synthetic("train", 4, 25, 5, 0.3, 2));
        (MlpClassifier::new(5, &[8], 4, 1), data)
    }

    #[test]
    fn evaluation_is_idempotent() {
        let (model, data) = fixture();
        let partition = Partition::full(&data);
        let first = evaluate(&model, &partition, 16, &CrossEntropyLoss).unwrap();
        let second = evaluate(&model, &partition, 16, &CrossEntropyLoss).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.samples, 100);
    }

    #[test]
    fn empty_class_reports_zero() {
        let (model, data) = fixture();
        let retain = Partition::retain(&data, 1);
        let report = evaluate(&model, &retain, 16, &CrossEntropyLoss).unwrap();
        assert_eq!(report.class_accuracies.len(), 4);
        assert!(report.class_accuracy(1).abs() < f64::EPSILON);
        assert!(report.label_dist.rows[1].iter().all(|v| *v == 0.0));
        assert!(report.conf_dist.rows[1].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn empty_partition_never_divides_by_zero() {
        let (model, data) = fixture();
        let nothing = Partition::subset(&data, Vec::new());
        let report = evaluate(&model, &nothing, 8, &CrossEntropyLoss).unwrap();
        assert_eq!(report.samples, 0);
        assert!(report.loss.abs() < f64::EPSILON);
        assert!(report.accuracy.abs() < f64::EPSILON);
        assert!(report.remaining_accuracy(0).abs() < f64::EPSILON);
    }

    #[test]
    fn distributions_are_row_normalised() {
        let (model, data) = fixture();
        let report = evaluate(&model, &Partition::full(&data), 32, &CrossEntropyLoss).unwrap();
        for row in &report.label_dist.rows {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
        for row in &report.conf_dist.rows {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-4);
        }
        let formatted = report.label_dist.format();
        assert_eq!(formatted.keys().next().map(String::as_str), Some("gt_0"));
        assert_eq!(formatted["gt_3"].len(), 4);
    }

    #[test]
    fn remaining_accuracy_skips_forget_class() {
        let mut report = evaluate(
            &fixture().0,
            &Partition::full(&fixture().1),
            8,
            &CrossEntropyLoss,
        )
        .unwrap();
        report.class_accuracies = (0..4).map(|c| (c, c as f64 / 10.0)).collect();
        assert!((report.remaining_accuracy(0) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn activations_cover_partition_in_order() {
        let (model, data) = fixture();
        let subset = Partition::subset(&data, vec![5, 1, 9]);
        let acts = collect_activations(&model, &subset, 2).unwrap();
        assert_eq!(acts.indices, vec![5, 1, 9]);
        assert_eq!(acts.penultimate().dim(), (3, 8));
        assert_eq!(acts.logits().dim(), (3, 4));
        let empty = collect_activations(&model, &Partition::subset(&data, vec![]), 2).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.penultimate().dim(), (0, 8));
    }
}
