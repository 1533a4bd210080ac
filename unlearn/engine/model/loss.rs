use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip};

/// Scalar loss with its gradient with respect to the logits.
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Mean loss over the batch.
    pub loss: f32,
    /// d(loss)/d(logits), already divided by the batch size.
    pub grad: Array2<f32>,
}

impl LossOutput {
    /// Flips the sign of loss and gradient (ascent).
    #[must_use]
    pub fn negated(self) -> Self {
        self.scaled(-1.0)
    }

    /// Multiplies loss and gradient by `factor`.
    #[must_use]
    pub fn scaled(mut self, factor: f32) -> Self {
        self.loss *= factor;
        self.grad.mapv_inplace(|value| value * factor);
        self
    }

    /// Sums two losses over the same logits.
    #[must_use]
    pub fn combined(mut self, other: &Self) -> Self {
        self.loss += other.loss;
        self.grad += &other.grad;
        self
    }
}

/// Row-wise softmax of `logits / temperature`.
#[must_use]
pub fn softmax(logits: ArrayView2<'_, f32>, temperature: f32) -> Array2<f32> {
    let temperature = if temperature > 0.0 { temperature } else { 1.0 };
    let mut probs = logits.mapv(|value| value / temperature);
    for mut row in probs.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &value| acc.max(value));
        row.mapv_inplace(|value| (value - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|value| value / sum);
        }
    }
    probs
}

/// Row-wise log-softmax of `logits / temperature`.
#[must_use]
pub fn log_softmax(logits: ArrayView2<'_, f32>, temperature: f32) -> Array2<f32> {
    let temperature = if temperature > 0.0 { temperature } else { 1.0 };
    let mut scaled = logits.mapv(|value| value / temperature);
    for mut row in scaled.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &value| acc.max(value));
        let log_sum = row.mapv(|value| (value - max).exp()).sum().ln() + max;
        row.mapv_inplace(|value| value - log_sum);
    }
    scaled
}

/// Index of the largest entry; ties resolve to the lowest index.
#[must_use]
pub fn argmax(row: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (index, &value) in row.iter().enumerate() {
        if value > best_value {
            best = index;
            best_value = value;
        }
    }
    best
}

/// Predicted class per row.
#[must_use]
pub fn predictions(logits: ArrayView2<'_, f32>) -> Vec<usize> {
    logits.rows().into_iter().map(argmax).collect()
}

/// Class with the second-highest logit per row.
#[must_use]
pub fn second_best(logits: ArrayView2<'_, f32>) -> Vec<usize> {
    logits
        .rows()
        .into_iter()
        .map(|row| {
            let top = argmax(row);
            let mut best = if top == 0 { 1.min(row.len().saturating_sub(1)) } else { 0 };
            for (index, &value) in row.iter().enumerate() {
                if index != top && value > row[best] {
                    best = index;
                }
            }
            best
        })
        .collect()
}

/// Number of rows whose argmax equals the label.
#[must_use]
pub fn count_correct(logits: ArrayView2<'_, f32>, labels: &[usize]) -> usize {
    predictions(logits)
        .iter()
        .zip(labels)
        .filter(|(pred, label)| pred == label)
        .count()
}

/// Mean cross-entropy over integer labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Loss and gradient; an empty batch yields zero.
    #[must_use]
    pub fn compute(&self, logits: ArrayView2<'_, f32>, labels: &[usize]) -> LossOutput {
        let batch = logits.nrows();
        if batch == 0 {
            return LossOutput {
                loss: 0.0,
                grad: Array2::zeros(logits.raw_dim()),
            };
        }
        let log_probs = log_softmax(logits, 1.0);
        let mut grad = log_probs.mapv(f32::exp);
        let mut total = 0.0_f32;
        for (row, &label) in labels.iter().enumerate().take(batch) {
            total -= log_probs[[row, label]];
            grad[[row, label]] -= 1.0;
        }
        let scale = 1.0 / batch as f32;
        grad.mapv_inplace(|value| value * scale);
        LossOutput {
            loss: total * scale,
            grad,
        }
    }
}

/// Distillation loss `T^2 * KL(teacher || student)` at temperature `T`.
#[must_use]
pub fn distillation_kl(
    student_logits: ArrayView2<'_, f32>,
    teacher_logits: ArrayView2<'_, f32>,
    temperature: f32,
) -> LossOutput {
    let batch = student_logits.nrows();
    if batch == 0 {
        return LossOutput {
            loss: 0.0,
            grad: Array2::zeros(student_logits.raw_dim()),
        };
    }
    let t = if temperature > 0.0 { temperature } else { 1.0 };
    let student_log = log_softmax(student_logits, t);
    let teacher_log = log_softmax(teacher_logits, t);
    let teacher = teacher_log.mapv(f32::exp);
    let mut total = 0.0_f32;
    Zip::from(&teacher)
        .and(&teacher_log)
        .and(&student_log)
        .for_each(|&p, &log_p, &log_q| {
            if p > 0.0 {
                total += p * (log_p - log_q);
            }
        });
    let scale = 1.0 / batch as f32;
    // d/dz of T^2 * KL at temperature T is T * (q - p).
    let mut grad = student_log.mapv(f32::exp) - &teacher;
    grad.mapv_inplace(|value| value * t * scale);
    LossOutput {
        loss: total * t * t * scale,
        grad,
    }
}

/// Shannon entropy of each probability row.
#[must_use]
pub fn row_entropy(probs: ArrayView2<'_, f32>) -> Vec<f32> {
    probs
        .map_axis(Axis(1), |row| {
            row.iter()
                .filter(|p| **p > 0.0)
                .map(|p| -p * p.ln())
                .sum::<f32>()
        })
        .to_vec()
}
