use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::{evaluator::collect_activations, round_to};
use crate::{
    data::{DatasetBundle, Partition},
    error::EngineResult,
    model::Classifier,
};

/// Linear CKA between two activation matrices over the same samples.
///
/// Returns 0.0 when either representation has no variance or fewer than two samples.
#[must_use]
pub fn linear_cka(x: ArrayView2<'_, f32>, y: ArrayView2<'_, f32>) -> f64 {
    if x.nrows() != y.nrows() || x.nrows() < 2 {
        return 0.0;
    }
    let xc = center(x);
    let yc = center(y);
    let cross = frobenius_sq(&yc.t().dot(&xc));
    let norm_x = frobenius_sq(&xc.t().dot(&xc)).sqrt();
    let norm_y = frobenius_sq(&yc.t().dot(&yc)).sqrt();
    let denom = norm_x * norm_y;
    if denom <= f64::EPSILON || !denom.is_finite() {
        return 0.0;
    }
    (cross / denom).clamp(0.0, 1.0)
}

fn center(matrix: ArrayView2<'_, f32>) -> Array2<f64> {
    let data = matrix.mapv(f64::from);
    let mean = data
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(data.ncols()));
    data - &mean
}

fn frobenius_sq(matrix: &Array2<f64>) -> f64 {
    matrix.iter().map(|value| value * value).sum()
}

/// CKA per layer for the forget-class and other-class samples of one split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CkaSplit {
    /// Forget-class samples.
    pub forget: Vec<f64>,
    /// Remaining-class samples.
    pub other: Vec<f64>,
}

/// Layer-wise similarity between two models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CkaReport {
    /// Layer names in forward order.
    pub layers: Vec<String>,
    /// Training split.
    pub train: CkaSplit,
    /// Test split.
    pub test: CkaSplit,
}

/// Capped sample sets compared by [`calculate_cka_similarity`].
#[derive(Debug, Clone)]
pub struct CkaSources {
    train_forget: Partition,
    train_other: Partition,
    test_forget: Partition,
    test_other: Partition,
}

impl CkaSources {
    /// Draws up to `samples_per_split` samples per cell with a seeded permutation.
    #[must_use]
    pub fn new(
        datasets: &DatasetBundle,
        forget_class: usize,
        samples_per_split: usize,
        seed: u64,
    ) -> Self {
        let draw = |partition: Partition, offset: u64| {
            partition.sample(samples_per_split, seed.wrapping_add(offset))
        };
        Self {
            train_forget: draw(Partition::forget(&datasets.train, forget_class), 0),
            train_other: draw(Partition::retain(&datasets.train, forget_class), 1),
            test_forget: draw(Partition::forget(&datasets.test, forget_class), 2),
            test_other: draw(Partition::retain(&datasets.test, forget_class), 3),
        }
    }
}

/// Compares every layer of `before` and `after` with linear CKA.
pub fn calculate_cka_similarity(
    before: &dyn Classifier,
    after: &dyn Classifier,
    sources: &CkaSources,
    batch_size: usize,
) -> EngineResult<CkaReport> {
    let architecture = before.architecture();
    architecture.ensure_matches(&after.architecture())?;
    let compare = |partition: &Partition| -> EngineResult<Vec<f64>> {
        let lhs = collect_activations(before, partition, batch_size)?;
        let rhs = collect_activations(after, partition, batch_size)?;
        Ok(lhs
            .layers
            .iter()
            .zip(&rhs.layers)
            .map(|(a, b)| round_to(linear_cka(a.view(), b.view()), 3))
            .collect())
    };
    Ok(CkaReport {
        layers: architecture.layer_names(),
        train: CkaSplit {
            forget: compare(&sources.train_forget)?,
            other: compare(&sources.train_other)?,
        },
        test: CkaSplit {
            forget: compare(&sources.test_forget)?,
            other: compare(&sources.test_other)?,
        },
    })
}
