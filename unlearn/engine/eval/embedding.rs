use ndarray::{Array1, Array2, ArrayView2, Axis};

const POWER_ITERATIONS: usize = 200;
const EMBEDDING_EXTENT: f64 = 10.0;

/// Projects activations onto their two leading principal axes.
///
/// Axis signs are fixed so the forget-class centroid sits in the non-negative
/// quadrant; samples predicted as forget-class stand in when no sample carries
/// the forget flag. Coordinates are scaled into `[-10, 10]`.
#[must_use]
pub fn compute_embedding(
    activations: ArrayView2<'_, f32>,
    predicted: &[usize],
    forget_flags: &[bool],
    forget_class: usize,
) -> Array2<f64> {
    let samples = activations.nrows();
    if samples == 0 {
        return Array2::zeros((0, 2));
    }
    let data = activations.mapv(f64::from);
    let mean = data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(data.ncols()));
    let centered = &data - &mean;
    let covariance = centered.t().dot(&centered) / (samples.max(2) - 1) as f64;

    let first = leading_eigenvector(&covariance, None);
    let second = leading_eigenvector(&covariance, first.as_ref());
    let mut coords = Array2::zeros((samples, 2));
    for (axis, vector) in [first, second].into_iter().enumerate() {
        if let Some(vector) = vector {
            coords.column_mut(axis).assign(&centered.dot(&vector));
        }
    }

    let anchor: Vec<usize> = if forget_flags.iter().any(|&flag| flag) {
        forget_flags
            .iter()
            .enumerate()
            .filter_map(|(row, &flag)| flag.then_some(row))
            .collect()
    } else {
        predicted
            .iter()
            .enumerate()
            .filter_map(|(row, &pred)| (pred == forget_class).then_some(row))
            .collect()
    };
    if !anchor.is_empty() {
        let centroid = coords.select(Axis(0), &anchor).mean_axis(Axis(0));
        if let Some(centroid) = centroid {
            for axis in 0..2 {
                if centroid[axis] < 0.0 {
                    coords.column_mut(axis).mapv_inplace(|value| -value);
                }
            }
        }
    }

    let extent = coords.iter().fold(0.0_f64, |acc, value| acc.max(value.abs()));
    if extent > 0.0 {
        coords.mapv_inplace(|value| value / extent * EMBEDDING_EXTENT);
    }
    coords
}

/// Power iteration with optional deflation against `exclude`; `None` when the spectrum is flat.
fn leading_eigenvector(
    matrix: &Array2<f64>,
    exclude: Option<&Array1<f64>>,
) -> Option<Array1<f64>> {
    let dim = matrix.nrows();
    if dim == 0 {
        return None;
    }
    let mut deflated = matrix.clone();
    if let Some(previous) = exclude {
        let eigenvalue = previous.dot(&matrix.dot(previous));
        for row in 0..dim {
            for col in 0..dim {
                deflated[[row, col]] -= eigenvalue * previous[row] * previous[col];
            }
        }
    }
    let mut vector = Array1::from_shape_fn(dim, |i| 1.0 + (i as f64 + 1.0).sqrt() * 1e-3);
    normalise(&mut vector)?;
    for _ in 0..POWER_ITERATIONS {
        let mut next = deflated.dot(&vector);
        if normalise(&mut next).is_none() {
            return None;
        }
        vector = next;
    }
    Some(vector)
}

fn normalise(vector: &mut Array1<f64>) -> Option<()> {
    let norm = vector.dot(vector).sqrt();
    if norm <= 1e-12 || !norm.is_finite() {
        return None;
    }
    vector.mapv_inplace(|value| value / norm);
    Some(())
}
