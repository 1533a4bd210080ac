//! Post-training and per-epoch diagnostics.

/// Threshold membership attack and forgetting quality.
pub mod attack;
/// Two-dimensional embedding of penultimate activations.
pub mod embedding;
/// Per-epoch metric series.
pub mod epoch_metrics;
/// Accuracy, loss, and prediction distributions.
pub mod evaluator;
/// Linear CKA between two models.
pub mod similarity;

/// Rounds half away from zero to `places` decimals.
#[must_use]
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10_f64.powi(places);
    (value * factor).round() / factor
}

/// Mean of `values`, or zero when empty.
#[must_use]
pub fn mean_or_zero(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0_usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_half_away_from_zero() {
        assert!((round_to(0.8325, 3) - 0.833).abs() < 1e-12);
        assert!((round_to(-1.005, 1) + 1.0).abs() < 1e-12);
        assert!((round_to(3.14159, 2) - 3.14).abs() < 1e-12);
    }

    #[test]
    fn mean_of_nothing_is_zero() {
        assert!(mean_or_zero(Vec::new()).abs() < f64::EPSILON);
        assert!((mean_or_zero([1.0, 2.0]) - 1.5).abs() < f64::EPSILON);
    }
}
