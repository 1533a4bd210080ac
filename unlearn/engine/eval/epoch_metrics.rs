use std::{
    fmt::Write as _,
    fs,
    path::Path,
    time::{Duration, Instant},
};

use indexmap::IndexMap;

use super::{
    attack::{forget_quality, sample_features, SampleFeatures},
    evaluator::{collect_activations, evaluate},
    round_to,
};
use crate::{
    data::{DatasetBundle, Partition},
    error::EngineResult,
    model::{loss::CrossEntropyLoss, Classifier},
    settings::{AttackSettings, Settings},
};

/// Series keys, in record order.
pub const EPOCH_METRIC_KEYS: [&str; 7] = ["UA", "RA", "TUA", "TRA", "PS", "C-MIA", "E-MIA"];

/// Metrics observed after one epoch (or before the first).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetricsSnapshot {
    /// Forget-class train accuracy.
    pub ua: f64,
    /// Mean remaining-class train accuracy.
    pub ra: f64,
    /// Forget-class test accuracy.
    pub tua: f64,
    /// Mean remaining-class test accuracy.
    pub tra: f64,
    /// Privacy score.
    pub ps: f64,
    /// Forget samples flagged as members by the confidence classifier.
    pub c_mia: f64,
    /// Forget samples flagged as members by the entropy classifier.
    pub e_mia: f64,
}

impl EpochMetricsSnapshot {
    fn values(&self) -> [f64; 7] {
        [
            self.ua, self.ra, self.tua, self.tra, self.ps, self.c_mia, self.e_mia,
        ]
    }
}

/// Append-only per-epoch series keyed by [`EPOCH_METRIC_KEYS`].
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetricsSeries {
    series: IndexMap<String, Vec<f64>>,
}

impl Default for EpochMetricsSeries {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochMetricsSeries {
    /// Empty series with every key present.
    #[must_use]
    pub fn new() -> Self {
        Self {
            series: EPOCH_METRIC_KEYS
                .iter()
                .map(|key| ((*key).to_string(), Vec::new()))
                .collect(),
        }
    }

    /// Appends one value per key.
    pub fn push(&mut self, snapshot: &EpochMetricsSnapshot) {
        for (values, value) in self.series.values_mut().zip(snapshot.values()) {
            values.push(value);
        }
    }

    /// Entries per key.
    #[must_use]
    pub fn len(&self) -> usize {
        self.series.get("UA").map_or(0, Vec::len)
    }

    /// True before the baseline is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values of one key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.series.get(key).map(Vec::as_slice)
    }

    /// Ordered map with every value rounded to 3 decimals.
    #[must_use]
    pub fn rounded(&self) -> IndexMap<String, Vec<f64>> {
        self.series
            .iter()
            .map(|(key, values)| {
                (
                    key.clone(),
                    values.iter().map(|&value| round_to(value, 3)).collect(),
                )
            })
            .collect()
    }

    /// Writes an `epoch,UA,RA,...` table.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        let mut out = String::from("epoch");
        for key in self.series.keys() {
            out.push(',');
            out.push_str(key);
        }
        out.push('\n');
        for epoch in 0..self.len() {
            out.push_str(&epoch.to_string());
            for values in self.series.values() {
                let _ = write!(out, ",{:.3}", values.get(epoch).copied().unwrap_or(0.0));
            }
            out.push('\n');
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, out)?;
        Ok(())
    }
}

/// One-feature logistic regression fitted by gradient descent on standardised inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogisticModel {
    weight: f64,
    bias: f64,
    mean: f64,
    scale: f64,
}

impl LogisticModel {
    const STEPS: usize = 300;
    const LEARNING_RATE: f64 = 0.5;

    /// Fits `P(member | x)`; members are labeled 1.
    #[must_use]
    pub fn fit(members: &[f64], non_members: &[f64]) -> Self {
        let all: Vec<f64> = members.iter().chain(non_members).copied().collect();
        let count = all.len().max(1) as f64;
        let mean = all.iter().sum::<f64>() / count;
        let variance = all.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count;
        let scale = if variance > 1e-12 { variance.sqrt() } else { 1.0 };
        let mut model = Self {
            weight: 0.0,
            bias: 0.0,
            mean,
            scale,
        };
        if members.is_empty() || non_members.is_empty() {
            model.bias = if members.is_empty() { -1.0 } else { 1.0 };
            return model;
        }
        let samples: Vec<(f64, f64)> = members
            .iter()
            .map(|&x| ((x - mean) / scale, 1.0))
            .chain(non_members.iter().map(|&x| ((x - mean) / scale, 0.0)))
            .collect();
        for _ in 0..Self::STEPS {
            let (mut grad_w, mut grad_b) = (0.0, 0.0);
            for &(x, y) in &samples {
                let error = sigmoid(model.weight * x + model.bias) - y;
                grad_w += error * x;
                grad_b += error;
            }
            model.weight -= Self::LEARNING_RATE * grad_w / count;
            model.bias -= Self::LEARNING_RATE * grad_b / count;
        }
        model
    }

    /// Membership probability.
    #[must_use]
    pub fn probability(&self, x: f64) -> f64 {
        sigmoid(self.weight * (x - self.mean) / self.scale + self.bias)
    }

    /// True when `x` is classified as a member.
    #[must_use]
    pub fn is_member(&self, x: f64) -> bool {
        self.probability(x) >= 0.5
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Confidence- and entropy-based membership classifiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MiaClassifier {
    /// Classifier on the confidence feature.
    pub confidence: LogisticModel,
    /// Classifier on the entropy feature.
    pub entropy: LogisticModel,
}

impl MiaClassifier {
    /// Fits both classifiers.
    #[must_use]
    pub fn fit(members: &[SampleFeatures], non_members: &[SampleFeatures]) -> Self {
        let pick = |samples: &[SampleFeatures], f: fn(&SampleFeatures) -> f64| {
            samples.iter().map(f).collect::<Vec<_>>()
        };
        Self {
            confidence: LogisticModel::fit(
                &pick(members, |s| s.confidence),
                &pick(non_members, |s| s.confidence),
            ),
            entropy: LogisticModel::fit(
                &pick(members, |s| s.entropy),
                &pick(non_members, |s| s.entropy),
            ),
        }
    }

    /// Fractions of `samples` flagged as members by (confidence, entropy).
    #[must_use]
    pub fn member_rates(&self, samples: &[SampleFeatures]) -> (f64, f64) {
        if samples.is_empty() {
            return (0.0, 0.0);
        }
        let total = samples.len() as f64;
        let confidence = samples
            .iter()
            .filter(|s| self.confidence.is_member(s.confidence))
            .count() as f64;
        let entropy = samples
            .iter()
            .filter(|s| self.entropy.is_member(s.entropy))
            .count() as f64;
        (confidence / total, entropy / total)
    }
}

/// Collects [`EpochMetricsSnapshot`]s for one job and times itself.
#[derive(Debug)]
pub struct EpochMetricsAggregator {
    forget_class: usize,
    batch_size: usize,
    attack: AttackSettings,
    criterion: CrossEntropyLoss,
    train: Partition,
    test: Partition,
    forget_probe: Partition,
    privacy_probe: Partition,
    mia: MiaClassifier,
    series: EpochMetricsSeries,
    elapsed: Duration,
}

impl EpochMetricsAggregator {
    /// Builds probes and fits the membership classifiers on `model`.
    pub fn initialize(
        model: &dyn Classifier,
        datasets: &DatasetBundle,
        forget_class: usize,
        settings: &Settings,
        batch_size: usize,
    ) -> EngineResult<Self> {
        let started = Instant::now();
        let cap = settings.epoch_metrics.mia_samples.max(1);
        let seed = settings.training.seed;
        let members = Partition::retain(&datasets.train, forget_class).sample(cap, seed);
        let non_members = Partition::retain(&datasets.test, forget_class).sample(cap, seed ^ 1);
        let forget_probe = Partition::forget(&datasets.train, forget_class).sample(cap, seed ^ 2);
        let mut privacy_indices = members.indices().to_vec();
        privacy_indices.extend_from_slice(forget_probe.indices());
        let privacy_probe = Partition::subset(&datasets.train, privacy_indices);

        let attack = settings.attack.clone();
        let features = |partition: &Partition| -> EngineResult<Vec<SampleFeatures>> {
            let acts = collect_activations(model, partition, batch_size)?;
            Ok(sample_features(acts.logits(), &acts.labels, &attack))
        };
        let mia = MiaClassifier::fit(&features(&members)?, &features(&non_members)?);
        Ok(Self {
            forget_class,
            batch_size,
            attack: settings.attack.clone(),
            criterion: CrossEntropyLoss,
            train: Partition::full(&datasets.train),
            test: Partition::full(&datasets.test),
            forget_probe,
            privacy_probe,
            mia,
            series: EpochMetricsSeries::new(),
            elapsed: started.elapsed(),
        })
    }

    /// Measures `model` after `epoch` (0 for the baseline) and appends the snapshot.
    pub fn collect(
        &mut self,
        model: &dyn Classifier,
        epoch: usize,
    ) -> EngineResult<EpochMetricsSnapshot> {
        let started = Instant::now();
        let train = evaluate(model, &self.train, self.batch_size, &self.criterion)?;
        let test = evaluate(model, &self.test, self.batch_size, &self.criterion)?;

        let privacy = collect_activations(model, &self.privacy_probe, self.batch_size)?;
        let flagged: Vec<(bool, SampleFeatures)> = privacy
            .labels
            .iter()
            .map(|&label| label == self.forget_class)
            .zip(sample_features(privacy.logits(), &privacy.labels, &self.attack))
            .collect();
        let (_, ps) = forget_quality(&flagged, self.attack.thresholds);

        let probe = collect_activations(model, &self.forget_probe, self.batch_size)?;
        let probe_features = sample_features(probe.logits(), &probe.labels, &self.attack);
        let (c_mia, e_mia) = self.mia.member_rates(&probe_features);

        let snapshot = EpochMetricsSnapshot {
            ua: train.class_accuracy(self.forget_class),
            ra: train.remaining_accuracy(self.forget_class),
            tua: test.class_accuracy(self.forget_class),
            tra: test.remaining_accuracy(self.forget_class),
            ps,
            c_mia,
            e_mia,
        };
        self.series.push(&snapshot);
        self.elapsed += started.elapsed();
        tracing::debug!(
            epoch,
            ua = snapshot.ua,
            ra = snapshot.ra,
            ps = snapshot.ps,
            "epoch metrics collected"
        );
        Ok(snapshot)
    }

    /// Series collected so far.
    #[must_use]
    pub const fn series(&self) -> &EpochMetricsSeries {
        &self.series
    }

    /// Consumes the aggregator, returning its series.
    #[must_use]
    pub fn into_series(self) -> EpochMetricsSeries {
        self.series
    }

    /// Wall time spent inside the aggregator.
    #[must_use]
    pub const fn time_spent(&self) -> Duration {
        self.elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MlpClassifier;
    use tempfile::tempdir;

    fn snapshot(seed: f64) -> EpochMetricsSnapshot {
        EpochMetricsSnapshot {
            ua: seed,
            ra: 0.9,
            tua: seed / 2.0,
            tra: 0.85,
            ps: 0.4,
            c_mia: 0.3,
            e_mia: 0.2,
        }
    }

    #[test]
    fn series_keeps_key_order() {
        let mut series = EpochMetricsSeries::new();
        series.push(&snapshot(0.12345));
        let rounded = series.rounded();
        let keys: Vec<&str> = rounded.keys().map(String::as_str).collect();
        assert_eq!(keys, EPOCH_METRIC_KEYS.to_vec());
        assert!((rounded["UA"][0] - 0.123).abs() < 1e-12);
    }

    #[test]
    fn csv_has_row_per_entry() {
        let dir = tempdir().unwrap();
        let mut series = EpochMetricsSeries::new();
        series.push(&snapshot(1.0));
        series.push(&snapshot(0.5));
        let path = dir.path().join("3/abcd_epoch_metrics.csv");
        series.write_csv(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "epoch,UA,RA,TUA,TRA,PS,C-MIA,E-MIA");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("1,0.500"));
    }

    #[test]
    fn logistic_model_separates_clusters() {
        let members = [5.0, 6.0, 5.5, 6.5];
        let others = [-1.0, 0.0, -0.5, 0.5];
        let model = LogisticModel::fit(&members, &others);
        assert!(model.is_member(6.0));
        assert!(!model.is_member(-1.0));
    }

    #[test]
    fn aggregator_appends_baseline_and_epochs() {
        let bundle = DatasetBundle::synthetic(3, 15, 8, 4, 0.3, 4);
        let model = MlpClassifier::new(4, &[6], 3, 1);
        let mut settings = Settings::default();
        settings.epoch_metrics.mia_samples = 20;
        let mut aggregator =
            EpochMetricsAggregator::initialize(&model, &bundle, 1, &settings, 16).unwrap();
        for epoch in 0..3 {
            let snap = aggregator.collect(&model, epoch).unwrap();
            assert!((0.0..=1.0).contains(&snap.ps));
            assert!((0.0..=1.0).contains(&snap.c_mia));
        }
        assert_eq!(aggregator.series().len(), 3);
        assert!(aggregator.time_spent() > Duration::ZERO);
    }
}
