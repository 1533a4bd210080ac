//! Labeled datasets, forget/retain partitions, and seeded mini-batch loading.

use std::{fs, path::Path, sync::Arc};

use ndarray::{Array2, Axis};
use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or loading datasets.
#[derive(Debug, Error)]
pub enum DataError {
    /// Feature rows and labels disagree in length.
    #[error("dataset `{name}` has {rows} feature rows but {labels} labels")]
    LengthMismatch {
        /// Dataset name.
        name: String,
        /// Feature rows.
        rows: usize,
        /// Labels.
        labels: usize,
    },
    /// A label falls outside the class range.
    #[error("dataset `{name}` contains label {label} but only {num_classes} classes")]
    LabelOutOfRange {
        /// Dataset name.
        name: String,
        /// Offending label.
        label: usize,
        /// Declared class count.
        num_classes: usize,
    },
    /// Train and test splits disagree on feature width or class count.
    #[error("train/test splits are inconsistent: {0}")]
    SplitMismatch(String),
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parsing failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Immutable feature matrix with integer labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledDataset {
    /// Split name (`train`, `test`, ...).
    pub name: String,
    /// Number of classes labels are drawn from.
    pub num_classes: usize,
    /// One row per sample.
    pub features: Array2<f32>,
    /// Label per sample.
    pub labels: Vec<usize>,
}

impl LabeledDataset {
    /// Validates and wraps a feature matrix.
    pub fn new(
        name: impl Into<String>,
        num_classes: usize,
        features: Array2<f32>,
        labels: Vec<usize>,
    ) -> Result<Self, DataError> {
        let dataset = Self {
            name: name.into(),
            num_classes,
            features,
            labels,
        };
        dataset.validate()?;
        Ok(dataset)
    }

    fn validate(&self) -> Result<(), DataError> {
        if self.features.nrows() != self.labels.len() {
            return Err(DataError::LengthMismatch {
                name: self.name.clone(),
                rows: self.features.nrows(),
                labels: self.labels.len(),
            });
        }
        if let Some(&label) = self.labels.iter().find(|&&l| l >= self.num_classes) {
            return Err(DataError::LabelOutOfRange {
                name: self.name.clone(),
                label,
                num_classes: self.num_classes,
            });
        }
        Ok(())
    }

    /// Gaussian blobs around random class centres.
    #[must_use]
    pub fn synthetic(
        name: impl Into<String>,
        num_classes: usize,
        per_class: usize,
        feature_dim: usize,
        noise: f32,
        seed: u64,
    ) -> Self {
        let centres = class_centres(num_classes, feature_dim, seed);
        Self::around_centres(name, &centres, per_class, noise, seed.wrapping_add(1))
    }

    /// Samples `per_class` points around each row of `centres`.
    #[must_use]
    pub fn around_centres(
        name: impl Into<String>,
        centres: &Array2<f32>,
        per_class: usize,
        noise: f32,
        seed: u64,
    ) -> Self {
        let (num_classes, feature_dim) = centres.dim();
        let mut rng = SmallRng::seed_from_u64(seed);
        let total = num_classes * per_class;
        let labels: Vec<usize> = (0..total).map(|i| i % num_classes.max(1)).collect();
        let mut features = Array2::zeros((total, feature_dim));
        for (row, &label) in labels.iter().enumerate() {
            for col in 0..feature_dim {
                features[[row, col]] = centres[[label, col]] + noise * gaussian(&mut rng);
            }
        }
        Self {
            name: name.into(),
            num_classes,
            features,
            labels,
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True when the dataset holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Width of each feature row.
    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.features.ncols()
    }

    /// Indices of every sample of `class`, in dataset order.
    #[must_use]
    pub fn class_indices(&self, class: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(index, &label)| (label == class).then_some(index))
            .collect()
    }

    /// Copies the selected rows and labels.
    #[must_use]
    pub fn gather(&self, indices: &[usize]) -> (Array2<f32>, Vec<usize>) {
        let features = self.features.select(Axis(0), indices);
        let labels = indices.iter().map(|&index| self.labels[index]).collect();
        (features, labels)
    }
}

fn class_centres(num_classes: usize, feature_dim: usize, seed: u64) -> Array2<f32> {
    let mut rng = SmallRng::seed_from_u64(seed);
    Array2::from_shape_fn((num_classes, feature_dim), |_| rng.gen_range(-2.0_f32..2.0))
}

fn gaussian(rng: &mut SmallRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

/// Train and test splits stored together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetBundle {
    /// Training split.
    pub train: Arc<LabeledDataset>,
    /// Held-out split.
    pub test: Arc<LabeledDataset>,
}

impl DatasetBundle {
    /// Pairs two splits after checking they agree.
    pub fn new(train: LabeledDataset, test: LabeledDataset) -> Result<Self, DataError> {
        if train.num_classes != test.num_classes {
            return Err(DataError::SplitMismatch(format!(
                "{} vs {} classes",
                train.num_classes, test.num_classes
            )));
        }
        if train.feature_dim() != test.feature_dim() && !test.is_empty() && !train.is_empty() {
            return Err(DataError::SplitMismatch(format!(
                "{} vs {} features",
                train.feature_dim(),
                test.feature_dim()
            )));
        }
        Ok(Self {
            train: Arc::new(train),
            test: Arc::new(test),
        })
    }

    /// Synthetic train/test pair sharing class centres.
    #[must_use]
    pub fn synthetic(
        num_classes: usize,
        train_per_class: usize,
        test_per_class: usize,
        feature_dim: usize,
        noise: f32,
        seed: u64,
    ) -> Self {
        let centres = class_centres(num_classes, feature_dim, seed);
        let train = LabeledDataset::around_centres(
            "train",
            &centres,
            train_per_class,
            noise,
            seed.wrapping_add(1),
        );
        let test = LabeledDataset::around_centres(
            "test",
            &centres,
            test_per_class,
            noise,
            seed.wrapping_add(2),
        );
        Self {
            train: Arc::new(train),
            test: Arc::new(test),
        }
    }

    /// Number of classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.train.num_classes
    }

    /// Loads a bundle written by [`DatasetBundle::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DataError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let bundle: Self = serde_json::from_str(&contents)?;
        bundle.train.validate()?;
        bundle.test.validate()?;
        Ok(bundle)
    }

    /// Writes the bundle as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DataError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }
}

/// Which slice of a dataset a partition covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// Every sample.
    Full,
    /// Samples outside the forget class.
    Retain(usize),
    /// Samples of the forget class.
    Forget(usize),
    /// Explicit index list.
    Subset,
}

/// Immutable index view over a shared dataset.
#[derive(Debug, Clone)]
pub struct Partition {
    source: Arc<LabeledDataset>,
    indices: Arc<[usize]>,
    kind: PartitionKind,
}

impl Partition {
    /// All samples.
    #[must_use]
    pub fn full(source: &Arc<LabeledDataset>) -> Self {
        Self {
            source: Arc::clone(source),
            indices: (0..source.len()).collect(),
            kind: PartitionKind::Full,
        }
    }

    /// Samples whose label differs from `forget_class`.
    #[must_use]
    pub fn retain(source: &Arc<LabeledDataset>, forget_class: usize) -> Self {
        Self {
            source: Arc::clone(source),
            indices: source
                .labels
                .iter()
                .enumerate()
                .filter_map(|(index, &label)| (label != forget_class).then_some(index))
                .collect(),
            kind: PartitionKind::Retain(forget_class),
        }
    }

    /// Samples labeled `forget_class`.
    #[must_use]
    pub fn forget(source: &Arc<LabeledDataset>, forget_class: usize) -> Self {
        Self {
            source: Arc::clone(source),
            indices: source.class_indices(forget_class).into(),
            kind: PartitionKind::Forget(forget_class),
        }
    }

    /// Explicit indices into `source`.
    #[must_use]
    pub fn subset(source: &Arc<LabeledDataset>, indices: Vec<usize>) -> Self {
        Self {
            source: Arc::clone(source),
            indices: indices.into(),
            kind: PartitionKind::Subset,
        }
    }

    /// First `limit` samples of this partition.
    #[must_use]
    pub fn take(&self, limit: usize) -> Self {
        let kept = self.indices.iter().copied().take(limit).collect::<Vec<_>>();
        Self {
            source: Arc::clone(&self.source),
            indices: kept.into(),
            kind: PartitionKind::Subset,
        }
    }

    /// Up to `limit` samples drawn by a seeded permutation.
    #[must_use]
    pub fn sample(&self, limit: usize, seed: u64) -> Self {
        let mut order = self.indices.to_vec();
        order.shuffle(&mut SmallRng::seed_from_u64(seed));
        order.truncate(limit);
        Self {
            source: Arc::clone(&self.source),
            indices: order.into(),
            kind: PartitionKind::Subset,
        }
    }

    /// Underlying dataset.
    #[must_use]
    pub fn source(&self) -> &Arc<LabeledDataset> {
        &self.source
    }

    /// Dataset indices covered.
    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Partition flavour.
    #[must_use]
    pub const fn kind(&self) -> PartitionKind {
        self.kind
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// True when no samples are covered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Labels in partition order.
    #[must_use]
    pub fn labels(&self) -> Vec<usize> {
        self.indices
            .iter()
            .map(|&index| self.source.labels[index])
            .collect()
    }

    /// Mini-batch loader over this partition.
    #[must_use]
    pub fn loader(&self, batch_size: usize, shuffle: bool, seed: u64) -> DataLoader {
        DataLoader::new(self.clone(), batch_size, shuffle, seed)
    }
}

/// Mini-batch of gathered samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Dataset indices of the rows.
    pub indices: Vec<usize>,
    /// Feature rows.
    pub inputs: Array2<f32>,
    /// Labels.
    pub labels: Vec<usize>,
}

/// Mini-batch loader; reshuffles every epoch when enabled.
#[derive(Debug)]
pub struct DataLoader {
    partition: Partition,
    batch_size: usize,
    shuffle: bool,
    rng: SmallRng,
}

impl DataLoader {
    /// Creates a loader. A zero batch size is treated as one.
    #[must_use]
    pub fn new(partition: Partition, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            partition,
            batch_size: batch_size.max(1),
            shuffle,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Partition being iterated.
    #[must_use]
    pub const fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Batch size.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.partition.len().div_ceil(self.batch_size)
    }

    /// Starts a new epoch.
    pub fn epoch(&mut self) -> Batches {
        let mut order = self.partition.indices.to_vec();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        Batches {
            source: Arc::clone(&self.partition.source),
            order,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

/// One epoch of batches.
#[derive(Debug)]
pub struct Batches {
    source: Arc<LabeledDataset>,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for Batches {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        let (inputs, labels) = self.source.gather(&indices);
        Some(Batch {
            indices,
            inputs,
            labels,
        })
    }
}

/// Fixed, class-balanced subset: `data_size / num_classes` samples per class.
#[must_use]
pub fn balanced_subset(source: &Arc<LabeledDataset>, data_size: usize, seed: u64) -> Partition {
    let classes = source.num_classes.max(1);
    let per_class = data_size / classes;
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut indices = Vec::with_capacity(per_class * classes);
    for class in 0..classes {
        let mut members = source.class_indices(class);
        members.shuffle(&mut rng);
        members.truncate(per_class);
        indices.extend(members);
    }
    Partition::subset(source, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dataset() -> Arc<LabeledDataset> {
        Arc::new(LabeledDataset::synthetic("train", 4, 10, 3, 0.1, 7))
    }

    #[test]
    fn partitions_split_on_forget_class() {
        let data = dataset();
        let retain = Partition::retain(&data, 2);
        let forget = Partition::forget(&data, 2);
        assert_eq!(retain.len() + forget.len(), data.len());
        assert!(retain.labels().iter().all(|&label| label != 2));
        assert!(forget.labels().iter().all(|&label| label == 2));
    }

    #[test]
    fn loader_covers_every_sample_once() {
        let data = dataset();
        let mut loader = Partition::full(&data).loader(7, true, 3);
        let mut seen: Vec<usize> = loader.epoch().flat_map(|batch| batch.indices).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..data.len()).collect::<Vec<_>>());
        assert_eq!(loader.num_batches(), 6);
    }

    #[test]
    fn shuffling_is_seeded() {
        let data = dataset();
        let order = |seed| {
            Partition::full(&data)
                .loader(40, true, seed)
                .epoch()
                .next()
                .map(|batch| batch.indices)
                .unwrap()
        };
        assert_eq!(order(5), order(5));
        assert_ne!(order(5), order(6));
    }

    #[test]
    fn empty_partition_yields_no_batches() {
        let data = dataset();
        let mut loader = Partition::forget(&data, 9).loader(8, false, 0);
        assert_eq!(loader.epoch().count(), 0);
        assert_eq!(loader.num_batches(), 0);
    }

    #[test]
    fn balanced_subset_draws_per_class() {
        let data = dataset();
        let subset = balanced_subset(&data, 20, 42);
        assert_eq!(subset.len(), 20);
        for class in 0..4 {
            assert_eq!(subset.labels().iter().filter(|&&l| l == class).count(), 5);
        }
        assert_eq!(balanced_subset(&data, 20, 42).indices(), subset.indices());
    }

    #[test]
    fn rejects_labels_outside_range() {
        let err = LabeledDataset::new("bad", 2, Array2::zeros((1, 2)), vec![5]).unwrap_err();
        assert!(matches!(err, DataError::LabelOutOfRange { label: 5, .. }));
    }

    #[test]
    fn bundle_round_trips_through_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        let bundle = DatasetBundle::synthetic(3, 4, 2, 2, 0.2, 1);
        bundle.save(&path).unwrap();
        let loaded = DatasetBundle::load(&path).unwrap();
        assert_eq!(loaded.train.labels, bundle.train.labels);
        assert_eq!(loaded.test.len(), 6);
    }
}
