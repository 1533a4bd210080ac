//! Result records: assembly, identifiers, and JSON storage.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Local;
use indexmap::IndexMap;
use ndarray::Array2;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::{
    error::{EngineError, EngineResult},
    eval::{
        attack::{AttackReport, AttackResults, AttackValue},
        epoch_metrics::EpochMetricsSeries,
        evaluator::{ActivationSet, EvaluationReport},
        round_to,
        similarity::CkaReport,
    },
    request::UnlearningRequest,
};

/// Value of the record's `Type` field.
pub const RECORD_TYPE: &str = "Unlearned";

/// Mean of forgetting on both splits and retention on both splits, 3 decimals.
#[must_use]
pub fn privacy_accuracy(ua: f64, tua: f64, ra: f64, tra: f64) -> f64 {
    round_to(((1.0 - ua) + (1.0 - tua) + ra + tra) / 4.0, 3)
}

/// Sparse `{"class": p}` map keeping probabilities of at least 0.001.
#[must_use]
pub fn compress_prob_array(probs: &[f32]) -> IndexMap<String, f64> {
    probs
        .iter()
        .enumerate()
        .filter(|&(_, &p)| p >= 0.001)
        .map(|(class, &p)| (class.to_string(), round_to(f64::from(p), 3)))
        .collect()
}

/// One embedding sample, serialized as `[gt, pred, img, forget, x, y, probs]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingPoint {
    /// Ground-truth class.
    pub gt: usize,
    /// Predicted class.
    pub pred: usize,
    /// Dataset index.
    pub img: usize,
    /// 1 for forget-class samples.
    pub forget: u8,
    /// First coordinate, 2 decimals.
    pub x: f64,
    /// Second coordinate, 2 decimals.
    pub y: f64,
    /// Compressed softmax output.
    pub probs: IndexMap<String, f64>,
}

type PointTuple = (usize, usize, usize, u8, f64, f64, IndexMap<String, f64>);

impl Serialize for EmbeddingPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            self.gt,
            self.pred,
            self.img,
            self.forget,
            self.x,
            self.y,
            &self.probs,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EmbeddingPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (gt, pred, img, forget, x, y, probs) = <PointTuple>::deserialize(deserializer)?;
        Ok(Self {
            gt,
            pred,
            img,
            forget,
            x,
            y,
            probs,
        })
    }
}

/// Pairs collected activations with their 2-D coordinates.
#[must_use]
pub fn embedding_points(
    activations: &ActivationSet,
    coords: &Array2<f64>,
    forget_class: usize,
) -> Vec<EmbeddingPoint> {
    activations
        .indices
        .iter()
        .enumerate()
        .map(|(row, &img)| {
            let gt = activations.labels[row];
            let probs = activations.probabilities.row(row).to_vec();
            EmbeddingPoint {
                gt,
                pred: activations.predictions[row],
                img,
                forget: u8::from(gt == forget_class),
                x: round_to(coords.get([row, 0]).copied().unwrap_or(0.0), 2),
                y: round_to(coords.get([row, 1]).copied().unwrap_or(0.0), 2),
                probs: compress_prob_array(&probs),
            }
        })
        .collect()
}

/// Attack section of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackSection {
    /// Per-sample features.
    pub values: Vec<AttackValue>,
    /// Threshold sweeps.
    pub results: AttackResults,
}

/// Persisted outcome of one completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Local creation time, `%Y-%m-%d %H:%M:%S`.
    #[serde(rename = "CreatedAt")]
    pub created_at: String,
    /// Four hex characters.
    #[serde(rename = "ID")]
    pub id: String,
    /// Forget class.
    #[serde(rename = "FC")]
    pub forget_class: usize,
    /// Always [`RECORD_TYPE`].
    #[serde(rename = "Type")]
    pub record_type: String,
    /// Stem of the base checkpoint.
    #[serde(rename = "Base")]
    pub base: String,
    /// Method tag.
    #[serde(rename = "Method")]
    pub method: String,
    /// Epochs run.
    #[serde(rename = "Epoch")]
    pub epochs: usize,
    /// Batch size.
    #[serde(rename = "BS")]
    pub batch_size: usize,
    /// Base learning rate.
    #[serde(rename = "LR")]
    pub learning_rate: f64,
    /// Forget-class train accuracy.
    #[serde(rename = "UA")]
    pub ua: f64,
    /// Remaining-class train accuracy.
    #[serde(rename = "RA")]
    pub ra: f64,
    /// Forget-class test accuracy.
    #[serde(rename = "TUA")]
    pub tua: f64,
    /// Remaining-class test accuracy.
    #[serde(rename = "TRA")]
    pub tra: f64,
    /// Privacy accuracy.
    #[serde(rename = "PA")]
    pub pa: f64,
    /// Unlearning runtime in seconds, excluding epoch diagnostics.
    #[serde(rename = "RTE")]
    pub rte: f64,
    /// Forgetting quality score.
    #[serde(rename = "FQS")]
    pub fqs: f64,
    /// Train per-class accuracies.
    pub accs: Vec<f64>,
    /// Train prediction fractions.
    pub label_dist: IndexMap<String, Vec<f64>>,
    /// Train mean probabilities.
    pub conf_dist: IndexMap<String, Vec<f64>>,
    /// Test per-class accuracies.
    pub t_accs: Vec<f64>,
    /// Test prediction fractions.
    pub t_label_dist: IndexMap<String, Vec<f64>>,
    /// Test mean probabilities.
    pub t_conf_dist: IndexMap<String, Vec<f64>>,
    /// Similarity to the model before unlearning.
    pub cka: CkaReport,
    /// Similarity to the retrained reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cka_retrain: Option<CkaReport>,
    /// Embedding points.
    pub points: Vec<EmbeddingPoint>,
    /// Membership attack.
    pub attack: AttackSection,
    /// Epoch metric table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch_plot_path: Option<String>,
    /// Epoch metric series.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch_metrics: Option<IndexMap<String, Vec<f64>>>,
}

impl ResultRecord {
    /// Headline view of the record.
    #[must_use]
    pub fn summary(&self, path: impl Into<PathBuf>) -> ResultSummary {
        ResultSummary {
            id: self.id.clone(),
            forget_class: self.forget_class,
            method: self.method.clone(),
            created_at: self.created_at.clone(),
            ua: self.ua,
            ra: self.ra,
            tua: self.tua,
            tra: self.tra,
            pa: self.pa,
            rte: self.rte,
            fqs: self.fqs,
            path: path.into(),
        }
    }
}

/// Headline metrics of a stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    /// Record id.
    pub id: String,
    /// Forget class.
    pub forget_class: usize,
    /// Method tag.
    pub method: String,
    /// Creation time.
    pub created_at: String,
    /// Forget-class train accuracy.
    pub ua: f64,
    /// Remaining-class train accuracy.
    pub ra: f64,
    /// Forget-class test accuracy.
    pub tua: f64,
    /// Remaining-class test accuracy.
    pub tra: f64,
    /// Privacy accuracy.
    pub pa: f64,
    /// Runtime in seconds.
    pub rte: f64,
    /// Forgetting quality score.
    pub fqs: f64,
    /// Record location.
    pub path: PathBuf,
}

/// Collects the sections of a [`ResultRecord`]; every method goes through it.
#[derive(Debug)]
pub struct ResultRecordBuilder {
    id: String,
    forget_class: usize,
    base: String,
    method: String,
    epochs: usize,
    batch_size: usize,
    learning_rate: f64,
    runtime: f64,
    train: Option<EvaluationReport>,
    test: Option<EvaluationReport>,
    cka: Option<CkaReport>,
    cka_retrain: Option<CkaReport>,
    points: Vec<EmbeddingPoint>,
    attack: Option<AttackReport>,
    epoch_metrics: Option<(String, EpochMetricsSeries)>,
}

impl ResultRecordBuilder {
    /// Starts a record for `request` under `id`.
    #[must_use]
    pub fn new(id: impl Into<String>, request: &UnlearningRequest) -> Self {
        Self {
            id: id.into(),
            forget_class: request.forget_class,
            base: request.base_stem(),
            method: request.method.tag().to_string(),
            epochs: request.epochs,
            batch_size: request.batch_size,
            learning_rate: round_to(f64::from(request.learning_rate), 6),
            runtime: 0.0,
            train: None,
            test: None,
            cka: None,
            cka_retrain: None,
            points: Vec::new(),
            attack: None,
            epoch_metrics: None,
        }
    }

    /// Unlearning runtime in seconds.
    #[must_use]
    pub fn runtime(mut self, seconds: f64) -> Self {
        self.runtime = seconds;
        self
    }

    /// Train-split evaluation.
    #[must_use]
    pub fn train(mut self, report: EvaluationReport) -> Self {
        self.train = Some(report);
        self
    }

    /// Test-split evaluation.
    #[must_use]
    pub fn test(mut self, report: EvaluationReport) -> Self {
        self.test = Some(report);
        self
    }

    /// Similarity sections.
    #[must_use]
    pub fn similarity(mut self, before: CkaReport, retrain: Option<CkaReport>) -> Self {
        self.cka = Some(before);
        self.cka_retrain = retrain;
        self
    }

    /// Embedding points.
    #[must_use]
    pub fn points(mut self, points: Vec<EmbeddingPoint>) -> Self {
        self.points = points;
        self
    }

    /// Attack output.
    #[must_use]
    pub fn attack(mut self, report: AttackReport) -> Self {
        self.attack = Some(report);
        self
    }

    /// Epoch metric series and the table written for it.
    #[must_use]
    pub fn epoch_metrics(mut self, plot_path: impl Into<String>, series: EpochMetricsSeries) -> Self {
        self.epoch_metrics = Some((plot_path.into(), series));
        self
    }

    /// Assembles the record, stamping the current local time.
    pub fn build(self) -> EngineResult<ResultRecord> {
        let fc = self.forget_class;
        let train = self.train.ok_or(EngineError::IncompleteRecord("train evaluation"))?;
        let test = self.test.ok_or(EngineError::IncompleteRecord("test evaluation"))?;
        let cka = self.cka.ok_or(EngineError::IncompleteRecord("cka"))?;
        let attack = self.attack.ok_or(EngineError::IncompleteRecord("attack"))?;

        let ua = round_to(train.class_accuracy(fc), 3);
        let ra = round_to(train.remaining_accuracy(fc), 3);
        let tua = round_to(test.class_accuracy(fc), 3);
        let tra = round_to(test.remaining_accuracy(fc), 3);
        let rounded = |values: Vec<f64>| values.into_iter().map(|v| round_to(v, 3)).collect();
        let (epoch_plot_path, epoch_metrics) = match self.epoch_metrics {
            Some((path, series)) => (Some(path), Some(series.rounded())),
            None => (None, None),
        };
        Ok(ResultRecord {
            created_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            id: self.id,
            forget_class: fc,
            record_type: RECORD_TYPE.to_string(),
            base: self.base,
            method: self.method,
            epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            ua,
            ra,
            tua,
            tra,
            pa: privacy_accuracy(ua, tua, ra, tra),
            rte: round_to(self.runtime, 1),
            fqs: attack.fqs,
            accs: rounded(train.accuracy_vector()),
            label_dist: train.label_dist.format(),
            conf_dist: train.conf_dist.format(),
            t_accs: rounded(test.accuracy_vector()),
            t_label_dist: test.label_dist.format(),
            t_conf_dist: test.conf_dist.format(),
            cka,
            cka_retrain: self.cka_retrain,
            points: self.points,
            attack: AttackSection {
                values: attack.values,
                results: attack.results,
            },
            epoch_plot_path,
            epoch_metrics,
        })
    }
}

/// Record files under `{data_dir}/{fc}/`.
#[derive(Debug, Clone)]
pub struct ResultStore {
    data_dir: PathBuf,
}

impl ResultStore {
    /// Store rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Directory of one forget class.
    #[must_use]
    pub fn class_dir(&self, forget_class: usize) -> PathBuf {
        self.data_dir.join(forget_class.to_string())
    }

    /// `{data_dir}/{fc}/{id}.json`.
    #[must_use]
    pub fn record_path(&self, forget_class: usize, id: &str) -> PathBuf {
        self.class_dir(forget_class).join(format!("{id}.json"))
    }

    /// `{data_dir}/{fc}/{id}_{suffix}`.
    #[must_use]
    pub fn artifact_path(&self, forget_class: usize, id: &str, suffix: &str) -> PathBuf {
        self.class_dir(forget_class).join(format!("{id}_{suffix}"))
    }

    /// Four hex characters not yet used under `forget_class`.
    #[must_use]
    pub fn fresh_id(&self, forget_class: usize) -> String {
        loop {
            let id = Uuid::new_v4().simple().to_string()[..4].to_string();
            if !self.record_path(forget_class, &id).exists() {
                return id;
            }
        }
    }

    /// Writes a new record; an existing record with the same id is never overwritten.
    pub fn save(&self, record: &ResultRecord) -> EngineResult<PathBuf> {
        let path = self.record_path(record.forget_class, &record.id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(&serde_json::to_vec_pretty(record)?)?;
        Ok(path)
    }

    /// Reads one record.
    pub fn load(&self, forget_class: usize, id: &str) -> EngineResult<ResultRecord> {
        read_record(&self.record_path(forget_class, id))
    }

    /// Summaries of every record for `forget_class`, oldest first.
    pub fn list(&self, forget_class: usize) -> EngineResult<Vec<ResultSummary>> {
        let dir = self.class_dir(forget_class);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .is_some_and(|stem| !stem.contains('_'));
            if !is_record {
                continue;
            }
            match read_record(&path) {
                Ok(record) => summaries.push(record.summary(path)),
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping unreadable record"),
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }
}

fn read_record(path: &Path) -> EngineResult<ResultRecord> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        eval::{evaluator::Distribution, similarity::CkaSplit},
        methods::MethodKind,
    };
    use tempfile::tempdir;

    fn report(accs: &[f64]) -> EvaluationReport {
        let classes = accs.len();
        EvaluationReport {
            loss: 0.5,
            accuracy: 0.5,
            class_accuracies: accs.iter().copied().enumerate().collect::<BTreeMap<_, _>>(),
            label_dist: Distribution {
                rows: vec![vec![1.0 / classes as f64; classes]; classes],
            },
            conf_dist: Distribution {
                rows: vec![vec![1.0 / classes as f64; classes]; classes],
            },
            samples: 10,
        }
    }

    fn cka() -> CkaReport {
        CkaReport {
            layers: vec!["dense_1".into(), "classifier".into()],
            train: CkaSplit {
                forget: vec![0.5, 0.4],
                other: vec![0.9, 0.95],
            },
            test: CkaSplit::default(),
        }
    }

    fn record(id: &str) -> ResultRecord {
        let request = UnlearningRequest::new(MethodKind::FineTuning, 1, "models/base_0000.json")
            .with_epochs(2);
        ResultRecordBuilder::new(id, &request)
            .runtime(12.345)
            .train(report(&[0.9, 0.2, 0.8]))
            .test(report(&[0.85, 0.25, 0.75]))
            .similarity(cka(), None)
            .attack(AttackReport {
                values: Vec::new(),
                results: AttackResults::default(),
                fqs: 0.41,
            })
            .build()
            .unwrap()
    }

    #[test]
    fn privacy_accuracy_rounds_half_up() {
        assert!((privacy_accuracy(0.2, 0.25, 0.9, 0.88) - 0.833).abs() < 1e-12);
    }

    #[test]
    fn compression_drops_negligible_classes() {
        let probs = compress_prob_array(&[0.9, 0.0004, 0.0996]);
        assert_eq!(probs.len(), 2);
        assert!((probs["0"] - 0.9).abs() < 1e-9);
        assert!((probs["2"] - 0.1).abs() < 1e-9);
    }

    #[test]
    fn builder_derives_headline_metrics() {
        let record = record("ab12");
        assert!((record.ua - 0.2).abs() < 1e-12);
        assert!((record.ra - 0.85).abs() < 1e-12);
        assert!((record.tua - 0.25).abs() < 1e-12);
        assert!((record.rte - 12.3).abs() < 1e-12);
        assert_eq!(record.method, "FineTuning");
        assert_eq!(record.base, "base_0000");
        assert_eq!(record.record_type, RECORD_TYPE);
        assert_eq!(record.accs.len(), 3);
    }

    #[test]
    fn incomplete_builder_is_rejected() {
        let request = UnlearningRequest::new(MethodKind::GradientAscent, 0, "b.json");
        let err = ResultRecordBuilder::new("0000", &request).build().unwrap_err();
        assert!(matches!(err, EngineError::IncompleteRecord(_)));
    }

    #[test]
    fn serialized_keys_follow_record_layout() {
        let text = serde_json::to_string_pretty(&record("ab12")).unwrap();
        let order = [
            "\"CreatedAt\"", "\"ID\"", "\"FC\"", "\"Type\"", "\"Base\"", "\"Method\"",
            "\"Epoch\"", "\"BS\"", "\"LR\"", "\"UA\"", "\"RA\"", "\"TUA\"", "\"TRA\"",
            "\"PA\"", "\"RTE\"", "\"FQS\"", "\"accs\"", "\"label_dist\"", "\"conf_dist\"",
            "\"t_accs\"", "\"t_label_dist\"", "\"t_conf_dist\"", "\"cka\"", "\"points\"",
            "\"attack\"",
        ];
        let positions: Vec<usize> = order.iter().map(|key| text.find(key).unwrap()).collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(!text.contains("cka_retrain"));
        assert!(!text.contains("epoch_metrics"));
    }

    #[test]
    fn points_serialize_as_tuples() {
        let point = EmbeddingPoint {
            gt: 3,
            pred: 1,
            img: 42,
            forget: 1,
            x: 1.25,
            y: -3.5,
            probs: compress_prob_array(&[0.2, 0.8]),
        };
        let value = serde_json::to_value(&point).unwrap();
        assert_eq!(value, serde_json::json!([3, 1, 42, 1, 1.25, -3.5, {"0": 0.2, "1": 0.8}]));
        let back: EmbeddingPoint = serde_json::from_value(value).unwrap();
        assert_eq!(back, point);
    }

    #[test]
    fn store_lists_and_never_overwrites() {
        let dir = tempdir().unwrap();
        let store = ResultStore::new(dir.path());
        let first = record("aaaa");
        let path = store.save(&first).unwrap();
        assert_eq!(path, dir.path().join("1/aaaa.json"));
        assert!(store.save(&first).is_err());
        store.save(&record("bbbb")).unwrap();
        fs::write(store.artifact_path(1, "aaaa", "forget_distributions.json"), "{}").unwrap();

        let listed = store.list(1).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(store.load(1, "bbbb").unwrap().id, "bbbb");
        assert!(store.list(7).unwrap().is_empty());
        let id = store.fresh_id(1);
        assert_eq!(id.len(), 4);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
