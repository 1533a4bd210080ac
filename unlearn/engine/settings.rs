use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Engine-wide settings loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Storage locations.
    #[serde(default)]
    pub paths: PathSettings,
    /// Optimizer and training constants.
    #[serde(default)]
    pub training: TrainingSettings,
    /// Embedding subset configuration.
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    /// Membership attack configuration.
    #[serde(default)]
    pub attack: AttackSettings,
    /// Representation similarity configuration.
    #[serde(default)]
    pub similarity: SimilaritySettings,
    /// Per-epoch diagnostics.
    #[serde(default)]
    pub epoch_metrics: EpochMetricsSettings,
    /// Job controller behaviour.
    #[serde(default)]
    pub controller: ControllerSettings,
}

impl Settings {
    /// Loads settings from a TOML file; relative paths resolve against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            EngineError::Settings(format!("reading {}: {err}", path.display()))
        })?;
        let mut settings = Self::from_toml_str(&raw)?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        settings.paths.resolve_against(&source_dir);
        Ok(settings)
    }

    /// Writes the settings as TOML, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        let raw =
            toml::to_string_pretty(self).map_err(|err| EngineError::Settings(err.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, raw)?;
        Ok(())
    }

    /// Parses and validates settings from TOML text.
    pub fn from_toml_str(raw: &str) -> EngineResult<Self> {
        let settings: Self =
            toml::from_str(raw).map_err(|err| EngineError::Settings(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> EngineResult<()> {
        let classes = self.training.num_classes;
        if classes < 2 {
            return Err(EngineError::Settings(format!(
                "training.num_classes must be at least 2, got {classes}"
            )));
        }
        if self.embedding.data_size < classes {
            return Err(EngineError::Settings(format!(
                "embedding.data_size ({}) must cover every class ({classes})",
                self.embedding.data_size
            )));
        }
        if self.attack.thresholds < 2 {
            return Err(EngineError::Settings(
                "attack.thresholds must be at least 2".into(),
            ));
        }
        if !(self.training.momentum >= 0.0 && self.training.momentum < 1.0) {
            return Err(EngineError::Settings(format!(
                "training.momentum must lie in [0, 1), got {}",
                self.training.momentum
            )));
        }
        if self.training.max_grad_norm <= 0.0 || !self.training.max_grad_norm.is_finite() {
            return Err(EngineError::Settings(
                "training.max_grad_norm must be positive".into(),
            ));
        }
        if self.attack.entropy_temperature <= 0.0 || self.attack.confidence_temperature <= 0.0 {
            return Err(EngineError::Settings(
                "attack temperatures must be positive".into(),
            ));
        }
        if self.controller.poll_interval_ms == 0 {
            return Err(EngineError::Settings(
                "controller.poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Checkpoint of the model before unlearning, used as the similarity reference.
    #[must_use]
    pub fn before_checkpoint(&self, forget_class: usize) -> PathBuf {
        self.paths
            .models_dir
            .join(forget_class.to_string())
            .join(format!("000{forget_class}.json"))
    }

    /// Optional checkpoint of a model retrained without the forget class.
    #[must_use]
    pub fn retrain_checkpoint(&self, forget_class: usize) -> PathBuf {
        self.paths
            .models_dir
            .join(forget_class.to_string())
            .join(format!("retrain_{forget_class}.json"))
    }

    /// Location of the unlearned model saved by a job.
    #[must_use]
    pub fn unlearned_checkpoint(&self, forget_class: usize, id: &str) -> PathBuf {
        self.paths
            .models_dir
            .join(forget_class.to_string())
            .join(format!("{id}.json"))
    }

    /// Directory holding result records for a forget class.
    #[must_use]
    pub fn results_dir(&self, forget_class: usize) -> PathBuf {
        self.paths.data_dir.join(forget_class.to_string())
    }

    /// Per-job log file.
    #[must_use]
    pub fn job_log(&self, id: &str) -> PathBuf {
        self.paths.log_dir.join(format!("{id}.log"))
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Root of result records.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Root of model checkpoints.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    /// Root of job logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl PathSettings {
    /// Rebases every directory under `root`.
    #[must_use]
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join(default_data_dir()),
            models_dir: root.join(default_models_dir()),
            log_dir: root.join(default_log_dir()),
        }
    }

    fn resolve_against(&mut self, base: &Path) {
        for dir in [&mut self.data_dir, &mut self.models_dir, &mut self.log_dir] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            models_dir: default_models_dir(),
            log_dir: default_log_dir(),
        }
    }
}

/// Optimizer constants shared by every method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// SGD momentum.
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    /// L2 weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    /// Epoch milestones for the multi-step schedule.
    #[serde(default = "default_decreasing_lr")]
    pub decreasing_lr: Vec<usize>,
    /// Global gradient-norm ceiling for ascent steps.
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f32,
    /// Seed for shuffling, relabeling, and subset selection.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of classes the classifier predicts.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            decreasing_lr: default_decreasing_lr(),
            max_grad_norm: default_max_grad_norm(),
            seed: default_seed(),
            num_classes: default_num_classes(),
        }
    }
}

/// Split the embedding subset is drawn from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubsetSplit {
    /// Training split.
    #[default]
    Train,
    /// Held-out split.
    Test,
}

/// Embedding subset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    /// Total subset size; divided evenly across classes.
    #[serde(default = "default_embedding_size")]
    pub data_size: usize,
    /// Source split.
    #[serde(default)]
    pub dataset: SubsetSplit,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            data_size: default_embedding_size(),
            dataset: SubsetSplit::Train,
        }
    }
}

/// Membership attack configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackSettings {
    /// Softmax temperature for the entropy feature.
    #[serde(default = "default_entropy_temperature")]
    pub entropy_temperature: f32,
    /// Softmax temperature for the confidence feature.
    #[serde(default = "default_confidence_temperature")]
    pub confidence_temperature: f32,
    /// Number of thresholds in each sweep.
    #[serde(default = "default_thresholds")]
    pub thresholds: usize,
}

impl Default for AttackSettings {
    fn default() -> Self {
        Self {
            entropy_temperature: default_entropy_temperature(),
            confidence_temperature: default_confidence_temperature(),
            thresholds: default_thresholds(),
        }
    }
}

/// Representation similarity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilaritySettings {
    /// Cap on samples per (split, forget/other) cell.
    #[serde(default = "default_samples_per_split")]
    pub samples_per_split: usize,
}

impl Default for SimilaritySettings {
    fn default() -> Self {
        Self {
            samples_per_split: default_samples_per_split(),
        }
    }
}

/// Per-epoch diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetricsSettings {
    /// Collects all seven series when set.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cap on samples per side when fitting and scoring membership classifiers.
    #[serde(default = "default_mia_samples")]
    pub mia_samples: usize,
}

impl Default for EpochMetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mia_samples: default_mia_samples(),
        }
    }
}

/// Job controller behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Interval between liveness and cancellation checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("unlearned_models")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

const fn default_momentum() -> f32 {
    0.9
}

const fn default_weight_decay() -> f32 {
    5e-4
}

fn default_decreasing_lr() -> Vec<usize> {
    vec![91, 136]
}

const fn default_max_grad_norm() -> f32 {
    5.0
}

const fn default_seed() -> u64 {
    42
}

const fn default_num_classes() -> usize {
    10
}

const fn default_embedding_size() -> usize {
    2000
}

const fn default_entropy_temperature() -> f32 {
    2.0
}

const fn default_confidence_temperature() -> f32 {
    1.0
}

const fn default_thresholds() -> usize {
    50
}

const fn default_samples_per_split() -> usize {
    500
}

const fn default_true() -> bool {
    true
}

const fn default_mia_samples() -> usize {
    1000
}

const fn default_poll_interval_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.training.num_classes, 10);
        assert_eq!(settings.training.decreasing_lr, vec![91, 136]);
        assert_eq!(settings.embedding.data_size, 2000);
        assert_eq!(settings.controller.poll_interval_ms, 100);
        assert!(settings.epoch_metrics.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let raw = r#"
            [training]
            seed = 7
            num_classes = 4

            [embedding]
            data_size = 40
            dataset = "test"
        "#;
        let settings = Settings::from_toml_str(raw).unwrap();
        assert_eq!(settings.training.seed, 7);
        assert!((settings.training.momentum - 0.9).abs() < f32::EPSILON);
        assert_eq!(settings.embedding.dataset, SubsetSplit::Test);
    }

    #[test]
    fn rejects_subset_smaller_than_class_count() {
        let raw = "[embedding]\ndata_size = 5\n";
        let err = Settings::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, EngineError::Settings(_)));
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "[paths]\ndata_dir = \"out\"\n").unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.paths.data_dir, dir.path().join("out"));
        assert_eq!(
            settings.before_checkpoint(3),
            dir.path().join("unlearned_models/3/0003.json")
        );
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempdir().unwrap();
        let mut settings = Settings {
            paths: PathSettings::under(dir.path()),
            ..Settings::default()
        };
        settings.training.num_classes = 4;
        settings.embedding.data_size = 40;
        let path = dir.path().join("nested/engine.toml");
        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.training.num_classes, 4);
        assert_eq!(loaded.paths.models_dir, settings.paths.models_dir);
        assert_eq!(loaded.training.decreasing_lr, vec![91, 136]);
    }
}
