use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{EngineError, EngineResult},
    methods::MethodKind,
    model::scheduler::LrPolicy,
};

/// SCRUB distillation weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrubParams {
    /// Weight of the retain-set KL term in min steps.
    #[serde(default = "default_scrub_alpha")]
    pub alpha: f32,
    /// Weight of the retain-set cross-entropy term in min steps.
    #[serde(default = "default_scrub_gamma")]
    pub gamma: f32,
    /// Distillation temperature.
    #[serde(default = "default_kd_temperature")]
    pub kd_temperature: f32,
    /// Epochs that include a max step; defaults to half the run, rounded up.
    #[serde(default)]
    pub msteps: Option<usize>,
}

impl Default for ScrubParams {
    fn default() -> Self {
        Self {
            alpha: default_scrub_alpha(),
            gamma: default_scrub_gamma(),
            kd_temperature: default_kd_temperature(),
            msteps: None,
        }
    }
}

/// SalUn saliency configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalUnParams {
    /// Fraction of parameter entries left trainable.
    #[serde(default = "default_saliency_ratio")]
    pub saliency_ratio: f32,
}

impl Default for SalUnParams {
    fn default() -> Self {
        Self {
            saliency_ratio: default_saliency_ratio(),
        }
    }
}

/// Method-specific knobs; each method reads only its own section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodHyperparameters {
    /// SCRUB settings.
    #[serde(default)]
    pub scrub: ScrubParams,
    /// SalUn settings.
    #[serde(default)]
    pub salun: SalUnParams,
}

/// One unlearning job description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlearningRequest {
    /// Class whose influence is removed.
    pub forget_class: usize,
    /// Number of unlearning epochs.
    pub epochs: usize,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Base learning rate.
    pub learning_rate: f32,
    /// Unlearning method.
    pub method: MethodKind,
    /// Checkpoint the unlearned model starts from.
    pub base_weights: PathBuf,
    /// Method-specific knobs.
    #[serde(default)]
    pub hyperparameters: MethodHyperparameters,
    /// Overrides the method's default schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr_policy: Option<LrPolicy>,
}

impl UnlearningRequest {
    /// Creates a request with common defaults (5 epochs, batch 32, lr 0.01).
    #[must_use]
    pub fn new(method: MethodKind, forget_class: usize, base_weights: impl Into<PathBuf>) -> Self {
        Self {
            forget_class,
            epochs: 5,
            batch_size: 32,
            learning_rate: 0.01,
            method,
            base_weights: base_weights.into(),
            hyperparameters: MethodHyperparameters::default(),
            lr_policy: None,
        }
    }

    /// Sets the epoch count.
    #[must_use]
    pub const fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the base learning rate.
    #[must_use]
    pub const fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Overrides the learning-rate policy.
    #[must_use]
    pub fn with_lr_policy(mut self, policy: LrPolicy) -> Self {
        self.lr_policy = Some(policy);
        self
    }

    /// Replaces the method knobs.
    #[must_use]
    pub fn with_hyperparameters(mut self, hyperparameters: MethodHyperparameters) -> Self {
        self.hyperparameters = hyperparameters;
        self
    }

    /// Checks the request against the model's class count.
    pub fn validate(&self, num_classes: usize) -> EngineResult<()> {
        if self.forget_class >= num_classes {
            return Err(EngineError::InvalidRequest(format!(
                "forget_class {} outside 0..{num_classes}",
                self.forget_class
            )));
        }
        if self.epochs == 0 {
            return Err(EngineError::InvalidRequest("epochs must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::InvalidRequest(
                "batch_size must be positive".into(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(EngineError::InvalidRequest(format!(
                "learning_rate must be a positive finite number, got {}",
                self.learning_rate
            )));
        }
        let ratio = self.hyperparameters.salun.saliency_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(EngineError::InvalidRequest(format!(
                "salun.saliency_ratio must lie in (0, 1], got {ratio}"
            )));
        }
        if self.hyperparameters.scrub.kd_temperature <= 0.0 {
            return Err(EngineError::InvalidRequest(
                "scrub.kd_temperature must be positive".into(),
            ));
        }
        Ok(())
    }

    /// File stem of the base checkpoint, recorded as `Base`.
    #[must_use]
    pub fn base_stem(&self) -> String {
        Path::new(&self.base_weights)
            .file_stem()
            .map_or_else(String::new, |stem| stem.to_string_lossy().into_owned())
    }
}

const fn default_scrub_alpha() -> f32 {
    0.001
}

const fn default_scrub_gamma() -> f32 {
    0.99
}

const fn default_kd_temperature() -> f32 {
    4.0
}

const fn default_saliency_ratio() -> f32 {
    0.5
}
