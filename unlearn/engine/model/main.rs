//! Differentiable classifier abstraction, gradients, and JSON checkpoints.

/// Loss functions over logits.
pub mod loss;
/// Dense ReLU classifier.
pub mod mlp;
/// SGD optimizer and gradient utilities.
pub mod optim;
/// Learning-rate policies.
pub mod scheduler;

use std::{fmt, fs, path::Path};

use ndarray::{Array2, ArrayD, ArrayView2, ArrayViewD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub use mlp::{MlpClassifier, MlpFactory};

/// Named layer with its output width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Layer name used in similarity reports.
    pub name: String,
    /// Output width.
    pub width: usize,
}

/// Layer layout used for compatibility checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    /// Input feature dimension.
    pub input_dim: usize,
    /// Layers in forward order; the last one produces logits.
    pub layers: Vec<LayerSpec>,
}

impl Architecture {
    /// Number of output classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.layers.last().map_or(0, |layer| layer.width)
    }

    /// Layer names in forward order.
    #[must_use]
    pub fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|layer| layer.name.clone()).collect()
    }

    /// Fails with [`EngineError::ArchitectureMismatch`] unless both layouts agree.
    pub fn ensure_matches(&self, other: &Self) -> EngineResult<()> {
        if self == other {
            return Ok(());
        }
        Err(EngineError::ArchitectureMismatch(format!(
            "{} vs {}",
            self.describe(),
            other.describe()
        )))
    }

    fn describe(&self) -> String {
        let widths: Vec<String> = self
            .layers
            .iter()
            .map(|layer| format!("{}:{}", layer.name, layer.width))
            .collect();
        format!("in:{} [{}]", self.input_dim, widths.join(", "))
    }
}

/// Activations recorded during a forward pass.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// Batch inputs.
    pub input: Array2<f32>,
    /// Output of every layer; the last entry holds the logits.
    pub activations: Vec<Array2<f32>>,
}

impl ForwardPass {
    /// Logits of the batch.
    #[must_use]
    pub fn logits(&self) -> ArrayView2<'_, f32> {
        self.activations
            .last()
            .map_or_else(|| self.input.view(), |logits| logits.view())
    }

    /// Representation feeding the classification head.
    #[must_use]
    pub fn penultimate(&self) -> ArrayView2<'_, f32> {
        match self.activations.len() {
            0 | 1 => self.input.view(),
            n => self.activations[n - 2].view(),
        }
    }
}

/// One gradient tensor per parameter, in [`Classifier::parameters`] order.
#[derive(Debug, Clone)]
pub struct Gradients {
    /// Gradient tensors.
    pub tensors: Vec<ArrayD<f32>>,
}

impl Gradients {
    /// Zero gradients shaped like the model's parameters.
    #[must_use]
    pub fn zeros_like(model: &dyn Classifier) -> Self {
        Self {
            tensors: model
                .parameters()
                .iter()
                .map(|param| ArrayD::zeros(param.raw_dim()))
                .collect(),
        }
    }

    /// L2 norm over every tensor.
    #[must_use]
    pub fn global_norm(&self) -> f32 {
        self.tensors
            .iter()
            .map(|tensor| tensor.iter().map(|value| value * value).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    /// Rescales in place so the global norm does not exceed `max_norm`; returns the norm before clipping.
    pub fn clip_global_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.global_norm();
        if norm.is_finite() && norm > max_norm && norm > 0.0 {
            let scale = max_norm / (norm + 1e-6);
            self.scale(scale);
        }
        norm
    }

    /// Multiplies every entry by `factor`.
    pub fn scale(&mut self, factor: f32) {
        for tensor in &mut self.tensors {
            tensor.mapv_inplace(|value| value * factor);
        }
    }

    /// Adds `other` scaled by `factor`.
    pub fn add_scaled(&mut self, other: &Self, factor: f32) -> EngineResult<()> {
        ensure_same_count(self.tensors.len(), other.tensors.len())?;
        for (lhs, rhs) in self.tensors.iter_mut().zip(&other.tensors) {
            ensure_same_shape(lhs.shape(), rhs.shape())?;
            Zip::from(lhs).and(rhs).for_each(|a, &b| *a += factor * b);
        }
        Ok(())
    }

    /// Zeroes entries whose mask value is zero.
    pub fn apply_mask(&mut self, mask: &ParamMask) -> EngineResult<()> {
        ensure_same_count(self.tensors.len(), mask.tensors.len())?;
        for (grad, keep) in self.tensors.iter_mut().zip(&mask.tensors) {
            ensure_same_shape(grad.shape(), keep.shape())?;
            Zip::from(grad).and(keep).for_each(|g, &k| *g *= k);
        }
        Ok(())
    }

    /// True when every entry is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.tensors
            .iter()
            .all(|tensor| tensor.iter().all(|value| value.is_finite()))
    }
}

/// 0/1 mask over parameters.
#[derive(Debug, Clone)]
pub struct ParamMask {
    /// Mask tensors in parameter order.
    pub tensors: Vec<ArrayD<f32>>,
}

impl ParamMask {
    /// Fraction of entries kept.
    #[must_use]
    pub fn density(&self) -> f64 {
        let total: usize = self.tensors.iter().map(ArrayD::len).sum();
        if total == 0 {
            return 0.0;
        }
        let kept: f64 = self
            .tensors
            .iter()
            .map(|tensor| f64::from(tensor.sum()))
            .sum();
        kept / total as f64
    }
}

/// Differentiable classifier.
pub trait Classifier: Send + Sync + fmt::Debug {
    /// Layer layout.
    fn architecture(&self) -> Architecture;

    /// Runs the network on a batch, keeping every layer's output.
    fn forward(&self, inputs: ArrayView2<'_, f32>) -> EngineResult<ForwardPass>;

    /// Backpropagates `grad_logits` through a pass produced by [`Classifier::forward`].
    fn backward(
        &self,
        pass: &ForwardPass,
        grad_logits: ArrayView2<'_, f32>,
    ) -> EngineResult<Gradients>;

    /// Parameters in a stable order.
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>>;

    /// Mutable parameters in the same order as [`Classifier::parameters`].
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>>;

    /// Deep copy behind a box.
    fn boxed_clone(&self) -> Box<dyn Classifier>;

    /// Number of output classes.
    fn num_classes(&self) -> usize {
        self.architecture().num_classes()
    }
}

/// Builds empty models for a given architecture.
pub trait ModelFactory: Send + Sync + fmt::Debug {
    /// Creates a model whose parameters will be overwritten by a checkpoint.
    fn build(&self, architecture: &Architecture) -> EngineResult<Box<dyn Classifier>>;
}

/// Serialized model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Layout the tensors belong to.
    pub architecture: Architecture,
    /// Parameters in model order.
    pub tensors: Vec<ArrayD<f32>>,
}

impl Checkpoint {
    /// Captures the model's current parameters.
    #[must_use]
    pub fn capture(model: &dyn Classifier) -> Self {
        Self {
            architecture: model.architecture(),
            tensors: model
                .parameters()
                .iter()
                .map(|param| param.to_owned())
                .collect(),
        }
    }

    /// Reads a checkpoint; a missing file maps to [`EngineError::MissingCheckpoint`].
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EngineError::MissingCheckpoint(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Writes the checkpoint, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    /// Copies the stored tensors into `model`.
    pub fn restore_into(&self, model: &mut dyn Classifier) -> EngineResult<()> {
        self.architecture.ensure_matches(&model.architecture())?;
        let mut params = model.parameters_mut();
        ensure_same_count(params.len(), self.tensors.len())?;
        for (param, stored) in params.iter_mut().zip(&self.tensors) {
            ensure_same_shape(param.shape(), stored.shape())?;
            param.assign(stored);
        }
        Ok(())
    }

    /// Builds a fresh model through `factory` and restores the weights.
    pub fn instantiate(&self, factory: &dyn ModelFactory) -> EngineResult<Box<dyn Classifier>> {
        let mut model = factory.build(&self.architecture)?;
        self.restore_into(model.as_mut())?;
        Ok(model)
    }
}

/// Saves `model` as a checkpoint at `path`.
pub fn save_model(model: &dyn Classifier, path: impl AsRef<Path>) -> EngineResult<()> {
    Checkpoint::capture(model).save(path)
}

/// Loads a checkpoint and instantiates it through `factory`.
pub fn load_model(
    factory: &dyn ModelFactory,
    path: impl AsRef<Path>,
) -> EngineResult<Box<dyn Classifier>> {
    Checkpoint::load(path)?.instantiate(factory)
}

const fn ensure_same_count(expected: usize, found: usize) -> EngineResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(EngineError::Dimension { expected, found })
    }
}

fn ensure_same_shape(expected: &[usize], found: &[usize]) -> EngineResult<()> {
    if expected == found {
        return Ok(());
    }
    Err(EngineError::Dimension {
        expected: expected.iter().product(),
        found: found.iter().product(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn model() -> MlpClassifier {
        MlpClassifier::new(4, &[6], 3, 11)
    }

    #[test]
    fn checkpoint_round_trip_restores_weights() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("3/0003.json");
        let original = model();
        save_model(&original, &path).unwrap();
        let restored = load_model(&MlpFactory::new(1), &path).unwrap();
        let before: Vec<_> = original.parameters().iter().map(|p| p.to_owned()).collect();
        let after: Vec<_> = restored.parameters().iter().map(|p| p.to_owned()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn missing_checkpoint_is_configuration_error() {
        let dir = tempdir().unwrap();
        let err = Checkpoint::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, EngineError::MissingCheckpoint(_)));
    }

    #[test]
    fn restore_rejects_other_architecture() {
        let checkpoint = Checkpoint::capture(&model());
        let mut other = MlpClassifier::new(4, &[8], 3, 1);
        let err = checkpoint.restore_into(&mut other).unwrap_err();
        assert!(matches!(err, EngineError::ArchitectureMismatch(_)));
    }

    #[test]
    fn clipping_bounds_global_norm() {
        let net = model();
        let mut grads = Gradients::zeros_like(&net);
        for tensor in &mut grads.tensors {
            tensor.fill(3.0);
        }
        let before = grads.clip_global_norm(1.0);
        assert!(before > 1.0);
        assert!((grads.global_norm() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn mask_zeroes_gradients() {
        let net = model();
        let mut grads = Gradients::zeros_like(&net);
        for tensor in &mut grads.tensors {
            tensor.fill(1.0);
        }
        let mask = ParamMask {
            tensors: grads.tensors.iter().map(|t| ArrayD::zeros(t.raw_dim())).collect(),
        };
        grads.apply_mask(&mask).unwrap();
        assert!(grads.global_norm().abs() < f32::EPSILON);
        assert!(mask.density().abs() < f64::EPSILON);
    }
}
