use ndarray::{Array1, Array2, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{Architecture, Classifier, ForwardPass, Gradients, LayerSpec, ModelFactory};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DenseLayer {
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl DenseLayer {
    fn init(fan_in: usize, fan_out: usize, rng: &mut SmallRng) -> Self {
        let bound = (6.0 / fan_in.max(1) as f32).sqrt();
        Self {
            weights: Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-bound..bound)),
            bias: Array1::zeros(fan_out),
        }
    }
}

/// Fully connected ReLU classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpClassifier {
    input_dim: usize,
    layers: Vec<DenseLayer>,
}

impl MlpClassifier {
    /// Creates a network with He-uniform weights drawn from `seed`.
    #[must_use]
    pub fn new(input_dim: usize, hidden: &[usize], num_classes: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut widths = Vec::with_capacity(hidden.len() + 2);
        widths.push(input_dim);
        widths.extend_from_slice(hidden);
        widths.push(num_classes);
        let layers = widths
            .windows(2)
            .map(|pair| DenseLayer::init(pair[0], pair[1], &mut rng))
            .collect();
        Self { input_dim, layers }
    }

    fn layer_name(index: usize, total: usize) -> String {
        if index + 1 == total {
            "classifier".to_string()
        } else {
            format!("dense_{}", index + 1)
        }
    }
}

impl Classifier for MlpClassifier {
    fn architecture(&self) -> Architecture {
        let total = self.layers.len();
        Architecture {
            input_dim: self.input_dim,
            layers: self
                .layers
                .iter()
                .enumerate()
                .map(|(index, layer)| LayerSpec {
                    name: Self::layer_name(index, total),
                    width: layer.bias.len(),
                })
                .collect(),
        }
    }

    fn forward(&self, inputs: ArrayView2<'_, f32>) -> EngineResult<ForwardPass> {
        if inputs.ncols() != self.input_dim {
            return Err(EngineError::Dimension {
                expected: self.input_dim,
                found: inputs.ncols(),
            });
        }
        let last = self.layers.len().saturating_sub(1);
        let mut activations = Vec::with_capacity(self.layers.len());
        let mut current = inputs.to_owned();
        for (index, layer) in self.layers.iter().enumerate() {
            let mut output = current.dot(&layer.weights) + &layer.bias;
            if index != last {
                output.mapv_inplace(|value| value.max(0.0));
            }
            activations.push(output.clone());
            current = output;
        }
        Ok(ForwardPass {
            input: inputs.to_owned(),
            activations,
        })
    }

    fn backward(
        &self,
        pass: &ForwardPass,
        grad_logits: ArrayView2<'_, f32>,
    ) -> EngineResult<Gradients> {
        if pass.activations.len() != self.layers.len() {
            return Err(EngineError::Dimension {
                expected: self.layers.len(),
                found: pass.activations.len(),
            });
        }
        if grad_logits.dim() != pass.logits().dim() {
            return Err(EngineError::Dimension {
                expected: pass.logits().len(),
                found: grad_logits.len(),
            });
        }
        let mut per_layer = Vec::with_capacity(self.layers.len());
        let mut grad = grad_logits.to_owned();
        for index in (0..self.layers.len()).rev() {
            let layer = &self.layers[index];
            let previous = if index == 0 {
                &pass.input
            } else {
                &pass.activations[index - 1]
            };
            let d_weights = previous.t().dot(&grad);
            let d_bias = grad.sum_axis(Axis(0));
            if index > 0 {
                let mut upstream = grad.dot(&layer.weights.t());
                upstream.zip_mut_with(previous, |g, &a| {
                    if a <= 0.0 {
                        *g = 0.0;
                    }
                });
                grad = upstream;
            }
            per_layer.push((d_weights, d_bias));
        }
        per_layer.reverse();
        let tensors = per_layer
            .into_iter()
            .flat_map(|(weights, bias)| [weights.into_dyn(), bias.into_dyn()])
            .collect();
        Ok(Gradients { tensors })
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        self.layers
            .iter()
            .flat_map(|layer| [layer.weights.view().into_dyn(), layer.bias.view().into_dyn()])
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        self.layers
            .iter_mut()
            .flat_map(|layer| {
                [
                    layer.weights.view_mut().into_dyn(),
                    layer.bias.view_mut().into_dyn(),
                ]
            })
            .collect()
    }

    fn boxed_clone(&self) -> Box<dyn Classifier> {
        Box::new(self.clone())
    }
}

/// Builds [`MlpClassifier`]s from an architecture description.
#[derive(Debug, Clone, Copy)]
pub struct MlpFactory {
    seed: u64,
}

impl MlpFactory {
    /// Creates a factory; `seed` only matters for weights a checkpoint does not overwrite.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl ModelFactory for MlpFactory {
    fn build(&self, architecture: &Architecture) -> EngineResult<Box<dyn Classifier>> {
        let Some((head, hidden)) = architecture.layers.split_last() else {
            return Err(EngineError::ArchitectureMismatch(
                "architecture has no layers".into(),
            ));
        };
        let widths: Vec<usize> = hidden.iter().map(|layer| layer.width).collect();
        let model = MlpClassifier::new(architecture.input_dim, &widths, head.width, self.seed);
        model.architecture().ensure_matches(architecture)?;
        Ok(Box::new(model))
    }
}
