use ndarray::{ArrayD, Zip};

use super::{Classifier, Gradients};
use crate::error::{EngineError, EngineResult};

/// Stochastic gradient descent with momentum and L2 weight decay.
///
/// Follows the classic formulation: `d = g + wd * p`, `v = m * v + d`,
/// `p -= lr * v`, with the first step seeding `v = d`.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Vec<ArrayD<f32>>,
}

impl Sgd {
    /// Creates an optimizer.
    #[must_use]
    pub const fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocity: Vec::new(),
        }
    }

    /// Current learning rate.
    #[must_use]
    pub const fn lr(&self) -> f32 {
        self.lr
    }

    /// Overrides the learning rate (scheduler hook).
    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// Applies one update to `model`.
    pub fn step(&mut self, model: &mut dyn Classifier, grads: &Gradients) -> EngineResult<()> {
        if !grads.is_finite() {
            return Err(EngineError::NumericInstability(
                "non-finite gradient entering optimizer step".into(),
            ));
        }
        let mut params = model.parameters_mut();
        if params.len() != grads.tensors.len() {
            return Err(EngineError::Dimension {
                expected: params.len(),
                found: grads.tensors.len(),
            });
        }
        let fresh = self.velocity.len() != params.len();
        if fresh {
            self.velocity = params
                .iter()
                .map(|param| ArrayD::zeros(param.raw_dim()))
                .collect();
        }
        let (lr, momentum, weight_decay) = (self.lr, self.momentum, self.weight_decay);
        for ((param, grad), velocity) in params
            .iter_mut()
            .zip(&grads.tensors)
            .zip(&mut self.velocity)
        {
            if param.shape() != grad.shape() {
                return Err(EngineError::Dimension {
                    expected: param.len(),
                    found: grad.len(),
                });
            }
            Zip::from(param)
                .and(velocity)
                .and(grad)
                .for_each(|p, v, &g| {
                    let d = g + weight_decay * *p;
                    *v = if fresh || momentum == 0.0 {
                        d
                    } else {
                        momentum * *v + d
                    };
                    *p -= lr * *v;
                });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MlpClassifier;

    fn first_param(model: &MlpClassifier) -> ArrayD<f32> {
        model.parameters()[0].to_owned()
    }

    #[test]
    fn plain_step_moves_against_gradient() {
        let mut model = MlpClassifier::new(2, &[], 2, 4);
        let before = first_param(&model);
        let mut grads = Gradients::zeros_like(&model);
        grads.tensors[0].fill(1.0);
        let mut sgd = Sgd::new(0.1, 0.0, 0.0);
        sgd.step(&mut model, &grads).unwrap();
        let after = first_param(&model);
        for (b, a) in before.iter().zip(after.iter()) {
            assert!((b - a - 0.1).abs() < 1e-6);
        }
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut model = MlpClassifier::new(1, &[], 2, 4);
        let start = first_param(&model);
        let mut grads = Gradients::zeros_like(&model);
        grads.tensors[0].fill(1.0);
        let mut sgd = Sgd::new(1.0, 0.5, 0.0);
        sgd.step(&mut model, &grads).unwrap();
        sgd.step(&mut model, &grads).unwrap();
        // v1 = 1, v2 = 0.5 * 1 + 1 = 1.5; total displacement 2.5
        let end = first_param(&model);
        assert!((start[[0, 0]] - end[[0, 0]] - 2.5).abs() < 1e-5);
    }

    #[test]
    fn rejects_non_finite_gradients() {
        let mut model = MlpClassifier::new(2, &[], 2, 4);
        let mut grads = Gradients::zeros_like(&model);
        grads.tensors[1].fill(f32::NAN);
        let err = Sgd::new(0.1, 0.9, 0.0).step(&mut model, &grads).unwrap_err();
        assert!(matches!(err, EngineError::NumericInstability(_)));
    }
}
