use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use super::optim::Sgd;

/// Named learning-rate schedule, evaluated in closed form per epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LrPolicy {
    /// Fixed learning rate.
    Constant,
    /// Multiply by `gamma` at each milestone epoch.
    MultiStep {
        /// Epochs at which the rate decays.
        milestones: Vec<usize>,
        /// Decay factor.
        gamma: f32,
    },
    /// Half-cosine from the base rate to `eta_min` over the run.
    CosineAnnealing {
        /// Floor reached at the final epoch.
        eta_min: f32,
    },
    /// Linear interpolation of a multiplicative factor.
    Linear {
        /// Factor at epoch zero.
        start_factor: f32,
        /// Factor at the final epoch.
        end_factor: f32,
    },
    /// Cosine annealing restarted every `t0 * t_mult^k` epochs.
    CosineWarmRestarts {
        /// Length of the first cycle.
        t0: usize,
        /// Cycle length multiplier.
        t_mult: usize,
        /// Floor of each cycle.
        eta_min: f32,
    },
}

impl LrPolicy {
    /// Learning rate at `epoch` (0-based) for a run of `total_epochs`.
    #[must_use]
    pub fn rate_at(&self, base_lr: f32, epoch: usize, total_epochs: usize) -> f32 {
        let rate = match self {
            Self::Constant => base_lr,
            Self::MultiStep { milestones, gamma } => {
                let passed = milestones.iter().filter(|&&m| m <= epoch).count();
                base_lr * gamma.powi(i32::try_from(passed).unwrap_or(i32::MAX))
            }
            Self::CosineAnnealing { eta_min } => {
                let span = total_epochs.max(1);
                let progress = epoch.min(span) as f32 / span as f32;
                eta_min + (base_lr - eta_min) * (1.0 + (PI * progress).cos()) / 2.0
            }
            Self::Linear {
                start_factor,
                end_factor,
            } => {
                let span = total_epochs.max(1);
                let progress = epoch.min(span) as f32 / span as f32;
                base_lr * (start_factor + (end_factor - start_factor) * progress)
            }
            Self::CosineWarmRestarts {
                t0,
                t_mult,
                eta_min,
            } => {
                let mut cycle = (*t0).max(1);
                let mut position = epoch;
                while position >= cycle {
                    position -= cycle;
                    cycle = cycle.saturating_mul((*t_mult).max(1));
                }
                let progress = position as f32 / cycle as f32;
                eta_min + (base_lr - eta_min) * (1.0 + (PI * progress).cos()) / 2.0
            }
        };
        rate.max(f32::EPSILON)
    }
}

/// Per-epoch scheduler bound to an optimizer's base rate.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    policy: LrPolicy,
    base_lr: f32,
    total_epochs: usize,
    epoch: usize,
}

impl LrScheduler {
    /// Creates a scheduler positioned at epoch zero.
    #[must_use]
    pub const fn new(policy: LrPolicy, base_lr: f32, total_epochs: usize) -> Self {
        Self {
            policy,
            base_lr,
            total_epochs,
            epoch: 0,
        }
    }

    /// Active policy.
    #[must_use]
    pub const fn policy(&self) -> &LrPolicy {
        &self.policy
    }

    /// Rate for the current epoch.
    #[must_use]
    pub fn current_lr(&self) -> f32 {
        self.policy
            .rate_at(self.base_lr, self.epoch, self.total_epochs)
    }

    /// Advances one epoch and pushes the new rate into `optimizer`.
    pub fn step(&mut self, optimizer: &mut Sgd) -> f32 {
        self.epoch += 1;
        let lr = self.current_lr();
        optimizer.set_lr(lr);
        lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn multistep_decays_at_milestones() {
        let policy = LrPolicy::MultiStep {
            milestones: vec![2, 4],
            gamma: 0.2,
        };
        assert!(close(policy.rate_at(0.1, 1, 6), 0.1));
        assert!(close(policy.rate_at(0.1, 2, 6), 0.02));
        assert!(close(policy.rate_at(0.1, 5, 6), 0.004));
    }

    #[test]
    fn cosine_reaches_floor_at_end() {
        let policy = LrPolicy::CosineAnnealing { eta_min: 0.004 };
        assert!(close(policy.rate_at(0.1, 0, 10), 0.1));
        assert!(close(policy.rate_at(0.1, 10, 10), 0.004));
        assert!(close(policy.rate_at(0.1, 5, 10), 0.052));
    }

    #[test]
    fn cosine_moves_toward_eta_min_above_base() {
        let policy = LrPolicy::CosineAnnealing { eta_min: 0.004 };
        assert!(close(policy.rate_at(0.001, 0, 4), 0.001));
        assert!(close(policy.rate_at(0.001, 2, 4), 0.0025));
        assert!(close(policy.rate_at(0.001, 4, 4), 0.004));
    }

    #[test]
    fn warm_restarts_reset_each_cycle() {
        let policy = LrPolicy::CosineWarmRestarts {
            t0: 2,
            t_mult: 1,
            eta_min: 0.0,
        };
        assert!(close(policy.rate_at(0.1, 0, 8), 0.1));
        assert!(close(policy.rate_at(0.1, 2, 8), 0.1));
        assert!(close(policy.rate_at(0.1, 1, 8), 0.05));
    }

    #[test]
    fn scheduler_updates_optimizer() {
        let mut sgd = Sgd::new(0.1, 0.9, 0.0);
        let mut scheduler = LrScheduler::new(
            LrPolicy::Linear {
                start_factor: 1.0,
                end_factor: 0.0,
            },
            0.1,
            4,
        );
        let lr = scheduler.step(&mut sgd);
        assert!(close(lr, 0.075));
        assert!(close(sgd.lr(), 0.075));
    }

    #[test]
    fn serializes_with_policy_tag() {
        let json = serde_json::to_value(LrPolicy::CosineAnnealing { eta_min: 0.01 }).unwrap();
        assert_eq!(json["policy"], "cosine_annealing");
    }
}
