//! Unlearning strategies and the per-epoch context they drive.

/// GA+FT and GA+SL+FT.
pub mod combined;
/// Retain-set fine-tuning.
pub mod fine_tuning;
/// Forget-set gradient ascent.
pub mod gradient_ascent;
/// Forget-set random relabeling.
pub mod random_labeling;
/// Saliency-masked random labeling.
pub mod salun;
/// Teacher-student distillation with max/min steps.
pub mod scrub;

use std::{fmt, str::FromStr};

use rand::{rngs::SmallRng, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    data::DataLoader,
    error::{EngineError, EngineResult},
    eval::evaluator::evaluate,
    model::{
        loss::{count_correct, CrossEntropyLoss, LossOutput},
        optim::Sgd,
        scheduler::LrPolicy,
        Classifier, ForwardPass, ParamMask,
    },
    request::MethodHyperparameters,
    settings::TrainingSettings,
    status::CancelToken,
};

pub use combined::{GaFt, GaSlFt};
pub use fine_tuning::FineTuning;
pub use gradient_ascent::GradientAscent;
pub use random_labeling::RandomLabeling;
pub use salun::SalUn;
pub use scrub::Scrub;

/// Floor of the cosine schedule used by fine-tuning style methods.
const COSINE_ETA_MIN: f32 = 0.004;
/// Decay applied at each milestone of the multi-step schedule.
const MULTISTEP_GAMMA: f32 = 0.2;

/// Closed set of unlearning methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Ascend the forget-set loss.
    #[serde(alias = "ga")]
    GradientAscent,
    /// Fine-tune on the retain set.
    #[serde(alias = "ft")]
    FineTuning,
    /// Train the forget set toward random wrong labels.
    #[serde(alias = "rl")]
    RandomLabeling,
    /// Ascent phase followed by fine-tuning.
    GaFt,
    /// Second-logit ascent followed by fine-tuning.
    GaSlFt,
    /// Teacher-student max/min distillation.
    Scrub,
    /// Saliency-masked random labeling.
    #[serde(rename = "salun")]
    SalUn,
}

impl MethodKind {
    /// Every method, in display order.
    pub const ALL: [Self; 7] = [
        Self::GradientAscent,
        Self::FineTuning,
        Self::RandomLabeling,
        Self::GaFt,
        Self::GaSlFt,
        Self::Scrub,
        Self::SalUn,
    ];

    /// Value stored in a record's `Method` field.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::GradientAscent => "GradientAscent",
            Self::FineTuning => "FineTuning",
            Self::RandomLabeling => "RandomLabeling",
            Self::GaFt => "GA+FT",
            Self::GaSlFt => "GA+SL+FT",
            Self::Scrub => "SCRUB",
            Self::SalUn => "SalUn",
        }
    }

    /// Human-readable name shown in status.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::GradientAscent => "Gradient Ascent",
            Self::FineTuning => "Fine-Tuning",
            Self::RandomLabeling => "Random Labeling",
            Self::GaFt => "Gradient Ascent + Fine-Tuning",
            Self::GaSlFt => "Gradient Ascent + Second Logit + Fine-Tuning",
            Self::Scrub => "SCRUB",
            Self::SalUn => "SalUn",
        }
    }

    /// Schedule used when the request does not override it.
    #[must_use]
    pub fn default_lr_policy(self, training: &TrainingSettings) -> LrPolicy {
        match self {
            Self::GradientAscent | Self::RandomLabeling | Self::Scrub => LrPolicy::MultiStep {
                milestones: training.decreasing_lr.clone(),
                gamma: MULTISTEP_GAMMA,
            },
            Self::FineTuning | Self::GaFt | Self::GaSlFt | Self::SalUn => {
                LrPolicy::CosineAnnealing {
                    eta_min: COSINE_ETA_MIN,
                }
            }
        }
    }

    /// Instantiates the strategy.
    #[must_use]
    pub fn build(self, hyperparameters: &MethodHyperparameters) -> Box<dyn UnlearningMethod> {
        match self {
            Self::GradientAscent => Box::new(GradientAscent),
            Self::FineTuning => Box::new(FineTuning),
            Self::RandomLabeling => Box::new(RandomLabeling),
            Self::GaFt => Box::new(GaFt),
            Self::GaSlFt => Box::new(GaSlFt),
            Self::Scrub => Box::new(Scrub::new(hyperparameters.scrub.clone())),
            Self::SalUn => Box::new(SalUn::new(hyperparameters.salun.clone())),
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for MethodKind {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let key = raw.trim().to_ascii_lowercase().replace(['-', '+', ' '], "_");
        let kind = match key.as_str() {
            "ga" | "gradient_ascent" | "gradientascent" => Self::GradientAscent,
            "ft" | "fine_tuning" | "finetuning" => Self::FineTuning,
            "rl" | "random_labeling" | "randomlabeling" => Self::RandomLabeling,
            "ga_ft" => Self::GaFt,
            "ga_sl_ft" => Self::GaSlFt,
            "scrub" => Self::Scrub,
            "salun" => Self::SalUn,
            _ => {
                return Err(EngineError::InvalidRequest(format!(
                    "unknown unlearning method `{raw}`"
                )))
            }
        };
        Ok(kind)
    }
}

/// Loss and accuracy reported for one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// Reported loss.
    pub loss: f64,
    /// Reported accuracy.
    pub accuracy: f64,
}

/// How an epoch ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EpochOutcome {
    /// Every batch ran.
    Completed(EpochStats),
    /// The cancel token fired before a batch.
    Cancelled,
}

/// Mutable state shared by every epoch of one job.
#[derive(Debug)]
pub struct EpochContext {
    /// Model being unlearned.
    pub model: Box<dyn Classifier>,
    /// Optimizer bound to `model`.
    pub optimizer: Sgd,
    /// Training criterion.
    pub criterion: CrossEntropyLoss,
    /// Shuffled retain-set batches.
    pub retain: DataLoader,
    /// Shuffled forget-set batches.
    pub forget: DataLoader,
    /// Cooperative stop flag.
    pub cancel: CancelToken,
    /// Seeded randomness for relabeling.
    pub rng: SmallRng,
    /// Gradient-norm ceiling for ascent steps.
    pub max_grad_norm: f32,
    /// 0-based epoch about to run.
    pub epoch: usize,
    /// Epochs requested.
    pub total_epochs: usize,
    /// Batch size for no-gradient evaluation.
    pub eval_batch_size: usize,
}

impl EpochContext {
    /// Classes predicted by the model.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    /// Loss and accuracy of the current model on the whole forget partition.
    pub fn forget_stats(&self) -> EngineResult<EpochStats> {
        let report = evaluate(
            self.model.as_ref(),
            self.forget.partition(),
            self.eval_batch_size,
            &self.criterion,
        )?;
        Ok(EpochStats {
            loss: report.loss,
            accuracy: report.accuracy,
        })
    }
}

/// Strategy run once per epoch by the job worker.
pub trait UnlearningMethod: Send + fmt::Debug {
    /// Which method this is.
    fn kind(&self) -> MethodKind;

    /// Display name.
    fn name(&self) -> &'static str {
        self.kind().display_name()
    }

    /// Record tag.
    fn tag(&self) -> &'static str {
        self.kind().tag()
    }

    /// One-off setup before the first epoch.
    fn prepare(&mut self, _ctx: &mut EpochContext) -> EngineResult<()> {
        Ok(())
    }

    /// Runs one epoch.
    fn run_epoch(&mut self, ctx: &mut EpochContext) -> EngineResult<EpochOutcome>;
}

/// Per-batch loss and accuracy accumulator.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunningStats {
    loss_sum: f64,
    batches: usize,
    correct: usize,
    seen: usize,
}

impl RunningStats {
    pub(crate) fn record(&mut self, loss: f32, correct: usize, seen: usize) {
        self.loss_sum += f64::from(loss);
        self.batches += 1;
        self.correct += correct;
        self.seen += seen;
    }

    pub(crate) fn finish(self) -> EpochStats {
        EpochStats {
            loss: if self.batches == 0 {
                0.0
            } else {
                self.loss_sum / self.batches as f64
            },
            accuracy: if self.seen == 0 {
                0.0
            } else {
                self.correct as f64 / self.seen as f64
            },
        }
    }
}

/// Backpropagates `loss`, optionally masks and clips, then steps the optimizer.
pub(crate) fn apply_update(
    ctx: &mut EpochContext,
    pass: &ForwardPass,
    loss: &LossOutput,
    mask: Option<&ParamMask>,
    clip: bool,
) -> EngineResult<()> {
    if !loss.loss.is_finite() {
        return Err(EngineError::NumericInstability(format!(
            "non-finite loss at epoch {}",
            ctx.epoch + 1
        )));
    }
    let mut grads = ctx.model.backward(pass, loss.grad.view())?;
    if let Some(mask) = mask {
        grads.apply_mask(mask)?;
    }
    if clip {
        grads.clip_global_norm(ctx.max_grad_norm);
    }
    ctx.optimizer.step(ctx.model.as_mut(), &grads)
}

/// Ascends cross-entropy over every forget batch. `None` when cancelled.
pub(crate) fn ascent_phase(ctx: &mut EpochContext) -> EngineResult<Option<EpochStats>> {
    let mut stats = RunningStats::default();
    for batch in ctx.forget.epoch() {
        if ctx.cancel.is_cancelled() {
            return Ok(None);
        }
        let pass = ctx.model.forward(batch.inputs.view())?;
        let out = ctx.criterion.compute(pass.logits(), &batch.labels);
        stats.record(out.loss, count_correct(pass.logits(), &batch.labels), batch.labels.len());
        apply_update(ctx, &pass, &out.negated(), None, true)?;
    }
    Ok(Some(stats.finish()))
}

/// Minimises cross-entropy over every retain batch. `None` when cancelled.
pub(crate) fn fine_tune_phase(
    ctx: &mut EpochContext,
    mask: Option<&ParamMask>,
) -> EngineResult<Option<EpochStats>> {
    let mut stats = RunningStats::default();
    for batch in ctx.retain.epoch() {
        if ctx.cancel.is_cancelled() {
            return Ok(None);
        }
        let pass = ctx.model.forward(batch.inputs.view())?;
        let out = ctx.criterion.compute(pass.logits(), &batch.labels);
        stats.record(out.loss, count_correct(pass.logits(), &batch.labels), batch.labels.len());
        apply_update(ctx, &pass, &out, mask, false)?;
    }
    Ok(Some(stats.finish()))
}

/// Trains forget batches toward uniformly drawn wrong labels. `None` when cancelled.
///
/// Loss is measured against the random targets, accuracy against the true labels.
pub(crate) fn random_label_phase(
    ctx: &mut EpochContext,
    mask: Option<&ParamMask>,
) -> EngineResult<Option<EpochStats>> {
    let num_classes = ctx.num_classes();
    let mut stats = RunningStats::default();
    for batch in ctx.forget.epoch() {
        if ctx.cancel.is_cancelled() {
            return Ok(None);
        }
        let targets: Vec<usize> = batch
            .labels
            .iter()
            .map(|&label| wrong_label(&mut ctx.rng, label, num_classes))
            .collect();
        let pass = ctx.model.forward(batch.inputs.view())?;
        let out = ctx.criterion.compute(pass.logits(), &targets);
        stats.record(out.loss, count_correct(pass.logits(), &batch.labels), batch.labels.len());
        apply_update(ctx, &pass, &out, mask, false)?;
    }
    Ok(Some(stats.finish()))
}

/// Uniform draw from every class except `label`.
pub(crate) fn wrong_label(rng: &mut SmallRng, label: usize, num_classes: usize) -> usize {
    if num_classes < 2 {
        return label;
    }
    let draw = rng.gen_range(0..num_classes - 1);
    if draw >= label {
        draw + 1
    } else {
        draw
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use rand::SeedableRng;

    use super::*;
    use crate::{
        data::{DatasetBundle, Partition},
        eval::evaluator::EvaluationReport,
        model::MlpClassifier,
        status::CancelToken,
        training::train_classifier,
    };

    pub(crate) const FORGET_CLASS: usize = 1;

    /// Four well-separated classes and a model trained on all of them.
    pub(crate) fn trained() -> (DatasetBundle, MlpClassifier) {
        let bundle = DatasetBundle::synthetic(4, 30, 10, 6, 0.4, 3);
        let mut model = MlpClassifier::new(6, &[16], 4, 1);
        let mut loader = Partition::full(&bundle.train).loader(16, true, 7);
        train_classifier(
            &mut model,
            &mut loader,
            20,
            0.05,
            &TrainingSettings::default(),
            &CancelToken::new(),
        )
        .unwrap();
        (bundle, model)
    }

    pub(crate) fn context(bundle: &DatasetBundle, model: &MlpClassifier, lr: f32) -> EpochContext {
        let training = TrainingSettings::default();
        EpochContext {
            model: model.boxed_clone(),
            optimizer: Sgd::new(lr, training.momentum, training.weight_decay),
            criterion: CrossEntropyLoss,
            retain: Partition::retain(&bundle.train, FORGET_CLASS).loader(8, true, 11),
            forget: Partition::forget(&bundle.train, FORGET_CLASS).loader(8, true, 12),
            cancel: CancelToken::new(),
            rng: SmallRng::seed_from_u64(13),
            max_grad_norm: training.max_grad_norm,
            epoch: 0,
            total_epochs: 5,
            eval_batch_size: 32,
        }
    }

    pub(crate) fn train_report(bundle: &DatasetBundle, model: &dyn Classifier) -> EvaluationReport {
        evaluate(model, &Partition::full(&bundle.train), 64, &CrossEntropyLoss).unwrap()
    }

    /// Runs `epochs` epochs, advancing `ctx.epoch`.
    pub(crate) fn run(method: &mut dyn UnlearningMethod, ctx: &mut EpochContext, epochs: usize) -> Vec<EpochStats> {
        method.prepare(ctx).unwrap();
        (0..epochs)
            .map(|epoch| {
                ctx.epoch = epoch;
                match method.run_epoch(ctx).unwrap() {
                    EpochOutcome::Completed(stats) => stats,
                    EpochOutcome::Cancelled => panic!("epoch {epoch} cancelled"),
                }
            })
            .collect()
    }
}
