use super::{
    apply_update, ascent_phase, fine_tune_phase, EpochContext, EpochOutcome, EpochStats,
    MethodKind, RunningStats, UnlearningMethod,
};
use crate::{
    error::EngineResult,
    model::loss::{count_correct, second_best},
};

/// Gradient ascent on the forget set, then fine-tuning on the retain set.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaFt;

impl UnlearningMethod for GaFt {
    fn kind(&self) -> MethodKind {
        MethodKind::GaFt
    }

    fn run_epoch(&mut self, ctx: &mut EpochContext) -> EngineResult<EpochOutcome> {
        if ascent_phase(ctx)?.is_none() || fine_tune_phase(ctx, None)?.is_none() {
            return Ok(EpochOutcome::Cancelled);
        }
        Ok(EpochOutcome::Completed(ctx.forget_stats()?))
    }
}

/// Pushes each forget sample toward its second-highest logit, then fine-tunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaSlFt;

impl GaSlFt {
    /// Minimises `-CE(true) + CE(second best)` over forget batches.
    fn second_logit_phase(ctx: &mut EpochContext) -> EngineResult<Option<EpochStats>> {
        let mut stats = RunningStats::default();
        for batch in ctx.forget.epoch() {
            if ctx.cancel.is_cancelled() {
                return Ok(None);
            }
            let pass = ctx.model.forward(batch.inputs.view())?;
            let logits = pass.logits();
            let runner_up = second_best(logits);
            let truth = ctx.criterion.compute(logits, &batch.labels);
            let second = ctx.criterion.compute(logits, &runner_up);
            let loss = truth.negated().combined(&second);
            stats.record(loss.loss, count_correct(logits, &batch.labels), batch.labels.len());
            apply_update(ctx, &pass, &loss, None, true)?;
        }
        Ok(Some(stats.finish()))
    }
}

impl UnlearningMethod for GaSlFt {
    fn kind(&self) -> MethodKind {
        MethodKind::GaSlFt
    }

    fn run_epoch(&mut self, ctx: &mut EpochContext) -> EngineResult<EpochOutcome> {
        if Self::second_logit_phase(ctx)?.is_none() || fine_tune_phase(ctx, None)?.is_none() {
            return Ok(EpochOutcome::Cancelled);
        }
        Ok(EpochOutcome::Completed(ctx.forget_stats()?))
    }
}
