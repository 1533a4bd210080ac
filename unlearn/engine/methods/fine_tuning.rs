use super::{fine_tune_phase, EpochContext, EpochOutcome, MethodKind, UnlearningMethod};
use crate::error::EngineResult;

/// Fine-tunes on the retain set, relying on catastrophic forgetting.
///
/// Reports loss and accuracy of a no-gradient pass over the forget set.
#[derive(Debug, Clone, Copy, Default)]
pub struct FineTuning;

impl UnlearningMethod for FineTuning {
    fn kind(&self) -> MethodKind {
        MethodKind::FineTuning
    }

    fn run_epoch(&mut self, ctx: &mut EpochContext) -> EngineResult<EpochOutcome> {
        if fine_tune_phase(ctx, None)?.is_none() {
            return Ok(EpochOutcome::Cancelled);
        }
        Ok(EpochOutcome::Completed(ctx.forget_stats()?))
    }
}
