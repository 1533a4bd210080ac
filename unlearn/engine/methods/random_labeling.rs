use super::{random_label_phase, EpochContext, EpochOutcome, MethodKind, UnlearningMethod};
use crate::error::EngineResult;

/// Trains forget samples toward uniformly drawn wrong labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomLabeling;

impl UnlearningMethod for RandomLabeling {
    fn kind(&self) -> MethodKind {
        MethodKind::RandomLabeling
    }

    fn run_epoch(&mut self, ctx: &mut EpochContext) -> EngineResult<EpochOutcome> {
        Ok(random_label_phase(ctx, None)?.map_or(EpochOutcome::Cancelled, EpochOutcome::Completed))
    }
}
