use super::{apply_update, EpochContext, EpochOutcome, MethodKind, UnlearningMethod};
use crate::{
    error::EngineResult,
    model::{loss::distillation_kl, Classifier},
    request::ScrubParams,
};

/// Teacher-student unlearning.
///
/// The frozen teacher is the model as it was before the first epoch. Early
/// epochs push the student away from the teacher on forget batches; every
/// epoch pulls it back toward the teacher and the labels on retain batches.
#[derive(Debug)]
pub struct Scrub {
    params: ScrubParams,
    teacher: Option<Box<dyn Classifier>>,
}

impl Scrub {
    /// Creates the method with its distillation weights.
    #[must_use]
    pub const fn new(params: ScrubParams) -> Self {
        Self {
            params,
            teacher: None,
        }
    }

    /// Number of leading epochs that include a max step.
    #[must_use]
    pub fn max_steps(&self, total_epochs: usize) -> usize {
        self.params.msteps.unwrap_or_else(|| total_epochs.div_ceil(2))
    }

    fn max_phase(teacher: &dyn Classifier, temperature: f32, ctx: &mut EpochContext) -> EngineResult<bool> {
        for batch in ctx.forget.epoch() {
            if ctx.cancel.is_cancelled() {
                return Ok(false);
            }
            let pass = ctx.model.forward(batch.inputs.view())?;
            let reference = teacher.forward(batch.inputs.view())?;
            let loss = distillation_kl(pass.logits(), reference.logits(), temperature).negated();
            apply_update(ctx, &pass, &loss, None, true)?;
        }
        Ok(true)
    }

    fn min_phase(&self, teacher: &dyn Classifier, ctx: &mut EpochContext) -> EngineResult<bool> {
        let ScrubParams {
            alpha,
            gamma,
            kd_temperature,
            ..
        } = self.params;
        for batch in ctx.retain.epoch() {
            if ctx.cancel.is_cancelled() {
                return Ok(false);
            }
            let pass = ctx.model.forward(batch.inputs.view())?;
            let reference = teacher.forward(batch.inputs.view())?;
            let kl = distillation_kl(pass.logits(), reference.logits(), kd_temperature).scaled(alpha);
            let loss = ctx
                .criterion
                .compute(pass.logits(), &batch.labels)
                .scaled(gamma)
                .combined(&kl);
            apply_update(ctx, &pass, &loss, None, false)?;
        }
        Ok(true)
    }
}

impl UnlearningMethod for Scrub {
    fn kind(&self) -> MethodKind {
        MethodKind::Scrub
    }

    fn prepare(&mut self, ctx: &mut EpochContext) -> EngineResult<()> {
        self.teacher = Some(ctx.model.boxed_clone());
        Ok(())
    }

    fn run_epoch(&mut self, ctx: &mut EpochContext) -> EngineResult<EpochOutcome> {
        let teacher = match self.teacher.take() {
            Some(teacher) => teacher,
            None => ctx.model.boxed_clone(),
        };
        let proceed = if ctx.epoch < self.max_steps(ctx.total_epochs) {
            Self::max_phase(teacher.as_ref(), self.params.kd_temperature, ctx)?
                && self.min_phase(teacher.as_ref(), ctx)?
        } else {
            self.min_phase(teacher.as_ref(), ctx)?
        };
        self.teacher = Some(teacher);
        if !proceed {
            return Ok(EpochOutcome::Cancelled);
        }
        Ok(EpochOutcome::Completed(ctx.forget_stats()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::fixtures::{self, FORGET_CLASS};

    #[test]
    fn max_steps_default_to_half_the_run() {
        let scrub = Scrub::new(ScrubParams::default());
        assert_eq!(scrub.max_steps(5), 3);
        assert_eq!(scrub.max_steps(4), 2);
        let fixed = Scrub::new(ScrubParams {
            msteps: Some(1),
            ..ScrubParams::default()
        });
        assert_eq!(fixed.max_steps(5), 1);
    }

    #[test]
    fn teacher_is_frozen_at_prepare() {
        let (bundle, model) = fixtures::trained();
        let mut ctx = fixtures::context(&bundle, &model, 0.1);
        let mut scrub = Scrub::new(ScrubParams::default());
        let stats = fixtures::run(&mut scrub, &mut ctx, 3);
        assert_eq!(stats[2], ctx.forget_stats().unwrap());

        let teacher = scrub.teacher.as_ref().unwrap();
        let frozen: Vec<_> = teacher.parameters().iter().map(|p| p.to_owned()).collect();
        let original: Vec<_> = model.parameters().iter().map(|p| p.to_owned()).collect();
        assert_eq!(frozen, original);

        let after = fixtures::train_report(&bundle, ctx.model.as_ref());
        assert!(after.remaining_accuracy(FORGET_CLASS) > 0.7);
    }

    #[test]
    fn cancellation_keeps_the_teacher() {
        let (bundle, model) = fixtures::trained();
        let mut ctx = fixtures::context(&bundle, &model, 0.1);
        let mut scrub = Scrub::new(ScrubParams::default());
        scrub.prepare(&mut ctx).unwrap();
        ctx.cancel.cancel();
        assert_eq!(scrub.run_epoch(&mut ctx).unwrap(), EpochOutcome::Cancelled);
        assert!(scrub.teacher.is_some());
    }
}
