use super::{ascent_phase, EpochContext, EpochOutcome, MethodKind, UnlearningMethod};
use crate::error::EngineResult;

/// Ascends cross-entropy on the forget set with clipped gradients.
///
/// Reports the positive cross-entropy and accuracy seen on forget batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientAscent;

impl UnlearningMethod for GradientAscent {
    fn kind(&self) -> MethodKind {
        MethodKind::GradientAscent
    }

    fn run_epoch(&mut self, ctx: &mut EpochContext) -> EngineResult<EpochOutcome> {
        Ok(ascent_phase(ctx)?.map_or(EpochOutcome::Cancelled, EpochOutcome::Completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        methods::fixtures::{self, FORGET_CLASS},
        model::Classifier,
    };

    #[test]
    fn ascent_drops_forget_accuracy_only_in_ua() {
        let (bundle, model) = fixtures::trained();
        let before = fixtures::train_report(&bundle, &model);
        assert!(before.class_accuracy(FORGET_CLASS) > 0.9);

        let mut ctx = fixtures::context(&bundle, &model, 0.5);
        let stats = fixtures::run(&mut GradientAscent, &mut ctx, 5);
        assert_eq!(stats.len(), 5);
        assert!(stats.iter().all(|s| s.loss >= 0.0));

        let after = fixtures::train_report(&bundle, ctx.model.as_ref());
        let ua = after.class_accuracy(FORGET_CLASS);
        assert!(ua < before.class_accuracy(FORGET_CLASS), "ua {ua}");
        let others: Vec<f64> = (0..4)
            .filter(|&c| c != FORGET_CLASS)
            .map(|c| after.class_accuracy(c))
            .collect();
        let expected = others.iter().sum::<f64>() / 3.0;
        assert!((after.remaining_accuracy(FORGET_CLASS) - expected).abs() < 1e-12);
        assert_eq!(ctx.model.num_classes(), 4);
    }

    #[test]
    fn cancelled_epoch_leaves_weights_untouched() {
        let (bundle, model) = fixtures::trained();
        let mut ctx = fixtures::context(&bundle, &model, 0.1);
        ctx.cancel.cancel();
        let outcome = GradientAscent.run_epoch(&mut ctx).unwrap();
        assert_eq!(outcome, EpochOutcome::Cancelled);
        let before: Vec<_> = model.parameters().iter().map(|p| p.to_owned()).collect();
        let after: Vec<_> = ctx.model.parameters().iter().map(|p| p.to_owned()).collect();
        assert_eq!(before, after);
    }
}
