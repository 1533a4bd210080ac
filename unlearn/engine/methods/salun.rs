use ndarray::{ArrayD, Zip};

use super::{
    fine_tune_phase, random_label_phase, EpochContext, EpochOutcome, MethodKind, UnlearningMethod,
};
use crate::{
    data::Partition,
    error::EngineResult,
    model::{loss::CrossEntropyLoss, Classifier, Gradients, ParamMask},
    request::SalUnParams,
};

/// Random labeling restricted to the parameters most salient for the forget set.
#[derive(Debug)]
pub struct SalUn {
    params: SalUnParams,
    mask: Option<ParamMask>,
}

impl SalUn {
    /// Creates the method with its saliency ratio.
    #[must_use]
    pub const fn new(params: SalUnParams) -> Self {
        Self { params, mask: None }
    }

    /// Mask computed by [`UnlearningMethod::prepare`].
    #[must_use]
    pub const fn mask(&self) -> Option<&ParamMask> {
        self.mask.as_ref()
    }
}

/// Keeps the `ratio` fraction of parameter entries with the largest accumulated
/// |∂CE/∂θ| over `forget`, ranked globally across tensors.
pub fn saliency_mask(
    model: &dyn Classifier,
    forget: &Partition,
    batch_size: usize,
    criterion: &CrossEntropyLoss,
    ratio: f32,
) -> EngineResult<ParamMask> {
    let mut saliency = Gradients::zeros_like(model);
    for batch in forget.loader(batch_size, false, 0).epoch() {
        let pass = model.forward(batch.inputs.view())?;
        let out = criterion.compute(pass.logits(), &batch.labels);
        let grads = model.backward(&pass, out.grad.view())?;
        for (acc, grad) in saliency.tensors.iter_mut().zip(&grads.tensors) {
            Zip::from(acc).and(grad).for_each(|a, &g| *a += g.abs());
        }
    }

    let mut ranked: Vec<(f32, usize, usize)> = saliency
        .tensors
        .iter()
        .enumerate()
        .flat_map(|(tensor, values)| {
            values
                .iter()
                .enumerate()
                .map(move |(entry, &value)| (value, tensor, entry))
        })
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    let keep = ((f64::from(ratio) * ranked.len() as f64).ceil() as usize).min(ranked.len());

    let mut flags: Vec<Vec<f32>> = saliency
        .tensors
        .iter()
        .map(|tensor| vec![0.0; tensor.len()])
        .collect();
    for &(_, tensor, entry) in &ranked[..keep] {
        flags[tensor][entry] = 1.0;
    }
    let tensors = saliency
        .tensors
        .iter()
        .zip(flags)
        .map(|(tensor, flags)| ArrayD::from_shape_vec(tensor.raw_dim(), flags))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ParamMask { tensors })
}

impl UnlearningMethod for SalUn {
    fn kind(&self) -> MethodKind {
        MethodKind::SalUn
    }

    fn prepare(&mut self, ctx: &mut EpochContext) -> EngineResult<()> {
        let mask = saliency_mask(
            ctx.model.as_ref(),
            ctx.forget.partition(),
            ctx.eval_batch_size,
            &ctx.criterion,
            self.params.saliency_ratio,
        )?;
        tracing::debug!(density = mask.density(), "saliency mask ready");
        self.mask = Some(mask);
        Ok(())
    }

    fn run_epoch(&mut self, ctx: &mut EpochContext) -> EngineResult<EpochOutcome> {
        if self.mask.is_none() {
            self.prepare(ctx)?;
        }
        let mask = self.mask.as_ref();
        if random_label_phase(ctx, mask)?.is_none() || fine_tune_phase(ctx, mask)?.is_none() {
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
    fn mask_keeps_requested_fraction() {
        let (bundle, model) = fixtures::trained();
        let forget = Partition::forget(&bundle.train, FORGET_CLASS);
        let half = saliency_mask(&model, &forget, 16, &CrossEntropyLoss, 0.5).unwrap();
        assert!((half.density() - 0.5).abs() < 0.01);
        let all = saliency_mask(&model, &forget, 16, &CrossEntropyLoss, 1.0).unwrap();
        assert!((all.density() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn masked_relabeling_erodes_forget_class() {
        let (bundle, model) = fixtures::trained();
        let before = fixtures::train_report(&bundle, &model).class_accuracy(FORGET_CLASS);
        let mut ctx = fixtures::context(&bundle, &model, 0.1);
        let mut salun = SalUn::new(SalUnParams::default());
        let stats = fixtures::run(&mut salun, &mut ctx, 3);
        assert!(salun.mask().is_some());
        assert_eq!(stats[2], ctx.forget_stats().unwrap());
        let after = fixtures::train_report(&bundle, ctx.model.as_ref()).class_accuracy(FORGET_CLASS);
        assert!(after < before, "before {before} after {after}");
    }
}
