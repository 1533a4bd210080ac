//! Supervised training for base models and retrained references.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    data::{DataLoader, DatasetBundle, Partition},
    error::EngineResult,
    model::{
        loss::{count_correct, CrossEntropyLoss},
        optim::Sgd,
        save_model,
        scheduler::{LrPolicy, LrScheduler},
        Checkpoint, Classifier, MlpClassifier, ModelFactory,
    },
    settings::{Settings, TrainingSettings},
    status::CancelToken,
};

/// Decay applied at each `decreasing_lr` milestone while training from scratch.
const TRAINING_GAMMA: f32 = 0.1;

/// Summary of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    /// Epochs that ran to completion.
    pub epochs_run: usize,
    /// Mean batch loss of the last epoch.
    pub final_loss: f64,
    /// Accuracy over the last epoch's batches.
    pub final_accuracy: f64,
    /// Training stopped on the cancel token.
    pub cancelled: bool,
}

/// Minimises cross-entropy over `loader` with momentum SGD.
pub fn train_classifier(
    model: &mut dyn Classifier,
    loader: &mut DataLoader,
    epochs: usize,
    learning_rate: f32,
    settings: &TrainingSettings,
    cancel: &CancelToken,
) -> EngineResult<TrainingOutcome> {
    let criterion = CrossEntropyLoss;
    let mut optimizer = Sgd::new(learning_rate, settings.momentum, settings.weight_decay);
    let mut scheduler = LrScheduler::new(
        LrPolicy::MultiStep {
            milestones: settings.decreasing_lr.clone(),
            gamma: TRAINING_GAMMA,
        },
        learning_rate,
        epochs,
    );
    let mut outcome = TrainingOutcome {
        epochs_run: 0,
        final_loss: 0.0,
        final_accuracy: 0.0,
        cancelled: false,
    };
    for epoch in 0..epochs {
        let (mut loss_sum, mut batches, mut correct, mut seen) = (0.0_f64, 0_usize, 0_usize, 0_usize);
        for batch in loader.epoch() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                return Ok(outcome);
            }
            let pass = model.forward(batch.inputs.view())?;
            let out = criterion.compute(pass.logits(), &batch.labels);
            correct += count_correct(pass.logits(), &batch.labels);
            seen += batch.labels.len();
            loss_sum += f64::from(out.loss);
            batches += 1;
            let grads = model.backward(&pass, out.grad.view())?;
            optimizer.step(model, &grads)?;
        }
        scheduler.step(&mut optimizer);
        outcome.epochs_run = epoch + 1;
        outcome.final_loss = if batches == 0 { 0.0 } else { loss_sum / batches as f64 };
        outcome.final_accuracy = if seen == 0 { 0.0 } else { correct as f64 / seen as f64 };
        tracing::debug!(
            epoch = epoch + 1,
            loss = outcome.final_loss,
            accuracy = outcome.final_accuracy,
            "training epoch finished"
        );
    }
    Ok(outcome)
}

/// Hyperparameters for supervised runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingPlan {
    /// Epochs.
    pub epochs: usize,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Base learning rate.
    pub learning_rate: f32,
}

impl Default for TrainingPlan {
    fn default() -> Self {
        Self {
            epochs: 15,
            batch_size: 64,
            learning_rate: 0.05,
        }
    }
}

/// Trains a freshly initialised model on the retain split and saves it as the
/// retrained reference for `forget_class`.
pub fn retrain_reference(
    settings: &Settings,
    datasets: &DatasetBundle,
    factory: &dyn ModelFactory,
    forget_class: usize,
    plan: TrainingPlan,
    cancel: &CancelToken,
) -> EngineResult<Option<PathBuf>> {
    let architecture = Checkpoint::load(settings.before_checkpoint(forget_class))?.architecture;
    let mut model = factory.build(&architecture)?;
    let mut loader = Partition::retain(&datasets.train, forget_class).loader(
        plan.batch_size,
        true,
        settings.training.seed,
    );
    let outcome = train_classifier(
        model.as_mut(),
        &mut loader,
        plan.epochs,
        plan.learning_rate,
        &settings.training,
        cancel,
    )?;
    if outcome.cancelled {
        return Ok(None);
    }
    let path = settings.retrain_checkpoint(forget_class);
    save_model(model.as_ref(), &path)?;
    tracing::info!(forget_class, path = %path.display(), "retrained reference saved");
    Ok(Some(path))
}

/// Shape of a synthetic workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    /// Number of classes.
    pub num_classes: usize,
    /// Training samples per class.
    pub train_per_class: usize,
    /// Test samples per class.
    pub test_per_class: usize,
    /// Feature width.
    pub feature_dim: usize,
    /// Hidden layer widths.
    pub hidden: Vec<usize>,
    /// Gaussian noise around class centres.
    pub noise: f32,
    /// Base training run.
    pub plan: TrainingPlan,
}

impl Default for WorkspaceSpec {
    fn default() -> Self {
        Self {
            num_classes: 10,
            train_per_class: 200,
            test_per_class: 50,
            feature_dim: 32,
            hidden: vec![64, 32],
            noise: 0.6,
            plan: TrainingPlan::default(),
        }
    }
}

/// Files written by [`prepare_workspace`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedWorkspace {
    /// Dataset bundle JSON.
    pub dataset: PathBuf,
    /// Base weights to unlearn from.
    pub base_weights: PathBuf,
    /// Per-class "before" checkpoints.
    pub before_checkpoints: Vec<PathBuf>,
    /// Base model training summary.
    pub training: TrainingOutcome,
}

/// Synthesises a dataset, trains a base model, and lays out its checkpoints.
pub fn prepare_workspace(
    settings: &Settings,
    spec: &WorkspaceSpec,
) -> EngineResult<PreparedWorkspace> {
    let seed = settings.training.seed;
    let datasets = DatasetBundle::synthetic(
        spec.num_classes,
        spec.train_per_class,
        spec.test_per_class,
        spec.feature_dim,
        spec.noise,
        seed,
    );
    let dataset = settings.paths.data_dir.join("dataset.json");
    datasets.save(&dataset)?;

    let mut model = MlpClassifier::new(spec.feature_dim, &spec.hidden, spec.num_classes, seed);
    let mut loader = Partition::full(&datasets.train).loader(spec.plan.batch_size, true, seed);
    let training = train_classifier(
        &mut model,
        &mut loader,
        spec.plan.epochs,
        spec.plan.learning_rate,
        &settings.training,
        &CancelToken::new(),
    )?;

    let base_weights = settings.paths.models_dir.join("base_0000.json");
    save_model(&model, &base_weights)?;
    let before_checkpoints = (0..spec.num_classes)
        .map(|class| {
            let path = settings.before_checkpoint(class);
            save_model(&model, &path).map(|()| path)
        })
        .collect::<EngineResult<Vec<_>>>()?;
    tracing::info!(
        classes = spec.num_classes,
        accuracy = training.final_accuracy,
        "workspace prepared"
    );
    Ok(PreparedWorkspace {
        dataset,
        base_weights,
        before_checkpoints,
        training,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{eval::evaluator::evaluate, model::MlpFactory, settings::PathSettings};
    use tempfile::tempdir;

    #[test]
    fn training_fits_separable_blobs() {
        let bundle = DatasetBundle::synthetic(3, 30, 10, 4, 0.3, 5);
        let mut model = MlpClassifier::new(4, &[12], 3, 2);
        let mut loader = Partition::full(&bundle.train).loader(16, true, 1);
        let outcome = train_classifier(
            &mut model,
            &mut loader,
            25,
            0.1,
            &TrainingSettings::default(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(outcome.epochs_run, 25);
        let report = evaluate(&model, &Partition::full(&bundle.test), 32, &CrossEntropyLoss).unwrap();
        assert!(report.accuracy > 0.9, "accuracy {}", report.accuracy);
    }

    #[test]
    fn cancelled_training_stops_early() {
        let bundle = DatasetBundle::synthetic(3, 10, 2, 4, 0.3, 5);
        let mut model = MlpClassifier::new(4, &[6], 3, 2);
        let mut loader = Partition::full(&bundle.train).loader(8, false, 0);
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = train_classifier(
            &mut model,
            &mut loader,
            5,
            0.1,
            &TrainingSettings::default(),
            &cancel,
        )
        .unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.epochs_run, 0);
    }

    #[test]
    fn prepared_workspace_supports_retraining() {
        let dir = tempdir().unwrap();
        let settings = Settings {
            paths: PathSettings::under(dir.path()),
            ..Settings::default()
        };
        let spec = WorkspaceSpec {
            num_classes: 3,
            train_per_class: 12,
            test_per_class: 4,
            feature_dim: 4,
            hidden: vec![8],
            noise: 0.3,
            plan: TrainingPlan {
                epochs: 3,
                batch_size: 8,
                learning_rate: 0.05,
            },
        };
        let prepared = prepare_workspace(&settings, &spec).unwrap();
        assert_eq!(prepared.before_checkpoints.len(), 3);
        assert!(prepared.base_weights.exists());
        assert!(settings.before_checkpoint(2).exists());

        let datasets = DatasetBundle::load(&prepared.dataset).unwrap();
        let path = retrain_reference(
            &settings,
            &datasets,
            &MlpFactory::new(3),
            1,
            spec.plan,
            &CancelToken::new(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(path, settings.retrain_checkpoint(1));
        assert!(path.exists());
    }
}
