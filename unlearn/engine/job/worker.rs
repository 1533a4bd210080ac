//! Blocking job body: epoch loop followed by the post-training pipeline.

use std::{
    fs,
    sync::Arc,
    time::{Duration, Instant},
};

use rand::{rngs::SmallRng, SeedableRng};
use serde_json::{json, Value};
use shared_logging::LogLevel;

use super::results::{embedding_points, ResultRecordBuilder, ResultStore, ResultSummary};
use crate::{
    data::{balanced_subset, DatasetBundle, Partition},
    error::EngineResult,
    eval::{
        attack::{attack_from_activations, forget_distributions},
        embedding::compute_embedding,
        epoch_metrics::{EpochMetricsAggregator, EpochMetricsSeries},
        evaluator::{collect_activations, evaluate},
        round_to,
        similarity::{calculate_cka_similarity, CkaSources},
    },
    methods::{EpochContext, EpochOutcome, UnlearningMethod},
    model::{loss::CrossEntropyLoss, optim::Sgd, save_model, scheduler::LrScheduler, Classifier},
    request::UnlearningRequest,
    settings::{Settings, SubsetSplit},
    status::{progress, CancelToken, StatusHandle},
    telemetry::EngineTelemetry,
};

/// Batch size for every no-gradient pass.
pub const EVAL_BATCH_SIZE: usize = 256;

/// How the worker finished.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
    /// Record written.
    Completed(ResultSummary),
    /// Stopped on the cancel token; nothing was persisted.
    Cancelled,
}

/// Everything a job reads besides the model it trains.
#[derive(Debug)]
pub struct JobScope {
    /// Result identifier.
    pub id: String,
    /// Validated request.
    pub request: UnlearningRequest,
    /// Engine settings.
    pub settings: Arc<Settings>,
    /// Train and test splits.
    pub datasets: DatasetBundle,
    /// Model before unlearning, the similarity reference.
    pub model_before: Box<dyn Classifier>,
    /// Optional model retrained without the forget class.
    pub retrain: Option<Box<dyn Classifier>>,
    /// Shared status cell.
    pub status: StatusHandle,
    /// Stop flag fed by the controller.
    pub cancel: CancelToken,
    /// Job-tagged telemetry.
    pub telemetry: Option<EngineTelemetry>,
    /// Record storage.
    pub store: ResultStore,
}

/// Owns the model being unlearned for the lifetime of one job.
#[derive(Debug)]
pub struct Worker {
    scope: JobScope,
    model: Box<dyn Classifier>,
    method: Box<dyn UnlearningMethod>,
}

impl Worker {
    /// Binds `model` and `method` to a job.
    #[must_use]
    pub fn new(
        scope: JobScope,
        model: Box<dyn Classifier>,
        method: Box<dyn UnlearningMethod>,
    ) -> Self {
        Self {
            scope,
            model,
            method,
        }
    }

    /// Runs the job to completion, cancellation, or the first error.
    pub fn run(self) -> EngineResult<WorkerOutput> {
        let Self {
            scope,
            model,
            mut method,
        } = self;
        let fc = scope.request.forget_class;
        let seed = scope.settings.training.seed;
        let training = &scope.settings.training;

        let mut aggregator = if scope.settings.epoch_metrics.enabled {
            let mut aggregator = EpochMetricsAggregator::initialize(
                model.as_ref(),
                &scope.datasets,
                fc,
                &scope.settings,
                EVAL_BATCH_SIZE,
            )?;
            aggregator.collect(model.as_ref(), 0)?;
            Some(aggregator)
        } else {
            None
        };
        let setup_metrics_time = aggregator
            .as_ref()
            .map_or(Duration::ZERO, EpochMetricsAggregator::time_spent);

        let policy = scope
            .request
            .lr_policy
            .clone()
            .unwrap_or_else(|| scope.request.method.default_lr_policy(training));
        let mut scheduler =
            LrScheduler::new(policy, scope.request.learning_rate, scope.request.epochs);
        let mut optimizer = Sgd::new(
            scope.request.learning_rate,
            training.momentum,
            training.weight_decay,
        );
        optimizer.set_lr(scheduler.current_lr());

        let batch_size = scope.request.batch_size;
        let mut ctx = EpochContext {
            model,
            optimizer,
            criterion: CrossEntropyLoss,
            retain: Partition::retain(&scope.datasets.train, fc).loader(batch_size, true, seed),
            forget: Partition::forget(&scope.datasets.train, fc).loader(
                batch_size,
                true,
                seed.wrapping_add(1),
            ),
            cancel: scope.cancel.clone(),
            rng: SmallRng::seed_from_u64(seed),
            max_grad_norm: training.max_grad_norm,
            epoch: 0,
            total_epochs: scope.request.epochs,
            eval_batch_size: EVAL_BATCH_SIZE,
        };

        let started = Instant::now();
        method.prepare(&mut ctx)?;
        let unlearning_time = |aggregator: &Option<EpochMetricsAggregator>| {
            let metrics = aggregator
                .as_ref()
                .map_or(setup_metrics_time, EpochMetricsAggregator::time_spent);
            unlearning_duration(started.elapsed(), metrics, setup_metrics_time)
        };

        for epoch in 0..scope.request.epochs {
            if ctx.cancel.is_cancelled() {
                return Ok(WorkerOutput::Cancelled);
            }
            ctx.epoch = epoch;
            let stats = match method.run_epoch(&mut ctx)? {
                EpochOutcome::Completed(stats) => stats,
                EpochOutcome::Cancelled => return Ok(WorkerOutput::Cancelled),
            };
            let lr = scheduler.step(&mut ctx.optimizer);
            if let Some(aggregator) = aggregator.as_mut() {
                aggregator.collect(ctx.model.as_ref(), epoch + 1)?;
            }

            let done = epoch + 1;
            let elapsed = unlearning_time(&aggregator).as_secs_f64();
            let remaining = estimated_remaining(elapsed, done, scope.request.epochs);
            scope.status.update(|status| {
                status.current_epoch = done;
                status.current_unlearn_loss = round_to(stats.loss, 3);
                status.current_unlearn_accuracy = round_to(stats.accuracy, 3);
                status.estimated_time_remaining = round_to(remaining, 2);
            });
            tracing::info!(
                job = %scope.id,
                epoch = done,
                loss = stats.loss,
                accuracy = stats.accuracy,
                lr,
                "unlearning epoch finished"
            );
            scope.log(
                LogLevel::Info,
                "unlearning.epoch.completed",
                json!({
                    "epoch": done,
                    "loss": stats.loss,
                    "accuracy": stats.accuracy,
                    "lr": lr,
                }),
            );
        }
        let runtime = unlearning_time(&aggregator).as_secs_f64();
        let series = aggregator.map(EpochMetricsAggregator::into_series);
        let model = ctx.model;

        match scope.post_training(model.as_ref(), runtime, series) {
            Ok(Some(summary)) => Ok(WorkerOutput::Completed(summary)),
            Ok(None) => Ok(WorkerOutput::Cancelled),
            Err(err) => {
                let path = scope.settings.unlearned_checkpoint(fc, &scope.id);
                if let Err(save_err) = save_model(model.as_ref(), &path) {
                    tracing::warn!(error = %save_err, "could not save model after failure");
                } else {
                    scope.log(
                        LogLevel::Warn,
                        "unlearning.model.saved_after_failure",
                        json!({ "path": path.display().to_string() }),
                    );
                }
                Err(err)
            }
        }
    }
}

/// Seconds left once `done` of `total` epochs took `elapsed` seconds.
#[must_use]
pub fn estimated_remaining(elapsed: f64, done: usize, total: usize) -> f64 {
    if done == 0 {
        return 0.0;
    }
    (elapsed / done as f64).mul_add(total as f64, -elapsed).max(0.0)
}

/// Loop wall time without the metrics collected after setup.
#[must_use]
pub fn unlearning_duration(wall: Duration, metrics_total: Duration, metrics_setup: Duration) -> Duration {
    wall.saturating_sub(metrics_total.saturating_sub(metrics_setup))
}

impl JobScope {
    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }

    /// Moves to `stage`; false when the job was cancelled instead.
    fn enter(&self, stage: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.status.update(|status| status.progress = stage.to_string());
        tracing::debug!(job = %self.id, stage, "entering stage");
        true
    }

    fn post_training(
        &self,
        model: &dyn Classifier,
        runtime: f64,
        series: Option<EpochMetricsSeries>,
    ) -> EngineResult<Option<ResultSummary>> {
        let fc = self.request.forget_class;
        let seed = self.settings.training.seed;
        let criterion = CrossEntropyLoss;
        fs::create_dir_all(self.store.class_dir(fc))?;

        if !self.enter(progress::EVALUATING_TRAIN) {
            return Ok(None);
        }
        let train = evaluate(model, &Partition::full(&self.datasets.train), EVAL_BATCH_SIZE, &criterion)?;
        self.status.update(|status| {
            status.p_training_loss = round_to(train.loss, 3);
            status.p_training_accuracy = round_to(train.remaining_accuracy(fc), 3);
        });

        if !self.enter(progress::EVALUATING_TEST) {
            return Ok(None);
        }
        let test = evaluate(model, &Partition::full(&self.datasets.test), EVAL_BATCH_SIZE, &criterion)?;
        self.status.update(|status| {
            status.p_test_loss = round_to(test.loss, 3);
            status.p_test_accuracy = round_to(test.remaining_accuracy(fc), 3);
        });

        if !self.enter(progress::EMBEDDING) {
            return Ok(None);
        }
        let source = match self.settings.embedding.dataset {
            SubsetSplit::Train => &self.datasets.train,
            SubsetSplit::Test => &self.datasets.test,
        };
        let subset = balanced_subset(source, self.settings.embedding.data_size, seed);
        let activations = collect_activations(model, &subset, EVAL_BATCH_SIZE)?;
        let forget_flags: Vec<bool> = activations.labels.iter().map(|&label| label == fc).collect();
        let coords = compute_embedding(
            activations.penultimate(),
            &activations.predictions,
            &forget_flags,
            fc,
        );
        let points = embedding_points(&activations, &coords, fc);
        let attack = attack_from_activations(&activations, fc, &self.settings.attack);
        let distributions = forget_distributions(
            model,
            &Partition::forget(&self.datasets.train, fc),
            &self.settings.attack,
            EVAL_BATCH_SIZE,
        )?;

        if !self.enter(progress::SIMILARITY) {
            return Ok(None);
        }
        let sources = CkaSources::new(
            &self.datasets,
            fc,
            self.settings.similarity.samples_per_split,
            seed,
        );
        let cka = calculate_cka_similarity(self.model_before.as_ref(), model, &sources, EVAL_BATCH_SIZE)?;
        let cka_retrain = self
            .retrain
            .as_deref()
            .map(|retrain| calculate_cka_similarity(retrain, model, &sources, EVAL_BATCH_SIZE))
            .transpose()?;

        if !self.enter(progress::PREPARING_RESULTS) {
            return Ok(None);
        }
        let mut builder = ResultRecordBuilder::new(self.id.clone(), &self.request)
            .runtime(runtime)
            .train(train)
            .test(test)
            .similarity(cka, cka_retrain)
            .points(points)
            .attack(attack);
        let csv = self.store.artifact_path(fc, &self.id, "epoch_metrics.csv");
        if let Some(series) = &series {
            builder = builder.epoch_metrics(csv.display().to_string(), series.clone());
        }
        let record = builder.build()?;
        let distributions = serde_json::to_vec_pretty(&distributions)?;
        let path = self.store.save(&record)?;
        fs::write(
            self.store.artifact_path(fc, &self.id, "forget_distributions.json"),
            distributions,
        )?;
        if let Some(series) = &series {
            series.write_csv(&csv)?;
        }
        save_model(model, self.settings.unlearned_checkpoint(fc, &self.id))?;
        tracing::info!(job = %self.id, path = %path.display(), ua = record.ua, ra = record.ra, "result record saved");
        Ok(Some(record.summary(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        methods::MethodKind,
        model::{load_model, MlpClassifier, MlpFactory},
        settings::PathSettings,
        training::{prepare_workspace, TrainingPlan, WorkspaceSpec},
    };
    use tempfile::{tempdir, TempDir};

    const FORGET_CLASS: usize = 4;

    fn workspace() -> (TempDir, Settings, DatasetBundle, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let mut settings = Settings {
            paths: PathSettings::under(dir.path()),
            ..Settings::default()
        };
        settings.embedding.data_size = 60;
        settings.similarity.samples_per_split = 30;
        settings.epoch_metrics.mia_samples = 40;
        settings.attack.thresholds = 8;
        let spec = WorkspaceSpec {
            num_classes: 10,
            train_per_class: 12,
            test_per_class: 6,
            feature_dim: 8,
            hidden: vec![16],
            noise: 0.4,
            plan: TrainingPlan {
                epochs: 3,
                batch_size: 32,
                learning_rate: 0.05,
            },
        };
        let prepared = prepare_workspace(&settings, &spec).unwrap();
        let datasets = DatasetBundle::load(&prepared.dataset).unwrap();
        (dir, settings, datasets, prepared.base_weights)
    }

    fn worker(
        settings: &Settings,
        datasets: &DatasetBundle,
        base: &std::path::Path,
        retrain: Option<Box<dyn Classifier>>,
    ) -> Worker {
        let factory = MlpFactory::new(0);
        let request = UnlearningRequest::new(MethodKind::FineTuning, FORGET_CLASS, base)
            .with_epochs(2)
            .with_batch_size(16);
        let method = request.method.build(&request.hyperparameters);
        let scope = JobScope {
            id: "ab12".into(),
            request,
            settings: Arc::new(settings.clone()),
            datasets: datasets.clone(),
            model_before: load_model(&factory, settings.before_checkpoint(FORGET_CLASS)).unwrap(),
            retrain,
            status: StatusHandle::new(),
            cancel: CancelToken::new(),
            telemetry: None,
            store: ResultStore::new(&settings.paths.data_dir),
        };
        Worker::new(scope, load_model(&factory, base).unwrap(), method)
    }

    #[test]
    fn remaining_time_extrapolates_mean_epoch() {
        assert!((estimated_remaining(2.0, 1, 5) - 8.0).abs() < 1e-12);
        assert!((estimated_remaining(6.0, 3, 4) - 2.0).abs() < 1e-12);
        assert!(estimated_remaining(7.5, 4, 4).abs() < f64::EPSILON);
        assert!(estimated_remaining(3.0, 0, 4).abs() < f64::EPSILON);
    }

    #[test]
    fn runtime_drops_metrics_collected_after_setup() {
        let wall = Duration::from_millis(900);
        let setup = Duration::from_millis(200);
        let total = Duration::from_millis(500);
        assert_eq!(unlearning_duration(wall, total, setup), Duration::from_millis(600));
        assert_eq!(unlearning_duration(wall, setup, setup), wall);
        assert_eq!(
            unlearning_duration(Duration::from_millis(100), total, setup),
            Duration::ZERO
        );
    }

    #[test]
    fn runtime_stays_below_wall_time() {
        let (_dir, settings, datasets, base) = workspace();
        assert!(settings.epoch_metrics.enabled);
        let worker = worker(&settings, &datasets, &base, None);

        let started = Instant::now();
        let output = worker.run().unwrap();
        let wall = started.elapsed().as_secs_f64();

        let WorkerOutput::Completed(summary) = output else {
            panic!("worker did not complete");
        };
        assert!(summary.rte <= round_to(wall, 1));
    }

    #[test]
    fn failed_similarity_stage_writes_no_artifacts() {
        let (_dir, settings, datasets, base) = workspace();
        let narrow: Box<dyn Classifier> = Box::new(MlpClassifier::new(8, &[4], 10, 1));
        let worker = worker(&settings, &datasets, &base, Some(narrow));

        assert!(worker.run().is_err());

        let store = ResultStore::new(&settings.paths.data_dir);
        assert!(!store.record_path(FORGET_CLASS, "ab12").exists());
        assert!(!store
            .artifact_path(FORGET_CLASS, "ab12", "forget_distributions.json")
            .exists());
        assert!(!store
            .artifact_path(FORGET_CLASS, "ab12", "epoch_metrics.csv")
            .exists());
        assert!(settings.unlearned_checkpoint(FORGET_CLASS, "ab12").exists());
    }
}
