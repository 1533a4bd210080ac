//! Job submission, supervision, and result storage.

/// Result records and their storage.
pub mod results;
/// Blocking job body.
pub mod worker;

use std::{fmt, sync::Arc, time::Duration};

use serde_json::{json, Value};
use shared_event_bus::ProgressPublisher;
use shared_logging::LogLevel;
use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};

use crate::{
    data::DatasetBundle,
    error::{EngineError, EngineResult},
    model::{load_model, Classifier, ModelFactory},
    request::UnlearningRequest,
    settings::Settings,
    status::{progress, CancelToken, StatusHandle},
    telemetry::EngineTelemetry,
};

pub use results::{
    compress_prob_array, privacy_accuracy, EmbeddingPoint, ResultRecord, ResultRecordBuilder,
    ResultStore, ResultSummary,
};
pub use worker::{JobScope, Worker, WorkerOutput, EVAL_BATCH_SIZE};

/// Module label on job telemetry.
const TELEMETRY_MODULE: &str = "unlearn.engine";

/// Final state of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Record written.
    Completed(ResultSummary),
    /// Stopped on request.
    Cancelled,
    /// Stopped on a runtime error.
    Failed(String),
}

/// Validates requests and runs at most one job at a time.
#[derive(Clone)]
pub struct JobController {
    settings: Arc<Settings>,
    datasets: DatasetBundle,
    factory: Arc<dyn ModelFactory>,
    publisher: Option<Arc<dyn ProgressPublisher>>,
    store: ResultStore,
}

impl fmt::Debug for JobController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobController")
            .field("settings", &self.settings)
            .field("factory", &self.factory)
            .field("has_publisher", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}

impl JobController {
    /// Checks `settings` and that the dataset matches the configured class count.
    pub fn new(
        settings: Settings,
        datasets: DatasetBundle,
        factory: Arc<dyn ModelFactory>,
    ) -> EngineResult<Self> {
        settings.validate()?;
        let classes = datasets.num_classes();
        if classes != settings.training.num_classes {
            return Err(EngineError::Settings(format!(
                "dataset has {classes} classes but training.num_classes is {}",
                settings.training.num_classes
            )));
        }
        let store = ResultStore::new(&settings.paths.data_dir);
        Ok(Self {
            settings: Arc::new(settings),
            datasets,
            factory,
            publisher: None,
            store,
        })
    }

    /// Publishes job lifecycle events on `publisher`.
    #[must_use]
    pub fn with_event_publisher(mut self, publisher: Arc<dyn ProgressPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Active settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Record storage.
    #[must_use]
    pub const fn results(&self) -> &ResultStore {
        &self.store
    }

    /// Validates `request`, loads its checkpoints, and spawns the worker.
    ///
    /// Configuration errors are returned here and leave `status` untouched.
    /// Must be called from within a Tokio runtime.
    pub fn submit(
        &self,
        request: UnlearningRequest,
        status: &StatusHandle,
    ) -> EngineResult<JobHandle> {
        let runtime = Handle::try_current()
            .map_err(|err| EngineError::Settings(format!("no async runtime: {err}")))?;
        if status.is_unlearning() {
            return Err(EngineError::InvalidRequest(
                "an unlearning job is already running".into(),
            ));
        }
        request.validate(self.settings.training.num_classes)?;
        let fc = request.forget_class;

        let model_after = load_model(self.factory.as_ref(), &request.base_weights)?;
        let model_before = load_model(self.factory.as_ref(), self.settings.before_checkpoint(fc))?;
        self.ensure_compatible(model_after.as_ref(), model_before.as_ref())?;
        let retrain_path = self.settings.retrain_checkpoint(fc);
        let retrain = if retrain_path.exists() {
            let retrain = load_model(self.factory.as_ref(), &retrain_path)?;
            self.ensure_compatible(model_after.as_ref(), retrain.as_ref())?;
            Some(retrain)
        } else {
            None
        };

        let id = self.store.fresh_id(fc);
        let telemetry = self.job_telemetry(&id)?;
        let method = request.method.build(&request.hyperparameters);
        let mut claimed = false;
        status.update(|current| {
            if !current.is_unlearning {
                current.reset_for_job(method.name(), request.epochs);
                current.recent_id = Some(id.clone());
                claimed = true;
            }
        });
        if !claimed {
            return Err(EngineError::InvalidRequest(
                "an unlearning job is already running".into(),
            ));
        }

        let started = json!({
            "method": method.tag(),
            "forget_class": fc,
            "epochs": request.epochs,
            "batch_size": request.batch_size,
            "learning_rate": request.learning_rate,
            "retrain_reference": retrain.is_some(),
        });
        let _ = telemetry.log(LogLevel::Info, "unlearning.job.started", started.clone());
        let _ = telemetry.event("unlearning.job.started", started);
        tracing::info!(job = %id, method = method.tag(), forget_class = fc, "unlearning job started");

        let cancel = CancelToken::new();
        let scope = JobScope {
            id: id.clone(),
            request,
            settings: Arc::clone(&self.settings),
            datasets: self.datasets.clone(),
            model_before,
            retrain,
            status: status.clone(),
            cancel: cancel.clone(),
            telemetry: Some(telemetry.clone()),
            store: self.store.clone(),
        };
        let worker = Worker::new(scope, model_after, method);
        let join = runtime.spawn_blocking(move || worker.run());

        let (tx, rx) = oneshot::channel();
        let supervisor = Supervisor {
            status: status.clone(),
            cancel,
            poll: Duration::from_millis(self.settings.controller.poll_interval_ms.max(1)),
            telemetry,
        };
        runtime.spawn(async move {
            let outcome = supervisor.run_unlearning(join).await;
            let _ = tx.send(outcome);
        });
        Ok(JobHandle { id, rx })
    }

    fn ensure_compatible(&self, model: &dyn Classifier, other: &dyn Classifier) -> EngineResult<()> {
        let architecture = model.architecture();
        architecture.ensure_matches(&other.architecture())?;
        let feature_dim = self.datasets.train.feature_dim();
        if architecture.input_dim != feature_dim {
            return Err(EngineError::ArchitectureMismatch(format!(
                "model expects {} input features, dataset has {feature_dim}",
                architecture.input_dim
            )));
        }
        if architecture.num_classes() != self.settings.training.num_classes {
            return Err(EngineError::ArchitectureMismatch(format!(
                "model predicts {} classes, settings expect {}",
                architecture.num_classes(),
                self.settings.training.num_classes
            )));
        }
        Ok(())
    }

    fn job_telemetry(&self, id: &str) -> EngineResult<EngineTelemetry> {
        let mut builder =
            EngineTelemetry::builder(TELEMETRY_MODULE).log_path(self.settings.job_log(id));
        if let Some(publisher) = &self.publisher {
            builder = builder.event_publisher(Arc::clone(publisher));
        }
        builder
            .build()
            .map(|telemetry| telemetry.for_job(id))
            .map_err(|err| EngineError::Settings(format!("job log unavailable: {err}")))
    }
}

/// Handle returned to await job completion.
#[derive(Debug)]
pub struct JobHandle {
    id: String,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    /// Result identifier assigned at submission.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Awaits the final outcome. Status is finalized before this resolves.
    pub async fn outcome(self) -> JobOutcome {
        self.rx
            .await
            .unwrap_or_else(|err| JobOutcome::Failed(format!("job supervisor dropped: {err}")))
    }
}

struct Supervisor {
    status: StatusHandle,
    cancel: CancelToken,
    poll: Duration,
    telemetry: EngineTelemetry,
}

impl Supervisor {
    /// Forwards cancellation until the worker exits, then finalizes status.
    async fn run_unlearning(
        self,
        join: JoinHandle<EngineResult<WorkerOutput>>,
    ) -> JobOutcome {
        while !join.is_finished() {
            if self.status.cancel_requested() {
                self.cancel.cancel();
            }
            tokio::time::sleep(self.poll).await;
        }
        let result = join
            .await
            .unwrap_or_else(|err| Err(EngineError::WorkerPanic(err.to_string())));
        let outcome = match result {
            Ok(WorkerOutput::Completed(summary)) => JobOutcome::Completed(summary),
            Ok(WorkerOutput::Cancelled) => JobOutcome::Cancelled,
            Err(err) => JobOutcome::Failed(err.to_string()),
        };

        self.status.update(|status| {
            status.is_unlearning = false;
            status.cancel_requested = false;
            status.estimated_time_remaining = 0.0;
            match &outcome {
                JobOutcome::Completed(_) => {
                    status.progress = progress::COMPLETED.to_string();
                    status.error = None;
                }
                JobOutcome::Cancelled => {
                    status.progress = progress::CANCELLED.to_string();
                    status.error = None;
                }
                JobOutcome::Failed(message) => {
                    status.progress = progress::FAILED.to_string();
                    status.error = Some(message.clone());
                }
            }
        });

        match &outcome {
            JobOutcome::Completed(summary) => {
                let payload = json!({
                    "path": summary.path.display().to_string(),
                    "ua": summary.ua,
                    "ra": summary.ra,
                    "fqs": summary.fqs,
                });
                tracing::info!(path = %summary.path.display(), "unlearning job completed");
                self.report(LogLevel::Info, "unlearning.job.completed", payload);
            }
            JobOutcome::Cancelled => {
                tracing::info!("unlearning job cancelled");
                self.report(LogLevel::Info, "unlearning.job.cancelled", Value::Null);
            }
            JobOutcome::Failed(message) => {
                tracing::error!(error = %message, "unlearning job failed");
                self.report(
                    LogLevel::Error,
                    "unlearning.job.failed",
                    json!({ "error": message }),
                );
            }
        }
        outcome
    }

    fn report(&self, level: LogLevel, message: &str, payload: Value) {
        let _ = self.telemetry.log(level, message, payload.clone());
        let _ = self.telemetry.event(message, payload);
    }
}

/// Submits `request` and waits for it to finish.
pub async fn run_unlearning(
    controller: &JobController,
    request: UnlearningRequest,
    status: &StatusHandle,
) -> EngineResult<JobOutcome> {
    let handle = controller.submit(request, status)?;
    Ok(handle.outcome().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        methods::MethodKind,
        model::{save_model, MlpClassifier, MlpFactory},
        settings::PathSettings,
        training::{prepare_workspace, TrainingPlan, WorkspaceSpec},
    };
    use shared_event_bus::MemoryProgressBus;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        settings: Settings,
        datasets: DatasetBundle,
        base: std::path::PathBuf,
    }

    fn fixture(train_per_class: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let mut settings = Settings {
            paths: PathSettings::under(dir.path()),
            ..Settings::default()
        };
        settings.embedding.data_size = 100;
        settings.similarity.samples_per_split = 40;
        settings.epoch_metrics.mia_samples = 60;
        settings.attack.thresholds = 10;
        settings.controller.poll_interval_ms = 5;
        let spec = WorkspaceSpec {
            num_classes: 10,
            train_per_class,
            test_per_class: 8,
            feature_dim: 8,
            hidden: vec![16],
            noise: 0.4,
            plan: TrainingPlan {
                epochs: 5,
                batch_size: 32,
                learning_rate: 0.05,
            },
        };
        let prepared = prepare_workspace(&settings, &spec).unwrap();
        let datasets = DatasetBundle::load(&prepared.dataset).unwrap();
        Fixture {
            _dir: dir,
            settings,
            datasets,
            base: prepared.base_weights,
        }
    }

    fn controller(fixture: &Fixture) -> JobController {
        JobController::new(
            fixture.settings.clone(),
            fixture.datasets.clone(),
            Arc::new(MlpFactory::new(0)),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fine_tuning_job_writes_complete_record() {
        let fixture = fixture(20);
        let bus = Arc::new(MemoryProgressBus::new(4096));
        let controller = controller(&fixture).with_event_publisher(bus.clone());
        let status = StatusHandle::new().with_telemetry(
            EngineTelemetry::builder("unlearn.status")
                .event_publisher(bus.clone())
                .build()
                .unwrap(),
        );
        let request = UnlearningRequest::new(MethodKind::FineTuning, 3, &fixture.base)
            .with_epochs(2)
            .with_batch_size(32);

        let handle = controller.submit(request, &status).unwrap();
        let id = handle.id().to_string();
        let JobOutcome::Completed(summary) = handle.outcome().await else {
            panic!("job did not complete");
        };

        let snapshot = status.snapshot();
        assert_eq!(snapshot.current_epoch, 2);
        assert!(!snapshot.is_unlearning);
        assert_eq!(snapshot.progress, progress::COMPLETED);
        assert_eq!(snapshot.recent_id.as_deref(), Some(id.as_str()));

        let raw = std::fs::read_to_string(&summary.path).unwrap();
        let created = raw.find("\"CreatedAt\"").unwrap();
        let fc = raw.find("\"FC\"").unwrap();
        let accs = raw.find("\"accs\"").unwrap();
        let points = raw.find("\"points\"").unwrap();
        assert!(created < fc && fc < accs && accs < points);

        let record = controller.results().load(3, &id).unwrap();
        assert_eq!(record.accs.len(), 10);
        assert_eq!(record.points.len(), 100);
        assert_eq!(record.method, "FineTuning");
        assert!((snapshot.p_training_accuracy - record.ra).abs() < f64::EPSILON);
        assert!((snapshot.p_test_accuracy - record.tra).abs() < f64::EPSILON);
        assert!(record.cka_retrain.is_none());
        let series = record.epoch_metrics.unwrap();
        assert!(series.values().all(|values| values.len() == 3));
        assert!(std::path::Path::new(&record.epoch_plot_path.unwrap()).exists());
        assert!(controller
            .results()
            .artifact_path(3, &id, "forget_distributions.json")
            .exists());
        assert!(fixture.settings.unlearned_checkpoint(3, &id).exists());
        assert!(fixture.settings.job_log(&id).exists());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.of_type("unlearning.job.started").len(), 1);
        assert_eq!(bus.of_type("unlearning.job.completed").len(), 1);
        assert!(!bus.of_type("unlearning.status").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_job_leaves_no_record() {
        let fixture = fixture(20);
        let controller = controller(&fixture);
        let status = StatusHandle::new();
        let request = UnlearningRequest::new(MethodKind::FineTuning, 2, &fixture.base)
            .with_epochs(500)
            .with_batch_size(4);

        let handle = controller.submit(request.clone(), &status).unwrap();
        let id = handle.id().to_string();
        let second = controller.submit(request, &status).unwrap_err();
        assert!(second.is_configuration());

        status.request_cancel();
        assert_eq!(handle.outcome().await, JobOutcome::Cancelled);

        let snapshot = status.snapshot();
        assert!(!snapshot.is_unlearning);
        assert!(!snapshot.cancel_requested);
        assert!(snapshot.current_epoch < 500);
        assert_eq!(snapshot.progress, progress::CANCELLED);
        assert!(!controller.results().record_path(2, &id).exists());
        assert!(controller.results().list(2).unwrap().is_empty());
    }

    #[tokio::test]
    async fn configuration_errors_are_synchronous() {
        let fixture = fixture(6);
        let controller = controller(&fixture);
        let status = StatusHandle::new();

        let bad_class = UnlearningRequest::new(MethodKind::FineTuning, 10, &fixture.base);
        let err = controller.submit(bad_class, &status).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        let missing = UnlearningRequest::new(
            MethodKind::FineTuning,
            1,
            fixture.settings.paths.models_dir.join("absent.json"),
        );
        let err = controller.submit(missing, &status).unwrap_err();
        assert!(matches!(err, EngineError::MissingCheckpoint(_)));

        let narrow = fixture.settings.paths.models_dir.join("narrow.json");
        save_model(&MlpClassifier::new(8, &[4], 10, 1), &narrow).unwrap();
        let mismatched = UnlearningRequest::new(MethodKind::FineTuning, 1, &narrow);
        let err = controller.submit(mismatched, &status).unwrap_err();
        assert!(matches!(err, EngineError::ArchitectureMismatch(_)));

        let snapshot = status.snapshot();
        assert!(!snapshot.is_unlearning);
        assert_eq!(snapshot.progress, progress::IDLE);
        assert_eq!(snapshot.version, 0);
    }

    #[tokio::test]
    async fn controller_rejects_class_count_mismatch() {
        let fixture = fixture(6);
        let mut settings = fixture.settings.clone();
        settings.training.num_classes = 5;
        let err = JobController::new(settings, fixture.datasets.clone(), Arc::new(MlpFactory::new(0)))
            .unwrap_err();
        assert!(matches!(err, EngineError::Settings(_)));
    }
}
