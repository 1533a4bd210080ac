#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Class-unlearning engine: method loops, cancellable jobs, and post-training diagnostics.

/// Engine error taxonomy.
#[path = "../error.rs"]
pub mod error;

/// TOML settings and storage layout.
#[path = "../settings.rs"]
pub mod settings;

/// Telemetry helpers for logging/event emission.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Unlearning requests and method hyperparameters.
#[path = "../request.rs"]
pub mod request;

/// Shared job status and cancellation.
#[path = "../status.rs"]
pub mod status;

/// Supervised training for base models and retrained references.
#[path = "../training.rs"]
pub mod training;

/// Classifiers, losses, optimizers, and checkpoints.
#[path = "../model/main.rs"]
pub mod model;

/// Datasets, partitions, and loaders.
#[path = "../data/main.rs"]
pub mod data;

/// Evaluation, attack, embedding, and similarity.
#[path = "../eval/main.rs"]
pub mod eval;

/// Unlearning strategies.
#[path = "../methods/main.rs"]
pub mod methods;

/// Job controller, worker, and result records.
#[path = "../job/main.rs"]
pub mod job;

pub use data::{DataLoader, DatasetBundle, LabeledDataset, Partition};
pub use error::{EngineError, EngineResult};
pub use job::{
    run_unlearning, JobController, JobHandle, JobOutcome, ResultRecord, ResultStore,
    ResultSummary,
};
pub use methods::{MethodKind, UnlearningMethod};
pub use model::{
    load_model, save_model, scheduler::LrPolicy, Checkpoint, Classifier, MlpClassifier,
    MlpFactory, ModelFactory,
};
pub use request::{MethodHyperparameters, SalUnParams, ScrubParams, UnlearningRequest};
pub use settings::Settings;
pub use status::{CancelToken, StatusHandle, UnlearningStatus};
pub use telemetry::{EngineTelemetry, EngineTelemetryBuilder};
pub use training::{prepare_workspace, retrain_reference, TrainingPlan, WorkspaceSpec};
