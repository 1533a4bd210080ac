use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use shared_event_bus::{FileProgressPublisher, ProgressPublisher};
use shared_logging::{JobLogger, LogLevel, LogRecord};
use tracing_subscriber::EnvFilter;
use unlearn_engine::{
    prepare_workspace, retrain_reference,
    settings::PathSettings,
    CancelToken, DatasetBundle, EngineTelemetry, JobController, JobOutcome, MethodKind,
    MlpFactory, ResultStore, Settings, StatusHandle, TrainingPlan, UnlearningRequest,
    WorkspaceSpec,
};

const SETTINGS_FILE: &str = "settings.toml";

#[derive(Parser, Debug)]
#[command(name = "unl", version, about = "Class-unlearning experiment driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synthesizes a dataset, trains a base model, and writes its checkpoints.
    Prepare(PrepareArgs),
    /// Runs one unlearning job and streams its status.
    Run(RunArgs),
    /// Lists stored results for a forget class.
    List {
        #[arg(long, default_value = SETTINGS_FILE)]
        settings: PathBuf,
        #[arg(long)]
        forget_class: usize,
    },
    /// Prints one stored result record.
    Show {
        #[arg(long, default_value = SETTINGS_FILE)]
        settings: PathBuf,
        #[arg(long)]
        forget_class: usize,
        #[arg(long)]
        id: String,
    },
}

#[derive(Args, Debug)]
struct PrepareArgs {
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value_t = 10)]
    classes: usize,
    #[arg(long, default_value_t = 200)]
    per_class: usize,
    #[arg(long, default_value_t = 50)]
    test_per_class: usize,
    #[arg(long, default_value_t = 32)]
    feature_dim: usize,
    #[arg(long, default_value_t = 15)]
    epochs: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Also trains retain-only reference models for these classes.
    #[arg(long, value_delimiter = ',')]
    retrain: Vec<usize>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value = SETTINGS_FILE)]
    settings: PathBuf,
    /// Dataset bundle; defaults to `{data_dir}/dataset.json`.
    #[arg(long)]
    dataset: Option<PathBuf>,
    #[arg(long, default_value = "ft")]
    method: MethodKind,
    #[arg(long)]
    forget_class: usize,
    #[arg(long, default_value_t = 5)]
    epochs: usize,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 0.01)]
    lr: f32,
    /// Weights to unlearn from; defaults to `{models_dir}/base_0000.json`.
    #[arg(long)]
    base: Option<PathBuf>,
    /// JSON-lines file receiving every progress event.
    #[arg(long)]
    event_log: Option<PathBuf>,
    #[arg(long, default_value_t = 500)]
    refresh_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Prepare(args) => handle_prepare(&args),
        Commands::Run(args) => handle_run(args).await,
        Commands::List {
            settings,
            forget_class,
        } => {
            let settings = load_settings(&settings)?;
            let store = ResultStore::new(&settings.paths.data_dir);
            let summaries = store.list(forget_class)?;
            if summaries.is_empty() {
                println!("no results for class {forget_class}");
            }
            for summary in summaries {
                println!(
                    "{} | {} | {} | UA {:.3} | RA {:.3} | TUA {:.3} | TRA {:.3} | PA {:.3} | FQS {:.3} | {:.1}s",
                    summary.id,
                    summary.created_at,
                    summary.method,
                    summary.ua,
                    summary.ra,
                    summary.tua,
                    summary.tra,
                    summary.pa,
                    summary.fqs,
                    summary.rte
                );
            }
            Ok(())
        }
        Commands::Show {
            settings,
            forget_class,
            id,
        } => {
            let settings = load_settings(&settings)?;
            let record = ResultStore::new(&settings.paths.data_dir)
                .load(forget_class, &id)
                .with_context(|| format!("loading result {id} for class {forget_class}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}

fn handle_prepare(args: &PrepareArgs) -> Result<()> {
    let mut settings = Settings {
        paths: PathSettings::under(&args.output),
        ..Settings::default()
    };
    settings.training.num_classes = args.classes;
    settings.training.seed = args.seed;
    settings.embedding.data_size = settings.embedding.data_size.min(args.classes * args.per_class);
    settings.validate().context("invalid workspace shape")?;

    let spec = WorkspaceSpec {
        num_classes: args.classes,
        train_per_class: args.per_class,
        test_per_class: args.test_per_class,
        feature_dim: args.feature_dim,
        plan: TrainingPlan {
            epochs: args.epochs,
            ..TrainingPlan::default()
        },
        ..WorkspaceSpec::default()
    };
    let prepared = prepare_workspace(&settings, &spec).context("preparing workspace")?;
    tracing::info!(
        accuracy = prepared.training.final_accuracy,
        loss = prepared.training.final_loss,
        "base model trained"
    );

    if !args.retrain.is_empty() {
        let datasets = DatasetBundle::load(&prepared.dataset)?;
        let factory = MlpFactory::new(args.seed);
        for &class in &args.retrain {
            if class >= args.classes {
                bail!("retrain class {class} outside 0..{}", args.classes);
            }
            retrain_reference(&settings, &datasets, &factory, class, spec.plan, &CancelToken::new())?;
        }
    }

    let settings_path = args.output.join(SETTINGS_FILE);
    settings.save(&settings_path)?;
    log_cli_event(
        &settings,
        LogLevel::Info,
        "workspace prepared",
        json!({
            "output": args.output,
            "classes": args.classes,
            "retrain": args.retrain,
        }),
    )?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "settings": settings_path,
            "dataset": prepared.dataset,
            "base_weights": prepared.base_weights,
            "before_checkpoints": prepared.before_checkpoints.len(),
            "training": prepared.training,
        }))?
    );
    Ok(())
}

async fn handle_run(args: RunArgs) -> Result<()> {
    let settings = load_settings(&args.settings)?;
    let dataset_path = args
        .dataset
        .clone()
        .unwrap_or_else(|| settings.paths.data_dir.join("dataset.json"));
    let datasets = DatasetBundle::load(&dataset_path)
        .with_context(|| format!("loading dataset {}", dataset_path.display()))?;
    let base = args
        .base
        .clone()
        .unwrap_or_else(|| settings.paths.models_dir.join("base_0000.json"));

    let mut controller = JobController::new(
        settings.clone(),
        datasets,
        Arc::new(MlpFactory::new(settings.training.seed)),
    )?;
    let mut status = StatusHandle::new();
    if let Some(path) = &args.event_log {
        let publisher: Arc<dyn ProgressPublisher> = Arc::new(FileProgressPublisher::new(path)?);
        controller = controller.with_event_publisher(Arc::clone(&publisher));
        status = status.with_telemetry(
            EngineTelemetry::builder("unl.status")
                .event_publisher(publisher)
                .build()?,
        );
    }

    let request = UnlearningRequest::new(args.method, args.forget_class, base)
        .with_epochs(args.epochs)
        .with_batch_size(args.batch_size)
        .with_learning_rate(args.lr);
    let handle = controller.submit(request, &status)?;
    let id = handle.id().to_string();
    log_cli_event(
        &settings,
        LogLevel::Info,
        "job submitted",
        json!({ "job_id": id, "method": args.method.tag(), "forget_class": args.forget_class }),
    )?;
    tracing::info!(job = %id, method = args.method.display_name(), "job submitted");

    let outcome = handle.outcome();
    tokio::pin!(outcome);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.refresh_ms.max(50)));
    let mut last_version = 0;
    let outcome = loop {
        tokio::select! {
            outcome = &mut outcome => break outcome,
            _ = ticker.tick() => {
                let snapshot = status.snapshot();
                if snapshot.version != last_version {
                    last_version = snapshot.version;
                    tracing::info!(
                        progress = %snapshot.progress,
                        epoch = snapshot.current_epoch,
                        total = snapshot.total_epochs,
                        loss = snapshot.current_unlearn_loss,
                        accuracy = snapshot.current_unlearn_accuracy,
                        eta_s = snapshot.estimated_time_remaining,
                        "status"
                    );
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for ctrl-c")?;
                tracing::warn!("cancellation requested");
                status.request_cancel();
            }
        }
    };

    match outcome {
        JobOutcome::Completed(summary) => {
            log_cli_event(
                &settings,
                LogLevel::Info,
                "job completed",
                json!({ "job_id": id, "path": summary.path }),
            )?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        JobOutcome::Cancelled => {
            log_cli_event(&settings, LogLevel::Warn, "job cancelled", json!({ "job_id": id }))?;
            println!("job {id} cancelled");
            Ok(())
        }
        JobOutcome::Failed(error) => {
            log_cli_event(
                &settings,
                LogLevel::Error,
                "job failed",
                json!({ "job_id": id, "error": error }),
            )?;
            bail!("job {id} failed: {error}")
        }
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    Settings::load(path).with_context(|| format!("loading settings {}", path.display()))
}

fn log_cli_event(settings: &Settings, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
    let logger = JobLogger::new(settings.paths.log_dir.join("unl.log"))?;
    let record = LogRecord::new("unl", level, message).with_metadata(metadata);
    logger.log(&record)
}
