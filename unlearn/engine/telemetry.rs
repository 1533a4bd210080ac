use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{ProgressEvent, ProgressPublisher};
use shared_logging::{JobLogger, LogLevel, LogRecord};
use tokio::runtime::{Builder, Handle};

/// Builder for engine telemetry sinks.
pub struct EngineTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    publisher: Option<Arc<dyn ProgressPublisher>>,
}

impl EngineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the progress publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn ProgressPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<EngineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JobLogger::new(path)?),
            None => None,
        };
        Ok(EngineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.publisher,
            }),
            job_id: None,
        })
    }
}

/// Telemetry handle shared by the controller and its worker.
#[derive(Clone)]
pub struct EngineTelemetry {
    inner: Arc<TelemetryInner>,
    job_id: Option<Arc<str>>,
}

impl fmt::Debug for EngineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTelemetry")
            .field("module", &self.inner.module)
            .field("job_id", &self.job_id)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JobLogger>,
    publisher: Option<Arc<dyn ProgressPublisher>>,
}

impl EngineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> EngineTelemetryBuilder {
        EngineTelemetryBuilder::new(module)
    }

    /// Handle that tags every record and event with `job_id`.
    #[must_use]
    pub fn for_job(&self, job_id: &str) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            job_id: Some(Arc::from(job_id)),
        }
    }

    /// Job the handle is bound to.
    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let mut record =
                LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            if let Some(job) = &self.job_id {
                record = record.for_job(job.as_ref());
            }
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits a progress event.
    ///
    /// Inside a runtime the publish is spawned; otherwise it runs to completion
    /// on a throwaway current-thread runtime.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let mut event = ProgressEvent::new(&self.inner.module, event_type, payload);
        if let Some(job) = &self.job_id {
            event = event.for_job(job.as_ref());
        }
        let publisher = Arc::clone(publisher);
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = publisher.publish(event).await {
                    tracing::warn!(error = %err, "progress event publish failed");
                }
            });
            Ok(())
        } else {
            let runtime = Builder::new_current_thread().enable_all().build()?;
            runtime.block_on(publisher.publish(event))
        }
    }
}
