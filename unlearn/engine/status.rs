use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::telemetry::EngineTelemetry;

/// Progress labels written to [`UnlearningStatus::progress`].
pub mod progress {
    /// No job has run yet.
    pub const IDLE: &str = "Idle";
    /// Epoch loop running.
    pub const UNLEARNING: &str = "Unlearning";
    /// Post-training evaluation of the train split.
    pub const EVALUATING_TRAIN: &str = "Evaluating Train Set";
    /// Post-training evaluation of the test split.
    pub const EVALUATING_TEST: &str = "Evaluating Test Set";
    /// Embedding and attack stage.
    pub const EMBEDDING: &str = "Computing Embedding";
    /// Representation similarity stage.
    pub const SIMILARITY: &str = "Calculating CKA Similarity";
    /// Result assembly and persistence.
    pub const PREPARING_RESULTS: &str = "Preparing Results";
    /// Job finished and the record was written.
    pub const COMPLETED: &str = "Completed";
    /// Job stopped on request.
    pub const CANCELLED: &str = "Cancelled";
    /// Job stopped on error.
    pub const FAILED: &str = "Failed";
}

/// Externally visible state of the current job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlearningStatus {
    /// A job is running.
    pub is_unlearning: bool,
    /// Caller asked the running job to stop.
    pub cancel_requested: bool,
    /// Human-readable stage label.
    pub progress: String,
    /// Display name of the running method.
    pub method: String,
    /// Identifier of the current or last job.
    pub recent_id: Option<String>,
    /// Epochs completed so far.
    pub current_epoch: usize,
    /// Epochs requested.
    pub total_epochs: usize,
    /// Loss reported by the last finished epoch.
    pub current_unlearn_loss: f64,
    /// Accuracy reported by the last finished epoch.
    pub current_unlearn_accuracy: f64,
    /// Seconds remaining, extrapolated from elapsed epoch time.
    pub estimated_time_remaining: f64,
    /// Post-training train-split loss.
    pub p_training_loss: f64,
    /// Post-training train-split accuracy over the remaining classes.
    pub p_training_accuracy: f64,
    /// Post-training test-split loss.
    pub p_test_loss: f64,
    /// Post-training test-split accuracy over the remaining classes.
    pub p_test_accuracy: f64,
    /// Failure message of the last job.
    pub error: Option<String>,
    /// Incremented on every write.
    pub version: u64,
}

impl Default for UnlearningStatus {
    fn default() -> Self {
        Self {
            is_unlearning: false,
            cancel_requested: false,
            progress: progress::IDLE.to_string(),
            method: String::new(),
            recent_id: None,
            current_epoch: 0,
            total_epochs: 0,
            current_unlearn_loss: 0.0,
            current_unlearn_accuracy: 0.0,
            estimated_time_remaining: 0.0,
            p_training_loss: 0.0,
            p_training_accuracy: 0.0,
            p_test_loss: 0.0,
            p_test_accuracy: 0.0,
            error: None,
            version: 0,
        }
    }
}

impl UnlearningStatus {
    /// Clears per-job fields ahead of a new run.
    pub fn reset_for_job(&mut self, method: &str, total_epochs: usize) {
        let version = self.version;
        *self = Self {
            is_unlearning: true,
            progress: progress::UNLEARNING.to_string(),
            method: method.to_string(),
            total_epochs,
            version,
            ..Self::default()
        };
    }
}

/// Shared status cell. Workers and controllers write; anyone may read snapshots or request cancellation.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<RwLock<UnlearningStatus>>,
    telemetry: Option<EngineTelemetry>,
}

impl StatusHandle {
    /// Creates an idle status.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits `unlearning.status` on every write.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Consistent copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> UnlearningStatus {
        self.inner.read().clone()
    }

    /// Asks the running job to stop at its next checkpoint.
    pub fn request_cancel(&self) {
        self.update(|status| {
            if status.is_unlearning {
                status.cancel_requested = true;
            }
        });
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.inner.read().cancel_requested
    }

    /// Whether a job is running.
    #[must_use]
    pub fn is_unlearning(&self) -> bool {
        self.inner.read().is_unlearning
    }

    /// Applies `change` under the write lock and bumps the version.
    pub fn update(&self, change: impl FnOnce(&mut UnlearningStatus)) {
        let snapshot = {
            let mut status = self.inner.write();
            change(&mut status);
            status.version += 1;
            self.telemetry.as_ref().map(|_| status.clone())
        };
        if let (Some(tel), Some(status)) = (&self.telemetry, snapshot) {
            let _ = tel.event("unlearning.status", json!(status));
        }
    }
}

/// Cooperative stop flag checked by workers at batch and stage boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_bump_version() {
        let status = StatusHandle::new();
        let start = status.snapshot().version;
        status.update(|s| s.current_epoch = 1);
        status.update(|s| s.current_epoch = 2);
        let snap = status.snapshot();
        assert_eq!(snap.version, start + 2);
        assert_eq!(snap.current_epoch, 2);
    }

    #[test]
    fn cancel_only_applies_to_running_job() {
        let status = StatusHandle::new();
        status.request_cancel();
        assert!(!status.cancel_requested());
        status.update(|s| s.reset_for_job("Fine-Tuning", 3));
        status.request_cancel();
        assert!(status.cancel_requested());
    }

    #[test]
    fn reset_keeps_version_monotonic() {
        let status = StatusHandle::new();
        status.update(|s| s.current_epoch = 4);
        let before = status.snapshot().version;
        status.update(|s| s.reset_for_job("SCRUB", 2));
        let snap = status.snapshot();
        assert!(snap.version > before);
        assert_eq!(snap.current_epoch, 0);
        assert!(snap.is_unlearning);
        assert_eq!(snap.progress, progress::UNLEARNING);
    }

    #[test]
    fn token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
