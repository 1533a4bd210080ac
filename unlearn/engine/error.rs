use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the unlearning engine.
///
/// Configuration variants are returned synchronously from job submission;
/// runtime variants surface through the job outcome.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Two models (or a model and a dataset) disagree on layer layout.
    #[error("architecture mismatch: {0}")]
    ArchitectureMismatch(String),
    /// Required checkpoint is absent.
    #[error("checkpoint not found: {}", .0.display())]
    MissingCheckpoint(PathBuf),
    /// Settings could not be parsed or are inconsistent.
    #[error("settings error: {0}")]
    Settings(String),
    /// Loss or gradients went non-finite.
    #[error("numeric instability: {0}")]
    NumericInstability(String),
    /// Tensor dimensions did not line up.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    Dimension {
        /// Expected size.
        expected: usize,
        /// Observed size.
        found: usize,
    },
    /// ndarray reshape failure.
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    /// Dataset construction or loading failure.
    #[error("dataset error: {0}")]
    Data(#[from] crate::data::DataError),
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Result assembly was missing a section.
    #[error("result record is missing `{0}`")]
    IncompleteRecord(&'static str),
    /// Background worker panicked or was aborted.
    #[error("worker panicked: {0}")]
    WorkerPanic(String),
}

impl EngineError {
    /// True for errors detected before a job is spawned.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::ArchitectureMismatch(_)
                | Self::MissingCheckpoint(_)
                | Self::Settings(_)
        )
    }
}

/// Convenience alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_configuration_errors() {
        assert!(EngineError::InvalidRequest("epochs".into()).is_configuration());
        assert!(EngineError::MissingCheckpoint(PathBuf::from("a.json")).is_configuration());
        assert!(!EngineError::NumericInstability("nan".into()).is_configuration());
        assert!(!EngineError::WorkerPanic("boom".into()).is_configuration());
    }

    #[test]
    fn renders_missing_checkpoint_path() {
        let err = EngineError::MissingCheckpoint(PathBuf::from("models/3/0003.json"));
        assert_eq!(err.to_string(), "checkpoint not found: models/3/0003.json");
    }
}
