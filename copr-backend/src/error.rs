//! Backend-wide error types.

use thiserror::Error;

/// Backend-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Backend-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Shared state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Pop from an empty priority queue")]
    QueueEmpty,

    #[error("Task {0} is not queued")]
    TaskNotFound(String),

    #[error("Task {0} is already queued or running")]
    QueueDuplicate(String),

    #[error("Failed to start worker {worker_id}: {detail}")]
    WorkerStartFailed { worker_id: String, detail: String },

    #[error("Worker {0} failed to start in time")]
    WorkerStillborn(String),

    #[error("Worker {0} is dead")]
    WorkerDead(String),

    #[error("Frontend unavailable: {0}")]
    FrontendUnavailable(String),

    #[error("Batch for {0} was already processed by a peer")]
    BatchMergeLost(String),

    #[error("createrepo failed for {dir}: {detail}")]
    Createrepo { dir: String, detail: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn frontend(msg: impl Into<String>) -> Self {
        Self::FrontendUnavailable(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn start_failed(worker_id: impl Into<String>, detail: impl ToString) -> Self {
        Self::WorkerStartFailed {
            worker_id: worker_id.into(),
            detail: detail.to_string(),
        }
    }

    /// Errors the control loops back off from and retry on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::Database(_) | Self::FrontendUnavailable(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::FrontendUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::store("down").is_transient());
        assert!(Error::frontend("502").is_transient());
        assert!(!Error::QueueEmpty.is_transient());
        assert!(!Error::config("bad prefix").is_transient());
    }

    #[test]
    fn test_start_failed_message() {
        let err = Error::start_failed("rpm_build_worker:42", "no such file");
        assert_eq!(
            err.to_string(),
            "Failed to start worker rpm_build_worker:42: no such file"
        );
    }
}
