use crate::job::{JobId, JobStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeferworkError {
    #[error("Store error: {message}")]
    Store { message: String },

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {id} has no call specification")]
    EmptyJob { id: JobId },

    #[error("No such job: {id}")]
    NoSuchJob { id: JobId },

    #[error("Cannot resolve callable '{name}'")]
    CallableResolution { name: String },

    #[error("Unreadable call specification: {message}")]
    UnreadableCallSpec { message: String },

    #[error("Job {job_id} depends on job {parent_id}, which has not finished")]
    DependencyNotResolved { job_id: JobId, parent_id: JobId },

    #[error("Job {id} cannot move from {from:?} to {to:?}")]
    InvalidStatusTransition {
        id: JobId,
        from: Option<JobStatus>,
        to: JobStatus,
    },

    #[error("Invalid job arguments: {message}")]
    InvalidArguments { message: String },

    #[error("Invalid value for field '{field}' of job {id}: {message}")]
    InvalidRecord {
        id: JobId,
        field: String,
        message: String,
    },

    #[error("Transaction on '{key}' kept conflicting after {attempts} attempts")]
    TransactionConflict { key: String, attempts: u32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("UUID parsing error: {0}")]
    UuidParsing(#[from] uuid::Error),

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for DeferworkError {
    fn from(err: toml::de::Error) -> Self {
        DeferworkError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for DeferworkError {
    fn from(err: toml::ser::Error) -> Self {
        DeferworkError::Config(format!("TOML serialization error: {}", err))
    }
}
