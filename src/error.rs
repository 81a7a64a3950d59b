// src/error.rs

use thiserror::Error;

use crate::models::JobStatus;

/// Errors raised by the job store persistence layer.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Server-side errors for job creation, chunk receipt, control and processing.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job creation rejected; nothing is stored.
    #[error("invalid upload request: {0}")]
    InvalidRequest(String),
    #[error("upload job {0} not found")]
    NotFound(String),
    #[error("job {job_id} is {status:?}, cannot {action}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        action: String,
    },
    #[error("chunk {index} is out of range (job has {total} chunks)")]
    ChunkOutOfRange { index: u32, total: u32 },
    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch { index: u32, expected: u64, actual: u64 },
    #[error("processing failed: {0}")]
    Processing(String),
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn status_code(&self) -> u16 {
        match self {
            JobError::InvalidRequest(_) | JobError::ChunkOutOfRange { .. } => 400,
            JobError::NotFound(_) => 404,
            JobError::InvalidState { .. } => 409,
            JobError::ChunkSizeMismatch { .. } | JobError::Processing(_) => 422,
            JobError::State(_) | JobError::Io(_) => 500,
        }
    }
}

/// Failures talking to the upload endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Network(e) => e.status().map(|s| s.as_u16()),
            ApiError::Status { status, .. } => Some(*status),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        ApiError::Status {
            status: err.status_code(),
            message: err.to_string(),
        }
    }
}

/// Errors surfaced to the caller of an upload session.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("job creation failed: {0}")]
    JobCreation(String),
    #[error("{} chunk(s) failed permanently: {message}", .failed.len())]
    ChunksFailed { failed: Vec<u32>, message: String },
    #[error("upload endpoint error: {0}")]
    Api(#[from] ApiError),
    #[error("session cannot {0} right now")]
    InvalidState(&'static str),
}
