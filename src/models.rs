// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::JobError;

/// Number of chunks needed to cover `file_size` bytes, or `None` when the count
/// does not fit a chunk index.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    u32::try_from(file_size.div_ceil(chunk_size)).ok()
}

/// The byte range `[index * chunk_size, min((index + 1) * chunk_size, file_size))`.
pub fn chunk_range(file_size: u64, chunk_size: u64, index: u32) -> Range<u64> {
    let start = (index as u64 * chunk_size).min(file_size);
    let end = start.saturating_add(chunk_size).min(file_size);
    start..end
}

/// What the uploaded file is going to be used for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadType {
    LeadImport,
    TemplateAsset,
    BulkEmailAsset,
}

/// The status of an upload job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Uploading,
    Uploaded,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Uploading => "uploading",
            JobStatus::Uploaded => "uploaded",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// True once the byte-transfer phase can make no further progress on its own.
    pub fn is_upload_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Uploading)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Uploading, Uploaded)
                | (Uploading, Failed)
                | (Uploading, Cancelled)
                | (Uploaded, Processing)
                | (Uploaded, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Uploading)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

/// Server-side record of one byte range of the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub index: u32,
    pub status: ChunkStatus,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Aggregate batch counters maintained by the processing coordinator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingStats {
    pub total_batches: u32,
    pub completed_batches: u32,
    pub failed_batches: u32,
}

impl ProcessingStats {
    pub fn is_terminal(&self) -> bool {
        self.completed_batches + self.failed_batches == self.total_batches
    }

    /// True when `later` never moved a counter backwards relative to `self`.
    pub fn is_monotonic_successor(&self, later: &ProcessingStats) -> bool {
        later.completed_batches >= self.completed_batches
            && later.failed_batches >= self.failed_batches
    }
}

/// Represents the complete, persistent state of a single upload job.
/// Serialized as one JSON document per job by the state manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: String,
    pub filename: String,
    pub file_size: u64,
    pub file_type: String,
    pub upload_type: UploadType,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub status: JobStatus,
    /// Passed through to processing untouched.
    #[serde(default)]
    pub validation_rules: Option<serde_json::Value>,
    pub chunks: Vec<ChunkRecord>,
    #[serde(default)]
    pub processing: ProcessingStats,
    pub error_message: Option<String>,
    /// SHA-256 of the assembled file, set once every chunk is in.
    #[serde(default)]
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadJob {
    pub fn new(id: String, request: &CreateJobRequest) -> Result<Self, JobError> {
        let total = request.chunk_count()?;
        let now = Utc::now();
        Ok(Self {
            id,
            filename: request.filename.clone(),
            file_size: request.file_size,
            file_type: request.file_type.clone(),
            upload_type: request.upload_type,
            chunk_size: request.chunk_size,
            total_chunks: total,
            status: JobStatus::Pending,
            validation_rules: request.validation_rules.clone(),
            chunks: (0..total)
                .map(|index| ChunkRecord {
                    index,
                    status: ChunkStatus::Pending,
                    retry_count: 0,
                    error: None,
                })
                .collect(),
            processing: ProcessingStats::default(),
            error_message: None,
            checksum: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn chunk_range(&self, index: u32) -> Range<u64> {
        chunk_range(self.file_size, self.chunk_size, index)
    }

    /// Moves the job to `next`, rejecting edges outside the lifecycle.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidState {
                job_id: self.id.clone(),
                status: self.status,
                action: format!("move to {}", next.as_str()),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Marks the job failed and keeps the message that caused it.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), JobError> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn chunks_completed(&self) -> u32 {
        self.chunks.iter().filter(|c| c.status == ChunkStatus::Completed).count() as u32
    }

    pub fn chunks_failed(&self) -> u32 {
        self.chunks.iter().filter(|c| c.status == ChunkStatus::Failed).count() as u32
    }

    pub fn all_chunks_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.status == ChunkStatus::Completed)
    }

    pub fn progress(&self) -> UploadProgress {
        UploadProgress {
            status: self.status,
            chunks_completed: self.chunks_completed(),
            chunks_failed: self.chunks_failed(),
            total_chunks: self.total_chunks,
            error_message: self.error_message.clone(),
        }
    }
}

/// Client-local mirror of a chunk; rebuilt from server acknowledgments.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkState {
    pub index: u32,
    pub status: ChunkStatus,
    /// 0.0 until the server acknowledges the chunk, then 1.0.
    pub progress: f32,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl ChunkState {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            status: ChunkStatus::Pending,
            progress: 0.0,
            error: None,
            retry_count: 0,
        }
    }
}

// --- Wire types -----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub filename: String,
    pub file_size: u64,
    pub file_type: String,
    pub upload_type: UploadType,
    pub chunk_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_rules: Option<serde_json::Value>,
}

impl CreateJobRequest {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.filename.trim().is_empty() {
            return Err(JobError::InvalidRequest("filename is required".into()));
        }
        if self.file_type.trim().is_empty() {
            return Err(JobError::InvalidRequest("file_type is required".into()));
        }
        if self.file_size == 0 {
            return Err(JobError::InvalidRequest("file_size must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(JobError::InvalidRequest("chunk_size must be positive".into()));
        }
        self.chunk_count()?;
        Ok(())
    }

    pub fn chunk_count(&self) -> Result<u32, JobError> {
        total_chunks(self.file_size, self.chunk_size).ok_or_else(|| {
            JobError::InvalidRequest(format!(
                "{} bytes in chunks of {} bytes needs too many chunks",
                self.file_size, self.chunk_size
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub upload_job: UploadJob,
    pub chunk_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkAck {
    pub chunk_index: u32,
    pub status: ChunkStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadProgress {
    pub status: JobStatus,
    pub chunks_completed: u32,
    pub chunks_failed: u32,
    pub total_chunks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Body of `POST /upload/{jobId}/progress`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    Cancel,
    Retry,
    /// Sent by a client whose retries for one chunk ran out.
    ChunkFailed { chunk_index: u32, error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CsvConfig {
    pub delimiter: char,
    pub has_header: bool,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self { delimiter: ',', has_header: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImportConfig {
    /// Rows per batch; the server default applies when absent.
    pub batch_size: Option<usize>,
    /// Handed to the batch processor as-is.
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessRequest {
    pub csv_config: Option<CsvConfig>,
    pub import_config: Option<ImportConfig>,
}
