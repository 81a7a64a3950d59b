// src/manager.rs

use crate::config::ServerConfig;
use crate::error::JobError;
use crate::integrity::sha256_sum;
use crate::models::{
    ChunkAck, ChunkStatus, ControlAction, CreateJobRequest, CreateJobResponse, JobStatus,
    ProcessingStats, UploadJob, UploadProgress,
};
use crate::processor::FailurePolicy;
use crate::state_manager::StateManager;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of asking to start processing for a job.
#[derive(Debug)]
pub enum ProcessingClaim {
    /// The caller owns this processing run.
    Started {
        job: UploadJob,
        token: CancellationToken,
    },
    /// Processing was already triggered; nothing new is started.
    AlreadyStarted(ProcessingStats),
}

/// Server-side job store: owns every upload job, its chunk records and batch counters.
pub struct JobManager {
    state_manager: StateManager,
    jobs: Mutex<HashMap<String, Arc<Mutex<UploadJob>>>>,
    // One token per running processing job.
    cancellation_tokens: Mutex<HashMap<String, CancellationToken>>,
    data_dir: PathBuf,
    max_chunk_size: u64,
    max_chunks: u32,
    max_chunk_retries: u32,
}

impl JobManager {
    pub async fn new(state_manager: StateManager, config: &ServerConfig) -> Result<Self, JobError> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let mut jobs = HashMap::new();
        for mut job in state_manager.load_all_jobs().await? {
            // No worker survives a restart, so an interrupted run starts over.
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Uploaded;
                job.processing = ProcessingStats::default();
                state_manager.save_job(&job).await?;
                info!(job_id = %job.id, "reset interrupted processing run");
            }
            jobs.insert(job.id.clone(), Arc::new(Mutex::new(job)));
        }
        info!(jobs = jobs.len(), "loaded upload jobs");

        Ok(Self {
            state_manager,
            jobs: Mutex::new(jobs),
            cancellation_tokens: Mutex::new(HashMap::new()),
            data_dir: config.data_dir.clone(),
            max_chunk_size: config.max_chunk_size,
            max_chunks: config.max_chunks,
            max_chunk_retries: config.max_chunk_retries.max(1),
        })
    }

    fn part_path(&self, job_id: &str) -> PathBuf {
        self.data_dir.join(format!("{job_id}.part"))
    }

    /// Where the file lives once every chunk has been received.
    pub fn assembled_path(&self, job_id: &str) -> PathBuf {
        self.data_dir.join(format!("{job_id}.upload"))
    }

    async fn job(&self, job_id: &str) -> Result<Arc<Mutex<UploadJob>>, JobError> {
        self.jobs
            .lock()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    pub async fn get_job(&self, job_id: &str) -> Result<UploadJob, JobError> {
        let job = self.job(job_id).await?;
        let snapshot = job.lock().await.clone();
        Ok(snapshot)
    }

    pub async fn create_job(
        &self,
        request: CreateJobRequest,
    ) -> Result<CreateJobResponse, JobError> {
        request.validate()?;
        if request.chunk_size > self.max_chunk_size {
            return Err(JobError::InvalidRequest(format!(
                "chunk_size {} exceeds the server limit of {} bytes",
                request.chunk_size, self.max_chunk_size
            )));
        }
        let count = request.chunk_count()?;
        if count > self.max_chunks {
            return Err(JobError::InvalidRequest(format!(
                "{count} chunks exceeds the server limit of {}",
                self.max_chunks
            )));
        }

        let job = UploadJob::new(Uuid::new_v4().to_string(), &request)?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.part_path(&job.id))
            .await?;
        file.set_len(job.file_size).await?;

        self.state_manager.save_job(&job).await?;
        self.jobs
            .lock()
            .await
            .insert(job.id.clone(), Arc::new(Mutex::new(job.clone())));

        let chunk_urls = (0..job.total_chunks)
            .map(|index| format!("/upload/{}/chunk/{}", job.id, index))
            .collect();

        info!(
            job_id = %job.id,
            filename = %job.filename,
            file_size = job.file_size,
            total_chunks = job.total_chunks,
            "created upload job"
        );
        Ok(CreateJobResponse { upload_job: job, chunk_urls })
    }

    /// Stores one chunk at its offset. Re-sending a completed chunk is acknowledged as-is.
    pub async fn receive_chunk(
        &self,
        job_id: &str,
        index: u32,
        data: &[u8],
    ) -> Result<ChunkAck, JobError> {
        let job_arc = self.job(job_id).await?;

        let offset = {
            let mut job = job_arc.lock().await;
            if index >= job.total_chunks {
                return Err(JobError::ChunkOutOfRange { index, total: job.total_chunks });
            }
            if job.chunks[index as usize].status == ChunkStatus::Completed {
                return Ok(ChunkAck { chunk_index: index, status: ChunkStatus::Completed });
            }
            if !matches!(job.status, JobStatus::Pending | JobStatus::Uploading) {
                return Err(JobError::InvalidState {
                    job_id: job.id.clone(),
                    status: job.status,
                    action: format!("accept chunk {index}"),
                });
            }

            let range = job.chunk_range(index);
            let expected = range.end - range.start;
            if data.len() as u64 != expected {
                let err = JobError::ChunkSizeMismatch {
                    index,
                    expected,
                    actual: data.len() as u64,
                };
                self.record_chunk_failure(&mut job, index, err.to_string()).await?;
                return Err(err);
            }

            job.transition(JobStatus::Uploading)?;
            job.chunks[index as usize].status = ChunkStatus::Uploading;
            range.start
        };

        if let Err(e) = self.write_chunk(job_id, offset, data).await {
            let mut job = job_arc.lock().await;
            self.record_chunk_failure(&mut job, index, e.to_string()).await?;
            return Err(e.into());
        }

        let last = {
            let mut job = job_arc.lock().await;
            if job.status != JobStatus::Uploading {
                // Cancelled or failed while the bytes were being written.
                return Err(JobError::InvalidState {
                    job_id: job.id.clone(),
                    status: job.status,
                    action: format!("accept chunk {index}"),
                });
            }
            let chunk = &mut job.chunks[index as usize];
            chunk.status = ChunkStatus::Completed;
            chunk.error = None;
            debug!(job_id, chunk = index, "chunk received");

            let last = job.all_chunks_completed();
            if last {
                let renamed =
                    tokio::fs::rename(self.part_path(job_id), self.assembled_path(job_id)).await;
                if let Err(e) = renamed {
                    self.fail_assembly(&mut job, &e).await?;
                    return Err(e.into());
                }
            }
            self.state_manager.save_job(&job).await?;
            last
        };

        if last {
            self.finish_assembly(&job_arc).await?;
        }
        Ok(ChunkAck { chunk_index: index, status: ChunkStatus::Completed })
    }

    async fn write_chunk(&self, job_id: &str, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(self.part_path(job_id)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Counts a rejected attempt; past the limit the chunk and its job are failed.
    async fn record_chunk_failure(
        &self,
        job: &mut UploadJob,
        index: u32,
        message: String,
    ) -> Result<(), JobError> {
        let max = self.max_chunk_retries;
        let chunk = &mut job.chunks[index as usize];
        chunk.retry_count = (chunk.retry_count + 1).min(max);
        chunk.error = Some(message.clone());
        if chunk.retry_count >= max {
            chunk.status = ChunkStatus::Failed;
            warn!(job_id = %job.id, chunk = index, error = %message, "chunk failed permanently");
            job.fail(format!("chunk {index} failed: {message}"))?;
        } else {
            chunk.status = ChunkStatus::Pending;
        }
        self.state_manager.save_job(job).await?;
        Ok(())
    }

    /// Hashes the assembled file without holding the job lock, then marks the job uploaded.
    async fn finish_assembly(&self, job_arc: &Mutex<UploadJob>) -> Result<(), JobError> {
        let job_id = job_arc.lock().await.id.clone();
        let digest = sha256_sum(&self.assembled_path(&job_id)).await;

        let mut job = job_arc.lock().await;
        if job.status != JobStatus::Uploading {
            return Ok(());
        }
        match digest {
            Ok(checksum) => {
                job.checksum = Some(checksum);
                job.transition(JobStatus::Uploaded)?;
                self.state_manager.save_job(&job).await?;
                info!(job_id, checksum = ?job.checksum, "all chunks received");
                Ok(())
            }
            Err(e) => {
                self.fail_assembly(&mut job, &e).await?;
                Err(e.into())
            }
        }
    }

    async fn fail_assembly(
        &self,
        job: &mut UploadJob,
        err: &std::io::Error,
    ) -> Result<(), JobError> {
        warn!(job_id = %job.id, error = %err, "could not assemble upload");
        job.fail(format!("assembly failed: {err}"))?;
        self.state_manager.save_job(job).await?;
        Ok(())
    }

    /// Drops settled jobs last touched before `retention` ago, with their files.
    /// Returns how many were removed.
    pub async fn purge_settled(&self, retention: std::time::Duration) -> Result<usize, JobError> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| chrono::Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        let snapshot: Vec<(String, Arc<Mutex<UploadJob>>)> = self
            .jobs
            .lock()
            .await
            .iter()
            .map(|(id, job)| (id.clone(), job.clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, job) in snapshot {
            let job = job.lock().await;
            if job.status.is_terminal() && job.updated_at <= cutoff {
                expired.push(id);
            }
        }

        for id in &expired {
            self.jobs.lock().await.remove(id);
            self.cancellation_tokens.lock().await.remove(id);
            self.state_manager.delete_job(id).await?;
            self.remove_files(id).await;
            debug!(job_id = %id, "purged settled job");
        }
        if !expired.is_empty() {
            info!(purged = expired.len(), "purged settled upload jobs");
        }
        Ok(expired.len())
    }

    async fn remove_files(&self, job_id: &str) {
        for path in [self.part_path(job_id), self.assembled_path(job_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(job_id, path = %path.display(), error = %e, "could not remove file")
                }
            }
        }
    }

    pub async fn progress(&self, job_id: &str) -> Result<UploadProgress, JobError> {
        let job = self.job(job_id).await?;
        let progress = job.lock().await.progress();
        Ok(progress)
    }

    pub async fn control(
        &self,
        job_id: &str,
        action: ControlAction,
    ) -> Result<UploadProgress, JobError> {
        let job_arc = self.job(job_id).await?;
        let mut job = job_arc.lock().await;

        match action {
            ControlAction::Cancel => {
                if job.status != JobStatus::Cancelled {
                    job.transition(JobStatus::Cancelled)?;
                    if let Some(token) = self.cancellation_tokens.lock().await.remove(job_id) {
                        token.cancel();
                    }
                    self.remove_files(job_id).await;
                    info!(job_id, "upload job cancelled");
                }
            }
            ControlAction::Retry => {
                if job.status != JobStatus::Failed || job.all_chunks_completed() {
                    return Err(JobError::InvalidState {
                        job_id: job.id.clone(),
                        status: job.status,
                        action: "retry the upload".into(),
                    });
                }
                for chunk in job.chunks.iter_mut().filter(|c| c.status != ChunkStatus::Completed) {
                    chunk.status = ChunkStatus::Pending;
                    chunk.retry_count = 0;
                    chunk.error = None;
                }
                job.error_message = None;
                job.transition(JobStatus::Uploading)?;
                info!(job_id, "failed chunks reset for retry");
            }
            ControlAction::ChunkFailed { chunk_index, error } => {
                if chunk_index >= job.total_chunks {
                    return Err(JobError::ChunkOutOfRange {
                        index: chunk_index,
                        total: job.total_chunks,
                    });
                }
                if !matches!(
                    job.status,
                    JobStatus::Pending | JobStatus::Uploading | JobStatus::Failed
                ) {
                    return Err(JobError::InvalidState {
                        job_id: job.id.clone(),
                        status: job.status,
                        action: format!("fail chunk {chunk_index}"),
                    });
                }
                let chunk = &mut job.chunks[chunk_index as usize];
                if chunk.status != ChunkStatus::Completed {
                    chunk.status = ChunkStatus::Failed;
                    chunk.error = Some(error.clone());
                    warn!(job_id, chunk = chunk_index, %error, "client reported chunk failure");
                    if job.status != JobStatus::Failed {
                        job.fail(format!("chunk {chunk_index} failed: {error}"))?;
                    }
                }
            }
        }

        self.state_manager.save_job(&job).await?;
        Ok(job.progress())
    }

    pub async fn processing_stats(&self, job_id: &str) -> Result<ProcessingStats, JobError> {
        let job = self.job(job_id).await?;
        let stats = job.lock().await.processing;
        Ok(stats)
    }

    /// Moves an uploaded job into `processing`, or reports the run already under way.
    pub async fn claim_processing(&self, job_id: &str) -> Result<ProcessingClaim, JobError> {
        let job_arc = self.job(job_id).await?;
        let mut job = job_arc.lock().await;

        match job.status {
            JobStatus::Uploaded => {}
            JobStatus::Processing | JobStatus::Completed => {
                return Ok(ProcessingClaim::AlreadyStarted(job.processing));
            }
            JobStatus::Failed if job.all_chunks_completed() => {
                return Ok(ProcessingClaim::AlreadyStarted(job.processing));
            }
            status => {
                return Err(JobError::InvalidState {
                    job_id: job.id.clone(),
                    status,
                    action: "start processing".into(),
                });
            }
        }

        job.transition(JobStatus::Processing)?;
        job.processing = ProcessingStats::default();
        self.state_manager.save_job(&job).await?;

        let token = CancellationToken::new();
        self.cancellation_tokens
            .lock()
            .await
            .insert(job_id.to_string(), token.clone());

        Ok(ProcessingClaim::Started { job: job.clone(), token })
    }

    pub async fn set_total_batches(
        &self,
        job_id: &str,
        total_batches: u32,
    ) -> Result<ProcessingStats, JobError> {
        let job_arc = self.job(job_id).await?;
        let mut job = job_arc.lock().await;
        if job.status == JobStatus::Processing && job.processing.total_batches == 0 {
            job.processing.total_batches = total_batches;
            self.state_manager.save_job(&job).await?;
        }
        Ok(job.processing)
    }

    /// Bumps one batch counter. Counters never decrease and never pass `total_batches`.
    pub async fn record_batch(
        &self,
        job_id: &str,
        succeeded: bool,
    ) -> Result<ProcessingStats, JobError> {
        let job_arc = self.job(job_id).await?;
        let mut job = job_arc.lock().await;
        if job.status != JobStatus::Processing || job.processing.is_terminal() {
            return Ok(job.processing);
        }
        if succeeded {
            job.processing.completed_batches += 1;
        } else {
            job.processing.failed_batches += 1;
        }
        self.state_manager.save_job(&job).await?;
        Ok(job.processing)
    }

    /// Settles the job once every batch has reported.
    pub async fn finish_processing(
        &self,
        job_id: &str,
        policy: FailurePolicy,
    ) -> Result<UploadJob, JobError> {
        self.cancellation_tokens.lock().await.remove(job_id);

        let job_arc = self.job(job_id).await?;
        let mut job = job_arc.lock().await;
        if job.status != JobStatus::Processing {
            return Ok(job.clone());
        }

        let stats = job.processing;
        if policy.is_failure(&stats) {
            job.fail(format!(
                "{} of {} batches failed",
                stats.failed_batches, stats.total_batches
            ))?;
            warn!(job_id, ?stats, "processing failed");
        } else {
            job.transition(JobStatus::Completed)?;
            info!(job_id, ?stats, "processing completed");
        }
        self.state_manager.save_job(&job).await?;
        Ok(job.clone())
    }

    pub async fn fail_processing(&self, job_id: &str, message: String) -> Result<(), JobError> {
        self.cancellation_tokens.lock().await.remove(job_id);

        let job_arc = self.job(job_id).await?;
        let mut job = job_arc.lock().await;
        if job.status == JobStatus::Processing {
            job.fail(message)?;
            self.state_manager.save_job(&job).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UploadType;

    async fn manager(dir: &std::path::Path, max_chunk_retries: u32) -> JobManager {
        let config = ServerConfig {
            data_dir: dir.to_path_buf(),
            max_chunk_retries,
            ..ServerConfig::default()
        };
        let store = StateManager::in_memory().await.unwrap();
        JobManager::new(store, &config).await.unwrap()
    }

    fn request(file_size: u64, chunk_size: u64) -> CreateJobRequest {
        CreateJobRequest {
            filename: "leads.csv".into(),
            file_size,
            file_type: "text/csv".into(),
            upload_type: UploadType::LeadImport,
            chunk_size,
            validation_rules: None,
        }
    }

    #[tokio::test]
    async fn assembles_chunks_received_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 3).await;
        let body: Vec<u8> = (0..250u32).map(|i| (i % 251) as u8).collect();

        let created = manager.create_job(request(250, 100)).await.unwrap();
        assert_eq!(created.chunk_urls.len(), 3);
        assert_eq!(created.upload_job.status, JobStatus::Pending);
        let id = created.upload_job.id;

        for index in [2u32, 0, 1] {
            let range = crate::models::chunk_range(250, 100, index);
            manager
                .receive_chunk(&id, index, &body[range.start as usize..range.end as usize])
                .await
                .unwrap();
        }

        let job = manager.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Uploaded);
        assert_eq!(job.checksum.as_deref(), Some(crate::integrity::sha256_bytes(&body).as_str()));
        let stored = tokio::fs::read(manager.assembled_path(&id)).await.unwrap();
        assert_eq!(stored, body);
    }

    #[tokio::test]
    async fn rejects_invalid_creation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 3).await;
        let err = manager.create_job(request(0, 100)).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn wrong_sized_chunk_counts_against_retries() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 2).await;
        let id = manager.create_job(request(200, 100)).await.unwrap().upload_job.id;

        assert!(manager.receive_chunk(&id, 0, &[0u8; 10]).await.is_err());
        assert_eq!(manager.progress(&id).await.unwrap().status, JobStatus::Pending);

        assert!(manager.receive_chunk(&id, 0, &[0u8; 10]).await.is_err());
        let progress = manager.progress(&id).await.unwrap();
        assert_eq!(progress.status, JobStatus::Failed);
        assert_eq!(progress.chunks_failed, 1);
        assert!(progress.error_message.unwrap().contains("chunk 0"));

        let progress = manager.control(&id, ControlAction::Retry).await.unwrap();
        assert_eq!(progress.status, JobStatus::Uploading);
        assert_eq!(progress.chunks_failed, 0);
        assert_eq!(progress.error_message, None);
        manager.receive_chunk(&id, 0, &[1u8; 100]).await.unwrap();
        manager.receive_chunk(&id, 1, &[2u8; 100]).await.unwrap();
        assert_eq!(manager.progress(&id).await.unwrap().status, JobStatus::Uploaded);
    }

    #[tokio::test]
    async fn cancelled_job_rejects_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 3).await;
        let id = manager.create_job(request(200, 100)).await.unwrap().upload_job.id;
        manager.receive_chunk(&id, 0, &[0u8; 100]).await.unwrap();

        let progress = manager.control(&id, ControlAction::Cancel).await.unwrap();
        assert_eq!(progress.status, JobStatus::Cancelled);
        let err = manager.receive_chunk(&id, 1, &[0u8; 100]).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        // Cancelling twice is harmless.
        manager.control(&id, ControlAction::Cancel).await.unwrap();
    }

    #[tokio::test]
    async fn reported_chunk_failure_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 3).await;
        let id = manager.create_job(request(200, 100)).await.unwrap().upload_job.id;

        let progress = manager
            .control(&id, ControlAction::ChunkFailed { chunk_index: 1, error: "timed out".into() })
            .await
            .unwrap();
        assert_eq!(progress.status, JobStatus::Failed);
        assert_eq!(progress.error_message.as_deref(), Some("chunk 1 failed: timed out"));
    }

    #[tokio::test]
    async fn batch_counters_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 3).await;
        let id = manager.create_job(request(100, 100)).await.unwrap().upload_job.id;
        manager.receive_chunk(&id, 0, &[b'a'; 100]).await.unwrap();

        let first = manager.claim_processing(&id).await.unwrap();
        assert!(matches!(first, ProcessingClaim::Started { .. }));
        let second = manager.claim_processing(&id).await.unwrap();
        assert!(matches!(second, ProcessingClaim::AlreadyStarted(_)));
        manager.set_total_batches(&id, 2).await.unwrap();
        manager.record_batch(&id, false).await.unwrap();
        manager.record_batch(&id, false).await.unwrap();
        let stats = manager.record_batch(&id, true).await.unwrap();
        let expected = ProcessingStats {
            total_batches: 2,
            completed_batches: 0,
            failed_batches: 2,
        };
        assert_eq!(stats, expected);

        let job = manager.finish_processing(&id, FailurePolicy::NoBatchesCompleted).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn rejects_chunk_counts_past_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 3).await;

        let overflow = manager.create_job(request(1 << 32, 1)).await.unwrap_err();
        assert_eq!(overflow.status_code(), 400);
        let too_many = manager.create_job(request(200_000, 1)).await.unwrap_err();
        assert_eq!(too_many.status_code(), 400);

        assert!(manager.jobs.lock().await.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cancel_after_upload_removes_the_assembled_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 3).await;
        let id = manager.create_job(request(100, 100)).await.unwrap().upload_job.id;
        manager.receive_chunk(&id, 0, &[b'a'; 100]).await.unwrap();
        assert!(manager.assembled_path(&id).exists());

        manager.control(&id, ControlAction::Cancel).await.unwrap();
        assert!(!manager.assembled_path(&id).exists());
        assert!(!manager.part_path(&id).exists());
    }

    #[tokio::test]
    async fn failed_assembly_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 3).await;
        let id = manager.create_job(request(200, 100)).await.unwrap().upload_job.id;
        manager.receive_chunk(&id, 0, &[b'a'; 100]).await.unwrap();

        // A directory in the way makes the final rename fail.
        std::fs::create_dir(manager.assembled_path(&id)).unwrap();
        std::fs::write(manager.assembled_path(&id).join("blocker"), b"x").unwrap();
        assert!(manager.receive_chunk(&id, 1, &[b'b'; 100]).await.is_err());

        let progress = manager.progress(&id).await.unwrap();
        assert_eq!(progress.status, JobStatus::Failed);
        assert!(progress.error_message.unwrap().starts_with("assembly failed"));
    }

    #[tokio::test]
    async fn purge_drops_only_settled_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 3).await;
        let settled = manager.create_job(request(100, 100)).await.unwrap().upload_job.id;
        let active = manager.create_job(request(100, 100)).await.unwrap().upload_job.id;
        manager.control(&settled, ControlAction::Cancel).await.unwrap();

        assert_eq!(manager.purge_settled(std::time::Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(manager.purge_settled(std::time::Duration::ZERO).await.unwrap(), 1);

        assert!(matches!(manager.get_job(&settled).await, Err(JobError::NotFound(_))));
        assert!(manager.get_job(&active).await.is_ok());
        assert!(manager.part_path(&active).exists());
        let stored = manager.state_manager.load_all_jobs().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, active);
    }

    #[tokio::test]
    async fn restart_resets_interrupted_processing() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig { data_dir: dir.path().to_path_buf(), ..ServerConfig::default() };
        let id = {
            let store = StateManager::new(&config.database_path()).await.unwrap();
            let manager = JobManager::new(store, &config).await.unwrap();
            let id = manager.create_job(request(100, 100)).await.unwrap().upload_job.id;
            manager.receive_chunk(&id, 0, &[b'a'; 100]).await.unwrap();
            manager.claim_processing(&id).await.unwrap();
            manager.set_total_batches(&id, 4).await.unwrap();
            id
        };

        let store = StateManager::new(&config.database_path()).await.unwrap();
        let manager = JobManager::new(store, &config).await.unwrap();
        let job = manager.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Uploaded);
        assert_eq!(job.processing, ProcessingStats::default());
    }
}
