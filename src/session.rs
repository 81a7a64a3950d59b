// src/session.rs

use crate::api::UploadApi;
use crate::backoff::{BackoffPolicy, LinearBackoff};
use crate::config::TransferConfig;
use crate::error::UploadError;
use crate::events::{emit, EventReceiver, EventSender, UploadEvent};
use crate::gate::PauseGate;
use crate::models::{
    total_chunks, ChunkState, ChunkStatus, ControlAction, CreateJobRequest, JobStatus,
    ProcessRequest, ProcessingStats, UploadJob, UploadType,
};
use crate::source::ChunkSource;
use crate::tracker::{spawn_processing_poller, spawn_upload_poller, Poller};
use crate::uploader::{ChunkUploader, UploadOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Describes the file a caller wants to upload.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub filename: String,
    pub file_type: String,
    pub upload_type: UploadType,
    pub validation_rules: Option<serde_json::Value>,
}

/// One file transfer attempt from job creation through processing.
///
/// Owns the job's chunk map, the pause gate and the cancellation scope shared by
/// every chunk task and both pollers. Progress is reported through the event
/// receiver returned by [`UploadSession::create`].
pub struct UploadSession {
    api: Arc<dyn UploadApi>,
    config: TransferConfig,
    job: UploadJob,
    uploader: ChunkUploader,
    chunks: Arc<Mutex<Vec<ChunkState>>>,
    gate: PauseGate,
    cancel: CancellationToken,
    events: EventSender,
    running: AtomicBool,
    upload_poller: Mutex<Option<Poller>>,
    processing_poller: Mutex<Option<Poller>>,
}

impl UploadSession {
    /// Creates the job on the server and starts the upload progress poller.
    pub async fn create(
        api: Arc<dyn UploadApi>,
        source: Arc<dyn ChunkSource>,
        upload: NewUpload,
        config: TransferConfig,
    ) -> Result<(Self, EventReceiver), UploadError> {
        let backoff = Arc::new(LinearBackoff::new(config.retry_delay_base));
        Self::create_with_backoff(api, source, upload, config, backoff).await
    }

    pub async fn create_with_backoff(
        api: Arc<dyn UploadApi>,
        source: Arc<dyn ChunkSource>,
        upload: NewUpload,
        config: TransferConfig,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Result<(Self, EventReceiver), UploadError> {
        let request = CreateJobRequest {
            filename: upload.filename,
            file_size: source.len(),
            file_type: upload.file_type,
            upload_type: upload.upload_type,
            chunk_size: config.chunk_size,
            validation_rules: upload.validation_rules,
        };
        request
            .validate()
            .map_err(|e| UploadError::JobCreation(e.to_string()))?;

        let response = api
            .create_job(&request)
            .await
            .map_err(|e| UploadError::JobCreation(e.to_string()))?;
        let job = response.upload_job;

        let expected = total_chunks(request.file_size, job.chunk_size);
        if job.file_size != request.file_size
            || Some(job.total_chunks) != expected
            || response.chunk_urls.len() != job.total_chunks as usize
        {
            return Err(UploadError::JobCreation(format!(
                "server returned {} chunk targets for {} chunks of a {}-byte file",
                response.chunk_urls.len(),
                job.total_chunks,
                request.file_size
            )));
        }

        info!(job_id = %job.id, total_chunks = job.total_chunks, "upload job created");
        Ok(Self::from_job(api, source, job, response.chunk_urls, config, backoff))
    }

    /// Picks up an existing job, for instance after a client or server restart.
    /// Chunks the server already holds are never sent again.
    pub async fn attach(
        api: Arc<dyn UploadApi>,
        source: Arc<dyn ChunkSource>,
        job_id: &str,
        config: TransferConfig,
    ) -> Result<(Self, EventReceiver), UploadError> {
        let job = api.get_job(job_id).await?;
        if job.status == JobStatus::Cancelled {
            return Err(UploadError::InvalidState("attach to a cancelled job"));
        }
        if job.file_size != source.len()
            || total_chunks(job.file_size, job.chunk_size) != Some(job.total_chunks)
            || job.chunks.len() != job.total_chunks as usize
        {
            return Err(UploadError::InvalidState(
                "attach with a source that does not match the job",
            ));
        }

        let completed = job.chunks_completed();
        info!(
            job_id = %job.id,
            completed,
            total_chunks = job.total_chunks,
            "attached to upload job"
        );

        // An empty target falls back to the default chunk route.
        let targets = vec![String::new(); job.total_chunks as usize];
        let backoff = Arc::new(LinearBackoff::new(config.retry_delay_base));
        Ok(Self::from_job(api, source, job, targets, config, backoff))
    }

    fn from_job(
        api: Arc<dyn UploadApi>,
        source: Arc<dyn ChunkSource>,
        job: UploadJob,
        targets: Vec<String>,
        config: TransferConfig,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> (Self, EventReceiver) {
        let chunks: Vec<ChunkState> = job
            .chunks
            .iter()
            .map(|record| {
                let mut state = ChunkState::new(record.index);
                match record.status {
                    ChunkStatus::Completed => {
                        state.status = ChunkStatus::Completed;
                        state.progress = 1.0;
                    }
                    ChunkStatus::Failed => {
                        state.status = ChunkStatus::Failed;
                        state.retry_count = record.retry_count;
                        state.error = record.error.clone();
                    }
                    ChunkStatus::Pending | ChunkStatus::Uploading => {}
                }
                state
            })
            .collect();
        let chunks = Arc::new(Mutex::new(chunks));

        let (events, receiver) = mpsc::unbounded_channel();
        let gate = PauseGate::new();
        let cancel = CancellationToken::new();

        let uploader = ChunkUploader {
            api: api.clone(),
            source,
            job_id: Arc::from(job.id.as_str()),
            file_size: job.file_size,
            chunk_size: job.chunk_size,
            targets: Arc::new(targets),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_uploads.max(1))),
            max_retries: config.max_retries,
            backoff,
            gate: gate.clone(),
            cancel: cancel.clone(),
            chunks: chunks.clone(),
            events: events.clone(),
        };

        let poller = spawn_upload_poller(
            api.clone(),
            job.id.clone(),
            config.upload_poll_interval,
            &cancel,
            events.clone(),
        );

        let session = Self {
            api,
            config,
            job,
            uploader,
            chunks,
            gate,
            cancel,
            events,
            running: AtomicBool::new(false),
            upload_poller: Mutex::new(Some(poller)),
            processing_poller: Mutex::new(None),
        };
        (session, receiver)
    }

    /// The job as returned at creation or attach.
    pub fn job(&self) -> &UploadJob {
        &self.job
    }

    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    pub async fn chunk_states(&self) -> Vec<ChunkState> {
        self.chunks.lock().await.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Transfers every chunk that is not yet completed.
    pub async fn start(&self) -> Result<UploadOutcome, UploadError> {
        if self.cancel.is_cancelled() {
            return Ok(UploadOutcome::Cancelled);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(UploadError::InvalidState("start while a transfer is running"));
        }

        let result = self.uploader.run().await;
        self.running.store(false, Ordering::SeqCst);

        match &result {
            Ok(UploadOutcome::Uploaded) => info!(job_id = %self.job.id, "all chunks uploaded"),
            Ok(UploadOutcome::Cancelled) => {
                info!(job_id = %self.job.id, "upload stopped by cancellation")
            }
            Err(e) => warn!(job_id = %self.job.id, error = %e, "upload failed"),
        }
        result
    }

    /// Stops new chunk attempts from starting. In-flight chunks finish.
    pub fn pause(&self) {
        if self.gate.pause() {
            info!(job_id = %self.job.id, "upload paused");
            emit(&self.events, UploadEvent::Paused);
        }
    }

    pub fn resume(&self) {
        if self.gate.resume() {
            info!(job_id = %self.job.id, "upload resumed");
            emit(&self.events, UploadEvent::Resumed);
        }
    }

    /// Aborts in-flight chunk requests, stops both pollers and tells the server (best-effort).
    pub async fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.stop_polling().await;

        if let Err(e) = self.api.control(&self.job.id, &ControlAction::Cancel).await {
            warn!(job_id = %self.job.id, error = %e, "server did not acknowledge cancel");
        }
        info!(job_id = %self.job.id, "upload cancelled");
        emit(&self.events, UploadEvent::Cancelled);
    }

    /// Resets failed chunks and transfers what is still missing.
    pub async fn retry_failed(&self) -> Result<UploadOutcome, UploadError> {
        if self.cancel.is_cancelled() {
            return Ok(UploadOutcome::Cancelled);
        }
        if self.running.load(Ordering::SeqCst) {
            return Err(UploadError::InvalidState("retry while a transfer is running"));
        }
        {
            let chunks = self.chunks.lock().await;
            if !chunks.iter().any(|c| c.status == ChunkStatus::Failed) {
                return Err(UploadError::InvalidState("retry without failed chunks"));
            }
        }

        match self.api.control(&self.job.id, &ControlAction::Retry).await {
            Ok(_) => {}
            // The failure report never reached the server; its job is still uploading.
            Err(e) if e.status() == Some(409) => {
                warn!(job_id = %self.job.id, error = %e, "server had no failed chunks to reset");
            }
            Err(e) => return Err(e.into()),
        }

        for state in self.chunks.lock().await.iter_mut() {
            if state.status == ChunkStatus::Failed {
                state.status = ChunkStatus::Pending;
                state.retry_count = 0;
                state.error = None;
            }
        }

        let poller = spawn_upload_poller(
            self.api.clone(),
            self.job.id.clone(),
            self.config.upload_poll_interval,
            &self.cancel,
            self.events.clone(),
        );
        *self.upload_poller.lock().await = Some(poller);

        info!(job_id = %self.job.id, "retrying failed chunks");
        self.start().await
    }

    /// Triggers batch processing and starts the processing stats poller.
    pub async fn start_processing(
        &self,
        request: ProcessRequest,
    ) -> Result<ProcessingStats, UploadError> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::InvalidState("start processing after cancel"));
        }
        let stats = self.api.start_processing(&self.job.id, &request).await?;
        info!(job_id = %self.job.id, total_batches = stats.total_batches, "processing triggered");

        let poller = spawn_processing_poller(
            self.api.clone(),
            self.job.id.clone(),
            self.config.processing_poll_interval,
            &self.cancel,
            self.events.clone(),
        );
        *self.processing_poller.lock().await = Some(poller);
        Ok(stats)
    }

    /// Stops both pollers without touching the transfer.
    pub async fn stop_polling(&self) {
        let upload = self.upload_poller.lock().await.take();
        let processing = self.processing_poller.lock().await.take();
        for mut poller in [upload, processing].into_iter().flatten() {
            poller.shutdown().await;
        }
    }

    pub async fn polling_active(&self) -> bool {
        let upload = self.upload_poller.lock().await;
        let processing = self.processing_poller.lock().await;
        let active = [upload.as_ref(), processing.as_ref()]
            .into_iter()
            .flatten()
            .any(|poller| !poller.is_finished());
        active
    }
}
