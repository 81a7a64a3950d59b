// src/uploader.rs

use crate::api::{ChunkTarget, UploadApi};
use crate::backoff::BackoffPolicy;
use crate::error::UploadError;
use crate::events::{emit, EventSender, UploadEvent};
use crate::gate::PauseGate;
use crate::models::{chunk_range, ChunkStatus, ChunkState, ControlAction};
use crate::source::ChunkSource;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How a call to [`ChunkUploader::run`] ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Every chunk is acknowledged by the server.
    Uploaded,
    /// The session was cancelled; this is not an error.
    Cancelled,
}

#[derive(Debug)]
enum ChunkResult {
    Completed,
    Cancelled,
    Failed(String),
}

/// Moves every outstanding chunk of one job to the server under a concurrency bound.
#[derive(Clone)]
pub struct ChunkUploader {
    pub(crate) api: Arc<dyn UploadApi>,
    pub(crate) source: Arc<dyn ChunkSource>,
    pub(crate) job_id: Arc<str>,
    pub(crate) file_size: u64,
    pub(crate) chunk_size: u64,
    pub(crate) targets: Arc<Vec<String>>,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) max_retries: u32,
    pub(crate) backoff: Arc<dyn BackoffPolicy>,
    pub(crate) gate: PauseGate,
    pub(crate) cancel: CancellationToken,
    pub(crate) chunks: Arc<Mutex<Vec<ChunkState>>>,
    pub(crate) events: EventSender,
}

impl ChunkUploader {
    /// Uploads every chunk not yet completed. Completed chunks are never re-sent.
    pub async fn run(&self) -> Result<UploadOutcome, UploadError> {
        if self.cancel.is_cancelled() {
            return Ok(UploadOutcome::Cancelled);
        }

        let outstanding: Vec<u32> = self
            .chunks
            .lock()
            .await
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .map(|c| c.index)
            .collect();
        debug!(job_id = %self.job_id, chunks = outstanding.len(), "starting chunk transfer");

        let mut tasks = JoinSet::new();
        for index in outstanding {
            let this = self.clone();
            tasks.spawn(async move { (index, this.upload_chunk(index).await) });
        }

        let mut failed = Vec::new();
        let mut last_error = None;
        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, ChunkResult::Completed)) => {}
                Ok((_, ChunkResult::Cancelled)) => cancelled = true,
                Ok((index, ChunkResult::Failed(message))) => {
                    failed.push(index);
                    last_error = Some(message);
                }
                Err(e) => {
                    error!(job_id = %self.job_id, error = %e, "chunk task aborted");
                    last_error = Some(e.to_string());
                }
            }
        }

        if cancelled || self.cancel.is_cancelled() {
            return Ok(UploadOutcome::Cancelled);
        }
        if let Some(message) = last_error {
            failed.sort_unstable();
            return Err(UploadError::ChunksFailed { failed, message });
        }
        Ok(UploadOutcome::Uploaded)
    }

    /// Attempts one chunk until it is acknowledged, retries run out, or the session is cancelled.
    /// Attempts for the same index are strictly sequential.
    async fn upload_chunk(&self, index: u32) -> ChunkResult {
        let range = chunk_range(self.file_size, self.chunk_size, index);
        let max_retries = self.max_retries.max(1);
        let mut retry_count = 0;

        loop {
            let Some(permit) = self.acquire_slot().await else {
                return self.cancelled(index).await;
            };

            self.update(index, |state| {
                state.status = ChunkStatus::Uploading;
                state.retry_count = retry_count;
            })
            .await;
            emit(&self.events, UploadEvent::ChunkStarted { index, attempt: retry_count + 1 });

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.send(index, range.clone()) => Some(result),
            };
            drop(permit);

            let message = match result {
                None => return self.cancelled(index).await,
                Some(Ok(())) => {
                    self.update(index, |state| {
                        state.status = ChunkStatus::Completed;
                        state.progress = 1.0;
                        state.error = None;
                    })
                    .await;
                    emit(&self.events, UploadEvent::ChunkCompleted { index });
                    return ChunkResult::Completed;
                }
                Some(Err(message)) => message,
            };

            retry_count += 1;
            if retry_count >= max_retries {
                self.update(index, |state| {
                    state.status = ChunkStatus::Failed;
                    state.retry_count = retry_count;
                    state.error = Some(message.clone());
                })
                .await;
                warn!(
                    job_id = %self.job_id,
                    chunk = index,
                    attempts = retry_count,
                    error = %message,
                    "chunk failed"
                );
                emit(&self.events, UploadEvent::ChunkFailed { index, error: message.clone() });
                self.report_failure(index, &message).await;
                return ChunkResult::Failed(message);
            }

            self.update(index, |state| {
                state.status = ChunkStatus::Pending;
                state.retry_count = retry_count;
                state.error = Some(message.clone());
            })
            .await;
            debug!(
                job_id = %self.job_id,
                chunk = index,
                retry_count,
                error = %message,
                "retrying chunk"
            );
            emit(
                &self.events,
                UploadEvent::ChunkRetrying { index, retry_count, error: message },
            );

            // No permit is held while backing off.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(index).await,
                _ = tokio::time::sleep(self.backoff.delay(retry_count)) => {}
            }
        }
    }

    /// Waits for the pause gate to open and then for a free slot. A pause that lands
    /// while queued for a slot hands the slot back, so a paused upload holds none.
    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = self.gate.wait_open() => {}
            }
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                permit = self.semaphore.clone().acquire_owned() => permit.ok()?,
            };
            if self.cancel.is_cancelled() {
                return None;
            }
            if self.gate.is_paused() {
                drop(permit);
                continue;
            }
            return Some(permit);
        }
    }

    async fn send(&self, index: u32, range: Range<u64>) -> Result<(), String> {
        let data = self.source.read_range(range).await.map_err(|e| e.to_string())?;
        let target = ChunkTarget {
            job_id: &self.job_id,
            index,
            url: self.targets.get(index as usize).map(String::as_str).unwrap_or(""),
        };
        let ack = self.api.upload_chunk(target, data).await.map_err(|e| e.to_string())?;
        if ack.chunk_index != index || ack.status != ChunkStatus::Completed {
            return Err(format!(
                "unexpected acknowledgment for chunk {index}: chunk {} is {:?}",
                ack.chunk_index, ack.status
            ));
        }
        Ok(())
    }

    /// Best-effort: lets the job store record the failure.
    async fn report_failure(&self, index: u32, message: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        let action = ControlAction::ChunkFailed { chunk_index: index, error: message.to_string() };
        if let Err(e) = self.api.control(&self.job_id, &action).await {
            warn!(
                job_id = %self.job_id,
                chunk = index,
                error = %e,
                "could not report chunk failure"
            );
        }
    }

    async fn cancelled(&self, index: u32) -> ChunkResult {
        self.update(index, |state| {
            if state.status == ChunkStatus::Uploading {
                state.status = ChunkStatus::Pending;
            }
        })
        .await;
        ChunkResult::Cancelled
    }

    async fn update(&self, index: u32, apply: impl FnOnce(&mut ChunkState)) {
        if let Some(state) = self.chunks.lock().await.get_mut(index as usize) {
            apply(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::LinearBackoff;
    use crate::error::ApiError;
    use crate::models::{
        ChunkAck, CreateJobRequest, CreateJobResponse, ProcessRequest, ProcessingStats, UploadJob,
        UploadProgress,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Unreachable;

    fn refused() -> ApiError {
        ApiError::Status { status: 503, message: "unreachable".into() }
    }

    #[async_trait]
    impl UploadApi for Unreachable {
        async fn create_job(
            &self,
            _request: &CreateJobRequest,
        ) -> Result<CreateJobResponse, ApiError> {
            Err(refused())
        }

        async fn get_job(&self, _job_id: &str) -> Result<UploadJob, ApiError> {
            Err(refused())
        }

        async fn upload_chunk(
            &self,
            _target: ChunkTarget<'_>,
            _data: Bytes,
        ) -> Result<ChunkAck, ApiError> {
            Err(refused())
        }

        async fn upload_progress(&self, _job_id: &str) -> Result<UploadProgress, ApiError> {
            Err(refused())
        }

        async fn control(
            &self,
            _job_id: &str,
            _action: &ControlAction,
        ) -> Result<UploadProgress, ApiError> {
            Err(refused())
        }

        async fn start_processing(
            &self,
            _job_id: &str,
            _request: &ProcessRequest,
        ) -> Result<ProcessingStats, ApiError> {
            Err(refused())
        }

        async fn processing_stats(&self, _job_id: &str) -> Result<ProcessingStats, ApiError> {
            Err(refused())
        }
    }

    fn uploader(slots: usize) -> ChunkUploader {
        let (events, _receiver) = mpsc::unbounded_channel();
        ChunkUploader {
            api: Arc::new(Unreachable),
            source: Arc::new(Bytes::from_static(b"abcdefgh")),
            job_id: Arc::from("job"),
            file_size: 8,
            chunk_size: 4,
            targets: Arc::new(vec![String::new(); 2]),
            semaphore: Arc::new(Semaphore::new(slots)),
            max_retries: 1,
            backoff: Arc::new(LinearBackoff::new(Duration::from_millis(1))),
            gate: PauseGate::new(),
            cancel: CancellationToken::new(),
            chunks: Arc::new(Mutex::new(vec![ChunkState::new(0), ChunkState::new(1)])),
            events,
        }
    }

    #[tokio::test]
    async fn pause_while_queued_hands_the_slot_back() {
        let uploader = uploader(1);
        let held = uploader.semaphore.clone().acquire_owned().await.unwrap();

        let waiter = {
            let uploader = uploader.clone();
            tokio::spawn(async move { uploader.acquire_slot().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        uploader.gate.pause();
        drop(held);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(uploader.semaphore.available_permits(), 1);
        assert!(!waiter.is_finished());

        uploader.gate.resume();
        let permit = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(permit.is_some());
        assert_eq!(uploader.semaphore.available_permits(), 0);
    }

    #[tokio::test]
    async fn cancel_while_paused_releases_waiters() {
        let uploader = uploader(1);
        uploader.gate.pause();

        let run = {
            let uploader = uploader.clone();
            tokio::spawn(async move { uploader.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!run.is_finished());

        uploader.cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Cancelled);
        assert_eq!(uploader.semaphore.available_permits(), 1);
        let chunks = uploader.chunks.lock().await;
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));
    }
}
