#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use upload_pipeline::api::ChunkTarget;
use upload_pipeline::error::ApiError;
use upload_pipeline::models::{
    ChunkAck, ControlAction, CreateJobRequest, CreateJobResponse, ProcessRequest, ProcessingStats,
    UploadJob, UploadProgress,
};
use upload_pipeline::prelude::*;

/// Small chunks and short timers so the tests run in milliseconds.
pub fn fast_transfer_config(chunk_size: u64, max_concurrent_uploads: usize) -> TransferConfig {
    TransferConfig {
        chunk_size,
        max_concurrent_uploads,
        max_retries: 3,
        retry_delay_base: Duration::from_millis(5),
        request_timeout: Duration::from_secs(5),
        upload_poll_interval: Duration::from_millis(20),
        processing_poll_interval: Duration::from_millis(20),
    }
}

pub fn server_config(dir: &TempDir) -> ServerConfig {
    ServerConfig {
        data_dir: dir.path().to_path_buf(),
        ..ServerConfig::default()
    }
}

pub struct LocalStack {
    pub dir: TempDir,
    pub manager: Arc<JobManager>,
    pub coordinator: Arc<ProcessingCoordinator>,
    pub api: LocalUploadApi,
}

pub async fn local_stack(processor: Arc<dyn BatchProcessor>) -> LocalStack {
    let dir = tempfile::tempdir().unwrap();
    let state = StateManager::in_memory().await.unwrap();
    stack_over(dir, state, processor).await
}

/// A stack whose jobs live in a database file under `dir`, so a second stack
/// over the same directory sees them again.
pub async fn persistent_stack(dir: TempDir, processor: Arc<dyn BatchProcessor>) -> LocalStack {
    let state = StateManager::new(&dir.path().join("jobs.db")).await.unwrap();
    stack_over(dir, state, processor).await
}

async fn stack_over(
    dir: TempDir,
    state: StateManager,
    processor: Arc<dyn BatchProcessor>,
) -> LocalStack {
    let config = server_config(&dir);
    let manager = Arc::new(JobManager::new(state, &config).await.unwrap());
    let coordinator = Arc::new(ProcessingCoordinator::new(manager.clone(), processor, &config));
    let api = LocalUploadApi::new(manager.clone(), coordinator.clone());
    LocalStack { dir, manager, coordinator, api }
}

pub fn new_upload(filename: &str) -> NewUpload {
    NewUpload {
        filename: filename.to_string(),
        file_type: "text/csv".to_string(),
        upload_type: UploadType::LeadImport,
        validation_rules: None,
    }
}

pub fn patterned_bytes(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

/// Wraps an API and scripts chunk behavior: per-chunk failure budgets, a fixed
/// delay per chunk request, and bookkeeping of attempts and concurrency.
pub struct ScriptedApi<A> {
    inner: A,
    delay: Duration,
    failures: Mutex<HashMap<u32, u32>>,
    attempts: Mutex<HashMap<u32, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: AtomicUsize,
}

impl<A: UploadApi> ScriptedApi<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            delay: Duration::ZERO,
            failures: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The next `count` attempts for `index` fail with a 503.
    pub fn fail_chunk(&self, index: u32, count: u32) {
        self.failures.lock().unwrap().insert(index, count);
    }

    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn attempts(&self, index: u32) -> u32 {
        self.attempts.lock().unwrap().get(&index).copied().unwrap_or(0)
    }

    pub fn chunk_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<A: UploadApi> UploadApi for ScriptedApi<A> {
    async fn create_job(
        &self,
        request: &CreateJobRequest,
    ) -> Result<CreateJobResponse, ApiError> {
        self.inner.create_job(request).await
    }

    async fn get_job(&self, job_id: &str) -> Result<UploadJob, ApiError> {
        self.inner.get_job(job_id).await
    }

    async fn upload_chunk(
        &self,
        target: ChunkTarget<'_>,
        data: Bytes,
    ) -> Result<ChunkAck, ApiError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.attempts.lock().unwrap().entry(target.index).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&target.index) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            return Err(ApiError::Status { status: 503, message: "scripted failure".into() });
        }
        self.inner.upload_chunk(target, data).await
    }

    async fn upload_progress(&self, job_id: &str) -> Result<UploadProgress, ApiError> {
        self.inner.upload_progress(job_id).await
    }

    async fn control(
        &self,
        job_id: &str,
        action: &ControlAction,
    ) -> Result<UploadProgress, ApiError> {
        self.inner.control(job_id, action).await
    }

    async fn start_processing(
        &self,
        job_id: &str,
        request: &ProcessRequest,
    ) -> Result<ProcessingStats, ApiError> {
        self.inner.start_processing(job_id, request).await
    }

    async fn processing_stats(&self, job_id: &str) -> Result<ProcessingStats, ApiError> {
        self.inner.processing_stats(job_id).await
    }
}

/// Drains events until `matches` accepts one, or panics after `timeout`.
pub async fn wait_for_event(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<UploadEvent>,
    timeout: Duration,
    mut matches: impl FnMut(&UploadEvent) -> bool,
) -> UploadEvent {
    tokio::time::timeout(timeout, async {
        while let Some(event) = events.recv().await {
            if matches(&event) {
                return event;
            }
        }
        panic!("event stream closed");
    })
    .await
    .expect("timed out waiting for event")
}
