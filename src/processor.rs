// src/processor.rs

//! Turns an assembled upload into batches of records and works through them
//! in the background, keeping the job's batch counters current.

use crate::error::JobError;
use crate::manager::{JobManager, ProcessingClaim};
use crate::models::{CsvConfig, ImportConfig, ProcessRequest, ProcessingStats, UploadJob};
use async_trait::async_trait;
use csv::StringRecord;
use futures_util::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Decides whether a finished processing run counts as a job failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailurePolicy {
    /// Failed only when not a single batch completed.
    NoBatchesCompleted,
    /// Failed when more than this fraction of batches failed.
    FailedFractionAbove(f64),
}

impl FailurePolicy {
    pub fn is_failure(&self, stats: &ProcessingStats) -> bool {
        if stats.total_batches == 0 {
            return false;
        }
        match *self {
            FailurePolicy::NoBatchesCompleted => stats.completed_batches == 0,
            FailurePolicy::FailedFractionAbove(limit) => {
                stats.failed_batches as f64 / stats.total_batches as f64 > limit
            }
        }
    }
}

/// One unit of domain-level work cut from the uploaded file.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub index: u32,
    pub headers: Option<Arc<StringRecord>>,
    pub rows: Vec<StringRecord>,
}

/// What a batch gets to see about the job it came from.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub job_id: String,
    pub upload_type: crate::models::UploadType,
    pub validation_rules: Option<serde_json::Value>,
    pub import_options: Option<serde_json::Value>,
}

/// Domain-level handling of one batch (lead import, asset registration, ...).
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, ctx: &BatchContext, batch: &RecordBatch) -> Result<(), String>;
}

/// Accepts every batch.
#[derive(Debug, Default)]
pub struct AcceptAllProcessor;

#[async_trait]
impl BatchProcessor for AcceptAllProcessor {
    async fn process_batch(&self, _ctx: &BatchContext, _batch: &RecordBatch) -> Result<(), String> {
        Ok(())
    }
}

/// Reads the assembled file and cuts it into batches of `batch_size` records.
pub fn partition_csv(
    path: &std::path::Path,
    csv_config: &CsvConfig,
    batch_size: usize,
) -> Result<Vec<RecordBatch>, JobError> {
    let delimiter = u8::try_from(csv_config.delimiter)
        .map_err(|_| {
            JobError::Processing(format!("unsupported delimiter {:?}", csv_config.delimiter))
        })?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(csv_config.has_header)
        .flexible(true)
        .from_path(path)
        .map_err(|e| JobError::Processing(e.to_string()))?;

    let headers = if csv_config.has_header {
        let headers = reader.headers().map_err(|e| JobError::Processing(e.to_string()))?;
        Some(Arc::new(headers.clone()))
    } else {
        None
    };

    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut rows = Vec::with_capacity(batch_size);
    for record in reader.records() {
        let record = record.map_err(|e| JobError::Processing(e.to_string()))?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        rows.push(record);
        if rows.len() == batch_size {
            batches.push(RecordBatch {
                index: batches.len() as u32,
                headers: headers.clone(),
                rows: std::mem::replace(&mut rows, Vec::with_capacity(batch_size)),
            });
        }
    }
    if !rows.is_empty() {
        batches.push(RecordBatch { index: batches.len() as u32, headers, rows });
    }
    Ok(batches)
}

/// Starts processing runs and drives their batches to a terminal count.
pub struct ProcessingCoordinator {
    manager: Arc<JobManager>,
    processor: Arc<dyn BatchProcessor>,
    default_batch_size: usize,
    max_concurrent_batches: usize,
    failure_policy: FailurePolicy,
}

impl ProcessingCoordinator {
    pub fn new(
        manager: Arc<JobManager>,
        processor: Arc<dyn BatchProcessor>,
        config: &crate::config::ServerConfig,
    ) -> Self {
        Self {
            manager,
            processor,
            default_batch_size: config.default_batch_size,
            max_concurrent_batches: config.max_concurrent_batches.max(1),
            failure_policy: config.failure_policy,
        }
    }

    /// Partitions the file and kicks off batch execution. Idempotent once started.
    pub async fn start(
        &self,
        job_id: &str,
        request: ProcessRequest,
    ) -> Result<ProcessingStats, JobError> {
        let (job, token) = match self.manager.claim_processing(job_id).await? {
            ProcessingClaim::AlreadyStarted(stats) => return Ok(stats),
            ProcessingClaim::Started { job, token } => (job, token),
        };

        let csv_config = request.csv_config.unwrap_or_default();
        let import_config = request.import_config.unwrap_or_default();
        let batch_size = import_config.batch_size.unwrap_or(self.default_batch_size);
        let path = self.manager.assembled_path(job_id);

        let batches = match Self::partition(path, csv_config, batch_size).await {
            Ok(batches) => batches,
            Err(e) => {
                warn!(job_id, error = %e, "could not partition upload");
                self.manager.fail_processing(job_id, e.to_string()).await?;
                return Err(e);
            }
        };

        let stats = self.manager.set_total_batches(job_id, batches.len() as u32).await?;
        info!(job_id, total_batches = stats.total_batches, batch_size, "processing started");

        if batches.is_empty() {
            self.manager.finish_processing(job_id, self.failure_policy).await?;
            return self.manager.processing_stats(job_id).await;
        }

        let ctx = Self::context(&job, &import_config);
        let manager = self.manager.clone();
        let processor = self.processor.clone();
        let limit = self.max_concurrent_batches;
        let policy = self.failure_policy;
        tokio::spawn(async move {
            Self::run_batches(manager, processor, ctx, batches, limit, policy, token).await;
        });

        Ok(stats)
    }

    async fn partition(
        path: PathBuf,
        csv_config: CsvConfig,
        batch_size: usize,
    ) -> Result<Vec<RecordBatch>, JobError> {
        tokio::task::spawn_blocking(move || partition_csv(&path, &csv_config, batch_size))
            .await
            .map_err(|e| JobError::Processing(format!("partition task failed: {e}")))?
    }

    fn context(job: &UploadJob, import_config: &ImportConfig) -> BatchContext {
        BatchContext {
            job_id: job.id.clone(),
            upload_type: job.upload_type,
            validation_rules: job.validation_rules.clone(),
            import_options: import_config.options.clone(),
        }
    }

    async fn run_batches(
        manager: Arc<JobManager>,
        processor: Arc<dyn BatchProcessor>,
        ctx: BatchContext,
        batches: Vec<RecordBatch>,
        limit: usize,
        policy: FailurePolicy,
        token: CancellationToken,
    ) {
        let job_id = ctx.job_id.clone();

        stream::iter(batches)
            .for_each_concurrent(limit, |batch| {
                let manager = manager.clone();
                let processor = processor.clone();
                let token = token.clone();
                let ctx = &ctx;
                async move {
                    if token.is_cancelled() {
                        return;
                    }
                    let succeeded = match processor.process_batch(ctx, &batch).await {
                        Ok(()) => true,
                        Err(reason) => {
                            warn!(
                                job_id = %ctx.job_id,
                                batch = batch.index,
                                %reason,
                                "batch failed"
                            );
                            false
                        }
                    };
                    if let Err(e) = manager.record_batch(&ctx.job_id, succeeded).await {
                        warn!(
                            job_id = %ctx.job_id,
                            batch = batch.index,
                            error = %e,
                            "could not record batch"
                        );
                    }
                }
            })
            .await;

        if token.is_cancelled() {
            info!(job_id = %job_id, "processing stopped by cancellation");
            return;
        }
        if let Err(e) = manager.finish_processing(&job_id, policy).await {
            warn!(job_id = %job_id, error = %e, "could not settle processing run");
        }
    }
}
