// src/tracker.rs

//! Interval pollers for the two phases of a job: byte transfer and batch processing.

use crate::api::UploadApi;
use crate::events::{emit, EventSender, UploadEvent};
use crate::models::{JobStatus, ProcessingStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to a running poller. Dropping it stops the poller.
#[derive(Debug)]
pub struct Poller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Poller {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the poller and waits until its task has exited.
    pub async fn shutdown(&mut self) {
        self.token.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Polls job progress until the upload phase reaches a terminal status.
/// A failed job surfaces its recorded error as [`UploadEvent::UploadFailed`].
pub fn spawn_upload_poller(
    api: Arc<dyn UploadApi>,
    job_id: String,
    interval: Duration,
    scope: &CancellationToken,
    events: EventSender,
) -> Poller {
    let token = scope.child_token();
    let stop = token.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let polled = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                polled = async {
                    ticker.tick().await;
                    api.upload_progress(&job_id).await
                } => polled,
            };

            let progress = match polled {
                Ok(progress) => progress,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "upload progress poll failed");
                    continue;
                }
            };

            let status = progress.status;
            let message = progress.error_message.clone();
            emit(&events, UploadEvent::UploadProgress(progress));

            if status.is_upload_terminal() {
                if status == JobStatus::Failed {
                    emit(
                        &events,
                        UploadEvent::UploadFailed {
                            message: message.unwrap_or_else(|| "upload failed".to_string()),
                        },
                    );
                }
                debug!(job_id = %job_id, status = status.as_str(), "upload poller finished");
                break;
            }
        }
    });

    Poller { token, handle }
}

/// Polls batch counters until `completed + failed == total`.
pub fn spawn_processing_poller(
    api: Arc<dyn UploadApi>,
    job_id: String,
    interval: Duration,
    scope: &CancellationToken,
    events: EventSender,
) -> Poller {
    let token = scope.child_token();
    let stop = token.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<ProcessingStats> = None;

        loop {
            let polled = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                polled = async {
                    ticker.tick().await;
                    api.processing_stats(&job_id).await
                } => polled,
            };

            let stats = match polled {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "processing stats poll failed");
                    continue;
                }
            };

            if let Some(previous) = last {
                if !previous.is_monotonic_successor(&stats) {
                    warn!(
                        job_id = %job_id,
                        ?previous,
                        current = ?stats,
                        "batch counters moved backwards"
                    );
                }
            }
            last = Some(stats);
            emit(&events, UploadEvent::ProcessingProgress(stats));

            if !stats.is_terminal() {
                continue;
            }
            // Counters alone do not say whether the job as a whole failed.
            match api.upload_progress(&job_id).await {
                // The last batch is counted but the run is not settled yet.
                Ok(progress) if progress.status == JobStatus::Processing => continue,
                Ok(progress) if progress.status == JobStatus::Failed => emit(
                    &events,
                    UploadEvent::ProcessingFailed {
                        stats,
                        message: progress
                            .error_message
                            .unwrap_or_else(|| "processing failed".to_string()),
                    },
                ),
                Ok(progress) if progress.status == JobStatus::Cancelled => {}
                Ok(_) => emit(&events, UploadEvent::ProcessingCompleted(stats)),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "could not read final job status");
                    emit(&events, UploadEvent::ProcessingCompleted(stats));
                }
            }
            debug!(job_id = %job_id, ?stats, "processing poller finished");
            break;
        }
    });

    Poller { token, handle }
}
