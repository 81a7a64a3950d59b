// src/events.rs

use crate::models::{ProcessingStats, UploadProgress};
use tokio::sync::mpsc;

/// Notifications emitted by an upload session.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    ChunkStarted { index: u32, attempt: u32 },
    ChunkCompleted { index: u32 },
    ChunkRetrying { index: u32, retry_count: u32, error: String },
    ChunkFailed { index: u32, error: String },
    /// One tick of the upload progress poller.
    UploadProgress(UploadProgress),
    UploadFailed { message: String },
    /// One tick of the processing stats poller.
    ProcessingProgress(ProcessingStats),
    ProcessingCompleted(ProcessingStats),
    /// Every batch reported but the job was judged failed.
    ProcessingFailed { stats: ProcessingStats, message: String },
    Paused,
    Resumed,
    Cancelled,
}

pub type EventSender = mpsc::UnboundedSender<UploadEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<UploadEvent>;

/// Sends an event, ignoring a caller that stopped listening.
pub(crate) fn emit(events: &EventSender, event: UploadEvent) {
    let _ = events.send(event);
}
