pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod integrity;
pub mod manager;
pub mod models;
pub mod processor;
pub mod server;
pub mod session;
pub mod source;
pub mod state_manager;
pub mod tracker;
pub mod uploader;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::api::{HttpUploadApi, LocalUploadApi, UploadApi};
    pub use crate::backoff::{BackoffPolicy, ExponentialBackoff, LinearBackoff};
    pub use crate::config::{ServerConfig, TransferConfig};
    pub use crate::error::{ApiError, JobError, UploadError};
    pub use crate::events::UploadEvent;
    pub use crate::manager::JobManager;
    pub use crate::models::{
        ChunkState, ChunkStatus, CsvConfig, ImportConfig, JobStatus, ProcessRequest,
        ProcessingStats, UploadJob, UploadProgress, UploadType,
    };
    pub use crate::processor::{
        AcceptAllProcessor, BatchProcessor, FailurePolicy, ProcessingCoordinator,
    };
    pub use crate::session::{NewUpload, UploadSession};
    pub use crate::source::{ChunkSource, FileSource};
    pub use crate::state_manager::StateManager;
    pub use crate::uploader::UploadOutcome;
}
