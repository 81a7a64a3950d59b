// src/server.rs

//! HTTP surface of the job store and processing coordinator.

use crate::config::ServerConfig;
use crate::error::JobError;
use crate::manager::JobManager;
use crate::models::{
    ChunkAck, ControlAction, CreateJobRequest, CreateJobResponse, ProcessRequest, ProcessingStats,
    UploadJob, UploadProgress,
};
use crate::processor::{BatchProcessor, ProcessingCoordinator};
use crate::state_manager::StateManager;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub coordinator: Arc<ProcessingCoordinator>,
}

impl AppState {
    /// Opens the job store under `config.data_dir` and wires up the coordinator.
    pub async fn new(
        config: &ServerConfig,
        processor: Arc<dyn BatchProcessor>,
    ) -> Result<Self, JobError> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let state_manager = StateManager::new(&config.database_path()).await?;
        let manager = Arc::new(JobManager::new(state_manager, config).await?);
        let coordinator = Arc::new(ProcessingCoordinator::new(manager.clone(), processor, config));
        Ok(Self { manager, coordinator })
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState, max_chunk_size: u64) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/upload/create", post(create_job))
        .route("/upload/:job_id", get(get_job))
        .route("/upload/:job_id/chunk/:index", post(upload_chunk))
        .route("/upload/:job_id/progress", get(get_progress).post(control))
        .route("/upload/:job_id/process", get(get_processing_stats).post(start_processing))
        .layer(DefaultBodyLimit::max(max_chunk_size as usize + 64 * 1024))
        .with_state(state)
}

/// Binds `config.bind_addr` and serves until the listener fails.
pub async fn serve(config: ServerConfig, processor: Arc<dyn BatchProcessor>) -> anyhow::Result<()> {
    config.log_config();
    let state = AppState::new(&config, processor).await?;
    spawn_purger(state.manager.clone(), config.job_retention);
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("upload server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state, config.max_chunk_size)).await?;
    Ok(())
}

/// Periodically removes settled jobs past their retention.
fn spawn_purger(manager: Arc<JobManager>, retention: Duration) -> JoinHandle<()> {
    let period = retention.clamp(Duration::from_secs(1), Duration::from_secs(60 * 60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = manager.purge_settled(retention).await {
                warn!(error = %e, "purge of settled jobs failed");
            }
        }
    })
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), JobError> {
    let response = state.manager.create_job(request).await.map_err(|e| {
        warn!(error = %e, "job creation rejected");
        e
    })?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<UploadJob>, JobError> {
    Ok(Json(state.manager.get_job(&job_id).await?))
}

async fn upload_chunk(
    State(state): State<AppState>,
    Path((job_id, index)): Path<(String, u32)>,
    body: Bytes,
) -> Result<Json<ChunkAck>, JobError> {
    let ack = state
        .manager
        .receive_chunk(&job_id, index, &body)
        .await
        .map_err(|e| {
            warn!(job_id = %job_id, chunk = index, error = %e, "chunk rejected");
            e
        })?;
    Ok(Json(ack))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<UploadProgress>, JobError> {
    Ok(Json(state.manager.progress(&job_id).await?))
}

async fn control(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(action): Json<ControlAction>,
) -> Result<Json<UploadProgress>, JobError> {
    Ok(Json(state.manager.control(&job_id, action).await?))
}

async fn start_processing(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    body: Bytes,
) -> Result<Json<ProcessingStats>, JobError> {
    // An empty body means "use the defaults".
    let request = if body.is_empty() {
        ProcessRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| JobError::InvalidRequest(e.to_string()))?
    };
    Ok(Json(state.coordinator.start(&job_id, request).await?))
}

async fn get_processing_stats(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ProcessingStats>, JobError> {
    Ok(Json(state.manager.processing_stats(&job_id).await?))
}
