// src/api.rs

use crate::error::ApiError;
use crate::manager::JobManager;
use crate::models::{
    ChunkAck, ControlAction, CreateJobRequest, CreateJobResponse, ProcessRequest, ProcessingStats,
    UploadJob, UploadProgress,
};
use crate::processor::ProcessingCoordinator;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Where one chunk goes.
#[derive(Debug, Clone, Copy)]
pub struct ChunkTarget<'a> {
    pub job_id: &'a str,
    pub index: u32,
    /// The per-chunk target handed out at job creation.
    pub url: &'a str,
}

/// The upload endpoints the client drives.
#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn create_job(
        &self,
        request: &CreateJobRequest,
    ) -> Result<CreateJobResponse, ApiError>;
    /// The full job, including per-chunk records.
    async fn get_job(&self, job_id: &str) -> Result<UploadJob, ApiError>;
    async fn upload_chunk(
        &self,
        target: ChunkTarget<'_>,
        data: Bytes,
    ) -> Result<ChunkAck, ApiError>;
    async fn upload_progress(&self, job_id: &str) -> Result<UploadProgress, ApiError>;
    async fn control(
        &self,
        job_id: &str,
        action: &ControlAction,
    ) -> Result<UploadProgress, ApiError>;
    async fn start_processing(
        &self,
        job_id: &str,
        request: &ProcessRequest,
    ) -> Result<ProcessingStats, ApiError>;
    async fn processing_stats(&self, job_id: &str) -> Result<ProcessingStats, ApiError>;
}

/// Talks to an upload server over HTTP.
#[derive(Debug, Clone)]
pub struct HttpUploadApi {
    client: Client,
    base_url: String,
}

impl HttpUploadApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent(concat!("upload_pipeline/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or(body);
            return Err(ApiError::Status { status: status.as_u16(), message });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn create_job(
        &self,
        request: &CreateJobRequest,
    ) -> Result<CreateJobResponse, ApiError> {
        let response = self.client.post(self.url("/upload/create")).json(request).send().await?;
        Self::decode(response).await
    }

    async fn get_job(&self, job_id: &str) -> Result<UploadJob, ApiError> {
        let response = self.client.get(self.url(&format!("/upload/{job_id}"))).send().await?;
        Self::decode(response).await
    }

    async fn upload_chunk(
        &self,
        target: ChunkTarget<'_>,
        data: Bytes,
    ) -> Result<ChunkAck, ApiError> {
        let url = if target.url.is_empty() {
            self.url(&format!("/upload/{}/chunk/{}", target.job_id, target.index))
        } else {
            self.url(target.url)
        };
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn upload_progress(&self, job_id: &str) -> Result<UploadProgress, ApiError> {
        let url = self.url(&format!("/upload/{job_id}/progress"));
        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }

    async fn control(
        &self,
        job_id: &str,
        action: &ControlAction,
    ) -> Result<UploadProgress, ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/upload/{job_id}/progress")))
            .json(action)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn start_processing(
        &self,
        job_id: &str,
        request: &ProcessRequest,
    ) -> Result<ProcessingStats, ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/upload/{job_id}/process")))
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn processing_stats(&self, job_id: &str) -> Result<ProcessingStats, ApiError> {
        let url = self.url(&format!("/upload/{job_id}/process"));
        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }
}

/// Drives a job manager in the same process, skipping the network.
#[derive(Clone)]
pub struct LocalUploadApi {
    manager: Arc<JobManager>,
    coordinator: Arc<ProcessingCoordinator>,
}

impl LocalUploadApi {
    pub fn new(manager: Arc<JobManager>, coordinator: Arc<ProcessingCoordinator>) -> Self {
        Self { manager, coordinator }
    }
}

#[async_trait]
impl UploadApi for LocalUploadApi {
    async fn create_job(
        &self,
        request: &CreateJobRequest,
    ) -> Result<CreateJobResponse, ApiError> {
        Ok(self.manager.create_job(request.clone()).await?)
    }

    async fn get_job(&self, job_id: &str) -> Result<UploadJob, ApiError> {
        Ok(self.manager.get_job(job_id).await?)
    }

    async fn upload_chunk(
        &self,
        target: ChunkTarget<'_>,
        data: Bytes,
    ) -> Result<ChunkAck, ApiError> {
        Ok(self.manager.receive_chunk(target.job_id, target.index, &data).await?)
    }

    async fn upload_progress(&self, job_id: &str) -> Result<UploadProgress, ApiError> {
        Ok(self.manager.progress(job_id).await?)
    }

    async fn control(
        &self,
        job_id: &str,
        action: &ControlAction,
    ) -> Result<UploadProgress, ApiError> {
        Ok(self.manager.control(job_id, action.clone()).await?)
    }

    async fn start_processing(
        &self,
        job_id: &str,
        request: &ProcessRequest,
    ) -> Result<ProcessingStats, ApiError> {
        Ok(self.coordinator.start(job_id, request.clone()).await?)
    }

    async fn processing_stats(&self, job_id: &str) -> Result<ProcessingStats, ApiError> {
        Ok(self.manager.processing_stats(job_id).await?)
    }
}
