// src/config.rs

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::processor::FailurePolicy;

/// Client-side transfer tuning.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: u64,
    pub max_concurrent_uploads: usize,
    /// Attempts per chunk before it is marked failed.
    pub max_retries: u32,
    pub retry_delay_base: Duration,
    pub request_timeout: Duration,
    pub upload_poll_interval: Duration,
    pub processing_poll_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            max_concurrent_uploads: 3,
            max_retries: 3,
            retry_delay_base: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(60),
            upload_poll_interval: Duration::from_secs(2),
            processing_poll_interval: Duration::from_secs(3),
        }
    }
}

impl TransferConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        env_override("UPLOAD_CHUNK_SIZE", &mut config.chunk_size);
        env_override("UPLOAD_MAX_CONCURRENT", &mut config.max_concurrent_uploads);
        env_override("UPLOAD_MAX_RETRIES", &mut config.max_retries);
        env_override_millis("UPLOAD_RETRY_DELAY_MS", &mut config.retry_delay_base);
        env_override_millis("UPLOAD_REQUEST_TIMEOUT_MS", &mut config.request_timeout);
        env_override_millis("UPLOAD_POLL_INTERVAL_MS", &mut config.upload_poll_interval);
        env_override_millis(
            "UPLOAD_PROCESSING_POLL_INTERVAL_MS",
            &mut config.processing_poll_interval,
        );
        config
    }
}

/// Server-side job store and processing settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Holds the SQLite job store and the assembled files.
    pub data_dir: PathBuf,
    pub max_chunk_size: u64,
    /// Upper bound on `total_chunks` for a single job.
    pub max_chunks: u32,
    /// Rejected attempts per chunk before the server fails it.
    pub max_chunk_retries: u32,
    pub default_batch_size: usize,
    pub max_concurrent_batches: usize,
    pub failure_policy: FailurePolicy,
    /// Settled jobs older than this are purged along with their files.
    pub job_retention: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: PathBuf::from("./upload-data"),
            max_chunk_size: 64 * 1024 * 1024,
            max_chunks: 100_000,
            max_chunk_retries: 3,
            default_batch_size: 100,
            max_concurrent_batches: 4,
            failure_policy: FailurePolicy::NoBatchesCompleted,
            job_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        env_override("UPLOAD_BIND_ADDR", &mut config.bind_addr);
        env_override("UPLOAD_DATA_DIR", &mut config.data_dir);
        env_override("UPLOAD_MAX_CHUNK_SIZE", &mut config.max_chunk_size);
        env_override("UPLOAD_MAX_CHUNKS", &mut config.max_chunks);
        env_override("UPLOAD_MAX_CHUNK_RETRIES", &mut config.max_chunk_retries);
        env_override("UPLOAD_BATCH_SIZE", &mut config.default_batch_size);
        env_override("UPLOAD_MAX_CONCURRENT_BATCHES", &mut config.max_concurrent_batches);
        env_override_millis("UPLOAD_JOB_RETENTION_MS", &mut config.job_retention);

        if let Some(fraction) = env_var::<f64>("UPLOAD_MAX_FAILED_FRACTION") {
            config.failure_policy = FailurePolicy::FailedFractionAbove(fraction);
        }
        config
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("jobs.db")
    }

    pub fn log_config(&self) {
        tracing::info!(
            bind_addr = %self.bind_addr,
            data_dir = %self.data_dir.display(),
            max_chunk_size = self.max_chunk_size,
            max_chunks = self.max_chunks,
            max_chunk_retries = self.max_chunk_retries,
            default_batch_size = self.default_batch_size,
            max_concurrent_batches = self.max_concurrent_batches,
            failure_policy = ?self.failure_policy,
            job_retention_secs = self.job_retention.as_secs(),
            "server configuration"
        );
    }
}

fn env_var<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

fn env_override<T: FromStr>(key: &str, target: &mut T) {
    if let Some(value) = env_var(key) {
        *target = value;
    }
}

fn env_override_millis(key: &str, target: &mut Duration) {
    if let Some(ms) = env_var::<u64>(key) {
        *target = Duration::from_millis(ms);
    }
}
