// src/state_manager.rs

use crate::error::StateError;
use crate::models::UploadJob;
use rusqlite::params;
use std::path::Path;
use tokio_rusqlite::Connection;

/// Persists upload jobs (with their chunk records and batch counters) to SQLite.
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Opens the database file, creating it and the jobs table if needed.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS upload_jobs (
                        id              TEXT PRIMARY KEY,
                        status          TEXT NOT NULL,
                        job_data        TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces the job document.
    pub async fn save_job(&self, job: &UploadJob) -> Result<(), StateError> {
        let job_data = serde_json::to_string(job)?;
        let status = job.status.as_str();
        let job_id = job.id.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO upload_jobs (id, status, job_data) VALUES (?1, ?2, ?3)",
                    params![job_id, status, job_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_all_jobs(&self) -> Result<Vec<UploadJob>, StateError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT job_data FROM upload_jobs")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<String>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(StateError::from))
            .collect()
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<(), StateError> {
        let job_id = job_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM upload_jobs WHERE id = ?1", params![job_id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
