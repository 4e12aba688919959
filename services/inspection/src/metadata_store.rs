use crate::config::DatabaseConfig;
use crate::models::{stored_precision, Image, Recording, RecordingKey, RecordingStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised by the relational stores
#[derive(Debug, Error)]
pub enum StoreError {
    /// A row with the same natural key already exists
    #[error("record already exists: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

/// Persistence for recordings, unique on (location_code, recording_ref)
#[async_trait]
pub trait RecordingStore: Send + Sync {
    /// Insert a new recording; fails with [`StoreError::Conflict`] if the key exists
    async fn insert_recording(&self, recording: &Recording) -> Result<(), StoreError>;

    /// Look up a recording by its natural key
    async fn find_recording(&self, key: &RecordingKey) -> Result<Option<Recording>, StoreError>;

    /// Move a partial recording to frozen. Returns the row only if this call made the
    /// transition; `None` means the recording is missing or was already frozen.
    async fn mark_frozen(
        &self,
        key: &RecordingKey,
        frozen_at: DateTime<Utc>,
    ) -> Result<Option<Recording>, StoreError>;

    /// Recordings of one status created at or after `since`, newest first
    async fn list_recordings_since(
        &self,
        location_code: &str,
        status: RecordingStatus,
        since: DateTime<Utc>,
    ) -> Result<Vec<Recording>, StoreError>;
}

/// Persistence for uploaded view images, unique on (location_code, recording_ref, view_name)
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Insert or overwrite the upload timestamp of one view (last write wins)
    async fn upsert_image(
        &self,
        key: &RecordingKey,
        view_name: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Result<Image, StoreError>;

    /// All images of a recording, most recent first
    async fn find_by_recording(&self, key: &RecordingKey) -> Result<Vec<Image>, StoreError>;
}

/// PostgreSQL-backed recording and image store
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordingStore for PgMetadataStore {
    #[instrument(skip(self, recording), fields(location = %recording.location_code, recording_ref = %recording.recording_ref))]
    async fn insert_recording(&self, recording: &Recording) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO recordings (location_code, recording_ref, status, created_at, frozen_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&recording.location_code)
        .bind(&recording.recording_ref)
        .bind(recording.status.as_str())
        .bind(stored_precision(recording.created_at))
        .bind(recording.frozen_at.map(stored_precision))
        .execute(&self.pool)
        .await?;

        debug!("Recording inserted");
        Ok(())
    }

    async fn find_recording(&self, key: &RecordingKey) -> Result<Option<Recording>, StoreError> {
        let recording = sqlx::query_as::<_, Recording>(
            r#"
            SELECT location_code, recording_ref, status, created_at, frozen_at
            FROM recordings
            WHERE location_code = $1 AND recording_ref = $2
            "#,
        )
        .bind(&key.location_code)
        .bind(&key.recording_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(recording)
    }

    #[instrument(skip(self), fields(recording = %key))]
    async fn mark_frozen(
        &self,
        key: &RecordingKey,
        frozen_at: DateTime<Utc>,
    ) -> Result<Option<Recording>, StoreError> {
        // Status and timestamp change in one statement so the frozen_at/status check
        // constraint holds at every point. The status guard lets exactly one caller win.
        let recording = sqlx::query_as::<_, Recording>(
            r#"
            UPDATE recordings
            SET status = 'frozen',
                frozen_at = $3
            WHERE location_code = $1 AND recording_ref = $2 AND status = 'partial'
            RETURNING location_code, recording_ref, status, created_at, frozen_at
            "#,
        )
        .bind(&key.location_code)
        .bind(&key.recording_ref)
        .bind(stored_precision(frozen_at))
        .fetch_optional(&self.pool)
        .await?;

        Ok(recording)
    }

    #[instrument(skip(self))]
    async fn list_recordings_since(
        &self,
        location_code: &str,
        status: RecordingStatus,
        since: DateTime<Utc>,
    ) -> Result<Vec<Recording>, StoreError> {
        let recordings = sqlx::query_as::<_, Recording>(
            r#"
            SELECT location_code, recording_ref, status, created_at, frozen_at
            FROM recordings
            WHERE location_code = $1 AND status = $2 AND created_at >= $3
            ORDER BY created_at DESC
            "#,
        )
        .bind(location_code)
        .bind(status.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(recordings)
    }
}

#[async_trait]
impl ImageStore for PgMetadataStore {
    #[instrument(skip(self), fields(recording = %key))]
    async fn upsert_image(
        &self,
        key: &RecordingKey,
        view_name: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Result<Image, StoreError> {
        let image = sqlx::query_as::<_, Image>(
            r#"
            INSERT INTO images (location_code, recording_ref, view_name, uploaded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (location_code, recording_ref, view_name)
            DO UPDATE SET uploaded_at = EXCLUDED.uploaded_at
            RETURNING location_code, recording_ref, view_name, uploaded_at
            "#,
        )
        .bind(&key.location_code)
        .bind(&key.recording_ref)
        .bind(view_name)
        .bind(stored_precision(uploaded_at))
        .fetch_one(&self.pool)
        .await?;

        metrics::counter!("inspection.images.recorded").increment(1);

        Ok(image)
    }

    async fn find_by_recording(&self, key: &RecordingKey) -> Result<Vec<Image>, StoreError> {
        let images = sqlx::query_as::<_, Image>(
            r#"
            SELECT location_code, recording_ref, view_name, uploaded_at
            FROM images
            WHERE location_code = $1 AND recording_ref = $2
            ORDER BY uploaded_at DESC
            "#,
        )
        .bind(&key.location_code)
        .bind(&key.recording_ref)
        .fetch_all(&self.pool)
        .await?;

        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_database_errors_are_not_conflicts() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Database(_)));

        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(!matches!(err, StoreError::Conflict(_)));
    }
}
