//! SQLite-backed metadata records for stored objects.
//!
//! The store is optional: a deployment without a database runs in
//! no-metadata mode and simply never constructs a `MetadataStore`.

use crate::models::file_record::FileMetadataRecord;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::warn;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("file entity `{0}` isn't found")]
    NotFound(String),
    #[error("metadata store did not answer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

#[derive(Clone, Debug)]
pub struct MetadataStore {
    /// Shared SQLite connection pool.
    db: Arc<SqlitePool>,

    /// Upper bound for every individual call.
    timeout: Duration,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn ensure_schema(&self) -> MetadataResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty());

        for stmt in statements {
            tracing::debug!("Executing migration SQL: {}", stmt);
            self.bounded(sqlx::query(stmt).execute(&*self.db)).await?;
        }
        Ok(())
    }

    async fn bounded<T, F>(&self, query: F) -> MetadataResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, query).await {
            Ok(result) => result.map_err(MetadataError::from),
            Err(_) => Err(MetadataError::Timeout(self.timeout)),
        }
    }

    /// Cheap connectivity probe used by readiness checks.
    pub async fn ping(&self) -> MetadataResult<()> {
        self.bounded(sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&*self.db))
            .await?;
        Ok(())
    }

    /// Insert a fresh record for a just-persisted object.
    ///
    /// An existing tombstone under the same id is reset, since the id has been
    /// claimed again on disk.
    pub async fn create(&self, id: &str) -> MetadataResult<FileMetadataRecord> {
        let query = sqlx::query_as::<_, FileMetadataRecord>(
            r#"
            INSERT INTO files (filename, upload_date, remove_date, is_removed, downloads_count)
            VALUES (?, ?, NULL, 0, 0)
            ON CONFLICT(filename) DO UPDATE SET
                upload_date = excluded.upload_date,
                remove_date = NULL,
                is_removed = 0,
                downloads_count = 0
            RETURNING filename, upload_date, remove_date, is_removed, downloads_count
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .fetch_one(&*self.db);

        self.bounded(query).await
    }

    /// Bump the download counter.
    pub async fn record_download(&self, id: &str) -> MetadataResult<()> {
        let query = sqlx::query(
            "UPDATE files SET downloads_count = downloads_count + 1 WHERE filename = ?",
        )
        .bind(id)
        .execute(&*self.db);

        if self.bounded(query).await?.rows_affected() == 0 {
            warn!(%id, "download of object without metadata record");
        }
        Ok(())
    }

    /// Turn the record into a tombstone.
    pub async fn mark_removed(&self, id: &str) -> MetadataResult<()> {
        let query = sqlx::query(
            "UPDATE files SET is_removed = 1, remove_date = ? WHERE filename = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db);

        if self.bounded(query).await?.rows_affected() == 0 {
            warn!(%id, "removal of object without metadata record");
        }
        Ok(())
    }

    pub async fn load(&self, id: &str) -> MetadataResult<FileMetadataRecord> {
        let query = sqlx::query_as::<_, FileMetadataRecord>(
            "SELECT filename, upload_date, remove_date, is_removed, downloads_count
             FROM files WHERE filename = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db);

        self.bounded(query)
            .await?
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))
    }

    /// Single-connection in-memory store with the schema applied.
    #[cfg(test)]
    pub(crate) async fn in_memory() -> Self {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let store = Self::new(Arc::new(pool), DEFAULT_METADATA_TIMEOUT);
        store.ensure_schema().await.expect("schema");
        store
    }
}
