//! Durable history of completed generations.
//!
//! Records live in SQLite. Scalar fields go in `records`; the encoded image
//! lives out-of-line in `record_blobs` so list scans never touch image
//! bytes. Every mutation runs in a single transaction across both tables
//! and mutations are serialized through one writer lock.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{NormalizedRequest, OutputFormat, StoreError, StoreResult};

/// Identity of a stored generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A generation about to be persisted.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub request: NormalizedRequest,
    pub image: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl NewRecord {
    pub fn new(request: NormalizedRequest, image: Vec<u8>) -> Self {
        Self {
            request,
            image,
            created_at: Utc::now(),
        }
    }
}

/// A stored generation including its image bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRecord {
    pub id: RecordId,
    pub request: NormalizedRequest,
    pub created_at: DateTime<Utc>,
    pub image: Vec<u8>,
}

/// The scalar part of a stored generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSummary {
    pub id: RecordId,
    pub request: NormalizedRequest,
    pub created_at: DateTime<Utc>,
    pub image_size: u64,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

const SUMMARY_COLUMNS: &str = "id, prompt, negative_prompt, steps, guidance_scale, width, height, \
     seed, output_format, model_id, image_size, created_at";

impl HistoryStore {
    /// Open (creating if needed) the history database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        tracing::info!(path = %path.as_ref().display(), "Opened history store");
        Self::from_pool(pool).await
    }

    /// A private database that lives as long as the store.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // Every connection to :memory: is a distinct database, so keep
        // exactly one alive forever.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                prompt TEXT NOT NULL,
                negative_prompt TEXT,
                steps INTEGER NOT NULL,
                guidance_scale REAL NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                seed INTEGER NOT NULL,
                output_format TEXT NOT NULL,
                model_id TEXT NOT NULL,
                image_size INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_records_created ON records(created_at DESC, seq DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS record_blobs (
                record_id TEXT PRIMARY KEY REFERENCES records(id) ON DELETE CASCADE,
                bytes BLOB NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    /// Persist a completed generation. Readers see either nothing or the
    /// whole record.
    pub async fn append(&self, record: NewRecord) -> StoreResult<RecordId> {
        let id = RecordId::new();
        let request = &record.request;
        let output_format = serde_plain::to_string(&request.output_format)
            .map_err(|e| StoreError::Corrupt {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO records (
                id, prompt, negative_prompt, steps, guidance_scale, width, height,
                seed, output_format, model_id, image_size, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&request.prompt)
        .bind(&request.negative_prompt)
        .bind(request.steps as i64)
        .bind(request.guidance_scale as f64)
        .bind(request.width as i64)
        .bind(request.height as i64)
        // Bit-preserving: SQLite integers are signed.
        .bind(request.seed as i64)
        .bind(output_format)
        .bind(&request.model_id)
        .bind(record.image.len() as i64)
        .bind(record.created_at.timestamp_micros())
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO record_blobs (record_id, bytes) VALUES (?, ?)")
            .bind(id.to_string())
            .bind(&record.image)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(%id, bytes = record.image.len(), "Appended generation record");
        Ok(id)
    }

    /// Record ids, newest first.
    pub async fn list(&self) -> StoreResult<Vec<RecordId>> {
        let rows = sqlx::query("SELECT id FROM records ORDER BY created_at DESC, seq DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                parse_id(&id)
            })
            .collect()
    }

    /// Scalar fields of every record, newest first.
    pub async fn list_summaries(&self) -> StoreResult<Vec<RecordSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM records ORDER BY created_at DESC, seq DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_summary).collect()
    }

    pub async fn summary(&self, id: RecordId) -> StoreResult<Option<RecordSummary>> {
        let row = sqlx::query(&format!("SELECT {SUMMARY_COLUMNS} FROM records WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_summary).transpose()
    }

    pub async fn get(&self, id: RecordId) -> StoreResult<Option<GenerationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT r.{}, b.bytes FROM records r JOIN record_blobs b ON b.record_id = r.id \
             WHERE r.id = ?",
            SUMMARY_COLUMNS.replace(", ", ", r.")
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let summary = parse_summary(&row)?;
        let image: Vec<u8> = row.try_get("bytes")?;
        Ok(Some(GenerationRecord {
            id: summary.id,
            request: summary.request,
            created_at: summary.created_at,
            image,
        }))
    }

    /// The encoded image of a record.
    pub async fn load_image(&self, id: RecordId) -> StoreResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT bytes FROM record_blobs WHERE record_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.try_get::<Vec<u8>, _>("bytes")).transpose()?)
    }

    /// Remove a record and its image. Returns whether it existed.
    pub async fn delete(&self, id: RecordId) -> StoreResult<bool> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM record_blobs WHERE record_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM records WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        tracing::debug!(%id, deleted = deleted > 0, "Deleted generation record");
        Ok(deleted > 0)
    }

    /// Remove every record and image. Returns how many records were removed.
    pub async fn delete_all(&self) -> StoreResult<u64> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM record_blobs")
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM records")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        tracing::info!(deleted, "Cleared generation history");
        Ok(deleted)
    }

    /// Close every connection. Later operations fail with a store error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Number of stored image blobs. Equal to [`count`](Self::count)
    /// unless the database was modified behind the store's back.
    pub async fn blob_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM record_blobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

fn parse_id(id: &str) -> StoreResult<RecordId> {
    id.parse().map_err(|e: uuid::Error| StoreError::Corrupt {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

fn parse_summary(row: &SqliteRow) -> StoreResult<RecordSummary> {
    let id_str: String = row.try_get("id")?;
    let id = parse_id(&id_str)?;
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id_str.clone(),
        reason,
    };
    let dimension = |column: &str| -> StoreResult<u32> {
        let value: i64 = row.try_get(column)?;
        u32::try_from(value).map_err(|_| corrupt(format!("{column} out of range: {value}")))
    };

    let output_format: String = row.try_get("output_format")?;
    let output_format: OutputFormat = serde_plain::from_str(&output_format)
        .map_err(|e| corrupt(format!("output format {output_format:?}: {e}")))?;
    let seed: i64 = row.try_get("seed")?;
    let guidance_scale: f64 = row.try_get("guidance_scale")?;
    let created_at: i64 = row.try_get("created_at")?;
    let created_at = DateTime::from_timestamp_micros(created_at)
        .ok_or_else(|| corrupt(format!("timestamp out of range: {created_at}")))?;
    let image_size: i64 = row.try_get("image_size")?;

    Ok(RecordSummary {
        id,
        request: NormalizedRequest {
            prompt: row.try_get("prompt")?,
            negative_prompt: row.try_get("negative_prompt")?,
            steps: dimension("steps")?,
            guidance_scale: guidance_scale as f32,
            width: dimension("width")?,
            height: dimension("height")?,
            seed: seed as u64,
            output_format,
            model_id: row.try_get("model_id")?,
        },
        created_at,
        image_size: image_size.max(0) as u64,
    })
}
