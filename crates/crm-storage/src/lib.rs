//! Durable ID mapping store, read-only source snapshot access and HTTP retry primitives.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_core::{MappingOrigin, MappingRecord, SourceRow};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "crm-storage";

const CREATE_MAPPINGS_TABLE: &str = "CREATE TABLE IF NOT EXISTS id_mappings (
    object_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    origin TEXT NOT NULL DEFAULT 'created',
    PRIMARY KEY (object_type, source_id)
)";

const HAS_ORIGIN_COLUMN: &str =
    "SELECT COUNT(*) FROM pragma_table_info('id_mappings') WHERE name = 'origin'";
const ADD_ORIGIN_COLUMN: &str =
    "ALTER TABLE id_mappings ADD COLUMN origin TEXT NOT NULL DEFAULT 'created'";

#[derive(Debug, Error)]
pub enum MappingStoreError {
    #[error("creating mapping store directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mapping store database error: {0}")]
    Database(#[from] sqlx::Error),
}

type MappingCache = HashMap<String, HashMap<String, String>>;

/// `(object_type, source_id) -> target_id` store backed by SQLite with a fully warmed read cache.
///
/// Writes hold `write_lock` for the duration of the transaction and the cache update, so the
/// cache only ever reflects committed rows.
#[derive(Debug)]
pub struct IdMappingStore {
    pool: SqlitePool,
    path: PathBuf,
    cache: RwLock<MappingCache>,
    write_lock: Mutex<()>,
}

impl IdMappingStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MappingStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| MappingStoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_MAPPINGS_TABLE).execute(&pool).await?;
        let (has_origin,): (i64,) = sqlx::query_as(HAS_ORIGIN_COLUMN).fetch_one(&pool).await?;
        if has_origin == 0 {
            sqlx::query(ADD_ORIGIN_COLUMN).execute(&pool).await?;
            info!(path = %path.display(), "added origin column to id mappings");
        }

        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT object_type, source_id, target_id FROM id_mappings")
                .fetch_all(&pool)
                .await?;
        let mut cache = MappingCache::new();
        for (object_type, source_id, target_id) in rows {
            cache
                .entry(object_type)
                .or_default()
                .insert(source_id, target_id);
        }
        let loaded: usize = cache.values().map(HashMap::len).sum();
        info!(path = %path.display(), loaded, "opened id mapping store");

        Ok(Self {
            pool,
            path,
            cache: RwLock::new(cache),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, object_type: &str, source_id: &str) -> Option<String> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(object_type)
            .and_then(|by_source| by_source.get(source_id))
            .cloned()
    }

    pub fn contains(&self, object_type: &str, source_id: &str) -> bool {
        self.get(object_type, source_id).is_some()
    }

    pub async fn put(
        &self,
        object_type: &str,
        source_id: &str,
        target_id: &str,
    ) -> Result<(), MappingStoreError> {
        self.put_batch(object_type, &[(source_id.to_string(), target_id.to_string())])
            .await
            .map(|_| ())
    }

    /// Persists all pairs as created by this migration. See [`Self::put_batch_as`].
    pub async fn put_batch(
        &self,
        object_type: &str,
        pairs: &[(String, String)],
    ) -> Result<usize, MappingStoreError> {
        self.put_batch_as(object_type, pairs, MappingOrigin::Created)
            .await
    }

    /// Persists all pairs in one transaction, then mirrors them into the cache.
    /// Pairs with an empty side are ignored. Returns the number of pairs written.
    pub async fn put_batch_as(
        &self,
        object_type: &str,
        pairs: &[(String, String)],
        origin: MappingOrigin,
    ) -> Result<usize, MappingStoreError> {
        let pairs: Vec<&(String, String)> = pairs
            .iter()
            .filter(|(source_id, target_id)| !source_id.is_empty() && !target_id.is_empty())
            .collect();
        if pairs.is_empty() {
            return Ok(0);
        }

        let _writer = self.write_lock.lock().await;
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        for (source_id, target_id) in &pairs {
            sqlx::query(
                "INSERT OR REPLACE INTO id_mappings
                 (object_type, source_id, target_id, created_at, origin)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(object_type)
            .bind(source_id.as_str())
            .bind(target_id.as_str())
            .bind(created_at)
            .bind(origin.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let by_source = cache.entry(object_type.to_string()).or_default();
        for (source_id, target_id) in &pairs {
            by_source.insert(source_id.clone(), target_id.clone());
        }
        debug!(
            object_type,
            written = pairs.len(),
            origin = origin.as_str(),
            "persisted id mappings"
        );
        Ok(pairs.len())
    }

    pub fn count(&self, object_type: Option<&str>) -> usize {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        match object_type {
            Some(object_type) => cache.get(object_type).map_or(0, HashMap::len),
            None => cache.values().map(HashMap::len).sum(),
        }
    }

    /// Mapping counts per object type, sorted by name.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .iter()
            .filter(|(_, by_source)| !by_source.is_empty())
            .map(|(object_type, by_source)| (object_type.clone(), by_source.len()))
            .collect()
    }

    pub async fn mappings_for(
        &self,
        object_type: &str,
    ) -> Result<Vec<MappingRecord>, MappingStoreError> {
        let rows: Vec<(String, String, String, DateTime<Utc>, String)> = sqlx::query_as(
            "SELECT object_type, source_id, target_id, created_at, origin
             FROM id_mappings WHERE object_type = ? ORDER BY created_at, source_id",
        )
        .bind(object_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(object_type, source_id, target_id, created_at, origin)| MappingRecord {
                    object_type,
                    source_id,
                    target_id,
                    created_at,
                    origin: MappingOrigin::parse(&origin),
                },
            )
            .collect())
    }

    pub async fn remove_batch(
        &self,
        object_type: &str,
        source_ids: &[String],
    ) -> Result<usize, MappingStoreError> {
        if source_ids.is_empty() {
            return Ok(0);
        }

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut removed = 0usize;
        for source_id in source_ids {
            let result =
                sqlx::query("DELETE FROM id_mappings WHERE object_type = ? AND source_id = ?")
                    .bind(object_type)
                    .bind(source_id.as_str())
                    .execute(&mut *tx)
                    .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(by_source) = cache.get_mut(object_type) {
            for source_id in source_ids {
                by_source.remove(source_id);
            }
        }
        Ok(removed)
    }

    /// Irreversibly drops mappings for one object type, or all of them.
    pub async fn clear(&self, object_type: Option<&str>) -> Result<u64, MappingStoreError> {
        let _writer = self.write_lock.lock().await;
        let result = match object_type {
            Some(object_type) => {
                sqlx::query("DELETE FROM id_mappings WHERE object_type = ?")
                    .bind(object_type)
                    .execute(&self.pool)
                    .await?
            }
            None => sqlx::query("DELETE FROM id_mappings").execute(&self.pool).await?,
        };

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        match object_type {
            Some(object_type) => {
                cache.remove(object_type);
            }
            None => cache.clear(),
        }
        info!(
            object_type = object_type.unwrap_or("*"),
            removed = result.rows_affected(),
            "cleared id mappings"
        );
        Ok(result.rows_affected())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Error)]
pub enum SourceStoreError {
    #[error("source database not found: {0}")]
    Missing(PathBuf),
    #[error("invalid object name {0:?}")]
    InvalidObjectName(String),
    #[error("source database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Read-only tabular snapshot keyed by object type name.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn tables(&self) -> Result<Vec<String>, SourceStoreError>;

    /// All rows of `object`, in storage order. Unknown objects yield no rows.
    async fn rows(&self, object: &str) -> Result<Vec<SourceRow>, SourceStoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSourceStore {
    pool: SqlitePool,
}

impl SqliteSourceStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceStoreError> {
        let path = path.as_ref();
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Err(SourceStoreError::Missing(path.to_path_buf()));
        }

        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "opened source snapshot");
        Ok(Self { pool })
    }

    async fn table_exists(&self, object: &str) -> Result<bool, SourceStoreError> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(object)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}

fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn decode_row(row: &SqliteRow) -> Result<SourceRow, sqlx::Error> {
    let mut out = SourceRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            JsonValue::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            match type_name.as_str() {
                "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => {
                    JsonValue::from(row.try_get_unchecked::<i64, _>(idx)?)
                }
                "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                    let number = row.try_get_unchecked::<f64, _>(idx)?;
                    serde_json::Number::from_f64(number)
                        .map(JsonValue::Number)
                        .unwrap_or(JsonValue::Null)
                }
                "BLOB" => {
                    let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx)?;
                    JsonValue::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => JsonValue::String(row.try_get_unchecked::<String, _>(idx)?),
            }
        };
        out.push(column.name(), value);
    }
    Ok(out)
}

#[async_trait]
impl SourceStore for SqliteSourceStore {
    async fn tables(&self) -> Result<Vec<String>, SourceStoreError> {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names.into_iter().map(|(name,)| name).collect())
    }

    async fn rows(&self, object: &str) -> Result<Vec<SourceRow>, SourceStoreError> {
        if !is_plain_identifier(object) {
            return Err(SourceStoreError::InvalidObjectName(object.to_string()));
        }
        if !self.table_exists(object).await? {
            debug!(object, "no source table");
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!("SELECT * FROM \"{object}\""))
            .fetch_all(&self.pool)
            .await?;
        let decoded = rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(decoded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }
}

impl BackoffPolicy {
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        builder.build().context("building reqwest client")
    }
}
