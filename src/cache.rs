//! Exact-match prompt cache
//!
//! Responses are keyed by (SHA-256 of model + messages, model) with a
//! per-row TTL captured at put time. Hit/miss counters live in process
//! memory only and reset on restart.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::{CacheStats, ChatMessage};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

const CREATE_CACHE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    prompt_hash TEXT NOT NULL,
    model TEXT NOT NULL,
    response BLOB NOT NULL,
    created_at DATETIME NOT NULL,
    ttl_seconds INTEGER NOT NULL,
    PRIMARY KEY (prompt_hash, model)
)
"#;

/// SQLite-backed response cache.
#[derive(Clone)]
pub struct CacheStore {
    pool: SqlitePool,
    ttl: Duration,
    hits: Arc<AtomicI64>,
    misses: Arc<AtomicI64>,
}

/// SHA-256 over the model name bytes followed by the JSON serialization of
/// the message list. The serialization of `ChatMessage` (`role`, then
/// `content`) is the canonical form; changing it breaks cache continuity.
pub fn hash_prompt(model: &str, messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    if let Ok(data) = serde_json::to_vec(messages) {
        hasher.update(&data);
    }
    hex::encode(hasher.finalize())
}

impl CacheStore {
    /// Open (or create) the cache database with the given default TTL.
    pub async fn new(database_url: &str, ttl: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| CacheError::Storage(format!("invalid database URL: {}", e)))?
            .create_if_missing(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CacheError::Storage(format!("connect cache db: {}", e)))?;

        sqlx::query(CREATE_CACHE_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| CacheError::Storage(format!("migrate cache db: {}", e)))?;

        Ok(Self {
            pool,
            ttl,
            hits: Arc::new(AtomicI64::new(0)),
            misses: Arc::new(AtomicI64::new(0)),
        })
    }

    /// Fetch a cached response. Absent or expired rows count as misses;
    /// storage errors on the read path degrade to misses as well.
    pub async fn get(&self, prompt_hash: &str, model: &str) -> Option<Vec<u8>> {
        let row = match sqlx::query(
            "SELECT response, created_at, ttl_seconds FROM cache_entries WHERE prompt_hash = ?1 AND model = ?2",
        )
        .bind(prompt_hash)
        .bind(model)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!("cache read error: {}", e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let Some(row) = row else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let created_at: DateTime<Utc> = row.get("created_at");
        let ttl_seconds: i64 = row.get("ttl_seconds");
        if (Utc::now() - created_at).num_seconds() > ttl_seconds {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(row.get("response"))
    }

    /// Store a response. The row captures the configured default TTL at
    /// put time; later config changes do not alter existing rows.
    pub async fn put(&self, prompt_hash: &str, model: &str, response: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cache_entries
                (prompt_hash, model, response, created_at, ttl_seconds)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(prompt_hash)
        .bind(model)
        .bind(response)
        .bind(Utc::now())
        .bind(self.ttl.as_secs() as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Storage(format!("cache put: {}", e)))?;
        Ok(())
    }

    /// Entry count plus process-local hit/miss counters.
    pub async fn stats(&self) -> Result<CacheStats> {
        let entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CacheError::Storage(format!("cache stats: {}", e)))?;

        Ok(CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }

    /// Remove entries; with `expired_only`, only rows past their TTL.
    pub async fn clear(&self, expired_only: bool) -> Result<()> {
        let query = if expired_only {
            "DELETE FROM cache_entries WHERE (julianday('now') - julianday(created_at)) * 86400 > ttl_seconds"
        } else {
            "DELETE FROM cache_entries"
        };
        sqlx::query(query)
            .execute(&self.pool)
            .await
            .map_err(|e| CacheError::Storage(format!("cache clear: {}", e)))?;
        Ok(())
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
