//! Audit logging
//!
//! Write-once entries keyed by request id in a dedicated SQLite database,
//! always separate from the usage and cache stores. Writes happen off the
//! response path; a background task sweeps expired rows hourly.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::AuditConfig;
use crate::models::{AuditEntry, AuditQueryOpts, AuditStat};

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AuditError>;

const CREATE_AUDIT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    request_id TEXT PRIMARY KEY,
    api_key_hash TEXT NOT NULL,
    api_key_prefix TEXT NOT NULL,
    model TEXT NOT NULL,
    session_id TEXT,
    provider TEXT,
    request_body TEXT,
    response_body TEXT,
    request_headers TEXT,
    status_code INTEGER,
    prompt_tokens INTEGER,
    completion_tokens INTEGER,
    total_tokens INTEGER,
    latency_ms INTEGER,
    created_at DATETIME NOT NULL
)
"#;

const CREATE_AUDIT_INDEXES: [&str; 3] = [
    "CREATE INDEX IF NOT EXISTS idx_audit_model ON audit_log(model)",
    "CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_audit_prefix ON audit_log(api_key_prefix)",
];

/// SQLite-backed audit logger with an hourly retention sweeper.
pub struct AuditLogger {
    pool: SqlitePool,
    cfg: AuditConfig,
    include: HashSet<String>,
    exclude: HashSet<String>,
    shutdown: watch::Sender<bool>,
}

/// SHA-256 hex hash of an API key plus its first 8 characters as a
/// queryable prefix.
pub fn hash_api_key(key: &str) -> (String, String) {
    let hash = hex::encode(Sha256::digest(key.as_bytes()));
    let prefix = if key.len() > 8 { &key[..8] } else { key };
    (hash, prefix.to_string())
}

impl AuditLogger {
    /// Open the audit database, run migrations, and start the retention
    /// sweeper.
    pub async fn new(database_url: &str, cfg: AuditConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AuditError::Storage(format!("invalid database URL: {}", e)))?
            .create_if_missing(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| AuditError::Storage(format!("connect audit db: {}", e)))?;

        sqlx::query(CREATE_AUDIT_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| AuditError::Storage(format!("migrate audit db: {}", e)))?;
        for statement in CREATE_AUDIT_INDEXES {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| AuditError::Storage(format!("migrate audit db: {}", e)))?;
        }

        let include: HashSet<String> = cfg.include.iter().cloned().collect();
        let exclude: HashSet<String> = cfg.exclude_models.iter().cloned().collect();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let logger = Self {
            pool,
            cfg,
            include,
            exclude,
            shutdown,
        };
        logger.spawn_retention_loop(shutdown_rx);
        Ok(logger)
    }

    fn spawn_retention_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let pool = self.pool.clone();
        let retention_days = self.cfg.retention_days;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cleanup_older_than(&pool, retention_days).await {
                            tracing::warn!("audit retention sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    /// Insert an audit entry, applying the exclude-models drop, the
    /// include-set field filter, and body truncation. Repeated inserts with
    /// the same request id overwrite the previous row.
    pub async fn log(&self, entry: AuditEntry) -> Result<()> {
        if self.exclude.contains(&entry.model) {
            return Ok(());
        }

        let mut request_body = entry.request_body;
        let mut response_body = entry.response_body;
        let mut headers_json = String::new();

        if !self.include.contains("prompts") {
            request_body.clear();
        }
        if !self.include.contains("responses") {
            response_body.clear();
        }
        if self.include.contains("metadata") {
            if let Some(headers) = &entry.request_headers {
                headers_json = serde_json::to_string(headers)?;
            }
        }

        if self.cfg.max_body_size > 0 {
            truncate_to(&mut request_body, self.cfg.max_body_size);
            truncate_to(&mut response_body, self.cfg.max_body_size);
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO audit_log
                (request_id, api_key_hash, api_key_prefix, model, session_id, provider,
                 request_body, response_body, request_headers, status_code,
                 prompt_tokens, completion_tokens, total_tokens, latency_ms, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&entry.request_id)
        .bind(&entry.api_key_hash)
        .bind(&entry.api_key_prefix)
        .bind(&entry.model)
        .bind(&entry.session_id)
        .bind(&entry.provider)
        .bind(&request_body)
        .bind(&response_body)
        .bind(&headers_json)
        .bind(entry.status_code)
        .bind(entry.prompt_tokens)
        .bind(entry.completion_tokens)
        .bind(entry.total_tokens)
        .bind(entry.latency_ms)
        .bind(entry.created_at.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::Storage(format!("insert audit entry: {}", e)))?;

        Ok(())
    }

    /// Entries matching the given filters, newest first. Limit defaults
    /// to 100.
    pub async fn query(&self, opts: &AuditQueryOpts) -> Result<Vec<AuditEntry>> {
        let mut query = String::from(
            r#"
            SELECT request_id, api_key_hash, api_key_prefix, model, session_id, provider,
                   request_body, response_body, request_headers, status_code,
                   prompt_tokens, completion_tokens, total_tokens, latency_ms, created_at
            FROM audit_log WHERE 1=1
            "#,
        );
        let mut bind_count = 0;

        if opts.request_id.is_some() {
            bind_count += 1;
            query.push_str(&format!(" AND request_id = ?{}", bind_count));
        }
        if opts.model.is_some() {
            bind_count += 1;
            query.push_str(&format!(" AND model = ?{}", bind_count));
        }
        if opts.since.is_some() {
            bind_count += 1;
            query.push_str(&format!(" AND created_at >= ?{}", bind_count));
        }
        if opts.api_key_prefix.is_some() {
            bind_count += 1;
            query.push_str(&format!(" AND api_key_prefix = ?{}", bind_count));
        }
        if opts.session_id.is_some() {
            bind_count += 1;
            query.push_str(&format!(" AND session_id = ?{}", bind_count));
        }

        let limit = match opts.limit {
            Some(n) if n > 0 => n,
            _ => 100,
        };
        bind_count += 1;
        query.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", bind_count));

        let mut sql_query = sqlx::query(&query);
        if let Some(ref request_id) = opts.request_id {
            sql_query = sql_query.bind(request_id);
        }
        if let Some(ref model) = opts.model {
            sql_query = sql_query.bind(model);
        }
        if let Some(since) = opts.since {
            sql_query = sql_query.bind(since);
        }
        if let Some(ref prefix) = opts.api_key_prefix {
            sql_query = sql_query.bind(prefix);
        }
        if let Some(ref session_id) = opts.session_id {
            sql_query = sql_query.bind(session_id);
        }
        sql_query = sql_query.bind(limit);

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AuditError::Storage(format!("query audit: {}", e)))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let headers_json: String = row.get("request_headers");
            let request_headers: Option<HashMap<String, String>> = if headers_json.is_empty() {
                None
            } else {
                serde_json::from_str(&headers_json).ok()
            };
            entries.push(AuditEntry {
                request_id: row.get("request_id"),
                api_key_hash: row.get("api_key_hash"),
                api_key_prefix: row.get("api_key_prefix"),
                model: row.get("model"),
                session_id: row.get("session_id"),
                provider: row.get("provider"),
                request_body: row.get("request_body"),
                response_body: row.get("response_body"),
                request_headers,
                status_code: row.get("status_code"),
                prompt_tokens: row.get("prompt_tokens"),
                completion_tokens: row.get("completion_tokens"),
                total_tokens: row.get("total_tokens"),
                latency_ms: row.get("latency_ms"),
                created_at: Some(row.get("created_at")),
            });
        }
        Ok(entries)
    }

    /// Aggregate counts grouped by model and UTC day, newest day first.
    pub async fn stats(&self) -> Result<Vec<AuditStat>> {
        let rows = sqlx::query(
            r#"
            SELECT model, date(created_at) AS day, COUNT(*) AS cnt
            FROM audit_log GROUP BY model, day ORDER BY day DESC, model
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuditError::Storage(format!("audit stats: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| AuditStat {
                model: row.get("model"),
                day: row.get::<Option<String>, _>("day").unwrap_or_default(),
                count: row.get("cnt"),
            })
            .collect())
    }

    /// Delete entries older than the configured retention period and return
    /// the number of rows removed. `retention_days = 0` purges everything
    /// older than now.
    pub async fn cleanup(&self) -> Result<u64> {
        cleanup_older_than(&self.pool, self.cfg.retention_days).await
    }

    /// Stop the retention sweeper and close the pool.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.pool.close().await;
    }
}

async fn cleanup_older_than(pool: &SqlitePool, retention_days: i64) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);
    let result = sqlx::query("DELETE FROM audit_log WHERE created_at < ?1")
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(|e| AuditError::Storage(format!("audit cleanup: {}", e)))?;
    Ok(result.rows_affected())
}

/// Truncate a string to at most `max` bytes, backing off to the nearest
/// char boundary.
fn truncate_to(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
