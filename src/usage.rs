//! Usage store
//!
//! Append-only record of every completed request plus the session table,
//! backed by a dedicated SQLite database. Queries here feed budget
//! enforcement, summaries, and cost reports.

use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::str::FromStr;
use thiserror::Error;

use crate::models::{CostReport, Session, SessionRequest, UsageRecord, UsageSummary};

#[derive(Error, Debug)]
pub enum UsageError {
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, UsageError>;

const CREATE_USAGE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS usage_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    api_key TEXT NOT NULL,
    model TEXT NOT NULL,
    session_id TEXT NOT NULL DEFAULT '',
    prompt_tokens INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    total_tokens INTEGER NOT NULL,
    team TEXT NOT NULL DEFAULT '',
    project TEXT NOT NULL DEFAULT '',
    env TEXT NOT NULL DEFAULT '',
    created_at DATETIME NOT NULL
)
"#;

const CREATE_USAGE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_usage_key_time ON usage_records(api_key, created_at)";

const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    api_key TEXT NOT NULL,
    started_at DATETIME NOT NULL,
    last_activity DATETIME NOT NULL,
    request_count INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0
)
"#;

const CREATE_SESSIONS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_sessions_key ON sessions(api_key)";

/// SQLite-backed usage store.
#[derive(Clone)]
pub struct UsageStore {
    pool: SqlitePool,
}

impl UsageStore {
    /// Open (or create) the usage database and run migrations.
    /// URL format: `sqlite:path/to/db.db` or `sqlite::memory:`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| UsageError::Storage(format!("invalid database URL: {}", e)))?
            .create_if_missing(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| UsageError::Storage(format!("connect usage db: {}", e)))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in [
            CREATE_USAGE_TABLE,
            CREATE_USAGE_INDEX,
            CREATE_SESSIONS_TABLE,
            CREATE_SESSIONS_INDEX,
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| UsageError::Storage(format!("migrate usage db: {}", e)))?;
        }
        Ok(())
    }

    /// Store a usage record and bump the session counters when the record
    /// carries a session id.
    pub async fn record(&self, rec: &UsageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_records
                (api_key, model, session_id, prompt_tokens, completion_tokens,
                 total_tokens, team, project, env, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&rec.api_key)
        .bind(&rec.model)
        .bind(&rec.session_id)
        .bind(rec.prompt_tokens)
        .bind(rec.completion_tokens)
        .bind(rec.total_tokens)
        .bind(&rec.team)
        .bind(&rec.project)
        .bind(&rec.env)
        .bind(rec.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| UsageError::Storage(format!("record usage: {}", e)))?;

        if !rec.session_id.is_empty() {
            sqlx::query(
                r#"
                UPDATE sessions
                SET last_activity = ?1,
                    request_count = request_count + 1,
                    total_tokens = total_tokens + ?2
                WHERE id = ?3
                "#,
            )
            .bind(rec.created_at)
            .bind(rec.total_tokens)
            .bind(&rec.session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| UsageError::Storage(format!("update session counters: {}", e)))?;
        }

        Ok(())
    }

    /// Resolve a session id for an API key.
    ///
    /// A non-empty explicit id is upserted (existing `started_at` and
    /// counters are untouched) and returned. Otherwise the most recent
    /// session for the key is reused when its last activity is within
    /// `gap_timeout`, or a fresh `sess_<date>_<hex>` id is created.
    pub async fn resolve_session(
        &self,
        api_key: &str,
        explicit_id: &str,
        gap_timeout: chrono::Duration,
    ) -> Result<String> {
        let now = Utc::now();

        if !explicit_id.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO sessions (id, api_key, started_at, last_activity)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(explicit_id)
            .bind(api_key)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| UsageError::Storage(format!("ensure session: {}", e)))?;
            return Ok(explicit_id.to_string());
        }

        let latest = sqlx::query(
            r#"
            SELECT id, last_activity FROM sessions
            WHERE api_key = ?1 ORDER BY last_activity DESC LIMIT 1
            "#,
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| UsageError::Storage(format!("find session: {}", e)))?;

        if let Some(row) = latest {
            let last_activity: DateTime<Utc> = row.get("last_activity");
            if now - last_activity <= gap_timeout {
                return Ok(row.get("id"));
            }
        }

        let new_id = generate_session_id();
        sqlx::query(
            "INSERT INTO sessions (id, api_key, started_at, last_activity) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&new_id)
        .bind(api_key)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| UsageError::Storage(format!("create session: {}", e)))?;

        Ok(new_id)
    }

    /// List sessions, newest first, optionally filtered by API key.
    pub async fn list_sessions(&self, api_key: Option<&str>) -> Result<Vec<Session>> {
        let mut query = String::from(
            "SELECT id, api_key, started_at, last_activity, request_count, total_tokens FROM sessions",
        );
        if api_key.is_some() {
            query.push_str(" WHERE api_key = ?1");
        }
        query.push_str(" ORDER BY started_at DESC");

        let mut sql_query = sqlx::query(&query);
        if let Some(key) = api_key {
            sql_query = sql_query.bind(key);
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| UsageError::Storage(format!("list sessions: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| Session {
                id: row.get("id"),
                api_key: row.get("api_key"),
                started_at: row.get("started_at"),
                last_activity: row.get("last_activity"),
                request_count: row.get("request_count"),
                total_tokens: row.get("total_tokens"),
            })
            .collect())
    }

    /// Per-request detail for a session with context growth, ordered by
    /// creation time ascending.
    pub async fn session_requests(&self, session_id: &str) -> Result<Vec<SessionRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT created_at, prompt_tokens, completion_tokens, total_tokens
            FROM usage_records WHERE session_id = ?1 ORDER BY created_at ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| UsageError::Storage(format!("session requests: {}", e)))?;

        let mut requests = Vec::with_capacity(rows.len());
        let mut prev_prompt = 0i64;
        for (idx, row) in rows.into_iter().enumerate() {
            let prompt_tokens: i64 = row.get("prompt_tokens");
            let seq = idx as i64 + 1;
            requests.push(SessionRequest {
                seq,
                created_at: row.get("created_at"),
                prompt_tokens,
                completion_tokens: row.get("completion_tokens"),
                total_tokens: row.get("total_tokens"),
                context_growth: if seq > 1 { prompt_tokens - prev_prompt } else { 0 },
            });
            prev_prompt = prompt_tokens;
        }
        Ok(requests)
    }

    /// Usage records for an API key since a given time, newest first.
    pub async fn query_by_key(
        &self,
        api_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, api_key, model, session_id, prompt_tokens, completion_tokens,
                   total_tokens, team, project, env, created_at
            FROM usage_records
            WHERE api_key = ?1 AND created_at >= ?2
            ORDER BY created_at DESC
            "#,
        )
        .bind(api_key)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| UsageError::Storage(format!("query usage: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| UsageRecord {
                id: row.get("id"),
                api_key: row.get("api_key"),
                model: row.get("model"),
                session_id: row.get("session_id"),
                prompt_tokens: row.get("prompt_tokens"),
                completion_tokens: row.get("completion_tokens"),
                total_tokens: row.get("total_tokens"),
                team: row.get("team"),
                project: row.get("project"),
                env: row.get("env"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Total tokens used by an API key since a given time.
    pub async fn total_by_key(&self, api_key: &str, since: DateTime<Utc>) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(total_tokens), 0) FROM usage_records WHERE api_key = ?1 AND created_at >= ?2",
        )
        .bind(api_key)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| UsageError::Storage(format!("total usage: {}", e)))
    }

    /// Total tokens used by an API key for a specific model since a given time.
    pub async fn total_by_key_and_model(
        &self,
        api_key: &str,
        model: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(total_tokens), 0) FROM usage_records
            WHERE api_key = ?1 AND model = ?2 AND created_at >= ?3
            "#,
        )
        .bind(api_key)
        .bind(model)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| UsageError::Storage(format!("total usage by model: {}", e)))
    }

    /// Aggregated usage grouped by API key and model.
    pub async fn summary(&self, api_key: Option<&str>) -> Result<Vec<UsageSummary>> {
        let mut query = String::from(
            r#"
            SELECT api_key, model, COUNT(*) AS request_count,
                   SUM(prompt_tokens) AS total_prompt,
                   SUM(completion_tokens) AS total_completion,
                   SUM(total_tokens) AS total_tokens
            FROM usage_records
            "#,
        );
        if api_key.is_some() {
            query.push_str(" WHERE api_key = ?1");
        }
        query.push_str(" GROUP BY api_key, model ORDER BY api_key, model");

        let mut sql_query = sqlx::query(&query);
        if let Some(key) = api_key {
            sql_query = sql_query.bind(key);
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| UsageError::Storage(format!("summary: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| UsageSummary {
                api_key: row.get("api_key"),
                model: row.get("model"),
                request_count: row.get("request_count"),
                total_prompt: row.get("total_prompt"),
                total_completion: row.get("total_completion"),
                total_tokens: row.get("total_tokens"),
            })
            .collect())
    }

    /// Aggregated usage grouped by (team, project, model) for cost
    /// attribution. Costs themselves are applied by the caller from the
    /// configured pricing table.
    pub async fn cost_report(
        &self,
        since: DateTime<Utc>,
        team: Option<&str>,
        project: Option<&str>,
    ) -> Result<Vec<CostReport>> {
        let mut query = String::from(
            r#"
            SELECT team, project, model, COUNT(*) AS request_count,
                   SUM(prompt_tokens) AS prompt_tokens,
                   SUM(completion_tokens) AS completion_tokens,
                   SUM(total_tokens) AS total_tokens
            FROM usage_records WHERE created_at >= ?1
            "#,
        );
        let mut bind_count = 1;
        if team.is_some() {
            bind_count += 1;
            query.push_str(&format!(" AND team = ?{}", bind_count));
        }
        if project.is_some() {
            bind_count += 1;
            query.push_str(&format!(" AND project = ?{}", bind_count));
        }
        query.push_str(" GROUP BY team, project, model ORDER BY team, project, model");

        let mut sql_query = sqlx::query(&query).bind(since);
        if let Some(team) = team {
            sql_query = sql_query.bind(team);
        }
        if let Some(project) = project {
            sql_query = sql_query.bind(project);
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| UsageError::Storage(format!("cost report: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| CostReport {
                team: row.get("team"),
                project: row.get("project"),
                model: row.get("model"),
                request_count: row.get("request_count"),
                prompt_tokens: row.get("prompt_tokens"),
                completion_tokens: row.get("completion_tokens"),
                total_tokens: row.get("total_tokens"),
                estimated_cost: 0.0,
            })
            .collect())
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Create a session id like `sess_20260802_a3f9c2` (UTC day + 6 hex chars).
fn generate_session_id() -> String {
    let mut suffix = [0u8; 3];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!(
        "sess_{}_{}",
        Utc::now().format("%Y%m%d"),
        hex::encode(suffix)
    )
}
