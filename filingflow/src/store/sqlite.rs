//! SQLite persistence via sqlx.
//!
//! One [`SqliteSession`] owns one transaction. Stage-local undo uses a
//! named savepoint inside that transaction. Timestamps are stored as
//! RFC 3339 text with microsecond precision so that lexical order matches
//! chronological order.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DeadLetterRepository, FilingRepository, Session, SessionFactory, UnitOfWork};
use crate::config::DatabaseConfig;
use crate::core::{AnalysisStatus, Filing, FilingStatus};
use crate::dlq::{DeadLetterEntry, DeadLetterFilter, DeadLetterStatus, Payload};
use crate::errors::StoreError;

const STAGE_SAVEPOINT: &str = "filing_stage";

const DEAD_LETTER_COLUMNS: &str = "id, task_name, receipt_no, corp_code, ticker, payload, error, \
     retries, status, next_run_at, last_error_at, created_at, updated_at";

/// Pool-backed session factory.
#[derive(Debug, Clone)]
pub struct SqliteSessionFactory {
    pool: SqlitePool,
}

impl SqliteSessionFactory {
    /// Connects using the configured URL and pool size.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        info!(url = %config.url, "connected to database");
        Ok(Self { pool })
    }

    /// Opens a private in-memory database.
    ///
    /// The pool holds exactly one connection that never expires, since every
    /// SQLite in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates tables and indexes if missing. Safe to call repeatedly.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS filings (
                id TEXT PRIMARY KEY,
                corp_code TEXT,
                ticker TEXT,
                title TEXT,
                source_path TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                analysis_status TEXT NOT NULL DEFAULT 'PENDING',
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS filing_artifacts (
                filing_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (filing_id, kind)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                task_name TEXT NOT NULL,
                receipt_no TEXT,
                corp_code TEXT,
                ticker TEXT,
                payload TEXT NOT NULL,
                error TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0 CHECK (retries >= 0),
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'requeued', 'completed')),
                next_run_at TEXT,
                last_error_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dead_letters_status_created \
             ON dead_letters (status, created_at)",
        )
        .execute(&self.pool)
        .await?;

        debug!("schema ready");
        Ok(())
    }

    /// Starts a unit of work.
    pub async fn session(&self) -> Result<SqliteSession, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(SqliteSession {
            tx: Some(tx),
            in_stage: false,
        })
    }
}

#[async_trait]
impl SessionFactory for SqliteSessionFactory {
    async fn open(&self) -> Result<Box<dyn Session>, StoreError> {
        Ok(Box::new(self.session().await?))
    }
}

/// One transaction. Dropping it uncommitted rolls back.
pub struct SqliteSession {
    tx: Option<Transaction<'static, Sqlite>>,
    in_stage: bool,
}

impl std::fmt::Debug for SqliteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSession")
            .field("open", &self.tx.is_some())
            .field("in_stage", &self.in_stage)
            .finish()
    }
}

impl SqliteSession {
    fn conn(&mut self) -> Result<&mut SqliteConnection, StoreError> {
        self.tx.as_deref_mut().ok_or(StoreError::Closed)
    }

    async fn exec(&mut self, sql: &str) -> Result<(), StoreError> {
        sqlx::query(sql).execute(self.conn()?).await?;
        Ok(())
    }
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(table, format!("bad timestamp '{raw}': {e}")))
}

fn filing_from_row(row: &SqliteRow) -> Result<Filing, StoreError> {
    let status: String = row.try_get("status")?;
    let analysis: String = row.try_get("analysis_status")?;
    Ok(Filing {
        id: row.try_get("id")?,
        corp_code: row.try_get("corp_code")?,
        ticker: row.try_get("ticker")?,
        title: row.try_get("title")?,
        source_path: row.try_get("source_path")?,
        status: status
            .parse()
            .map_err(|e: String| StoreError::corrupt("filings", e))?,
        analysis_status: analysis
            .parse()
            .map_err(|e: String| StoreError::corrupt("filings", e))?,
    })
}

fn dead_letter_from_row(row: &SqliteRow) -> Result<DeadLetterEntry, StoreError> {
    const TABLE: &str = "dead_letters";
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let retries: i64 = row.try_get("retries")?;
    let status: String = row.try_get("status")?;
    let next_run_at: Option<String> = row.try_get("next_run_at")?;
    let last_error_at: String = row.try_get("last_error_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(DeadLetterEntry {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::corrupt(TABLE, e.to_string()))?,
        task_name: row.try_get("task_name")?,
        receipt_no: row.try_get("receipt_no")?,
        corp_code: row.try_get("corp_code")?,
        ticker: row.try_get("ticker")?,
        payload: serde_json::from_str::<Payload>(&payload)?,
        error: row.try_get("error")?,
        retries: u32::try_from(retries)
            .map_err(|_| StoreError::corrupt(TABLE, format!("retries out of range: {retries}")))?,
        status: status.parse().map_err(|e: String| StoreError::corrupt(TABLE, e))?,
        next_run_at: next_run_at
            .as_deref()
            .map(|raw| parse_ts(TABLE, raw))
            .transpose()?,
        last_error_at: parse_ts(TABLE, &last_error_at)?,
        created_at: parse_ts(TABLE, &created_at)?,
        updated_at: parse_ts(TABLE, &updated_at)?,
    })
}

#[async_trait]
impl UnitOfWork for SqliteSession {
    async fn begin_stage(&mut self) -> Result<(), StoreError> {
        if self.in_stage {
            self.commit_stage().await?;
        }
        self.exec(&format!("SAVEPOINT {STAGE_SAVEPOINT}")).await?;
        self.in_stage = true;
        Ok(())
    }

    async fn commit_stage(&mut self) -> Result<(), StoreError> {
        if self.in_stage {
            self.exec(&format!("RELEASE SAVEPOINT {STAGE_SAVEPOINT}")).await?;
            self.in_stage = false;
        }
        Ok(())
    }

    async fn rollback_stage(&mut self) -> Result<(), StoreError> {
        if self.in_stage {
            self.exec(&format!("ROLLBACK TO SAVEPOINT {STAGE_SAVEPOINT}"))
                .await?;
            self.exec(&format!("RELEASE SAVEPOINT {STAGE_SAVEPOINT}")).await?;
            self.in_stage = false;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Closed)?;
        self.in_stage = false;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Closed)?;
        self.in_stage = false;
        tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl FilingRepository for SqliteSession {
    async fn load_filing(&mut self, id: &str) -> Result<Option<Filing>, StoreError> {
        let row = sqlx::query(
            "SELECT id, corp_code, ticker, title, source_path, status, analysis_status \
             FROM filings WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        row.as_ref().map(filing_from_row).transpose()
    }

    async fn upsert_filing(&mut self, filing: &Filing) -> Result<bool, StoreError> {
        let exists = sqlx::query("SELECT 1 FROM filings WHERE id = ?")
            .bind(&filing.id)
            .fetch_optional(self.conn()?)
            .await?
            .is_some();

        sqlx::query(
            r"
            INSERT INTO filings (id, corp_code, ticker, title, source_path, status, analysis_status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                corp_code = excluded.corp_code,
                ticker = excluded.ticker,
                title = excluded.title,
                source_path = excluded.source_path,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&filing.id)
        .bind(&filing.corp_code)
        .bind(&filing.ticker)
        .bind(&filing.title)
        .bind(&filing.source_path)
        .bind(filing.status.as_str())
        .bind(filing.analysis_status.as_str())
        .bind(ts(Utc::now()))
        .execute(self.conn()?)
        .await?;

        Ok(!exists)
    }

    async fn save_artifact(
        &mut self,
        filing_id: &str,
        kind: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_string(value)?;
        sqlx::query(
            r"
            INSERT INTO filing_artifacts (filing_id, kind, body, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(filing_id, kind) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            ",
        )
        .bind(filing_id)
        .bind(kind)
        .bind(body)
        .bind(ts(Utc::now()))
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn load_artifact(
        &mut self,
        filing_id: &str,
        kind: &str,
    ) -> Result<Option<Value>, StoreError> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM filing_artifacts WHERE filing_id = ? AND kind = ?")
                .bind(filing_id)
                .bind(kind)
                .fetch_optional(self.conn()?)
                .await?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    async fn set_filing_status(
        &mut self,
        filing_id: &str,
        status: FilingStatus,
        analysis: AnalysisStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE filings SET status = ?, analysis_status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(analysis.as_str())
        .bind(ts(Utc::now()))
        .bind(filing_id)
        .execute(self.conn()?)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("filing {filing_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl DeadLetterRepository for SqliteSession {
    async fn insert_dead_letter(&mut self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&entry.payload)?;
        sqlx::query(&format!(
            "INSERT INTO dead_letters ({DEAD_LETTER_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(entry.id.to_string())
        .bind(&entry.task_name)
        .bind(&entry.receipt_no)
        .bind(&entry.corp_code)
        .bind(&entry.ticker)
        .bind(payload)
        .bind(&entry.error)
        .bind(i64::from(entry.retries))
        .bind(entry.status.as_str())
        .bind(entry.next_run_at.map(ts))
        .bind(ts(entry.last_error_at))
        .bind(ts(entry.created_at))
        .bind(ts(entry.updated_at))
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn fetch_dead_letters(
        &mut self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE 1 = 1"
        ));
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(task_name) = &filter.task_name {
            query.push(" AND task_name = ").push_bind(task_name.clone());
        }
        if let Some(at) = filter.due_by {
            query
                .push(" AND next_run_at IS NOT NULL AND next_run_at <= ")
                .push_bind(ts(at));
        }
        query
            .push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
            .push_bind(i64::try_from(filter.limit).unwrap_or(i64::MAX));

        let rows = query.build().fetch_all(self.conn()?).await?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn fetch_dead_letter(&mut self, id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.conn()?)
        .await?;
        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn update_dead_letter(&mut self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE dead_letters SET status = ?, next_run_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(entry.status.as_str())
        .bind(entry.next_run_at.map(ts))
        .bind(ts(entry.updated_at))
        .bind(entry.id.to_string())
        .execute(self.conn()?)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("dead letter {}", entry.id)));
        }
        Ok(())
    }

    async fn count_dead_letters(&mut self) -> Result<BTreeMap<DeadLetterStatus, u64>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM dead_letters GROUP BY status")
            .fetch_all(self.conn()?)
            .await?;
        let mut counts = BTreeMap::new();
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let status: DeadLetterStatus = status
                .parse()
                .map_err(|e: String| StoreError::corrupt("dead_letters", e))?;
            counts.insert(status, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}
