//! Embedded persistence for claims and classifier error history.
//!
//! Follows the donor's `tokio_rusqlite`-backed cache: WAL pragmas for
//! throughput, enum/JSON serialized columns, schema created on open. All
//! calls route through a single `tokio_rusqlite::Connection` background
//! thread, which gives the claim operations (`acquire`/`renew`/read-holder)
//! the strict-serializability the spec requires for free.

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{Claim, ErrorRecord, Task, TaskStatus, ERROR_RECORD_MAX_ENTRIES};

pub struct Db {
    conn: Connection,
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Db {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    pub async fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<(), DbError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS claims (
                        task_id           TEXT PRIMARY KEY,
                        holder_id         TEXT NOT NULL,
                        acquired_at       TEXT NOT NULL,
                        ttl_minutes       INTEGER NOT NULL,
                        renew_interval_ms INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS error_records (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        task_id    TEXT NOT NULL,
                        pattern    TEXT NOT NULL,
                        timestamp  TEXT NOT NULL,
                        action     TEXT NOT NULL,
                        confidence REAL NOT NULL,
                        details    TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_error_records_task ON error_records(task_id);

                    CREATE TABLE IF NOT EXISTS tasks (
                        task_id        TEXT PRIMARY KEY,
                        title          TEXT NOT NULL,
                        description    TEXT NOT NULL,
                        status         TEXT NOT NULL,
                        tags           TEXT NOT NULL,
                        branch_name    TEXT,
                        base_branch    TEXT,
                        creator_login  TEXT,
                        pr_number      INTEGER,
                        pr_url         TEXT,
                        priority       INTEGER NOT NULL,
                        created_at     TEXT NOT NULL,
                        updated_at     TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Attempt to claim `task_id` for `holder_id`. Returns the existing
    /// holder if the task is already claimed by someone else and the
    /// existing claim has not expired; otherwise installs the new claim and
    /// returns `None`.
    pub async fn claim_acquire(
        &self,
        task_id: &str,
        holder_id: Uuid,
        ttl_minutes: i64,
        renew_interval_ms: u64,
    ) -> Result<Option<Uuid>, DbError> {
        let task_id = task_id.to_string();
        let now = Utc::now();
        self.conn
            .call(move |conn| {
                let existing: Option<(String, String, i64)> = conn
                    .query_row(
                        "SELECT holder_id, acquired_at, ttl_minutes FROM claims WHERE task_id = ?1",
                        [&task_id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .ok();

                if let Some((holder, acquired_at, ttl)) = existing {
                    let acquired_at: DateTime<Utc> = acquired_at.parse().unwrap_or(now);
                    let expired = now.signed_duration_since(acquired_at) > chrono::Duration::minutes(ttl);
                    let existing_holder: Uuid = holder.parse().unwrap_or(holder_id);
                    if !expired && existing_holder != holder_id {
                        return Ok(Some(existing_holder));
                    }
                }

                conn.execute(
                    "INSERT INTO claims (task_id, holder_id, acquired_at, ttl_minutes, renew_interval_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(task_id) DO UPDATE SET
                        holder_id = excluded.holder_id,
                        acquired_at = excluded.acquired_at,
                        ttl_minutes = excluded.ttl_minutes,
                        renew_interval_ms = excluded.renew_interval_ms",
                    rusqlite::params![
                        task_id,
                        holder_id.to_string(),
                        now.to_rfc3339(),
                        ttl_minutes,
                        renew_interval_ms as i64
                    ],
                )?;
                Ok(None)
            })
            .await
            .map_err(DbError::from)
    }

    /// Renew a claim; returns `Err` (as the stolen holder) if the current
    /// holder differs from `holder_id`.
    pub async fn claim_renew(&self, task_id: &str, holder_id: Uuid) -> Result<Result<(), Uuid>, DbError> {
        let task_id = task_id.to_string();
        let now = Utc::now();
        self.conn
            .call(move |conn| {
                let current: Option<String> = conn
                    .query_row(
                        "SELECT holder_id FROM claims WHERE task_id = ?1",
                        [&task_id],
                        |row| row.get(0),
                    )
                    .ok();
                match current {
                    Some(h) if h == holder_id.to_string() => {
                        conn.execute(
                            "UPDATE claims SET acquired_at = ?1 WHERE task_id = ?2",
                            rusqlite::params![now.to_rfc3339(), task_id],
                        )?;
                        Ok(Ok(()))
                    }
                    Some(h) => Ok(Err(h.parse().unwrap_or(holder_id))),
                    None => Ok(Err(holder_id)),
                }
            })
            .await
            .map_err(DbError::from)
    }

    pub async fn claim_release(&self, task_id: &str, holder_id: Uuid) -> Result<(), DbError> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM claims WHERE task_id = ?1 AND holder_id = ?2",
                    rusqlite::params![task_id, holder_id.to_string()],
                )?;
                Ok(())
            })
            .await
            .map_err(DbError::from)
    }

    pub async fn claim_read(&self, task_id: &str) -> Result<Option<Claim>, DbError> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| {
                let row: Option<(String, String, i64, i64)> = conn
                    .query_row(
                        "SELECT holder_id, acquired_at, ttl_minutes, renew_interval_ms FROM claims WHERE task_id = ?1",
                        [&task_id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .ok();
                Ok(row.map(|(holder, acquired_at, ttl, renew)| Claim {
                    task_id: task_id.clone(),
                    holder_id: holder.parse().unwrap_or_default(),
                    acquired_at: acquired_at.parse().unwrap_or_else(|_| Utc::now()),
                    ttl_minutes: ttl,
                    renew_interval_ms: renew as u64,
                }))
            })
            .await
            .map_err(DbError::from)
    }

    /// Lists every currently held claim, for operator inspection.
    pub async fn claims_all(&self) -> Result<Vec<Claim>, DbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id, holder_id, acquired_at, ttl_minutes, renew_interval_ms FROM claims",
                )?;
                let rows = stmt.query_map([], |row| {
                    let task_id: String = row.get(0)?;
                    let holder_id: String = row.get(1)?;
                    let acquired_at: String = row.get(2)?;
                    let ttl_minutes: i64 = row.get(3)?;
                    let renew_interval_ms: i64 = row.get(4)?;
                    Ok(Claim {
                        task_id,
                        holder_id: holder_id.parse().unwrap_or_default(),
                        acquired_at: acquired_at.parse().unwrap_or_else(|_| Utc::now()),
                        ttl_minutes,
                        renew_interval_ms: renew_interval_ms as u64,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
            })
            .await
            .map_err(DbError::from)
    }

    /// Append an error record, trimming to `ERROR_RECORD_MAX_ENTRIES` per task.
    pub async fn error_record_append(&self, task_id: &str, record: ErrorRecord) -> Result<(), DbError> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO error_records (task_id, pattern, timestamp, action, confidence, details)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        task_id,
                        record.pattern,
                        record.timestamp.to_rfc3339(),
                        record.action,
                        record.confidence,
                        record.details
                    ],
                )?;
                conn.execute(
                    "DELETE FROM error_records WHERE task_id = ?1 AND id NOT IN (
                        SELECT id FROM error_records WHERE task_id = ?1 ORDER BY id DESC LIMIT ?2
                    )",
                    rusqlite::params![task_id, ERROR_RECORD_MAX_ENTRIES as i64],
                )?;
                Ok(())
            })
            .await
            .map_err(DbError::from)
    }

    pub async fn error_records_for_task(&self, task_id: &str) -> Result<Vec<ErrorRecord>, DbError> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT pattern, timestamp, action, confidence, details FROM error_records
                     WHERE task_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map([&task_id], |row| {
                        let timestamp: String = row.get(1)?;
                        Ok(ErrorRecord {
                            pattern: row.get(0)?,
                            timestamp: timestamp.parse().unwrap_or_else(|_| Utc::now()),
                            action: row.get(2)?,
                            confidence: row.get(3)?,
                            details: row.get(4)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(DbError::from)
    }

    pub async fn error_record_clear(&self, task_id: &str) -> Result<(), DbError> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM error_records WHERE task_id = ?1", [&task_id])?;
                Ok(())
            })
            .await
            .map_err(DbError::from)
    }

    /// Upsert a task row. Used by the local/offline kanban backend, which has
    /// no external system of record.
    pub async fn task_upsert(&self, task: Task) -> Result<(), DbError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (task_id, title, description, status, tags, branch_name,
                        base_branch, creator_login, pr_number, pr_url, priority, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(task_id) DO UPDATE SET
                        title = excluded.title,
                        description = excluded.description,
                        status = excluded.status,
                        tags = excluded.tags,
                        branch_name = excluded.branch_name,
                        base_branch = excluded.base_branch,
                        creator_login = excluded.creator_login,
                        pr_number = excluded.pr_number,
                        pr_url = excluded.pr_url,
                        priority = excluded.priority,
                        updated_at = excluded.updated_at",
                    rusqlite::params![
                        task.task_id,
                        task.title,
                        task.description,
                        task.status.to_string(),
                        serde_json::to_string(&task.tags).unwrap_or_default(),
                        task.branch_name,
                        task.base_branch,
                        task.creator_login,
                        task.pr_number.map(|n| n as i64),
                        task.pr_url,
                        task.priority,
                        task.created_at.to_rfc3339(),
                        task.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(DbError::from)
    }

    pub async fn task_set_status(&self, task_id: &str, status: TaskStatus) -> Result<(), DbError> {
        let task_id = task_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE task_id = ?3",
                    rusqlite::params![status.to_string(), now, task_id],
                )?;
                Ok(())
            })
            .await
            .map_err(DbError::from)
    }

    pub async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DbError> {
        let status = status.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id, title, description, status, tags, branch_name, base_branch,
                        creator_login, pr_number, pr_url, priority, created_at, updated_at
                     FROM tasks WHERE status = ?1 ORDER BY priority DESC, created_at ASC",
                )?;
                let rows = stmt
                    .query_map([&status], Self::row_to_task)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(DbError::from)
    }

    pub async fn task_read(&self, task_id: &str) -> Result<Option<Task>, DbError> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| {
                let task = conn
                    .query_row(
                        "SELECT task_id, title, description, status, tags, branch_name, base_branch,
                            creator_login, pr_number, pr_url, priority, created_at, updated_at
                         FROM tasks WHERE task_id = ?1",
                        [&task_id],
                        Self::row_to_task,
                    )
                    .ok();
                Ok(task)
            })
            .await
            .map_err(DbError::from)
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        let status_str: String = row.get(3)?;
        let tags_str: String = row.get(4)?;
        let created_at: String = row.get(11)?;
        let updated_at: String = row.get(12)?;
        let pr_number: Option<i64> = row.get(8)?;
        Ok(Task {
            task_id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            status: parse_task_status(&status_str),
            tags: serde_json::from_str(&tags_str).unwrap_or_default(),
            branch_name: row.get(5)?,
            base_branch: row.get(6)?,
            creator_login: row.get(7)?,
            pr_number: pr_number.map(|n| n as u64),
            pr_url: row.get(9)?,
            priority: row.get(10)?,
            created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
            updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
        })
    }
}

fn parse_task_status(s: &str) -> TaskStatus {
    match s {
        "backlog" => TaskStatus::Backlog,
        "todo" => TaskStatus::Todo,
        "inprogress" => TaskStatus::Inprogress,
        "inreview" => TaskStatus::Inreview,
        "done" => TaskStatus::Done,
        "cancelled" => TaskStatus::Cancelled,
        "blocked" => TaskStatus::Blocked,
        _ => TaskStatus::Backlog,
    }
}
