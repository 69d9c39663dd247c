//! SQLite store for the ferry job queue.
//!
//! Jobs live in one table with a row per job, keyed by `(queue, id)`. The
//! state list a job belongs to is its `state` column, ordered by `order_key`
//! (and by `run_at` for delayed jobs). A second table holds the per-queue id
//! sequence, the paused flag and the halt reason.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ferry_core::{EventBus, Queue, QueueConfig};
//! use ferry_sqlite::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> ferry_core::Result<()> {
//!     let store = SqliteStore::new("sqlite:jobs.db", "myapp").await?;
//!     let queue = Queue::with_store(QueueConfig::new("mail"), store, EventBus::new());
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use ferry_core::{
    FerryError, InsertOutcome, Job, JobCounts, JobId, JobOptions, JobState, LeaseRequest,
    Released, Result, Retention, Store, Transition,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

const JOB_COLUMNS: &str = "queue, id, name, data, opts, state, order_key, attempts_made, \
    attempts_started, stalled_count, progress, return_value, last_error, created_at, \
    processed_at, finished_at, run_at, expires_at, lock_token, locked_by, lock_until";

/// Map a sqlx error, keeping an unreachable database apart from a failed query.
fn db_err(action: &'static str) -> impl Fn(sqlx::Error) -> FerryError {
    move |e| match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            FerryError::Connection(format!("Failed to {}: {}", action, e))
        }
        e => FerryError::Store(format!("Failed to {}: {}", action, e)),
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// SQLite store for job queue storage.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    jobs_table: String,
    queues_table: String,
}

impl SqliteStore {
    /// Create a new SQLite store, creating the database file and tables if needed.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite` or `sqlite::memory:`.
    /// `namespace` prefixes the table names and must be alphanumeric or `_`.
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        if namespace.is_empty()
            || !namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(FerryError::Config(format!(
                "invalid namespace {:?}: use letters, digits and underscores",
                namespace
            )));
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| FerryError::Config(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection: every operation is serialized, and an in-memory
        // database lives exactly as long as that connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| FerryError::Connection(format!("Failed to connect to SQLite: {}", e)))?;

        let store = Self {
            pool,
            jobs_table: format!("{}_jobs", namespace),
            queues_table: format!("{}_queues", namespace),
        };

        store.init_tables().await?;
        tracing::debug!(namespace = %namespace, "SQLite store ready");

        Ok(store)
    }

    /// Create an in-memory SQLite store (useful for testing).
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        Self::new("sqlite::memory:", namespace).await
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                queue TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                opts TEXT NOT NULL,
                state TEXT NOT NULL,
                order_key INTEGER NOT NULL,
                attempts_made INTEGER NOT NULL DEFAULT 0,
                attempts_started INTEGER NOT NULL DEFAULT 0,
                stalled_count INTEGER NOT NULL DEFAULT 0,
                progress TEXT NOT NULL DEFAULT 'null',
                return_value TEXT,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                processed_at INTEGER,
                finished_at INTEGER,
                run_at INTEGER,
                expires_at INTEGER,
                lock_token TEXT,
                locked_by TEXT,
                lock_until INTEGER,
                PRIMARY KEY (queue, id)
            )
            "#,
            self.jobs_table
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err("create jobs table"))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_state ON {0} (queue, state, order_key)",
            self.jobs_table
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err("create state index"))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_run_at ON {0} (queue, state, run_at)",
            self.jobs_table
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err("create run_at index"))?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                name TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL DEFAULT 0,
                order_seq INTEGER NOT NULL DEFAULT 0,
                paused INTEGER NOT NULL DEFAULT 0,
                halted TEXT
            )
            "#,
            self.queues_table
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err("create queues table"))?;

        Ok(())
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>> {
        self.pool.begin().await.map_err(db_err("begin transaction"))
    }

    /// Register the queue if needed and refuse to touch a halted one.
    async fn enter(&self, conn: &mut SqliteConnection, queue: &str) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (name) VALUES (?)",
            self.queues_table
        ))
        .bind(queue)
        .execute(&mut *conn)
        .await
        .map_err(db_err("register queue"))?;

        self.check_halted(conn, queue).await
    }

    async fn check_halted(&self, conn: &mut SqliteConnection, queue: &str) -> Result<()> {
        let halted: Option<Option<String>> = sqlx::query_scalar(&format!(
            "SELECT halted FROM {} WHERE name = ?",
            self.queues_table
        ))
        .bind(queue)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("read queue"))?;

        match halted.flatten() {
            Some(reason) => Err(FerryError::Corrupted(format!("{}: {}", queue, reason))),
            None => Ok(()),
        }
    }

    /// Next position in the queue's lists.
    async fn next_order(&self, conn: &mut SqliteConnection, queue: &str) -> Result<i64> {
        sqlx::query_scalar(&format!(
            "UPDATE {} SET order_seq = order_seq + 1 WHERE name = ? RETURNING order_seq",
            self.queues_table
        ))
        .bind(queue)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err("advance order sequence"))
    }

    async fn load(&self, conn: &mut SqliteConnection, queue: &str, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE queue = ? AND id = ?",
            JOB_COLUMNS, self.jobs_table
        ))
        .bind(queue)
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("load job"))?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Insert or overwrite the full job row.
    async fn save(&self, conn: &mut SqliteConnection, job: &Job, order_key: i64) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} ({}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.jobs_table, JOB_COLUMNS
        ))
        .bind(&job.queue)
        .bind(job.id.as_str())
        .bind(&job.name)
        .bind(serde_json::to_string(&job.data)?)
        .bind(serde_json::to_string(&job.opts)?)
        .bind(job.state.as_str())
        .bind(order_key)
        .bind(i64::from(job.attempts_made))
        .bind(i64::from(job.attempts_started))
        .bind(i64::from(job.stalled_count))
        .bind(serde_json::to_string(&job.progress)?)
        .bind(job.return_value.as_ref().map(serde_json::to_string).transpose()?)
        .bind(job.last_error.as_deref())
        .bind(job.created_at)
        .bind(job.processed_at)
        .bind(job.finished_at)
        .bind(job.run_at)
        .bind(job.expires_at)
        .bind(job.lock_token.as_deref())
        .bind(job.locked_by.as_deref())
        .bind(job.lock_until)
        .execute(&mut *conn)
        .await
        .map_err(db_err("save job"))?;
        Ok(())
    }

    async fn delete_ids(&self, conn: &mut SqliteConnection, queue: &str, ids: &[JobId]) -> Result<()> {
        for id in ids {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE queue = ? AND id = ?",
                self.jobs_table
            ))
            .bind(queue)
            .bind(id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(db_err("delete job"))?;
        }
        Ok(())
    }

    async fn select_ids(
        &self,
        conn: &mut SqliteConnection,
        sql: &str,
        queue: &str,
        bound: Option<i64>,
        limit: i64,
    ) -> Result<Vec<JobId>> {
        let mut query = sqlx::query_scalar::<_, String>(sql).bind(queue);
        if let Some(value) = bound {
            query = query.bind(value);
        }
        let ids = query
            .bind(limit)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err("select jobs"))?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    /// Move an active job according to `transition`, applying retention when it finishes.
    async fn transition(
        &self,
        conn: &mut SqliteConnection,
        mut job: Job,
        transition: Transition,
        now: i64,
    ) -> Result<Released> {
        transition.apply_to(&mut job, now);
        let queue = job.queue.clone();
        let order = self.next_order(conn, &queue).await?;

        match job.state {
            JobState::Waiting => {
                // Head of the line.
                self.save(conn, &job, -order).await?;
                Ok(Released {
                    job,
                    removed: Vec::new(),
                })
            }
            JobState::Delayed | JobState::Active => {
                self.save(conn, &job, order).await?;
                Ok(Released {
                    job,
                    removed: Vec::new(),
                })
            }
            JobState::Completed | JobState::Failed => {
                let retention = job.opts.retention_for(job.state);
                if retention == Retention::Remove {
                    self.delete_ids(conn, &queue, std::slice::from_ref(&job.id))
                        .await?;
                    return Ok(Released {
                        removed: vec![job.id.clone()],
                        job,
                    });
                }

                job.expires_at = retention.expires_at(now);
                self.save(conn, &job, order).await?;

                let mut removed = Vec::new();
                if let Some(keep) = retention.keep_last() {
                    let keep = i64::try_from(keep).unwrap_or(i64::MAX);
                    let trimmed: Vec<String> = sqlx::query_scalar(&format!(
                        "SELECT id FROM {} WHERE queue = ? AND state = ? \
                         ORDER BY order_key DESC LIMIT -1 OFFSET ?",
                        self.jobs_table
                    ))
                    .bind(&queue)
                    .bind(job.state.as_str())
                    .bind(keep)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(db_err("select trimmed jobs"))?;
                    removed = trimmed.into_iter().map(JobId::from).collect();
                    self.delete_ids(conn, &queue, &removed).await?;
                }

                Ok(Released { job, removed })
            }
        }
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let get_err = |e: sqlx::Error| FerryError::Store(format!("Failed to decode job row: {}", e));
    let count = |column: &str| -> Result<u32> {
        let value: i64 = row.try_get(column).map_err(get_err)?;
        u32::try_from(value).map_err(|_| FerryError::Store(format!("{} out of range", column)))
    };

    let data: String = row.try_get("data").map_err(get_err)?;
    let opts: String = row.try_get("opts").map_err(get_err)?;
    let state: String = row.try_get("state").map_err(get_err)?;
    let progress: String = row.try_get("progress").map_err(get_err)?;
    let return_value: Option<String> = row.try_get("return_value").map_err(get_err)?;
    let id: String = row.try_get("id").map_err(get_err)?;

    Ok(Job {
        id: JobId::from(id),
        queue: row.try_get("queue").map_err(get_err)?,
        name: row.try_get("name").map_err(get_err)?,
        data: serde_json::from_str(&data)?,
        opts: serde_json::from_str::<JobOptions>(&opts)?,
        state: state.parse()?,
        attempts_made: count("attempts_made")?,
        attempts_started: count("attempts_started")?,
        stalled_count: count("stalled_count")?,
        progress: serde_json::from_str(&progress)?,
        return_value: return_value.as_deref().map(serde_json::from_str).transpose()?,
        last_error: row.try_get("last_error").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        processed_at: row.try_get("processed_at").map_err(get_err)?,
        finished_at: row.try_get("finished_at").map_err(get_err)?,
        run_at: row.try_get("run_at").map_err(get_err)?,
        expires_at: row.try_get("expires_at").map_err(get_err)?,
        lock_token: row.try_get("lock_token").map_err(get_err)?,
        locked_by: row.try_get("locked_by").map_err(get_err)?,
        lock_until: row.try_get("lock_until").map_err(get_err)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| FerryError::Connection(format!("SQLite ping failed: {}", e)))?;
        Ok(())
    }

    async fn next_job_id(&self, queue: &str) -> Result<u64> {
        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;
        let sequence: i64 = sqlx::query_scalar(&format!(
            "UPDATE {} SET sequence = sequence + 1 WHERE name = ? RETURNING sequence",
            self.queues_table
        ))
        .bind(queue)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("advance id sequence"))?;
        tx.commit().await.map_err(db_err("commit"))?;

        u64::try_from(sequence)
            .map_err(|_| FerryError::Corrupted(format!("{}: negative id sequence", queue)))
    }

    async fn insert_job(&self, job: &Job) -> Result<InsertOutcome> {
        if !matches!(job.state, JobState::Waiting | JobState::Delayed) {
            return Err(FerryError::Store(format!(
                "cannot insert job {} in state {}",
                job.id, job.state
            )));
        }

        let mut tx = self.begin().await?;
        self.enter(&mut tx, &job.queue).await?;
        if let Some(existing) = self.load(&mut tx, &job.queue, &job.id).await? {
            return Ok(InsertOutcome::Duplicate(existing));
        }
        let order = self.next_order(&mut tx, &job.queue).await?;
        self.save(&mut tx, job, order).await?;
        tx.commit().await.map_err(db_err("commit"))?;

        tracing::trace!(queue = %job.queue, job_id = %job.id, "Job inserted");
        Ok(InsertOutcome::Inserted(job.clone()))
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire connection"))?;
        self.check_halted(&mut conn, queue).await?;
        self.load(&mut conn, queue, id).await
    }

    async fn remove_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>> {
        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;
        let Some(job) = self.load(&mut tx, queue, id).await? else {
            return Ok(None);
        };
        if job.state == JobState::Active {
            return Err(FerryError::JobLocked(id.to_string()));
        }
        self.delete_ids(&mut tx, queue, std::slice::from_ref(id)).await?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(Some(job))
    }

    async fn claim(&self, queue: &str, lease: &LeaseRequest, now: i64) -> Result<Option<Job>> {
        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;

        let paused: bool = sqlx::query_scalar(&format!(
            "SELECT paused FROM {} WHERE name = ?",
            self.queues_table
        ))
        .bind(queue)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("read paused flag"))?;
        if paused {
            return Ok(None);
        }

        let order = self.next_order(&mut tx, queue).await?;
        let row = sqlx::query(&format!(
            "UPDATE {0} SET state = 'active', lock_token = ?, locked_by = ?, lock_until = ?, \
                processed_at = ?, attempts_started = attempts_started + 1, order_key = ? \
             WHERE queue = ? AND id = ( \
                SELECT id FROM {0} WHERE queue = ? AND state = 'waiting' \
                ORDER BY order_key LIMIT 1) \
             RETURNING {1}",
            self.jobs_table, JOB_COLUMNS
        ))
        .bind(&lease.token)
        .bind(&lease.worker_id)
        .bind(now.saturating_add(millis(lease.duration)))
        .bind(now)
        .bind(order)
        .bind(queue)
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("claim job"))?;

        let job = row.as_ref().map(job_from_row).transpose()?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(job)
    }

    async fn extend_lease(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        until: i64,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;
        let result = sqlx::query(&format!(
            "UPDATE {} SET lock_until = ? \
             WHERE queue = ? AND id = ? AND state = 'active' AND lock_token = ?",
            self.jobs_table
        ))
        .bind(until)
        .bind(queue)
        .bind(id.as_str())
        .bind(token)
        .execute(&mut *tx)
        .await
        .map_err(db_err("extend lease"))?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        progress: serde_json::Value,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;
        let result = sqlx::query(&format!(
            "UPDATE {} SET progress = ? \
             WHERE queue = ? AND id = ? AND state = 'active' AND lock_token = ?",
            self.jobs_table
        ))
        .bind(serde_json::to_string(&progress)?)
        .bind(queue)
        .bind(id.as_str())
        .bind(token)
        .execute(&mut *tx)
        .await
        .map_err(db_err("update progress"))?;
        if result.rows_affected() == 0 {
            return Err(FerryError::LeaseLost(id.to_string()));
        }
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(())
    }

    async fn release(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        transition: Transition,
        now: i64,
    ) -> Result<Released> {
        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;
        let job = match self.load(&mut tx, queue, id).await? {
            Some(job) if job.is_locked_by(token) => job,
            _ => return Err(FerryError::LeaseLost(id.to_string())),
        };
        let released = self.transition(&mut tx, job, transition, now).await?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(released)
    }

    async fn promote_delayed(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>> {
        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;
        let due = self
            .select_ids(
                &mut tx,
                &format!(
                    "SELECT id FROM {} WHERE queue = ? AND state = 'delayed' AND run_at <= ? \
                     ORDER BY run_at, order_key LIMIT ?",
                    self.jobs_table
                ),
                queue,
                Some(now),
                i64::try_from(limit).unwrap_or(i64::MAX),
            )
            .await?;

        for id in &due {
            let order = self.next_order(&mut tx, queue).await?;
            sqlx::query(&format!(
                "UPDATE {} SET state = 'waiting', run_at = NULL, order_key = ? \
                 WHERE queue = ? AND id = ?",
                self.jobs_table
            ))
            .bind(order)
            .bind(queue)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err("promote job"))?;
        }
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(due)
    }

    async fn next_delayed_at(&self, queue: &str) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire connection"))?;
        self.check_halted(&mut conn, queue).await?;
        sqlx::query_scalar(&format!(
            "SELECT MIN(run_at) FROM {} WHERE queue = ? AND state = 'delayed'",
            self.jobs_table
        ))
        .bind(queue)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err("read next deadline"))
    }

    async fn stalled_jobs(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<Job>> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire connection"))?;
        self.check_halted(&mut conn, queue).await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE queue = ? AND state = 'active' \
             AND (lock_until IS NULL OR lock_until < ?) ORDER BY order_key LIMIT ?",
            JOB_COLUMNS, self.jobs_table
        ))
        .bind(queue)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("select stalled jobs"))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn reclaim_stalled(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        transition: Transition,
        now: i64,
    ) -> Result<Option<Released>> {
        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;
        let mut job = match self.load(&mut tx, queue, id).await? {
            Some(job) if job.is_locked_by(token) && job.lease_expired(now) => job,
            _ => return Ok(None),
        };
        job.stalled_count = job.stalled_count.saturating_add(1);
        let released = self.transition(&mut tx, job, transition, now).await?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(Some(released))
    }

    async fn purge_expired(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>> {
        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;
        let expired = self
            .select_ids(
                &mut tx,
                &format!(
                    "SELECT id FROM {} WHERE queue = ? AND state IN ('completed', 'failed') \
                     AND expires_at <= ? ORDER BY expires_at LIMIT ?",
                    self.jobs_table
                ),
                queue,
                Some(now),
                i64::try_from(limit).unwrap_or(i64::MAX),
            )
            .await?;
        self.delete_ids(&mut tx, queue, &expired).await?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(expired)
    }

    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        older_than: i64,
        limit: usize,
    ) -> Result<Vec<JobId>> {
        if state == JobState::Active {
            return Ok(Vec::new());
        }
        let reference = if state.is_terminal() {
            "COALESCE(finished_at, created_at)"
        } else {
            "created_at"
        };

        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;
        let victims = self
            .select_ids(
                &mut tx,
                &format!(
                    "SELECT id FROM {} WHERE queue = ? AND state = '{}' AND {} < ? \
                     ORDER BY order_key LIMIT ?",
                    self.jobs_table,
                    state.as_str(),
                    reference
                ),
                queue,
                Some(older_than),
                i64::try_from(limit).unwrap_or(i64::MAX),
            )
            .await?;
        self.delete_ids(&mut tx, queue, &victims).await?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(victims)
    }

    async fn drain(&self, queue: &str, include_delayed: bool) -> Result<Vec<JobId>> {
        let states = if include_delayed {
            "('waiting', 'delayed')"
        } else {
            "('waiting')"
        };

        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;
        let drained = self
            .select_ids(
                &mut tx,
                &format!(
                    "SELECT id FROM {} WHERE queue = ? AND state IN {} ORDER BY order_key LIMIT ?",
                    self.jobs_table, states
                ),
                queue,
                None,
                -1,
            )
            .await?;
        self.delete_ids(&mut tx, queue, &drained).await?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(drained)
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<()> {
        let mut tx = self.begin().await?;
        self.enter(&mut tx, queue).await?;
        sqlx::query(&format!(
            "UPDATE {} SET paused = ? WHERE name = ?",
            self.queues_table
        ))
        .bind(paused)
        .bind(queue)
        .execute(&mut *tx)
        .await
        .map_err(db_err("set paused flag"))?;
        tx.commit().await.map_err(db_err("commit"))?;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire connection"))?;
        self.check_halted(&mut conn, queue).await?;
        let paused: Option<bool> = sqlx::query_scalar(&format!(
            "SELECT paused FROM {} WHERE name = ?",
            self.queues_table
        ))
        .bind(queue)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("read paused flag"))?;
        Ok(paused.unwrap_or(false))
    }

    async fn halt(&self, queue: &str, reason: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO {} (name, halted) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET halted = excluded.halted",
            self.queues_table
        ))
        .bind(queue)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(db_err("halt queue"))?;
        tx.commit().await.map_err(db_err("commit"))?;

        tracing::error!(queue = %queue, reason = %reason, "Queue halted");
        Ok(())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        let mut conn = self.pool.acquire().await.map_err(db_err("acquire connection"))?;
        self.check_halted(&mut conn, queue).await?;
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT state, COUNT(*) FROM {} WHERE queue = ? GROUP BY state",
            self.jobs_table
        ))
        .bind(queue)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("count jobs"))?;

        let mut counts = JobCounts::default();
        for (state, count) in rows {
            let count = usize::try_from(count).unwrap_or(0);
            match state.parse::<JobState>()? {
                JobState::Waiting => counts.waiting = count,
                JobState::Delayed => counts.delayed = count,
                JobState::Active => counts.active = count,
                JobState::Completed => counts.completed = count,
                JobState::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let order = match state {
            JobState::Waiting | JobState::Active => "order_key ASC",
            JobState::Delayed => "run_at ASC, order_key ASC",
            JobState::Completed | JobState::Failed => "order_key DESC",
        };

        let mut conn = self.pool.acquire().await.map_err(db_err("acquire connection"))?;
        self.check_halted(&mut conn, queue).await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE queue = ? AND state = ? ORDER BY {} LIMIT ? OFFSET ?",
            JOB_COLUMNS, self.jobs_table, order
        ))
        .bind(queue)
        .bind(state.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("list jobs"))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn queues(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(&format!(
            "SELECT name FROM {} ORDER BY name",
            self.queues_table
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list queues"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::Backoff;
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory("test").await.unwrap()
    }

    fn lease(token: &str) -> LeaseRequest {
        LeaseRequest {
            token: token.to_string(),
            worker_id: "worker-1".to_string(),
            duration: Duration::from_secs(30),
        }
    }

    async fn add(store: &SqliteStore, id: &str, opts: JobOptions, now: i64) -> Job {
        let job = Job::new("q", JobId::from(id), "work", json!({"id": id}), opts, now);
        match store.insert_job(&job).await.unwrap() {
            InsertOutcome::Inserted(job) => job,
            InsertOutcome::Duplicate(_) => panic!("unexpected duplicate {}", id),
        }
    }

    #[tokio::test]
    async fn test_invalid_namespace_is_rejected() {
        let err = SqliteStore::in_memory("bad-name; DROP").await.err().unwrap();
        assert!(matches!(err, FerryError::Config(_)));
    }

    #[tokio::test]
    async fn test_sequence_and_insert() {
        let store = store().await;
        assert_eq!(store.next_job_id("q").await.unwrap(), 1);
        assert_eq!(store.next_job_id("q").await.unwrap(), 2);
        assert_eq!(store.next_job_id("other").await.unwrap(), 1);

        let job = add(&store, "a", JobOptions::default().attempts(3), 1_000).await;
        let loaded = store.get_job("q", &job.id).await.unwrap().unwrap();
        assert_eq!(loaded, job);

        let again = Job::new("q", JobId::from("a"), "work", json!({}), JobOptions::default(), 2_000);
        match store.insert_job(&again).await.unwrap() {
            InsertOutcome::Duplicate(existing) => assert_eq!(existing.data, json!({"id": "a"})),
            InsertOutcome::Inserted(_) => panic!("expected duplicate"),
        }
        assert_eq!(store.queues().await.unwrap(), vec!["other", "q"]);
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_exclusive() {
        let store = store().await;
        add(&store, "a", JobOptions::default(), 1_000).await;
        add(&store, "b", JobOptions::default(), 1_001).await;

        let first = store.claim("q", &lease("t1"), 2_000).await.unwrap().unwrap();
        assert_eq!(first.id.as_str(), "a");
        assert_eq!(first.state, JobState::Active);
        assert_eq!(first.lock_until, Some(32_000));
        assert_eq!(first.attempts_started, 1);

        let (l2, l3) = (lease("t2"), lease("t3"));
        let (x, y) = tokio::join!(
            store.claim("q", &l2, 2_000),
            store.claim("q", &l3, 2_000)
        );
        let claimed: Vec<Job> = [x.unwrap(), y.unwrap()].into_iter().flatten().collect();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id.as_str(), "b");
    }

    #[tokio::test]
    async fn test_paused_queue_is_not_claimed() {
        let store = store().await;
        add(&store, "a", JobOptions::default(), 1_000).await;
        store.set_paused("q", true).await.unwrap();
        assert!(store.is_paused("q").await.unwrap());
        assert!(store.claim("q", &lease("t"), 2_000).await.unwrap().is_none());
        store.set_paused("q", false).await.unwrap();
        assert!(store.claim("q", &lease("t"), 2_000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_delay_and_promotion() {
        let store = store().await;
        let opts = JobOptions::default()
            .attempts(3)
            .backoff(Backoff::fixed(Duration::from_secs(1)));
        add(&store, "a", opts, 1_000).await;
        let job = store.claim("q", &lease("t"), 2_000).await.unwrap().unwrap();

        let released = store
            .release(
                "q",
                &job.id,
                "t",
                Transition::Retry {
                    error: "boom".to_string(),
                    attempts_made: 1,
                    run_at: Some(3_000),
                },
                2_000,
            )
            .await
            .unwrap();
        assert_eq!(released.job.state, JobState::Delayed);
        assert_eq!(store.next_delayed_at("q").await.unwrap(), Some(3_000));

        assert!(store.promote_delayed("q", 2_999, 10).await.unwrap().is_empty());
        assert_eq!(store.promote_delayed("q", 3_000, 10).await.unwrap(), vec![job.id.clone()]);

        let job = store.get_job("q", &job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(job.run_at.is_none());
    }

    #[tokio::test]
    async fn test_immediate_retry_goes_to_head() {
        let store = store().await;
        add(&store, "a", JobOptions::default().attempts(2), 1_000).await;
        add(&store, "b", JobOptions::default(), 1_001).await;
        let job = store.claim("q", &lease("t"), 2_000).await.unwrap().unwrap();

        store
            .release(
                "q",
                &job.id,
                "t",
                Transition::Retry {
                    error: "boom".to_string(),
                    attempts_made: 1,
                    run_at: None,
                },
                2_000,
            )
            .await
            .unwrap();

        let waiting = store.list_jobs("q", JobState::Waiting, 0, 10).await.unwrap();
        let ids: Vec<&str> = waiting.iter().map(|job| job.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_release_requires_lease_owner() {
        let store = store().await;
        add(&store, "a", JobOptions::default(), 1_000).await;
        let job = store.claim("q", &lease("t"), 2_000).await.unwrap().unwrap();

        let err = store
            .release(
                "q",
                &job.id,
                "other",
                Transition::Complete {
                    return_value: json!(1),
                },
                2_100,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FerryError::LeaseLost(_)));
        assert!(!store.extend_lease("q", &job.id, "other", 99_000).await.unwrap());
        assert!(store.extend_lease("q", &job.id, "t", 99_000).await.unwrap());
        assert!(matches!(
            store.update_progress("q", &job.id, "other", json!(1)).await,
            Err(FerryError::LeaseLost(_))
        ));
        store.update_progress("q", &job.id, "t", json!({"pct": 10})).await.unwrap();

        let released = store
            .release(
                "q",
                &job.id,
                "t",
                Transition::Complete {
                    return_value: json!("ok"),
                },
                2_200,
            )
            .await
            .unwrap();
        assert_eq!(released.job.state, JobState::Completed);
        assert_eq!(released.job.progress, json!({"pct": 10}));
        assert_eq!(released.job.finished_at, Some(2_200));
        assert!(released.job.lock_token.is_none());
    }

    #[tokio::test]
    async fn test_retention_count_and_age() {
        let store = store().await;
        let opts = JobOptions::default().remove_on_complete(Retention::count(2));
        for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
            add(&store, id, opts.clone(), 1_000).await;
            let job = store.claim("q", &lease(id), 2_000).await.unwrap().unwrap();
            let released = store
                .release(
                    "q",
                    &job.id,
                    id,
                    Transition::Complete {
                        return_value: json!(i),
                    },
                    3_000 + i as i64,
                )
                .await
                .unwrap();
            if id == "c" {
                assert_eq!(released.removed, vec![JobId::from("a")]);
            }
        }
        let completed = store.list_jobs("q", JobState::Completed, 0, 10).await.unwrap();
        let ids: Vec<&str> = completed.iter().map(|job| job.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);

        let opts = JobOptions::default().remove_on_fail(Retention::age(Duration::from_secs(1)));
        add(&store, "d", opts, 1_000).await;
        let job = store.claim("q", &lease("t"), 2_000).await.unwrap().unwrap();
        let released = store
            .release(
                "q",
                &job.id,
                "t",
                Transition::Fail {
                    error: "boom".to_string(),
                    attempts_made: 1,
                },
                5_000,
            )
            .await
            .unwrap();
        assert_eq!(released.job.expires_at, Some(6_000));
        assert!(store.purge_expired("q", 5_999, 10).await.unwrap().is_empty());
        assert_eq!(store.purge_expired("q", 6_000, 10).await.unwrap(), vec![job.id]);
    }

    #[tokio::test]
    async fn test_retention_remove_deletes_row() {
        let store = store().await;
        add(&store, "a", JobOptions::default().remove_on_complete(Retention::Remove), 1_000).await;
        let job = store.claim("q", &lease("t"), 2_000).await.unwrap().unwrap();
        let released = store
            .release(
                "q",
                &job.id,
                "t",
                Transition::Complete {
                    return_value: json!(null),
                },
                3_000,
            )
            .await
            .unwrap();
        assert_eq!(released.removed, vec![job.id.clone()]);
        assert!(store.get_job("q", &job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stalled_jobs_and_reclaim() {
        let store = store().await;
        add(&store, "a", JobOptions::default(), 1_000).await;
        let job = store.claim("q", &lease("t"), 2_000).await.unwrap().unwrap();

        assert!(store.stalled_jobs("q", 32_000, 10).await.unwrap().is_empty());
        let stalled = store.stalled_jobs("q", 32_001, 10).await.unwrap();
        assert_eq!(stalled.len(), 1);

        let requeue = Transition::Retry {
            error: "job stalled".to_string(),
            attempts_made: 0,
            run_at: None,
        };
        assert!(store
            .reclaim_stalled("q", &job.id, "t", requeue.clone(), 20_000)
            .await
            .unwrap()
            .is_none());
        let released = store
            .reclaim_stalled("q", &job.id, "t", requeue.clone(), 32_001)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.job.state, JobState::Waiting);
        assert_eq!(released.job.stalled_count, 1);

        // Already reclaimed: a second attempt is a no-op.
        assert!(store
            .reclaim_stalled("q", &job.id, "t", requeue, 40_000)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_remove_clean_drain_and_counts() {
        let store = store().await;
        add(&store, "a", JobOptions::default(), 1_000).await;
        add(&store, "b", JobOptions::default(), 5_000).await;
        add(&store, "c", JobOptions::default().delay(Duration::from_secs(10)), 1_000).await;
        add(&store, "d", JobOptions::default(), 1_000).await;
        let active = store.claim("q", &lease("t"), 6_000).await.unwrap().unwrap();

        assert!(matches!(
            store.remove_job("q", &active.id).await,
            Err(FerryError::JobLocked(_))
        ));
        assert!(store.remove_job("q", &JobId::from("missing")).await.unwrap().is_none());

        let counts = store.counts("q").await.unwrap();
        assert_eq!(
            counts,
            JobCounts {
                waiting: 2,
                delayed: 1,
                active: 1,
                completed: 0,
                failed: 0
            }
        );

        let cleaned = store.clean("q", JobState::Waiting, 2_000, 10).await.unwrap();
        assert_eq!(cleaned, vec![JobId::from("d")]);
        assert!(store.clean("q", JobState::Active, i64::MAX, 10).await.unwrap().is_empty());

        let drained = store.drain("q", true).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(store.counts("q").await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_halted_queue_rejects_operations() {
        let store = store().await;
        add(&store, "a", JobOptions::default(), 1_000).await;
        store.halt("q", "sequence lost").await.unwrap();

        assert!(matches!(
            store.claim("q", &lease("t"), 2_000).await,
            Err(FerryError::Corrupted(_))
        ));
        assert!(matches!(store.counts("q").await, Err(FerryError::Corrupted(_))));
        assert!(store.counts("other").await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_reports_connection_error() {
        let store = store().await;
        add(&store, "a", JobOptions::default(), 1_000).await;
        store.pool.close().await;

        assert!(matches!(store.counts("q").await, Err(FerryError::Connection(_))));
        assert!(matches!(
            store.claim("q", &lease("t"), 2_000).await,
            Err(FerryError::Connection(_))
        ));
        assert!(matches!(store.ping().await, Err(FerryError::Connection(_))));
    }

    #[test]
    fn test_query_errors_stay_store_errors() {
        let err = db_err("read queue")(sqlx::Error::RowNotFound);
        assert!(matches!(err, FerryError::Store(_)));
        let err = db_err("read queue")(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, FerryError::Connection(_)));
    }

    #[tokio::test]
    async fn test_file_database_persists_across_connections() {
        let path = std::env::temp_dir().join(format!("ferry-test-{}.db", std::process::id()));
        let url = format!("sqlite:{}", path.display());
        {
            let store = SqliteStore::new(&url, "persist").await.unwrap();
            add(&store, "a", JobOptions::default(), 1_000).await;
            store.pool.close().await;
        }
        let store = SqliteStore::new(&url, "persist").await.unwrap();
        assert!(store.get_job("q", &JobId::from("a")).await.unwrap().is_some());
        store.pool.close().await;
        let _ = std::fs::remove_file(&path);
    }
}
