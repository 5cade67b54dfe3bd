//! SQLite persistence for run records, decision history, briefs, the
//! delivery ledger and the feedback log.
//!
//! Decision history and feedback are append-only: nothing here updates or
//! deletes a `triaged_items` or `feedback` row.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::delivery::DeliveryRecord;
use crate::models::{
    Classification, DailyTriageBrief, FeedbackAction, HistoricalDecision, TriageFeedback,
    TriagedItem,
};
use crate::pipeline::state::RunRecord;

/// Async-safe handle to the triage database.
///
/// Wraps `TriageDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TriageDb>>,
}

impl DbHandle {
    pub fn new(db: TriageDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TriageDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("Invalid date '{}'", s))
}

pub struct TriageDb {
    conn: Connection,
}

impl TriageDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        // `serve` and one-shot commands may share the file.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS pipeline_runs (
                    run_id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL,
                    state TEXT NOT NULL,
                    record TEXT NOT NULL,
                    started_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS triaged_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    external_id TEXT NOT NULL,
                    classification TEXT NOT NULL,
                    priority TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    decided_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS briefs (
                    brief_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    brief_date TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS deliveries (
                    workspace_id TEXT NOT NULL,
                    brief_date TEXT NOT NULL,
                    brief_id TEXT NOT NULL,
                    thread_id TEXT NOT NULL,
                    item_ids TEXT NOT NULL DEFAULT '[]',
                    delivered_at TEXT NOT NULL,
                    PRIMARY KEY (workspace_id, brief_date)
                );

                CREATE TABLE IF NOT EXISTS alerts (
                    workspace_id TEXT NOT NULL,
                    brief_date TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    thread_id TEXT NOT NULL,
                    alerted_at TEXT NOT NULL,
                    PRIMARY KEY (workspace_id, brief_date, item_id)
                );

                CREATE TABLE IF NOT EXISTS feedback (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    action TEXT NOT NULL,
                    classification TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS run_leases (
                    workspace_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    holder TEXT NOT NULL,
                    acquired_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_workspace ON pipeline_runs(workspace_id, started_at);
                CREATE INDEX IF NOT EXISTS idx_triaged_workspace ON triaged_items(workspace_id, decided_at);
                CREATE INDEX IF NOT EXISTS idx_triaged_item ON triaged_items(item_id);
                CREATE INDEX IF NOT EXISTS idx_feedback_run ON feedback(run_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ────────────────────────────────────────────────────────

    pub fn upsert_run(&self, run: &RunRecord) -> Result<()> {
        let record = serde_json::to_string(run).context("Failed to serialize run record")?;
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (run_id, workspace_id, state, record, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(run_id) DO UPDATE SET state = excluded.state, record = excluded.record",
                params![
                    run.run_id,
                    run.workspace_id,
                    run.state.as_str(),
                    record,
                    ts(&run.started_at)
                ],
            )
            .context("Failed to upsert pipeline run")?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM pipeline_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query pipeline run")?;
        record
            .map(|r| serde_json::from_str(&r).context("Failed to decode run record"))
            .transpose()
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, workspace_id: Option<&str>, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT record FROM pipeline_runs
                 WHERE ?1 IS NULL OR workspace_id = ?1
                 ORDER BY started_at DESC LIMIT ?2",
            )
            .context("Failed to prepare recent_runs")?;
        let rows = stmt
            .query_map(params![workspace_id, limit as i64], |row| row.get::<_, String>(0))
            .context("Failed to query recent runs")?;
        rows.map(|r| {
            let r = r.context("Failed to read pipeline_runs row")?;
            serde_json::from_str(&r).context("Failed to decode run record")
        })
        .collect()
    }

    // ── Decision history ───────────────────────────────────────────

    pub fn insert_triaged_items(
        &self,
        run_id: &str,
        workspace_id: &str,
        items: &[TriagedItem],
    ) -> Result<()> {
        let decided_at = ts(&Utc::now());
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO triaged_items
                     (run_id, workspace_id, item_id, external_id, classification, priority, payload, decided_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .context("Failed to prepare triaged item insert")?;
            for item in items {
                let payload =
                    serde_json::to_string(item).context("Failed to serialize triaged item")?;
                stmt.execute(params![
                    run_id,
                    workspace_id,
                    item.item.id,
                    item.item.external_id,
                    item.classification.as_str(),
                    item.priority.as_str(),
                    payload,
                    decided_at
                ])
                .context("Failed to insert triaged item")?;
            }
        }
        tx.commit().context("Failed to commit triaged items")?;
        Ok(())
    }

    pub fn triaged_items_for_run(&self, run_id: &str) -> Result<Vec<TriagedItem>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM triaged_items WHERE run_id = ?1 ORDER BY id")
            .context("Failed to prepare triaged_items_for_run")?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))
            .context("Failed to query triaged items")?;
        rows.map(|r| {
            let r = r.context("Failed to read triaged_items row")?;
            serde_json::from_str(&r).context("Failed to decode triaged item")
        })
        .collect()
    }

    /// Previous decisions for a workspace, most recent first.
    pub fn review_history(&self, workspace_id: &str, limit: usize) -> Result<Vec<HistoricalDecision>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT item_id, external_id, classification, priority, decided_at
                 FROM triaged_items WHERE workspace_id = ?1
                 ORDER BY decided_at DESC, id DESC LIMIT ?2",
            )
            .context("Failed to prepare review_history")?;
        let rows = stmt
            .query_map(params![workspace_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query review history")?;
        rows.map(|r| {
            let (item_id, external_id, classification, priority, decided_at) =
                r.context("Failed to read review history row")?;
            Ok(HistoricalDecision {
                item_id,
                external_id,
                classification: classification.parse().map_err(anyhow::Error::msg)?,
                priority: priority.parse().map_err(anyhow::Error::msg)?,
                decided_at: parse_ts(&decided_at)?,
            })
        })
        .collect()
    }

    /// Classification from the most recent decision about an item.
    pub fn latest_classification(&self, item_id: &str) -> Result<Option<Classification>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT classification FROM triaged_items WHERE item_id = ?1
                 ORDER BY decided_at DESC, id DESC LIMIT 1",
                params![item_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query latest classification")?;
        value
            .map(|v| v.parse().map_err(anyhow::Error::msg))
            .transpose()
    }

    // ── Briefs ──────────────────────────────────────────────────────

    pub fn save_brief(&self, brief: &DailyTriageBrief) -> Result<()> {
        let payload = serde_json::to_string(brief).context("Failed to serialize brief")?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO briefs (brief_id, run_id, workspace_id, brief_date, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    brief.id,
                    brief.run_id,
                    brief.workspace_id,
                    brief.date.to_string(),
                    payload,
                    ts(&Utc::now())
                ],
            )
            .context("Failed to save brief")?;
        Ok(())
    }

    pub fn get_brief(&self, brief_id: &str) -> Result<Option<DailyTriageBrief>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM briefs WHERE brief_id = ?1",
                params![brief_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query brief")?;
        payload
            .map(|p| serde_json::from_str(&p).context("Failed to decode brief"))
            .transpose()
    }

    // ── Delivery ledger ─────────────────────────────────────────────

    /// Last brief delivered for a workspace on a date.
    pub fn delivered_brief(&self, workspace_id: &str, date: NaiveDate) -> Result<Option<DeliveryRecord>> {
        self.query_delivery(
            "SELECT workspace_id, brief_date, brief_id, thread_id, item_ids, delivered_at
             FROM deliveries WHERE workspace_id = ?1 AND brief_date = ?2",
            params![workspace_id, date.to_string()],
        )
    }

    pub fn delivery_by_thread(&self, thread_id: &str) -> Result<Option<DeliveryRecord>> {
        self.query_delivery(
            "SELECT workspace_id, brief_date, brief_id, thread_id, item_ids, delivered_at
             FROM deliveries WHERE thread_id = ?1",
            params![thread_id],
        )
    }

    fn query_delivery(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<DeliveryRecord>> {
        let row = self
            .conn
            .query_row(sql, params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .optional()
            .context("Failed to query delivery ledger")?;
        row.map(|(workspace_id, date, brief_id, thread_id, item_ids, delivered_at)| {
            Ok(DeliveryRecord {
                workspace_id,
                date: parse_date(&date)?,
                brief_id,
                thread_id,
                item_ids: serde_json::from_str(&item_ids).context("Failed to decode item ids")?,
                delivered_at: parse_ts(&delivered_at)?,
            })
        })
        .transpose()
    }

    /// Record a successful delivery, replacing any earlier one for the date.
    pub fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        let item_ids = serde_json::to_string(&record.item_ids).context("Failed to serialize item ids")?;
        self.conn
            .execute(
                "INSERT INTO deliveries (workspace_id, brief_date, brief_id, thread_id, item_ids, delivered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(workspace_id, brief_date) DO UPDATE SET
                    brief_id = excluded.brief_id,
                    thread_id = excluded.thread_id,
                    item_ids = excluded.item_ids,
                    delivered_at = excluded.delivered_at",
                params![
                    record.workspace_id,
                    record.date.to_string(),
                    record.brief_id,
                    record.thread_id,
                    item_ids,
                    ts(&record.delivered_at)
                ],
            )
            .context("Failed to record delivery")?;
        Ok(())
    }

    pub fn record_alert(
        &self,
        workspace_id: &str,
        date: NaiveDate,
        item_id: &str,
        thread_id: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO alerts (workspace_id, brief_date, item_id, thread_id, alerted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![workspace_id, date.to_string(), item_id, thread_id, ts(&Utc::now())],
            )
            .context("Failed to record alert")?;
        Ok(())
    }

    pub fn alerted_items(&self, workspace_id: &str, date: NaiveDate) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT item_id FROM alerts WHERE workspace_id = ?1 AND brief_date = ?2")
            .context("Failed to prepare alerted_items")?;
        let rows = stmt
            .query_map(params![workspace_id, date.to_string()], |row| row.get::<_, String>(0))
            .context("Failed to query alerts")?;
        rows.map(|r| r.context("Failed to read alerts row")).collect()
    }

    // ── Feedback ────────────────────────────────────────────────────

    pub fn append_feedback(&self, feedback: &TriageFeedback) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO feedback (run_id, user_id, item_id, action, classification, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    feedback.run_id,
                    feedback.user_id,
                    feedback.item_id,
                    feedback.action.as_str(),
                    feedback.classification.map(|c| c.as_str()),
                    ts(&feedback.timestamp)
                ],
            )
            .context("Failed to append feedback")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Feedback attached to the trailing `window_runs` runs, oldest first.
    pub fn feedback_window(
        &self,
        workspace_id: Option<&str>,
        window_runs: usize,
    ) -> Result<Vec<TriageFeedback>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, user_id, item_id, action, classification, created_at
                 FROM feedback
                 WHERE run_id IN (
                    SELECT run_id FROM pipeline_runs
                    WHERE ?1 IS NULL OR workspace_id = ?1
                    ORDER BY started_at DESC LIMIT ?2
                 )
                 ORDER BY id",
            )
            .context("Failed to prepare feedback_window")?;
        let rows = stmt
            .query_map(params![workspace_id, window_runs as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query feedback")?;
        rows.map(|r| {
            let (run_id, user_id, item_id, action, classification, created_at) =
                r.context("Failed to read feedback row")?;
            Ok(TriageFeedback {
                run_id,
                user_id,
                item_id,
                action: action.parse::<FeedbackAction>()?,
                timestamp: parse_ts(&created_at)?,
                classification: classification
                    .map(|c| c.parse::<Classification>().map_err(anyhow::Error::msg))
                    .transpose()?,
            })
        })
        .collect()
    }

    // ── Run leases ──────────────────────────────────────────────────

    /// Claim the workspace for `run_id`. A lease older than `stale_before`
    /// belongs to a process that died mid-run and is taken over.
    pub fn acquire_run_lease(
        &self,
        workspace_id: &str,
        run_id: &str,
        holder: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<LeaseOutcome> {
        let reclaimed = self
            .conn
            .execute(
                "DELETE FROM run_leases WHERE workspace_id = ?1 AND acquired_at < ?2",
                params![workspace_id, ts(&stale_before)],
            )
            .context("Failed to clear stale run lease")?;
        if reclaimed > 0 {
            tracing::warn!(workspace_id, "reclaimed stale run lease");
        }

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO run_leases (workspace_id, run_id, holder, acquired_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![workspace_id, run_id, holder, ts(&Utc::now())],
            )
            .context("Failed to insert run lease")?;
        if inserted == 1 {
            return Ok(LeaseOutcome::Acquired);
        }
        let lease = self
            .run_lease(workspace_id)?
            .context("Run lease vanished while being read")?;
        Ok(LeaseOutcome::Held(lease))
    }

    pub fn run_lease(&self, workspace_id: &str) -> Result<Option<RunLease>> {
        self.conn
            .query_row(
                "SELECT workspace_id, run_id, holder, acquired_at FROM run_leases WHERE workspace_id = ?1",
                params![workspace_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query run lease")?
            .map(|(workspace_id, run_id, holder, acquired_at)| {
                Ok(RunLease {
                    workspace_id,
                    run_id,
                    holder,
                    acquired_at: parse_ts(&acquired_at)?,
                })
            })
            .transpose()
    }

    /// Drop the lease if `run_id` still holds it.
    pub fn release_run_lease(&self, workspace_id: &str, run_id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM run_leases WHERE workspace_id = ?1 AND run_id = ?2",
                params![workspace_id, run_id],
            )
            .context("Failed to release run lease")?;
        Ok(removed > 0)
    }
}

/// Row of `run_leases`: which run currently owns a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    pub workspace_id: String,
    pub run_id: String,
    /// `<pid>:<id>` of the owning process.
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    Held(RunLease),
}
