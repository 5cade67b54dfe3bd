//! Workspace leases shared through the database.
//!
//! The in-process [`RunRegistry`](super::RunRegistry) only sees runs started
//! by this process. `triage serve` and one-shot commands such as
//! `triage run` or `triage deliver` open the same database file, so every
//! run and re-delivery also claims a row in `run_leases`. The row is removed
//! when the work ends. A row older than the lease TTL is treated as left
//! behind by a crashed process and taken over.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::db::{DbHandle, LeaseOutcome, RunLease};
use crate::errors::TriageError;
use crate::pipeline::state::RunRecord;

/// How often a waiter re-reads a lease held by another process.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Result of asking the database for a workspace.
pub enum Claim {
    Granted(LeaseGuard),
    Busy(RunLease),
}

#[derive(Clone)]
pub struct LeaseStore {
    db: DbHandle,
    holder: String,
    ttl: chrono::Duration,
}

impl LeaseStore {
    pub fn new(db: DbHandle, ttl: Duration) -> Self {
        Self {
            db,
            holder: format!("{}:{}", std::process::id(), Uuid::new_v4().simple()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
        }
    }

    /// Identifies this store in `run_leases.holder`.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn acquire(&self, workspace_id: &str, run_id: &str) -> Result<Claim, TriageError> {
        let (workspace, run, holder) = (
            workspace_id.to_string(),
            run_id.to_string(),
            self.holder.clone(),
        );
        let stale_before = Utc::now() - self.ttl;
        let outcome = self
            .db
            .call(move |db| db.acquire_run_lease(&workspace, &run, &holder, stale_before))
            .await?;
        Ok(match outcome {
            LeaseOutcome::Acquired => Claim::Granted(LeaseGuard {
                db: self.db.clone(),
                workspace_id: workspace_id.to_string(),
                run_id: run_id.to_string(),
                released: false,
            }),
            LeaseOutcome::Held(lease) => Claim::Busy(lease),
        })
    }

    /// Wait until `lease` is released or goes stale. Returns the final
    /// record when the lease belonged to a pipeline run, `None` otherwise.
    pub async fn wait_released(&self, lease: &RunLease) -> Result<Option<RunRecord>, TriageError> {
        loop {
            let (workspace, run) = (lease.workspace_id.clone(), lease.run_id.clone());
            let (current, record) = self
                .db
                .call(move |db| Ok((db.run_lease(&workspace)?, db.get_run(&run)?)))
                .await?;

            if let Some(record) = record
                && record.state.is_terminal()
            {
                return Ok(Some(record));
            }
            let still_held = current.is_some_and(|c| {
                c.run_id == lease.run_id && c.acquired_at > Utc::now() - self.ttl
            });
            if !still_held {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Held lease. Released explicitly with [`release`](Self::release), or on
/// drop from a background task.
pub struct LeaseGuard {
    db: DbHandle,
    workspace_id: String,
    run_id: String,
    released: bool,
}

impl LeaseGuard {
    pub async fn release(mut self) {
        self.released = true;
        release(self.db.clone(), self.workspace_id.clone(), self.run_id.clone()).await;
    }
}

async fn release(db: DbHandle, workspace_id: String, run_id: String) {
    let (workspace, run) = (workspace_id.clone(), run_id.clone());
    if let Err(e) = db.call(move |db| db.release_run_lease(&workspace, &run)).await {
        tracing::error!(%workspace_id, %run_id, error = %e, "failed to release run lease");
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release(
                    self.db.clone(),
                    std::mem::take(&mut self.workspace_id),
                    std::mem::take(&mut self.run_id),
                ));
            }
            Err(_) => tracing::warn!(
                workspace_id = %self.workspace_id,
                run_id = %self.run_id,
                "run lease left to expire"
            ),
        }
    }
}
