//! Run scheduling and per-workspace single-flight.
//!
//! Every run for a workspace goes through the [`RunRegistry`]: admission is
//! checked and recorded under one lock before the run leaves `Idle`. The
//! admitted run then claims the workspace's database lease (see [`lease`]),
//! which other processes sharing the database respect. A scheduled trigger
//! for a busy workspace is rejected. An ad-hoc trigger for a busy workspace
//! waits for the in-flight run and returns its record.

pub mod cron;
pub mod lease;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::RunLease;
use crate::delivery::DeliveryReceipt;
use crate::errors::TriageError;
use crate::pipeline::state::{RunRecord, Trigger};
use crate::pipeline::{PipelineRunner, RunContext};

use cron::CronSchedule;
use lease::{Claim, LeaseGuard, LeaseStore};

type Completion = watch::Receiver<Option<RunRecord>>;

struct ActiveRun {
    run_id: String,
    trigger: Trigger,
    cancel: CancellationToken,
    done: Completion,
}

/// Snapshot of an in-flight run for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRunInfo {
    pub workspace_id: String,
    pub run_id: String,
    pub trigger: Trigger,
}

/// Result of asking the registry for a slot.
pub enum Admission {
    Started(RunTicket),
    InFlight { run_id: String, done: Completion },
}

/// Map of workspace id to its in-flight run.
#[derive(Clone, Default)]
pub struct RunRegistry {
    active: Arc<Mutex<HashMap<String, ActiveRun>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveRun>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically claim the workspace, or report the run holding it.
    pub fn admit(&self, workspace_id: &str, trigger: Trigger) -> Admission {
        let mut active = self.lock();
        if let Some(run) = active.get(workspace_id) {
            return Admission::InFlight {
                run_id: run.run_id.clone(),
                done: run.done.clone(),
            };
        }

        let cancel = CancellationToken::new();
        let ctx = RunContext::with_cancel(workspace_id, cancel.clone());
        let (tx, done) = watch::channel(None);
        active.insert(
            workspace_id.to_string(),
            ActiveRun {
                run_id: ctx.run_id.clone(),
                trigger: trigger.clone(),
                cancel,
                done,
            },
        );
        Admission::Started(RunTicket {
            ctx,
            trigger,
            tx,
            registry: self.clone(),
            lease: None,
        })
    }

    /// Request cancellation of the workspace's in-flight run. Takes effect
    /// at the next stage boundary.
    pub fn cancel(&self, workspace_id: &str) -> Option<String> {
        let active = self.lock();
        let run = active.get(workspace_id)?;
        run.cancel.cancel();
        Some(run.run_id.clone())
    }

    pub fn cancel_all(&self) {
        for run in self.lock().values() {
            run.cancel.cancel();
        }
    }

    pub fn active(&self) -> Vec<ActiveRunInfo> {
        let mut runs: Vec<ActiveRunInfo> = self
            .lock()
            .iter()
            .map(|(workspace_id, run)| ActiveRunInfo {
                workspace_id: workspace_id.clone(),
                run_id: run.run_id.clone(),
                trigger: run.trigger.clone(),
            })
            .collect();
        runs.sort_by(|a, b| a.workspace_id.cmp(&b.workspace_id));
        runs
    }

    pub fn is_running(&self, workspace_id: &str) -> bool {
        self.lock().contains_key(workspace_id)
    }

    /// Completion receivers of every in-flight run.
    fn pending(&self) -> Vec<Completion> {
        self.lock().values().map(|run| run.done.clone()).collect()
    }

    fn release(&self, workspace_id: &str, run_id: &str) {
        let mut active = self.lock();
        if active.get(workspace_id).is_some_and(|r| r.run_id == run_id) {
            active.remove(workspace_id);
        }
    }
}

/// Exclusive right to run a workspace. Releases the slot when dropped.
pub struct RunTicket {
    ctx: RunContext,
    trigger: Trigger,
    tx: watch::Sender<Option<RunRecord>>,
    registry: RunRegistry,
    lease: Option<LeaseGuard>,
}

impl RunTicket {
    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub async fn run(mut self, runner: &PipelineRunner) -> RunRecord {
        let record = runner.run(&self.ctx, self.trigger.clone()).await;
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
        self.registry.release(&self.ctx.workspace_id, &self.ctx.run_id);
        self.tx.send_replace(Some(record.clone()));
        record
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.registry.release(&self.ctx.workspace_id, &self.ctx.run_id);
    }
}

/// Wait for an in-flight run to publish its final record.
pub async fn wait_for(mut done: Completion) -> Result<RunRecord, TriageError> {
    let record = done
        .wait_for(Option::is_some)
        .await
        .map_err(|_| anyhow::anyhow!("run ended without a record"))?;
    record
        .clone()
        .ok_or_else(|| TriageError::Other(anyhow::anyhow!("run ended without a record")))
}

/// How a trigger was placed.
enum Spawned {
    Started { run_id: String, done: Completion },
    /// Another trigger in this process already runs the workspace.
    Joined { run_id: String, done: Completion },
    /// Another process holds the workspace lease.
    Elsewhere(RunLease),
}

pub struct Scheduler {
    runner: Arc<PipelineRunner>,
    registry: RunRegistry,
    leases: LeaseStore,
}

impl Scheduler {
    pub fn new(runner: Arc<PipelineRunner>) -> Self {
        let ttl = std::time::Duration::from_secs(runner.config().storage.run_lease_secs);
        let leases = LeaseStore::new(runner.db().clone(), ttl);
        Self {
            runner,
            registry: RunRegistry::new(),
            leases,
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &Arc<PipelineRunner> {
        &self.runner
    }

    /// Start a run on its own task, or report who holds the workspace.
    async fn spawn(&self, workspace_id: &str, trigger: Trigger) -> Result<Spawned, TriageError> {
        if self.runner.config().workspace(workspace_id).is_none() {
            return Err(TriageError::UnknownWorkspace(workspace_id.to_string()));
        }
        let mut ticket = match self.registry.admit(workspace_id, trigger) {
            Admission::Started(ticket) => ticket,
            Admission::InFlight { run_id, done } => return Ok(Spawned::Joined { run_id, done }),
        };
        let run_id = ticket.context().run_id.clone();
        match self.leases.acquire(workspace_id, &run_id).await? {
            Claim::Granted(guard) => ticket.lease = Some(guard),
            Claim::Busy(lease) => {
                tracing::info!(
                    %workspace_id,
                    run_id = %lease.run_id,
                    holder = %lease.holder,
                    "workspace leased by another process"
                );
                return Ok(Spawned::Elsewhere(lease));
            }
        }

        let done = ticket.tx.subscribe();
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            ticket.run(&runner).await;
        });
        Ok(Spawned::Started { run_id, done })
    }

    /// Start a run, rejecting it while the workspace is busy.
    async fn start_exclusive(
        &self,
        workspace_id: &str,
        trigger: Trigger,
    ) -> Result<(String, Completion), TriageError> {
        match self.spawn(workspace_id, trigger).await? {
            Spawned::Started { run_id, done } => Ok((run_id, done)),
            Spawned::Joined { .. } | Spawned::Elsewhere(_) => Err(TriageError::RunInProgress {
                workspace_id: workspace_id.to_string(),
            }),
        }
    }

    /// Cron-fired run. Returns the run id without waiting.
    pub async fn trigger_scheduled(&self, workspace_id: &str) -> Result<String, TriageError> {
        self.start_exclusive(workspace_id, Trigger::Scheduled)
            .await
            .map(|(run_id, _)| run_id)
    }

    /// Operator-started run; waits for the final record.
    pub async fn run_workspace(&self, workspace_id: &str) -> Result<RunRecord, TriageError> {
        let (_, done) = self.start_exclusive(workspace_id, Trigger::Manual).await?;
        wait_for(done).await
    }

    /// Manual run for the workspace `user_id` belongs to. Joins an
    /// in-flight run instead of starting a second one, including a run
    /// owned by another process.
    pub async fn trigger_ad_hoc(&self, user_id: &str) -> Result<RunRecord, TriageError> {
        let workspace = self
            .runner
            .config()
            .workspace_for_member(user_id)
            .ok_or_else(|| TriageError::NotAMember(user_id.to_string()))?;
        let workspace_id = workspace.id.clone();
        let trigger = Trigger::AdHoc {
            user_id: user_id.to_string(),
        };
        loop {
            match self.spawn(&workspace_id, trigger.clone()).await? {
                Spawned::Started { done, .. } => return wait_for(done).await,
                Spawned::Joined { run_id, done } => {
                    tracing::info!(%workspace_id, %run_id, user_id, "ad-hoc trigger joining in-flight run");
                    return wait_for(done).await;
                }
                Spawned::Elsewhere(lease) => {
                    tracing::info!(%workspace_id, run_id = %lease.run_id, user_id, "ad-hoc trigger waiting on another process");
                    if let Some(record) = self.leases.wait_released(&lease).await? {
                        return Ok(record);
                    }
                    // The holder was a re-delivery, not a run: start our own.
                }
            }
        }
    }

    /// Deliver a stored brief under the workspace lease, so it cannot race
    /// a run delivering for the same workspace.
    pub async fn redeliver(&self, brief_id: &str) -> Result<DeliveryReceipt, TriageError> {
        let (brief, items) = self.runner.load_brief(brief_id).await?;
        let workspace_id = brief.workspace_id.clone();
        let claim_id = format!("delivery-{}", Uuid::new_v4());
        let guard = match self.leases.acquire(&workspace_id, &claim_id).await? {
            Claim::Granted(guard) => guard,
            Claim::Busy(_) => return Err(TriageError::RunInProgress { workspace_id }),
        };
        let receipt = self.runner.deliver_brief(&brief, &items).await;
        guard.release().await;
        receipt
    }

    pub fn cancel(&self, workspace_id: &str) -> Option<String> {
        let run_id = self.registry.cancel(workspace_id)?;
        tracing::info!(%workspace_id, %run_id, "run cancellation requested");
        Some(run_id)
    }

    /// Fire workspace runs on their cron schedules until `shutdown`.
    pub async fn run_forever(&self, shutdown: CancellationToken) {
        let schedules: Vec<(String, CronSchedule)> = self
            .runner
            .config()
            .workspaces
            .iter()
            .filter_map(|ws| match CronSchedule::parse(&ws.cron) {
                Ok(schedule) => Some((ws.id.clone(), schedule)),
                Err(e) => {
                    tracing::error!(workspace_id = %ws.id, error = %e, "workspace not scheduled");
                    None
                }
            })
            .collect();

        // Schedule time follows the runtime clock from one wall-clock reading.
        let wall_anchor = Utc::now();
        let anchor = tokio::time::Instant::now();
        let wall_now = || {
            wall_anchor
                + chrono::Duration::from_std(anchor.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero())
        };

        loop {
            let now = wall_now();
            let Some(next) = schedules.iter().filter_map(|(_, s)| s.next_after(now)).min() else {
                tracing::info!("no schedules to run");
                shutdown.cancelled().await;
                break;
            };
            let due: Vec<&str> = schedules
                .iter()
                .filter(|(_, s)| s.next_after(now) == Some(next))
                .map(|(id, _)| id.as_str())
                .collect();
            tracing::debug!(at = %next, workspaces = ?due, "next scheduled runs");

            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            for workspace_id in due {
                match self.trigger_scheduled(workspace_id).await {
                    Ok(run_id) => tracing::info!(%workspace_id, %run_id, "scheduled run started"),
                    Err(TriageError::RunInProgress { .. }) => {
                        tracing::warn!(%workspace_id, "previous run still in progress; skipping")
                    }
                    Err(e) => tracing::error!(%workspace_id, error = %e, "scheduled run not started"),
                }
            }
        }

        // In-flight runs stop at their next checkpoint and release their
        // leases before we return.
        self.registry.cancel_all();
        let pending = self.registry.pending();
        if !pending.is_empty() {
            tracing::info!(runs = pending.len(), "waiting for cancelled runs to finish");
            join_all(pending.into_iter().map(wait_for)).await;
        }
    }
}
