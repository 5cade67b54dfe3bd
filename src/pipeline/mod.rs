//! One triage run, end to end.
//!
//! `Idle → Fetching → Analyzing → Synthesizing → Delivering → Completed`.
//! Research and context are fetched concurrently and joined before
//! analysis starts. Every transition is persisted, so a failed run keeps
//! whatever it had computed: decisions and the brief are written before
//! delivery is attempted.

pub mod state;

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::brief::{BriefScope, BriefSynthesizer};
use crate::config::{TriageConfig, WorkspaceConfig};
use crate::context::ContextProvider;
use crate::db::DbHandle;
use crate::delivery::{BriefDelivery, DeliveryChannel, DeliveryReceipt};
use crate::errors::TriageError;
use crate::feedback::FeedbackRecorder;
use crate::models::{DailyTriageBrief, GitHubItem, ProjectContext, TriagedItem};
use crate::research::ResearchCollector;
use crate::triage::TriageAgent;

use state::{RunRecord, RunState, Trigger};

/// Explicit per-run context handed to every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub workspace_id: String,
    pub cancel: CancellationToken,
    pub span: tracing::Span,
}

impl RunContext {
    pub fn new(workspace_id: &str) -> Self {
        Self::with_cancel(workspace_id, CancellationToken::new())
    }

    pub fn with_cancel(workspace_id: &str, cancel: CancellationToken) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("triage_run", run_id = %run_id, workspace_id = %workspace_id);
        Self {
            run_id,
            workspace_id: workspace_id.to_string(),
            cancel,
            span,
        }
    }

    /// Fail with `Cancelled` if the run was cancelled before `stage`.
    fn checkpoint(&self, stage: RunState) -> Result<(), TriageError> {
        if self.cancel.is_cancelled() {
            return Err(TriageError::Cancelled {
                run_id: self.run_id.clone(),
                stage: stage.to_string(),
            });
        }
        Ok(())
    }
}

/// The agents a run is composed of. Built once at startup.
#[derive(Clone)]
pub struct Agents {
    pub collector: Arc<dyn ResearchCollector>,
    pub context: Arc<dyn ContextProvider>,
    pub orchestrator: Arc<dyn TriageAgent>,
    pub synthesizer: Arc<dyn BriefSynthesizer>,
    pub channel: Arc<dyn DeliveryChannel>,
    pub feedback: Arc<dyn FeedbackRecorder>,
}

pub struct PipelineRunner {
    config: Arc<TriageConfig>,
    agents: Agents,
    delivery: BriefDelivery,
    db: DbHandle,
}

impl PipelineRunner {
    pub fn new(config: Arc<TriageConfig>, agents: Agents, db: DbHandle) -> Self {
        let delivery = BriefDelivery::new(agents.channel.clone(), db.clone(), config.slack.retry.clone())
            .with_timeout(std::time::Duration::from_secs(config.slack.delivery_timeout_secs));
        Self {
            config,
            agents,
            delivery,
            db,
        }
    }

    pub fn config(&self) -> &TriageConfig {
        &self.config
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn delivery(&self) -> &BriefDelivery {
        &self.delivery
    }

    pub fn feedback(&self) -> &Arc<dyn FeedbackRecorder> {
        &self.agents.feedback
    }

    /// Execute one run. Failures end in a persisted `Failed` record rather
    /// than an error; the record's `error` says why.
    pub async fn run(&self, ctx: &RunContext, trigger: Trigger) -> RunRecord {
        let mut record = RunRecord::new(&ctx.run_id, &ctx.workspace_id, trigger);
        let result = async {
            self.persist(&record).await?;
            tracing::info!(trigger = record.trigger.label(), "run started");
            self.execute(ctx, &mut record).await
        }
        .instrument(ctx.span.clone())
        .await;

        if let Err(e) = result {
            record.fail(e.to_string());
            if let Err(persist) = self.persist(&record).await {
                ctx.span.in_scope(|| tracing::error!(error = %persist, "failed to persist failed run"));
            }
            ctx.span.in_scope(|| {
                tracing::error!(stage = %record.last_stage, error = %e, "run failed");
            });
        } else {
            ctx.span.in_scope(|| {
                tracing::info!(
                    items = record.item_count,
                    incomplete = record.incomplete,
                    delivery = ?record.delivery,
                    "run completed"
                );
            });
        }
        record
    }

    async fn persist(&self, record: &RunRecord) -> Result<(), TriageError> {
        let record = record.clone();
        self.db.call(move |db| db.upsert_run(&record)).await?;
        Ok(())
    }

    async fn transition(&self, record: &mut RunRecord, to: RunState) -> Result<(), TriageError> {
        record.advance(to).map_err(|e| TriageError::Other(anyhow::anyhow!(e)))?;
        self.persist(record).await?;
        tracing::info!(state = %to, "run state changed");
        Ok(())
    }

    fn workspace(&self, workspace_id: &str) -> Result<&WorkspaceConfig, TriageError> {
        self.config
            .workspace(workspace_id)
            .ok_or_else(|| TriageError::UnknownWorkspace(workspace_id.to_string()))
    }

    async fn execute(&self, ctx: &RunContext, record: &mut RunRecord) -> Result<(), TriageError> {
        let workspace = self.workspace(&ctx.workspace_id)?;
        let settings = &self.config.triage;

        self.transition(record, RunState::Fetching).await?;
        let window_start = Utc::now() - Duration::hours(settings.lookback_hours);
        let repos = self.config.repos_for(workspace);
        let (fetched, context, history) = tokio::join!(
            self.agents.collector.fetch_recent_activity(window_start, &repos),
            self.agents.context.get_project_context(&workspace.id),
            self.agents
                .context
                .get_review_history(&workspace.id, settings.history_limit),
        );

        let fetched = fetched?;
        if fetched.incomplete && fetched.items.is_empty() {
            return Err(TriageError::NothingFetched(
                fetched.note.unwrap_or_else(|| "no pages were read".to_string()),
            ));
        }
        record.incomplete = fetched.incomplete;
        if let Some(note) = &fetched.note {
            tracing::warn!(note = %note, fetched = fetched.items.len(), "fetch incomplete");
        }

        let context = context.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "context unavailable; using defaults");
            ProjectContext::empty(&workspace.id)
        });
        let history = history.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "review history unavailable");
            Vec::new()
        });
        let context = context.with_history(history);
        let items = self.prepare(fetched.items).await;

        ctx.checkpoint(RunState::Analyzing)?;
        self.transition(record, RunState::Analyzing).await?;
        let triaged = self.analyze(items, &context).await;
        record.item_count = triaged.len();
        {
            let (run_id, workspace_id, rows) =
                (ctx.run_id.clone(), workspace.id.clone(), triaged.clone());
            self.db
                .call(move |db| db.insert_triaged_items(&run_id, &workspace_id, &rows))
                .await?;
        }

        ctx.checkpoint(RunState::Synthesizing)?;
        self.transition(record, RunState::Synthesizing).await?;
        let scope = BriefScope {
            run_id: ctx.run_id.clone(),
            date: Utc::now().date_naive(),
            window_start,
            incomplete: fetched.incomplete,
            fetch_note: fetched.note,
        };
        let brief = self
            .agents
            .synthesizer
            .generate_daily_brief(&triaged, &context, &scope);
        {
            let brief = brief.clone();
            self.db.call(move |db| db.save_brief(&brief)).await?;
        }
        record.brief_id = Some(brief.id.clone());
        self.persist(record).await?;

        ctx.checkpoint(RunState::Delivering)?;
        self.transition(record, RunState::Delivering).await?;
        let receipt = self
            .delivery
            .deliver(&brief, &triaged, &workspace.channel)
            .await?;
        record.thread_id = Some(receipt.thread_id);
        record.delivery = Some(receipt.outcome);

        self.transition(record, RunState::Completed).await
    }

    /// Drop malformed items, then fill empty descriptions from discussion
    /// for up to `github.enrich_limit` items.
    async fn prepare(&self, items: Vec<GitHubItem>) -> Vec<GitHubItem> {
        let mut valid: Vec<GitHubItem> = items
            .into_iter()
            .filter(|item| match item.validate() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "excluding malformed item");
                    false
                }
            })
            .collect();

        let limit = self.config.github.enrich_limit;
        let collector = &self.agents.collector;
        let lookups = valid
            .iter_mut()
            .filter(|i| i.description.trim().is_empty())
            .take(limit)
            .map(|item| async move {
                match collector.enrich_item_context(&item.id).await {
                    Ok(text) => item.description = text,
                    Err(e) => {
                        tracing::debug!(item_id = %item.id, error = %e, "enrichment skipped")
                    }
                }
            });
        join_all(lookups).await;
        valid
    }

    /// Decide every item, then adjust for recent feedback.
    async fn analyze(&self, items: Vec<GitHubItem>, context: &ProjectContext) -> Vec<TriagedItem> {
        let orchestrator = &self.agents.orchestrator;
        let triaged = orchestrator.analyze_and_triage(items, context);
        let feedback = self.agents.feedback.recent_feedback(&context.workspace_id).await;
        if feedback.is_empty() {
            return triaged;
        }
        triaged
            .iter()
            .map(|t| orchestrator.recalibrate_priority(t, &feedback))
            .collect()
    }

    /// Load a brief computed by an earlier run together with its items.
    pub async fn load_brief(
        &self,
        brief_id: &str,
    ) -> Result<(DailyTriageBrief, Vec<TriagedItem>), TriageError> {
        let lookup = brief_id.to_string();
        Ok(self
            .db
            .call(move |db| {
                let brief = db
                    .get_brief(&lookup)?
                    .ok_or_else(|| anyhow::anyhow!("Brief {} not found", lookup))?;
                let items = db.triaged_items_for_run(&brief.run_id)?;
                Ok((brief, items))
            })
            .await?)
    }

    /// Deliver a stored brief, e.g. after its run's delivery failed. Goes
    /// through the same ledger as a normal run. Callers hold the
    /// workspace lease, see [`Scheduler::redeliver`](crate::scheduler::Scheduler::redeliver).
    pub async fn deliver_brief(
        &self,
        brief: &DailyTriageBrief,
        items: &[TriagedItem],
    ) -> Result<DeliveryReceipt, TriageError> {
        let workspace = self.workspace(&brief.workspace_id)?;
        Ok(self
            .delivery
            .deliver(brief, items, &workspace.channel)
            .await?)
    }
}
