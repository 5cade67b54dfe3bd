//! End-to-end pipeline runs against in-memory storage and fake adapters.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use triage::brief::DigestSynthesizer;
use triage::config::TriageConfig;
use triage::context::ConfigContextProvider;
use triage::db::{DbHandle, TriageDb};
use triage::delivery::{DeliveryChannel, MessageState};
use triage::errors::{DeliveryError, FetchError, TriageError};
use triage::feedback::FeedbackRecorder;
use triage::models::{
    DailyTriageBrief, GitHubItem, ItemType, TriageFeedback, TriagedItem, internal_item_id,
};
use triage::pipeline::state::{DeliveryOutcome, RunState, Trigger};
use triage::pipeline::{Agents, PipelineRunner, RunContext};
use triage::research::{FetchResult, ResearchCollector};
use triage::scheduler::Scheduler;
use triage::triage::RuleBasedOrchestrator;

fn issue(number: i64, title: &str, labels: &[&str]) -> GitHubItem {
    let now = Utc::now();
    let external_id = format!("{}", 5000 + number);
    GitHubItem {
        id: internal_item_id("github", &external_id),
        provider: "github".to_string(),
        external_id,
        repo: "acme/api".to_string(),
        number,
        item_type: ItemType::Issue,
        title: title.to_string(),
        description: format!("Details for #{}", number),
        url: format!("https://github.com/acme/api/issues/{}", number),
        author: "dana".to_string(),
        author_is_bot: false,
        assignees: BTreeSet::new(),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        is_open: true,
        created_at: now - Duration::hours(3),
        updated_at: now - Duration::hours(1),
        closed_at: None,
        pull_request: None,
    }
}

/// Returns the same result on every call. Optionally parks until released.
struct ScriptedCollector {
    result: FetchResult,
    calls: AtomicUsize,
    entered: Notify,
    gate: Option<Semaphore>,
}

impl ScriptedCollector {
    fn new(result: FetchResult) -> Self {
        Self {
            result,
            calls: AtomicUsize::new(0),
            entered: Notify::new(),
            gate: None,
        }
    }

    fn gated(result: FetchResult) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(result)
        }
    }

    fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }
}

#[async_trait]
impl ResearchCollector for ScriptedCollector {
    async fn fetch_recent_activity(
        &self,
        _since: DateTime<Utc>,
        _repos: &[String],
    ) -> Result<FetchResult, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        Ok(self.result.clone())
    }

    async fn enrich_item_context(&self, _item_id: &str) -> Result<String, FetchError> {
        Ok(String::new())
    }
}

struct NoFeedback;

#[async_trait]
impl FeedbackRecorder for NoFeedback {
    async fn record_feedback(&self, _feedback: TriageFeedback) {}
    async fn generate_optimization_suggestions(&self) -> Vec<String> {
        Vec::new()
    }
    async fn recent_feedback(&self, _workspace_id: &str) -> Vec<TriageFeedback> {
        Vec::new()
    }
}

/// Counts posts; fails every post when `down` is set.
#[derive(Default)]
struct RecordingChannel {
    briefs: AtomicUsize,
    alerts: AtomicUsize,
    down: bool,
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    async fn post_daily_brief(
        &self,
        _brief: &DailyTriageBrief,
        _items: &[TriagedItem],
        channel_id: &str,
    ) -> Result<String, DeliveryError> {
        if self.down {
            return Err(DeliveryError::Rejected("channel_not_found".into()));
        }
        let n = self.briefs.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}:1700000000.{:06}", channel_id, n))
    }

    async fn post_alert(
        &self,
        _item: &TriagedItem,
        _channel_id: &str,
        _thread_id: Option<&str>,
    ) -> Result<(), DeliveryError> {
        self.alerts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_message_state(
        &self,
        _message_id: &str,
        _state: MessageState,
    ) -> Result<(), DeliveryError> {
        Ok(())
    }
}

fn config() -> Arc<TriageConfig> {
    let mut config = TriageConfig::starter();
    config.github.repos = vec!["acme/api".to_string()];
    config.workspaces[0].id = "acme".to_string();
    config.workspaces[0].channel = "C1".to_string();
    config.workspaces[0].members = vec!["ana".to_string()];
    config.workspaces[0].context.sprint_goals = vec!["Ship billing exports".to_string()];
    Arc::new(config)
}

struct Harness {
    runner: PipelineRunner,
    db: DbHandle,
    collector: Arc<ScriptedCollector>,
    channel: Arc<RecordingChannel>,
}

fn harness(collector: ScriptedCollector, channel: RecordingChannel) -> anyhow::Result<Harness> {
    harness_with(config(), collector, channel)
}

fn harness_with(
    config: Arc<TriageConfig>,
    collector: ScriptedCollector,
    channel: RecordingChannel,
) -> anyhow::Result<Harness> {
    let db = DbHandle::new(TriageDb::new_in_memory()?);
    let collector = Arc::new(collector);
    let channel = Arc::new(channel);
    let agents = Agents {
        collector: collector.clone(),
        context: Arc::new(ConfigContextProvider::new(&config.workspaces, db.clone())),
        orchestrator: Arc::new(RuleBasedOrchestrator::new(config.triage.clone())),
        synthesizer: Arc::new(DigestSynthesizer),
        channel: channel.clone(),
        feedback: Arc::new(NoFeedback),
    };
    Ok(Harness {
        runner: PipelineRunner::new(config, agents, db.clone()),
        db,
        collector,
        channel,
    })
}

#[tokio::test]
async fn partial_fetch_still_delivers_a_marked_brief() -> anyhow::Result<()> {
    let mut result = FetchResult::complete(
        (1..=40)
            .map(|n| {
                let labels: &[&str] = if n % 10 == 0 { &["bug"] } else { &[] };
                issue(n, &format!("Item {}", n), labels)
            })
            .collect(),
    );
    result.mark_incomplete("acme/api partially fetched: rate limited");
    let h = harness(ScriptedCollector::new(result), RecordingChannel::default())?;

    let record = h.runner.run(&RunContext::new("acme"), Trigger::Scheduled).await;
    assert_eq!(record.state, RunState::Completed);
    assert!(record.incomplete);
    assert_eq!(record.item_count, 40);
    assert_eq!(record.delivery, Some(DeliveryOutcome::Posted));

    let brief_id = record.brief_id.clone().unwrap();
    let brief = h.db.call(move |db| db.get_brief(&brief_id)).await?.unwrap();
    assert!(brief.incomplete);
    assert!(brief.notes.iter().any(|n| n.starts_with("Partial data")));
    assert_eq!(brief.stats.total_open, 40);
    Ok(())
}

#[tokio::test]
async fn rerun_on_the_same_day_does_not_post_twice() -> anyhow::Result<()> {
    let items = vec![issue(1, "Checkout broken", &["bug"]), issue(2, "Docs typo", &[])];
    let h = harness(
        ScriptedCollector::new(FetchResult::complete(items)),
        RecordingChannel::default(),
    )?;

    let first = h.runner.run(&RunContext::new("acme"), Trigger::Scheduled).await;
    let second = h.runner.run(&RunContext::new("acme"), Trigger::Manual).await;

    assert_eq!(first.delivery, Some(DeliveryOutcome::Posted));
    assert_eq!(second.state, RunState::Completed);
    assert_eq!(second.delivery, Some(DeliveryOutcome::AlreadyDelivered));
    assert_eq!(first.brief_id, second.brief_id);
    assert_eq!(first.thread_id, second.thread_id);
    assert_eq!(h.channel.briefs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn new_critical_item_later_in_the_day_is_alerted_once() -> anyhow::Result<()> {
    let morning = harness(
        ScriptedCollector::new(FetchResult::complete(vec![issue(1, "Docs typo", &[])])),
        RecordingChannel::default(),
    )?;
    morning
        .runner
        .run(&RunContext::new("acme"), Trigger::Scheduled)
        .await;

    // Same storage and channel, new activity.
    let config = config();
    let collector = Arc::new(ScriptedCollector::new(FetchResult::complete(vec![
        issue(1, "Docs typo", &[]),
        issue(2, "Payments outage", &["outage"]),
    ])));
    let agents = Agents {
        collector,
        context: Arc::new(ConfigContextProvider::new(&config.workspaces, morning.db.clone())),
        orchestrator: Arc::new(RuleBasedOrchestrator::new(config.triage.clone())),
        synthesizer: Arc::new(DigestSynthesizer),
        channel: morning.channel.clone(),
        feedback: Arc::new(NoFeedback),
    };
    let afternoon = PipelineRunner::new(config, agents, morning.db.clone());
    let record = afternoon.run(&RunContext::new("acme"), Trigger::Manual).await;

    assert_eq!(record.state, RunState::Completed);
    assert_eq!(record.delivery, Some(DeliveryOutcome::AlertsOnly));
    assert_eq!(morning.channel.briefs.load(Ordering::SeqCst), 1);
    assert_eq!(morning.channel.alerts.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn failed_delivery_can_be_retried_from_the_stored_brief() -> anyhow::Result<()> {
    let items = vec![issue(1, "Token leak", &["security"])];
    let down = harness(
        ScriptedCollector::new(FetchResult::complete(items)),
        RecordingChannel {
            down: true,
            ..Default::default()
        },
    )?;
    let record = down.runner.run(&RunContext::new("acme"), Trigger::Scheduled).await;
    assert_eq!(record.state, RunState::Failed);
    assert_eq!(record.last_stage, RunState::Delivering);
    let brief_id = record.brief_id.clone().expect("brief survives failed delivery");

    let config = config();
    let channel = Arc::new(RecordingChannel::default());
    let agents = Agents {
        collector: down.collector.clone(),
        context: Arc::new(ConfigContextProvider::new(&config.workspaces, down.db.clone())),
        orchestrator: Arc::new(RuleBasedOrchestrator::new(config.triage.clone())),
        synthesizer: Arc::new(DigestSynthesizer),
        channel: channel.clone(),
        feedback: Arc::new(NoFeedback),
    };
    let recovered = Scheduler::new(Arc::new(PipelineRunner::new(config, agents, down.db.clone())));
    let receipt = recovered.redeliver(&brief_id).await?;
    assert_eq!(receipt.outcome, DeliveryOutcome::Posted);
    assert_eq!(channel.briefs.load(Ordering::SeqCst), 1);

    let again = recovered.redeliver(&brief_id).await?;
    assert_eq!(again.outcome, DeliveryOutcome::AlreadyDelivered);
    assert_eq!(channel.briefs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn busy_workspace_rejects_scheduled_and_joins_ad_hoc() -> anyhow::Result<()> {
    let h = harness(
        ScriptedCollector::gated(FetchResult::complete(vec![issue(1, "Flaky test", &["bug"])])),
        RecordingChannel::default(),
    )?;
    let collector = h.collector.clone();
    let scheduler = Arc::new(Scheduler::new(Arc::new(h.runner)));

    let run_id = scheduler.trigger_scheduled("acme").await?;
    collector.entered.notified().await;
    assert!(scheduler.registry().is_running("acme"));

    let err = scheduler.trigger_scheduled("acme").await.unwrap_err();
    assert!(matches!(err, TriageError::RunInProgress { ref workspace_id } if workspace_id == "acme"));

    let joiner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.trigger_ad_hoc("ana").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    collector.release();

    let record = joiner.await??;
    assert_eq!(record.run_id, run_id);
    assert_eq!(record.state, RunState::Completed);
    assert_eq!(record.trigger, Trigger::Scheduled);
    assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
    assert!(!scheduler.registry().is_running("acme"));
    Ok(())
}

/// Second runner over the same storage, as a separate `triage` process
/// would build it.
fn second_process(
    h: &Harness,
    collector: Arc<ScriptedCollector>,
    channel: Arc<RecordingChannel>,
) -> Scheduler {
    let config = config();
    let agents = Agents {
        collector,
        context: Arc::new(ConfigContextProvider::new(&config.workspaces, h.db.clone())),
        orchestrator: Arc::new(RuleBasedOrchestrator::new(config.triage.clone())),
        synthesizer: Arc::new(DigestSynthesizer),
        channel,
        feedback: Arc::new(NoFeedback),
    };
    Scheduler::new(Arc::new(PipelineRunner::new(config, agents, h.db.clone())))
}

#[tokio::test]
async fn workspace_lease_holds_across_schedulers_sharing_storage() -> anyhow::Result<()> {
    let h = harness(
        ScriptedCollector::gated(FetchResult::complete(vec![issue(1, "Flaky test", &["bug"])])),
        RecordingChannel::default(),
    )?;
    let other_collector = Arc::new(ScriptedCollector::new(FetchResult::complete(vec![issue(
        1,
        "Flaky test",
        &["bug"],
    )])));
    let cli = second_process(&h, other_collector.clone(), h.channel.clone());
    let collector = h.collector.clone();
    let channel = h.channel.clone();
    let serve = Arc::new(Scheduler::new(Arc::new(h.runner)));

    let run_id = serve.trigger_scheduled("acme").await?;
    collector.entered.notified().await;

    let err = cli.trigger_scheduled("acme").await.unwrap_err();
    assert!(matches!(err, TriageError::RunInProgress { .. }));
    assert!(matches!(
        cli.run_workspace("acme").await,
        Err(TriageError::RunInProgress { .. })
    ));
    assert_eq!(other_collector.calls.load(Ordering::SeqCst), 0);

    // An ad-hoc trigger from the other process waits for the leased run.
    let joiner = tokio::spawn(async move { cli.trigger_ad_hoc("ana").await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    collector.release();

    let record = joiner.await??;
    assert_eq!(record.run_id, run_id);
    assert_eq!(record.state, RunState::Completed);
    assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(other_collector.calls.load(Ordering::SeqCst), 0);
    assert_eq!(channel.briefs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn redelivery_is_refused_while_a_run_holds_the_workspace() -> anyhow::Result<()> {
    let h = harness(
        ScriptedCollector::gated(FetchResult::complete(vec![issue(1, "Token leak", &["security"])])),
        RecordingChannel {
            down: true,
            ..Default::default()
        },
    )?;
    h.collector.release();
    let first = h.runner.run(&RunContext::new("acme"), Trigger::Scheduled).await;
    assert_eq!(first.state, RunState::Failed);
    let brief_id = first.brief_id.clone().expect("brief survives failed delivery");
    h.collector.entered.notified().await;

    let working = Arc::new(RecordingChannel::default());
    let cli = second_process(
        &h,
        Arc::new(ScriptedCollector::new(FetchResult::default())),
        working.clone(),
    );
    let collector = h.collector.clone();
    let db = h.db.clone();
    let serve = Scheduler::new(Arc::new(h.runner));

    serve.trigger_scheduled("acme").await?;
    collector.entered.notified().await;

    let err = cli.redeliver(&brief_id).await.unwrap_err();
    assert!(matches!(err, TriageError::RunInProgress { ref workspace_id } if workspace_id == "acme"));
    assert_eq!(working.briefs.load(Ordering::SeqCst), 0);

    collector.release();
    for _ in 0..100 {
        if db.call(|db| db.run_lease("acme")).await?.is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let receipt = cli.redeliver(&brief_id).await?;
    assert_eq!(receipt.outcome, DeliveryOutcome::Posted);
    assert_eq!(working.briefs.load(Ordering::SeqCst), 1);
    assert!(db.call(|db| db.run_lease("acme")).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn ad_hoc_trigger_requires_membership() -> anyhow::Result<()> {
    let h = harness(
        ScriptedCollector::new(FetchResult::default()),
        RecordingChannel::default(),
    )?;
    let scheduler = Scheduler::new(Arc::new(h.runner));
    let err = scheduler.trigger_ad_hoc("mallory").await.unwrap_err();
    assert!(matches!(err, TriageError::NotAMember(ref u) if u == "mallory"));
    Ok(())
}

#[tokio::test]
async fn cancelled_run_stops_before_delivery() -> anyhow::Result<()> {
    let h = harness(
        ScriptedCollector::gated(FetchResult::complete(vec![issue(1, "Outage", &["outage"])])),
        RecordingChannel::default(),
    )?;
    let collector = h.collector.clone();
    let channel = h.channel.clone();
    let db = h.db.clone();
    let scheduler = Arc::new(Scheduler::new(Arc::new(h.runner)));

    let run_id = scheduler.trigger_scheduled("acme").await?;
    collector.entered.notified().await;
    assert_eq!(scheduler.cancel("acme"), Some(run_id.clone()));
    collector.release();

    // Wait for the slot to clear.
    for _ in 0..100 {
        if !scheduler.registry().is_running("acme") {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let lookup = run_id.clone();
    let record = db.call(move |db| db.get_run(&lookup)).await?.unwrap();
    assert_eq!(record.state, RunState::Failed);
    assert!(record.error.unwrap_or_default().contains("cancelled"));
    assert_eq!(channel.briefs.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cron_loop_skips_a_busy_workspace_and_drains_on_shutdown() -> anyhow::Result<()> {
    let mut every_minute = (*config()).clone();
    every_minute.workspaces[0].cron = "* * * * *".to_string();
    let h = harness_with(
        Arc::new(every_minute),
        ScriptedCollector::gated(FetchResult::complete(vec![issue(1, "Outage", &["outage"])])),
        RecordingChannel::default(),
    )?;
    let collector = h.collector.clone();
    let channel = h.channel.clone();
    let db = h.db.clone();
    let scheduler = Arc::new(Scheduler::new(Arc::new(h.runner)));
    let shutdown = CancellationToken::new();
    let cron_loop = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run_forever(shutdown).await })
    };

    // First tick starts a run that parks in fetch.
    collector.entered.notified().await;
    let active = scheduler.registry().active();
    assert_eq!(active.len(), 1);
    let run_id = active[0].run_id.clone();
    assert_eq!(active[0].trigger, Trigger::Scheduled);

    // Later ticks find the workspace busy and start nothing.
    tokio::time::sleep(std::time::Duration::from_secs(180)).await;
    assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.registry().active()[0].run_id, run_id);

    shutdown.cancel();
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    collector.release();
    cron_loop.await?;

    // The loop returns only once the cancelled run has finished.
    assert!(!scheduler.registry().is_running("acme"));
    let lookup = run_id.clone();
    let record = db.call(move |db| db.get_run(&lookup)).await?.unwrap();
    assert_eq!(record.state, RunState::Failed);
    assert!(record.error.unwrap_or_default().contains("cancelled"));
    assert_eq!(channel.briefs.load(Ordering::SeqCst), 0);
    assert!(db.call(|db| db.run_lease("acme")).await?.is_none());
    Ok(())
}
