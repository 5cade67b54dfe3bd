//! Delivery channel: posts briefs and alerts to a messaging surface.
//!
//! [`DeliveryChannel`] is the raw adapter. [`BriefDelivery`] sits in front of
//! it and owns the delivery ledger: one brief per (workspace, date), repeat
//! deliveries of the same brief are no-ops, and later briefs on the same day
//! only add threaded alerts for critical items not yet covered.

pub mod slack;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::db::DbHandle;
use crate::errors::DeliveryError;
use crate::models::{DailyTriageBrief, TriagedItem};
use crate::pipeline::state::DeliveryOutcome;
use crate::retry::{RetryPolicy, retry_with_backoff};

pub use slack::SlackChannel;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Delivered,
    Acknowledged,
    Superseded,
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Post the brief and return an opaque thread id for replies and
    /// [`update_message_state`](Self::update_message_state).
    async fn post_daily_brief(
        &self,
        brief: &DailyTriageBrief,
        items: &[TriagedItem],
        channel_id: &str,
    ) -> Result<String, DeliveryError>;

    /// Single-item notification, threaded under `thread_id` when given.
    async fn post_alert(
        &self,
        item: &TriagedItem,
        channel_id: &str,
        thread_id: Option<&str>,
    ) -> Result<(), DeliveryError>;

    async fn update_message_state(
        &self,
        message_id: &str,
        state: MessageState,
    ) -> Result<(), DeliveryError>;
}

/// Ledger row: the brief delivered for a workspace on a date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub workspace_id: String,
    pub date: NaiveDate,
    pub brief_id: String,
    pub thread_id: String,
    /// Every item referenced by the delivered brief.
    pub item_ids: Vec<String>,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub outcome: DeliveryOutcome,
    pub thread_id: String,
    pub alerts_posted: usize,
}

/// Split an opaque `"<channel>:<ts>"` thread id.
pub fn parse_thread_id(thread_id: &str) -> Result<(&str, &str), DeliveryError> {
    match thread_id.split_once(':') {
        Some((channel, ts)) if !channel.is_empty() && !ts.is_empty() => Ok((channel, ts)),
        _ => Err(DeliveryError::InvalidThreadId(thread_id.to_string())),
    }
}

pub fn thread_id(channel: &str, ts: &str) -> String {
    format!("{}:{}", channel, ts)
}

pub struct BriefDelivery {
    channel: Arc<dyn DeliveryChannel>,
    db: DbHandle,
    retry: RetryPolicy,
    /// Budget for one `deliver` call, retries included. Unbounded if unset.
    timeout: Option<Duration>,
}

impl BriefDelivery {
    pub fn new(channel: Arc<dyn DeliveryChannel>, db: DbHandle, retry: RetryPolicy) -> Self {
        Self {
            channel,
            db,
            retry,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn ledger_entry(
        &self,
        workspace_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DeliveryRecord>, DeliveryError> {
        let workspace_id = workspace_id.to_string();
        self.db
            .call(move |db| db.delivered_brief(&workspace_id, date))
            .await
            .map_err(DeliveryError::Ledger)
    }

    /// Deliver `brief` to `channel_id` at most once per (workspace, date).
    pub async fn deliver(
        &self,
        brief: &DailyTriageBrief,
        items: &[TriagedItem],
        channel_id: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        match self.ledger_entry(&brief.workspace_id, brief.date).await? {
            Some(previous) if previous.brief_id == brief.id => {
                tracing::info!(brief_id = %brief.id, "brief already delivered; skipping");
                Ok(DeliveryReceipt {
                    outcome: DeliveryOutcome::AlreadyDelivered,
                    thread_id: previous.thread_id,
                    alerts_posted: 0,
                })
            }
            Some(previous) => {
                self.deliver_alerts_only(brief, items, channel_id, previous, deadline)
                    .await
            }
            None => self.deliver_new(brief, items, channel_id, deadline).await,
        }
    }

    async fn deliver_new(
        &self,
        brief: &DailyTriageBrief,
        items: &[TriagedItem],
        channel_id: &str,
        deadline: Option<Instant>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let thread_id = retry_with_backoff(&self.retry, deadline, "post_daily_brief", || {
            self.channel.post_daily_brief(brief, items, channel_id)
        })
        .await
        .map_err(|e| e.into_inner())?;

        let record = DeliveryRecord {
            workspace_id: brief.workspace_id.clone(),
            date: brief.date,
            brief_id: brief.id.clone(),
            thread_id: thread_id.clone(),
            item_ids: brief.referenced_items().cloned().collect(),
            delivered_at: Utc::now(),
        };
        self.db
            .call(move |db| db.record_delivery(&record))
            .await
            .map_err(DeliveryError::Ledger)?;
        tracing::info!(brief_id = %brief.id, %thread_id, "brief delivered");

        Ok(DeliveryReceipt {
            outcome: DeliveryOutcome::Posted,
            thread_id,
            alerts_posted: 0,
        })
    }

    /// A different brief already went out today: thread alerts for critical
    /// items it did not cover, then mark the earlier message superseded.
    async fn deliver_alerts_only(
        &self,
        brief: &DailyTriageBrief,
        items: &[TriagedItem],
        channel_id: &str,
        previous: DeliveryRecord,
        deadline: Option<Instant>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let workspace_id = brief.workspace_id.clone();
        let date = brief.date;
        let alerted = self
            .db
            .call(move |db| db.alerted_items(&workspace_id, date))
            .await
            .map_err(DeliveryError::Ledger)?;
        let covered: HashSet<&str> = previous
            .item_ids
            .iter()
            .map(String::as_str)
            .chain(alerted.iter().map(String::as_str))
            .collect();

        let fresh: Vec<&TriagedItem> = brief
            .critical_alerts
            .iter()
            .filter(|id| !covered.contains(id.as_str()))
            .filter_map(|id| items.iter().find(|t| t.id() == id.as_str()))
            .collect();

        for item in &fresh {
            retry_with_backoff(&self.retry, deadline, "post_alert", || {
                self.channel
                    .post_alert(item, channel_id, Some(&previous.thread_id))
            })
            .await
            .map_err(|e| e.into_inner())?;

            let workspace_id = brief.workspace_id.clone();
            let item_id = item.id().to_string();
            let thread = previous.thread_id.clone();
            self.db
                .call(move |db| db.record_alert(&workspace_id, date, &item_id, &thread))
                .await
                .map_err(DeliveryError::Ledger)?;
        }

        if let Err(e) = self
            .channel
            .update_message_state(&previous.thread_id, MessageState::Superseded)
            .await
        {
            tracing::warn!(error = %e, thread_id = %previous.thread_id, "failed to mark earlier brief superseded");
        }
        tracing::info!(alerts = fresh.len(), thread_id = %previous.thread_id, "posted intraday alerts");

        Ok(DeliveryReceipt {
            outcome: DeliveryOutcome::AlertsOnly,
            thread_id: previous.thread_id,
            alerts_posted: fresh.len(),
        })
    }

    /// Mark a delivered brief acknowledged. Unknown thread ids are rejected.
    pub async fn acknowledge(&self, thread_id: &str) -> Result<(), DeliveryError> {
        parse_thread_id(thread_id)?;
        let lookup = thread_id.to_string();
        let known = self
            .db
            .call(move |db| db.delivery_by_thread(&lookup))
            .await
            .map_err(DeliveryError::Ledger)?;
        if known.is_none() {
            return Err(DeliveryError::InvalidThreadId(thread_id.to_string()));
        }
        self.channel
            .update_message_state(thread_id, MessageState::Acknowledged)
            .await
    }
}
