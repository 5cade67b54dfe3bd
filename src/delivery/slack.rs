//! Slack Web API adapter.
//!
//! Briefs go out through `chat.postMessage` as Block Kit sections. Message
//! state is shown with a reaction on the brief since the original content
//! is not kept here.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{DeliveryChannel, MessageState, parse_thread_id, thread_id};
use crate::brief::render::{self, stats_line};
use crate::config::SlackSection;
use crate::errors::DeliveryError;
use crate::models::{DailyTriageBrief, TriagedItem};
use crate::retry::http_client;

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    error: Option<String>,
    ts: Option<String>,
    channel: Option<String>,
}

fn reaction_for(state: MessageState) -> Option<&'static str> {
    match state {
        MessageState::Delivered => None,
        MessageState::Acknowledged => Some("white_check_mark"),
        MessageState::Superseded => Some("arrows_counterclockwise"),
    }
}

fn mrkdwn_line(t: &TriagedItem) -> String {
    let mut line = format!(
        "<{}|{}#{}> {} · *{}* {}",
        t.item.url, t.item.repo, t.item.number, t.item.title, t.priority, t.classification
    );
    if let Some(assignee) = &t.suggested_assignee {
        line.push_str(&format!(" · suggested: {}", assignee));
    }
    line
}

/// Block Kit payload for a brief. Empty sections produce no blocks.
pub fn brief_blocks(brief: &DailyTriageBrief, items: &[TriagedItem]) -> Vec<Value> {
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {"type": "plain_text", "text": format!("Daily triage · {}", brief.date)}
        }),
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": brief.summary.iter().map(|b| format!("• {}", b)).collect::<Vec<_>>().join("\n")
            }
        }),
    ];
    for section in render::sections(brief, items) {
        let lines = section
            .items
            .iter()
            .map(|t| mrkdwn_line(t))
            .collect::<Vec<_>>()
            .join("\n");
        blocks.push(json!({"type": "divider"}));
        blocks.push(json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": format!("*{}*\n{}", section.title, lines)}
        }));
    }
    let mut context = vec![json!({"type": "mrkdwn", "text": stats_line(&brief.stats)})];
    context.extend(
        brief
            .notes
            .iter()
            .map(|n| json!({"type": "mrkdwn", "text": format!(":warning: {}", n)})),
    );
    blocks.push(json!({"type": "context", "elements": context}));
    blocks
}

pub struct SlackChannel {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl SlackChannel {
    pub fn new(section: &SlackSection, token: String) -> Self {
        Self {
            client: http_client(std::time::Duration::from_secs(section.request_timeout_secs.max(1))),
            api_base: section.api_base.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Build from config, reading the token from `section.token_env`.
    pub fn from_env(section: &SlackSection) -> Result<Self, DeliveryError> {
        let token = std::env::var(&section.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| DeliveryError::MissingToken(section.token_env.clone()))?;
        Ok(Self::new(section, token))
    }

    async fn call(&self, method: &str, payload: &Value) -> Result<SlackResponse, DeliveryError> {
        let resp = self
            .client
            .post(format!("{}/{}", self.api_base, method))
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            return Err(DeliveryError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(DeliveryError::Unreachable(format!("{} returned {}", method, status)));
        }
        if !status.is_success() {
            return Err(DeliveryError::Rejected(format!("{} returned {}", method, status)));
        }

        let body: SlackResponse = resp
            .json()
            .await
            .map_err(|e| DeliveryError::Rejected(format!("undecodable {} response: {}", method, e)))?;
        if body.ok {
            return Ok(body);
        }
        match body.error.as_deref() {
            Some("ratelimited") => Err(DeliveryError::RateLimited { retry_after: None }),
            Some(error) => Err(DeliveryError::Rejected(error.to_string())),
            None => Err(DeliveryError::Rejected(format!("{} failed", method))),
        }
    }
}

#[async_trait]
impl DeliveryChannel for SlackChannel {
    async fn post_daily_brief(
        &self,
        brief: &DailyTriageBrief,
        items: &[TriagedItem],
        channel_id: &str,
    ) -> Result<String, DeliveryError> {
        let payload = json!({
            "channel": channel_id,
            "text": render::plain_text(brief, items),
            "blocks": brief_blocks(brief, items),
            "unfurl_links": false,
        });
        let resp = self.call("chat.postMessage", &payload).await?;
        let ts = resp
            .ts
            .ok_or_else(|| DeliveryError::Rejected("chat.postMessage returned no ts".into()))?;
        let channel = resp.channel.unwrap_or_else(|| channel_id.to_string());
        Ok(thread_id(&channel, &ts))
    }

    async fn post_alert(
        &self,
        item: &TriagedItem,
        channel_id: &str,
        thread: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let mut payload = json!({
            "channel": channel_id,
            "text": format!(":rotating_light: {}", render::item_label(item)),
            "blocks": [{
                "type": "section",
                "text": {"type": "mrkdwn", "text": format!(":rotating_light: {}\n{}", mrkdwn_line(item), item.reasoning)}
            }],
        });
        if let Some(thread) = thread {
            let (_, ts) = parse_thread_id(thread)?;
            payload["thread_ts"] = json!(ts);
        }
        self.call("chat.postMessage", &payload).await?;
        Ok(())
    }

    async fn update_message_state(
        &self,
        message_id: &str,
        state: MessageState,
    ) -> Result<(), DeliveryError> {
        let (channel, ts) = parse_thread_id(message_id)?;
        let Some(reaction) = reaction_for(state) else {
            return Ok(());
        };
        let payload = json!({"channel": channel, "timestamp": ts, "name": reaction});
        match self.call("reactions.add", &payload).await {
            Err(DeliveryError::Rejected(e)) if e == "already_reacted" => Ok(()),
            other => other.map(|_| ()),
        }
    }
}
