//! Configuration loaded from `triage.toml`.
//!
//! Secrets never live in the file: `github.token_env` and `slack.token_env`
//! name the environment variables that hold them (a `.env` file is loaded
//! first, see [`load_dotenv`]).
//!
//! # Configuration File Format
//!
//! ```toml
//! [github]
//! repos = ["acme/api"]
//! fetch_timeout_secs = 120
//!
//! [triage]
//! stale_after_days = 14
//! lookback_hours = 24
//!
//! [storage]
//! db_path = ".triage/triage.db"
//!
//! [[workspaces]]
//! id = "acme"
//! channel = "C0123456"
//! cron = "0 9 * * 1-5"
//! members = ["ana", "ben"]
//!
//! [workspaces.context]
//! sprint_goals = ["ship usage-based billing"]
//! critical_paths = ["billing", "auth"]
//! on_call = "ana"
//!
//! [workspaces.context.focus_areas]
//! ben = ["auth", "security"]
//!
//! [workspaces.context.preferences]
//! mute_low_priority = true
//! watched_labels = ["customer-reported"]
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{ProjectContext, UserPreferences};
use crate::retry::RetryPolicy;
use crate::scheduler::cron::CronSchedule;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "triage.toml";

/// Load `.env` from the working directory if present. Missing file is fine.
pub fn load_dotenv() {
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        tracing::warn!(error = %e, "failed to load .env file");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
    /// Repos scanned when a workspace does not list its own.
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Total wall-clock budget for one fetch, retries and backoff included.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Budget for a single HTTP request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum number of items whose comments are pulled in to fill an
    /// empty description.
    #[serde(default = "default_enrich_limit")]
    pub enrich_limit: usize,
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_per_page() -> u32 {
    100
}

fn default_fetch_timeout_secs() -> u64 {
    120
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_enrich_limit() -> usize {
    10
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_base: default_github_api_base(),
            token_env: default_github_token_env(),
            repos: Vec::new(),
            per_page: default_per_page(),
            retry: RetryPolicy::default(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            enrich_limit: default_enrich_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackSection {
    #[serde(default = "default_slack_api_base")]
    pub api_base: String,
    #[serde(default = "default_slack_token_env")]
    pub token_env: String,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Budget for delivering one brief or one alert, retries included.
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

fn default_delivery_timeout_secs() -> u64 {
    120
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".to_string()
}

fn default_slack_token_env() -> String {
    "SLACK_BOT_TOKEN".to_string()
}

impl Default for SlackSection {
    fn default() -> Self {
        Self {
            api_base: default_slack_api_base(),
            token_env: default_slack_token_env(),
            retry: RetryPolicy::default(),
            request_timeout_secs: default_request_timeout_secs(),
            delivery_timeout_secs: default_delivery_timeout_secs(),
        }
    }
}

/// Policy knobs for the orchestrator and the feedback loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriageSection {
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: i64,
    /// Lookback window of one run.
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    /// Previous decisions handed to the orchestrator.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Trailing number of runs whose feedback is aggregated.
    #[serde(default = "default_feedback_window_runs")]
    pub feedback_window_runs: usize,
    /// Events needed before a (user, classification) pattern counts.
    #[serde(default = "default_min_feedback_events")]
    pub min_feedback_events: usize,
    #[serde(default = "default_dismissal_rate_threshold")]
    pub dismissal_rate_threshold: f64,
    #[serde(default = "default_engagement_rate_threshold")]
    pub engagement_rate_threshold: f64,
}

fn default_stale_after_days() -> i64 {
    14
}

fn default_lookback_hours() -> i64 {
    24
}

fn default_history_limit() -> usize {
    20
}

fn default_feedback_window_runs() -> usize {
    10
}

fn default_min_feedback_events() -> usize {
    3
}

fn default_dismissal_rate_threshold() -> f64 {
    0.6
}

fn default_engagement_rate_threshold() -> f64 {
    0.8
}

impl Default for TriageSection {
    fn default() -> Self {
        Self {
            stale_after_days: default_stale_after_days(),
            lookback_hours: default_lookback_hours(),
            history_limit: default_history_limit(),
            feedback_window_runs: default_feedback_window_runs(),
            min_feedback_events: default_min_feedback_events(),
            dismissal_rate_threshold: default_dismissal_rate_threshold(),
            engagement_rate_threshold: default_engagement_rate_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Age after which a workspace lease is assumed abandoned by a crashed
    /// process and may be taken over.
    #[serde(default = "default_run_lease_secs")]
    pub run_lease_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".triage/triage.db")
}

fn default_run_lease_secs() -> u64 {
    3600
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_lease_secs: default_run_lease_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written to a daily rolling file here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3142
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Team knowledge for one workspace as written in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextSection {
    #[serde(default)]
    pub sprint_goals: Vec<String>,
    #[serde(default)]
    pub critical_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_call: Option<String>,
    #[serde(default)]
    pub focus_areas: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub preferences: UserPreferences,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceConfig {
    pub id: String,
    /// Delivery channel identifier.
    pub channel: String,
    /// Standard 5-field cron expression, evaluated in UTC.
    #[serde(default = "default_cron")]
    pub cron: String,
    /// Repos for this workspace; empty means the `[github]` repos.
    #[serde(default)]
    pub repos: Vec<String>,
    /// Users allowed to trigger ad-hoc runs.
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub context: ContextSection,
}

fn default_cron() -> String {
    "0 9 * * 1-5".to_string()
}

impl WorkspaceConfig {
    /// Fresh snapshot of this workspace's context.
    pub fn project_context(&self) -> ProjectContext {
        ProjectContext {
            workspace_id: self.id.clone(),
            sprint_goals: self.context.sprint_goals.clone(),
            critical_paths: self.context.critical_paths.clone(),
            on_call: self.context.on_call.clone(),
            focus_areas: self.context.focus_areas.clone(),
            preferences: self.context.preferences.clone(),
            history: Vec::new(),
        }
    }
}

/// The complete triage.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub slack: SlackSection,
    #[serde(default)]
    pub triage: TriageSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceConfig>,
}

impl TriageConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse triage.toml")
    }

    /// Load from `path`, or fall back to defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize triage.toml")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Starter configuration written by `triage config init`.
    pub fn starter() -> Self {
        Self {
            github: GitHubSection {
                repos: vec!["owner/repo".to_string()],
                ..Default::default()
            },
            workspaces: vec![WorkspaceConfig {
                id: "default".to_string(),
                channel: "C0000000000".to_string(),
                cron: default_cron(),
                repos: Vec::new(),
                members: Vec::new(),
                context: ContextSection::default(),
            }],
            ..Default::default()
        }
    }

    pub fn workspace(&self, id: &str) -> Option<&WorkspaceConfig> {
        self.workspaces.iter().find(|w| w.id == id)
    }

    /// First workspace listing `user_id` as a member.
    pub fn workspace_for_member(&self, user_id: &str) -> Option<&WorkspaceConfig> {
        self.workspaces
            .iter()
            .find(|w| w.members.iter().any(|m| m == user_id))
    }

    /// Repos scanned for a workspace.
    pub fn repos_for(&self, workspace: &WorkspaceConfig) -> Vec<String> {
        if workspace.repos.is_empty() {
            self.github.repos.clone()
        } else {
            workspace.repos.clone()
        }
    }

    /// Check the configuration. Errors make runs fail or misbehave and
    /// stop `run` and `serve` from starting; warnings are only reported.
    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();

        if self.triage.stale_after_days <= 0 {
            report.errors.push(format!(
                "stale_after_days must be positive, got {}",
                self.triage.stale_after_days
            ));
        }
        if self.triage.lookback_hours <= 0 {
            report.errors.push(format!(
                "lookback_hours must be positive, got {}",
                self.triage.lookback_hours
            ));
        }
        for (name, rate) in [
            ("dismissal_rate_threshold", self.triage.dismissal_rate_threshold),
            ("engagement_rate_threshold", self.triage.engagement_rate_threshold),
        ] {
            if !(0.0..=1.0).contains(&rate) || rate == 0.0 {
                report.errors.push(format!("{} must be in (0, 1], got {}", name, rate));
            }
        }
        for (name, value) in [
            ("min_feedback_events", self.triage.min_feedback_events),
            ("feedback_window_runs", self.triage.feedback_window_runs),
        ] {
            if value == 0 {
                report.errors.push(format!("{} must be at least 1", name));
            }
        }
        for (name, secs) in [
            ("github.fetch_timeout_secs", self.github.fetch_timeout_secs),
            ("slack.delivery_timeout_secs", self.slack.delivery_timeout_secs),
            ("storage.run_lease_secs", self.storage.run_lease_secs),
        ] {
            if secs == 0 {
                report.errors.push(format!("{} must be positive", name));
            }
        }
        if self.github.per_page == 0 || self.github.per_page > 100 {
            report.warnings.push(format!(
                "github.per_page must be between 1 and 100, got {} (clamped)",
                self.github.per_page
            ));
        }

        let mut seen = HashSet::new();
        for ws in &self.workspaces {
            if !seen.insert(ws.id.as_str()) {
                report.errors.push(format!("Duplicate workspace id '{}'", ws.id));
            }
            if let Err(e) = CronSchedule::parse(&ws.cron) {
                report.errors.push(format!("Workspace '{}': {}", ws.id, e));
            }
            if ws.channel.trim().is_empty() {
                report
                    .errors
                    .push(format!("Workspace '{}' has no delivery channel", ws.id));
            }
            if self.repos_for(ws).is_empty() {
                report.warnings.push(format!(
                    "Workspace '{}' has no repos (set workspaces.repos or github.repos)",
                    ws.id
                ));
            }
        }

        report
    }
}

/// Outcome of [`TriageConfig::validate`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
        [github]
        repos = ["acme/api", "acme/web"]

        [triage]
        stale_after_days = 10

        [[workspaces]]
        id = "acme"
        channel = "C123"
        members = ["ana"]

        [workspaces.context]
        critical_paths = ["billing"]
        on_call = "ana"

        [workspaces.context.focus_areas]
        ben = ["auth"]

        [workspaces.context.preferences]
        watched_labels = ["customer"]
    "#;

    #[test]
    fn test_parse_applies_defaults() {
        let config = TriageConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.triage.stale_after_days, 10);
        assert_eq!(config.triage.lookback_hours, 24);
        assert_eq!(config.github.per_page, 100);
        assert_eq!(config.github.token_env, "GITHUB_TOKEN");
        let ws = config.workspace("acme").unwrap();
        assert_eq!(ws.cron, "0 9 * * 1-5");
        assert!(ws.context.preferences.watched_labels.contains("customer"));
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = TriageConfig::parse("").unwrap();
        assert!(config.workspaces.is_empty());
        assert_eq!(config.storage.db_path, PathBuf::from(".triage/triage.db"));
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_workspace_falls_back_to_global_repos() {
        let config = TriageConfig::parse(SAMPLE).unwrap();
        let ws = config.workspace("acme").unwrap();
        assert_eq!(config.repos_for(ws), vec!["acme/api", "acme/web"]);
    }

    #[test]
    fn test_workspace_for_member() {
        let config = TriageConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.workspace_for_member("ana").unwrap().id, "acme");
        assert!(config.workspace_for_member("zed").is_none());
    }

    #[test]
    fn test_project_context_snapshot() {
        let config = TriageConfig::parse(SAMPLE).unwrap();
        let ctx = config.workspace("acme").unwrap().project_context();
        assert_eq!(ctx.workspace_id, "acme");
        assert_eq!(ctx.on_call.as_deref(), Some("ana"));
        assert!(ctx.sprint_goals.is_empty());
        assert!(ctx.focus_areas["ben"].contains("auth"));
    }

    #[test]
    fn test_validate_flags_bad_cron_and_duplicates() {
        let mut config = TriageConfig::parse(SAMPLE).unwrap();
        let mut dup = config.workspaces[0].clone();
        dup.cron = "every day".to_string();
        config.workspaces.push(dup);
        let report = config.validate();
        assert!(report.errors.iter().any(|e| e.contains("Duplicate workspace id")));
        assert!(report.errors.iter().any(|e| e.contains("cron")));
    }

    #[test]
    fn test_validate_separates_errors_from_warnings() {
        let mut config = TriageConfig::parse(SAMPLE).unwrap();
        config.triage.lookback_hours = -24;
        config.triage.min_feedback_events = 0;
        config.github.repos.clear();
        let report = config.validate();
        assert!(report.errors.iter().any(|e| e.contains("lookback_hours")));
        assert!(report.errors.iter().any(|e| e.contains("min_feedback_events")));
        assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("has no repos"));
    }

    #[test]
    fn test_validate_clean_config() {
        let config = TriageConfig::parse(SAMPLE).unwrap();
        let report = config.validate();
        assert!(report.is_clean(), "{:?}", report);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("triage.toml");
        let config = TriageConfig::starter();
        config.save(&path).unwrap();
        let loaded = TriageConfig::load(&path).unwrap();
        assert_eq!(loaded.workspaces.len(), 1);
        assert_eq!(loaded.github.repos, vec!["owner/repo"]);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = TriageConfig::load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert!(config.workspaces.is_empty());
    }
}
