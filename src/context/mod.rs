//! Context provider: team knowledge and previous decisions for a workspace.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::WorkspaceConfig;
use crate::db::DbHandle;
use crate::errors::ContextError;
use crate::models::{HistoricalDecision, ProjectContext};

#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Fresh snapshot for one run. Unknown fields come back empty.
    async fn get_project_context(&self, workspace_id: &str) -> Result<ProjectContext, ContextError>;

    /// Previous decisions for the workspace, most recent first, at most `limit`.
    async fn get_review_history(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoricalDecision>, ContextError>;
}

/// Reads team knowledge from `[[workspaces]]` config and history from the
/// decision store.
pub struct ConfigContextProvider {
    workspaces: HashMap<String, WorkspaceConfig>,
    db: DbHandle,
}

impl ConfigContextProvider {
    pub fn new(workspaces: &[WorkspaceConfig], db: DbHandle) -> Self {
        Self {
            workspaces: workspaces
                .iter()
                .map(|w| (w.id.clone(), w.clone()))
                .collect(),
            db,
        }
    }
}

#[async_trait]
impl ContextProvider for ConfigContextProvider {
    async fn get_project_context(&self, workspace_id: &str) -> Result<ProjectContext, ContextError> {
        self.workspaces
            .get(workspace_id)
            .map(WorkspaceConfig::project_context)
            .ok_or_else(|| ContextError::UnknownWorkspace(workspace_id.to_string()))
    }

    async fn get_review_history(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoricalDecision>, ContextError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let workspace_id = workspace_id.to_string();
        self.db
            .call(move |db| db.review_history(&workspace_id, limit))
            .await
            .map_err(ContextError::History)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriageConfig;
    use crate::db::TriageDb;
    use crate::models::{Classification, Priority, TriagedItem, Verdict, fixtures};

    fn provider() -> anyhow::Result<ConfigContextProvider> {
        let config = TriageConfig::parse(
            r#"
            [[workspaces]]
            id = "acme"
            channel = "C1"
            repos = ["acme/api"]

            [workspaces.context]
            sprint_goals = ["billing v2"]
            on_call = "ana"
            "#,
        )?;
        let db = DbHandle::new(TriageDb::new_in_memory()?);
        Ok(ConfigContextProvider::new(&config.workspaces, db))
    }

    #[tokio::test]
    async fn unknown_workspace_is_an_error() -> anyhow::Result<()> {
        let provider = provider()?;
        let err = provider.get_project_context("nope").await.unwrap_err();
        assert!(matches!(err, ContextError::UnknownWorkspace(ref w) if w == "nope"));
        Ok(())
    }

    #[tokio::test]
    async fn context_fields_default_to_empty() -> anyhow::Result<()> {
        let provider = provider()?;
        let ctx = provider.get_project_context("acme").await?;
        assert_eq!(ctx.sprint_goals, vec!["billing v2"]);
        assert!(ctx.critical_paths.is_empty());
        assert!(ctx.focus_areas.is_empty());
        assert_eq!(ctx.missing_fields(), vec!["critical_paths"]);
        Ok(())
    }

    #[tokio::test]
    async fn history_is_bounded_and_recent_first() -> anyhow::Result<()> {
        let provider = provider()?;
        let first = TriagedItem::new(
            fixtures::issue(1, "one", &[]),
            Verdict {
                classification: Classification::Feature,
                priority: Priority::Low,
            },
            "no signal".into(),
        );
        let second = TriagedItem::new(
            fixtures::issue(2, "two", &[]),
            Verdict {
                classification: Classification::BugMinor,
                priority: Priority::Medium,
            },
            "label 'bug'".into(),
        );
        provider
            .db
            .call(move |db| {
                db.insert_triaged_items("r1", "acme", &[first])?;
                db.insert_triaged_items("r2", "acme", &[second])
            })
            .await?;

        let history = provider.get_review_history("acme", 1).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].classification, Classification::BugMinor);
        assert!(provider.get_review_history("acme", 0).await?.is_empty());
        Ok(())
    }
}
