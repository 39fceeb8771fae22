//! Issue record storage.
//!
//! The orchestrator depends only on the `IssueStore` trait, so the
//! in-memory map used here can be swapped for a durable backend at
//! composition time without touching any pipeline logic.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::{Issue, IssuePatch, timestamp};

#[async_trait]
pub trait IssueStore: Send + Sync {
    async fn save(&self, issue: Issue) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Issue>>;

    /// Merge a partial update into the record. All-or-nothing per call:
    /// either every provided field lands (and `updated_at` is refreshed)
    /// or, for an absent id, nothing happens and `None` is returned.
    async fn update(&self, id: Uuid, patch: IssuePatch) -> Result<Option<Issue>>;

    /// All records, newest first.
    async fn list_all(&self) -> Result<Vec<Issue>>;

    async fn count(&self) -> Result<usize>;
}

/// Process-local store backing the reference deployment. Survival across
/// restarts is an explicit non-goal.
#[derive(Default)]
pub struct InMemoryIssueStore {
    records: RwLock<HashMap<Uuid, Issue>>,
}

impl InMemoryIssueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn IssueStore> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl IssueStore for InMemoryIssueStore {
    async fn save(&self, issue: Issue) -> Result<()> {
        self.records.write().await.insert(issue.id, issue);
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Issue>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update(&self, id: Uuid, patch: IssuePatch) -> Result<Option<Issue>> {
        let mut records = self.records.write().await;
        let Some(issue) = records.get_mut(&id) else {
            return Ok(None);
        };

        if let Some(status) = patch.status {
            issue.status = status;
        }
        if let Some(decision) = patch.ai_decision {
            issue.ai_decision = Some(decision);
        }
        if let Some(reason) = patch.ai_reason {
            issue.ai_reason = Some(reason);
        }
        if let Some(sandbox_id) = patch.sandbox_id {
            issue.sandbox_id = Some(sandbox_id);
        }
        if let Some(branch) = patch.branch_name {
            issue.branch_name = Some(branch);
        }
        if let Some(pr_url) = patch.pr_url {
            issue.pr_url = Some(pr_url);
        }
        if let Some(summary) = patch.patch_summary {
            issue.patch_summary = Some(summary);
        }
        if let Some(message) = patch.commit_message {
            issue.commit_message = Some(message);
        }
        issue.logs.extend(patch.append_logs);
        issue.updated_at = timestamp();

        Ok(Some(issue.clone()))
    }

    async fn list_all(&self) -> Result<Vec<Issue>> {
        let mut issues: Vec<Issue> = self.records.read().await.values().cloned().collect();
        issues.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(issues)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }
}
