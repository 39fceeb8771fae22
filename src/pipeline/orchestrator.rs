//! The pipeline orchestrator: owns end-to-end sequencing for each issue,
//! sandbox lifetime, and every status transition.
//!
//! Submission creates the record and returns immediately; the run itself
//! executes as a detached task with a single top-level error boundary
//! that can only write the `failed` status and log. Stages within a run
//! are strictly sequential; runs for different issues are fully
//! concurrent and share nothing but the store.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::PipelineError;

use super::agent::CodeFixAgent;
use super::classifier::Classifier;
use super::hosting::CodeHost;
use super::models::{
    AiDecision, ChangedFile, ClassificationResult, Issue, IssuePatch, IssueStatus, IssueSubmission,
};
use super::notify::Notifier;
use super::sandbox::{Sandbox, SandboxProvider};
use super::store::IssueStore;

/// Validate a status transition against the pipeline state machine.
///
/// `failed` is reachable from any non-terminal state; everything else
/// moves strictly forward.
pub fn is_valid_transition(from: IssueStatus, to: IssueStatus) -> bool {
    use IssueStatus::*;
    if to == Failed {
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (Received, Classifying)
            | (Classifying, Notified)
            | (Classifying, Sandboxing)
            | (Sandboxing, Fixing)
            | (Fixing, PrOpened)
            | (Fixing, Notified)
            | (PrOpened, Merged)
    )
}

/// Registry of issues with a live run. Enforces the single-writer
/// invariant: at most one orchestrator run per issue identifier.
#[derive(Clone, Default)]
pub struct ActiveRuns(Arc<Mutex<HashSet<Uuid>>>);

impl ActiveRuns {
    pub async fn try_acquire(&self, id: Uuid) -> bool {
        self.0.lock().await.insert(id)
    }

    pub async fn release(&self, id: Uuid) {
        self.0.lock().await.remove(&id);
    }

    pub async fn is_active(&self, id: Uuid) -> bool {
        self.0.lock().await.contains(&id)
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn IssueStore>,
    classifier: Arc<dyn Classifier>,
    sandboxes: Arc<dyn SandboxProvider>,
    agent: Arc<dyn CodeFixAgent>,
    host: Arc<dyn CodeHost>,
    notifier: Arc<dyn Notifier>,
    active: ActiveRuns,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn IssueStore>,
        classifier: Arc<dyn Classifier>,
        sandboxes: Arc<dyn SandboxProvider>,
        agent: Arc<dyn CodeFixAgent>,
        host: Arc<dyn CodeHost>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            classifier,
            sandboxes,
            agent,
            host,
            notifier,
            active: ActiveRuns::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn IssueStore> {
        &self.store
    }

    /// Accept a validated submission: create the record, kick off the
    /// run, return the fresh record without waiting for the pipeline.
    pub async fn submit(&self, submission: IssueSubmission) -> Result<Issue, PipelineError> {
        let issue = Issue::new(submission);
        self.store.save(issue.clone()).await?;
        info!(issue_id = %issue.id, title = %issue.title, "Issue received");

        self.start_run(issue.id).await?;
        Ok(issue)
    }

    /// Spawn the detached run for an existing record. Rejected when a run
    /// for this identifier is already live.
    pub async fn start_run(&self, id: Uuid) -> Result<(), PipelineError> {
        if self.store.find_by_id(id).await?.is_none() {
            return Err(PipelineError::IssueNotFound { id });
        }
        if !self.active.try_acquire(id).await {
            return Err(PipelineError::AlreadyRunning { id });
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            // The only error boundary for the whole run: anything that
            // escapes the stages below becomes a `failed` record, never a
            // propagated error (the submitter already got its response).
            let outcome = AssertUnwindSafe(orchestrator.run_pipeline(id))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let message = format!("{:#}", e);
                    error!(issue_id = %id, error = %message, "Pipeline run failed");
                    orchestrator.mark_failed(id).await;
                }
                Err(_) => {
                    error!(issue_id = %id, "Pipeline run panicked");
                    orchestrator.mark_failed(id).await;
                }
            }
            orchestrator.active.release(id).await;
        });

        Ok(())
    }

    pub async fn is_running(&self, id: Uuid) -> bool {
        self.active.is_active(id).await
    }

    async fn run_pipeline(&self, id: Uuid) -> Result<(), PipelineError> {
        let issue = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(PipelineError::IssueNotFound { id })?;

        self.advance(id, IssueStatus::Classifying).await?;

        // Classification failure never fails the run: degrade to a
        // synthetic MANUAL decision and continue to notification.
        let classification = match self.classifier.classify(&issue).await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(issue_id = %id, error = %message, "Classification failed, degrading to MANUAL");
                ClassificationResult {
                    decision: AiDecision::Manual,
                    reason: format!("Classification unavailable: {}", message),
                    confidence: 0,
                }
            }
        };

        self.store
            .update(
                id,
                IssuePatch {
                    ai_decision: Some(classification.decision),
                    ai_reason: Some(classification.reason.clone()),
                    append_logs: vec![format!(
                        "Classified as {} (confidence {})",
                        classification.decision.as_str(),
                        classification.confidence
                    )],
                    ..IssuePatch::default()
                },
            )
            .await?;
        info!(
            issue_id = %id,
            decision = classification.decision.as_str(),
            confidence = classification.confidence,
            "Issue classified"
        );

        if classification.decision == AiDecision::Manual {
            return self.escalate(id).await;
        }

        // Automated path. The sandbox handle acquired here is owned by
        // this run alone and destroyed on every exit below.
        self.advance(id, IssueStatus::Sandboxing).await?;
        let mut sandbox = self.sandboxes.create(&issue.repo_url).await?;
        // Every path between create and destroy folds into `outcome`
        // below; no early return may bypass the destroy call.
        if let Err(e) = self
            .store
            .update(
                id,
                IssuePatch {
                    sandbox_id: Some(sandbox.id().to_string()),
                    ..IssuePatch::default()
                },
            )
            .await
        {
            warn!(issue_id = %id, error = %format!("{:#}", e), "Failed to record sandbox id");
        }

        let outcome = self.automated_stages(&issue, sandbox.as_mut()).await;

        let trailing = sandbox.take_logs();
        if !trailing.is_empty() {
            let _ = self.store.update(id, IssuePatch::logs(trailing)).await;
        }
        if let Err(e) = sandbox.destroy().await {
            warn!(issue_id = %id, error = %e, "Failed to destroy sandbox");
        }

        outcome
    }

    /// Clone → install → fix → re-read → submit. Runs with the sandbox
    /// borrowed; the caller owns destruction.
    async fn automated_stages(
        &self,
        issue: &Issue,
        sandbox: &mut dyn Sandbox,
    ) -> Result<(), PipelineError> {
        let id = issue.id;

        sandbox.clone_repo(&issue.repo_url).await?;
        sandbox.install_dependencies().await?;
        self.store
            .update(id, IssuePatch::logs(sandbox.take_logs()))
            .await?;

        self.advance(id, IssueStatus::Fixing).await?;
        let agent_result = self.agent.run(issue, sandbox).await;

        let mut logs = agent_result.transcript.clone();
        logs.extend(sandbox.take_logs());
        self.store.update(id, IssuePatch::logs(logs)).await?;

        if !agent_result.success || agent_result.files_changed.is_empty() {
            let reason = format!(
                "Agent failed: {}",
                agent_result
                    .error
                    .as_deref()
                    .unwrap_or("produced no file changes")
            );
            warn!(issue_id = %id, reason = %reason, "Escalating to manual review");
            self.store
                .update(
                    id,
                    IssuePatch {
                        ai_decision: Some(AiDecision::Manual),
                        ai_reason: Some(reason),
                        ..IssuePatch::default()
                    },
                )
                .await?;
            return self.escalate(id).await;
        }

        // Submission uses the actual post-write content re-read from the
        // sandbox; the agent's in-memory patch text is only trusted for
        // the human-readable summary.
        let mut files = Vec::new();
        for path in &agent_result.files_changed {
            match sandbox.read_file(path).await {
                Ok(content) => files.push(ChangedFile {
                    path: path.clone(),
                    content,
                }),
                Err(e) => {
                    warn!(issue_id = %id, path = %path, error = %e, "Dropping unreadable changed file from submission");
                    self.store
                        .update(
                            id,
                            IssuePatch::logs(vec![format!(
                                "Dropped from submission (re-read failed): {}",
                                path
                            )]),
                        )
                        .await?;
                }
            }
        }

        if files.is_empty() {
            // Every re-read failed; an empty submission would open a
            // no-op pull request, so treat this like an agent failure.
            self.store
                .update(
                    id,
                    IssuePatch {
                        ai_decision: Some(AiDecision::Manual),
                        ai_reason: Some(
                            "Agent failed: no changed file could be re-read from the sandbox"
                                .to_string(),
                        ),
                        ..IssuePatch::default()
                    },
                )
                .await?;
            return self.escalate(id).await;
        }

        let submission = self
            .host
            .submit_fix(issue, &files, &agent_result.commit_message, true)
            .await
            .map_err(|e| PipelineError::Submission(format!("{:#}", e)))?;

        self.advance(id, IssueStatus::PrOpened).await?;
        self.store
            .update(
                id,
                IssuePatch {
                    branch_name: Some(submission.branch_name.clone()),
                    pr_url: Some(submission.pr_url.clone()),
                    patch_summary: Some(agent_result.patch_summary.clone()),
                    commit_message: Some(agent_result.commit_message.clone()),
                    ..IssuePatch::default()
                },
            )
            .await?;

        if submission.merged {
            self.advance(id, IssueStatus::Merged).await?;
        }

        if let Ok(Some(latest)) = self.store.find_by_id(id).await
            && let Err(e) = self
                .notifier
                .fix_submitted(&latest, &submission.pr_url, submission.merged)
                .await
        {
            warn!(issue_id = %id, error = %format!("{:#}", e), "Failed to send fix notification");
        }

        info!(
            issue_id = %id,
            pr_url = %submission.pr_url,
            merged = submission.merged,
            "Pipeline complete"
        );
        Ok(())
    }

    /// Manual-review path: send the alert (best effort), then mark the
    /// record `notified`. A failed send never blocks the transition.
    async fn escalate(&self, id: Uuid) -> Result<(), PipelineError> {
        if let Ok(Some(latest)) = self.store.find_by_id(id).await
            && let Err(e) = self.notifier.manual_review(&latest).await
        {
            warn!(issue_id = %id, error = %format!("{:#}", e), "Failed to send manual review notification");
        }
        self.advance(id, IssueStatus::Notified).await
    }

    /// Sole writer of status transitions; single-writer-per-issue makes
    /// the read-validate-write here safe without a lock.
    async fn advance(&self, id: Uuid, to: IssueStatus) -> Result<(), PipelineError> {
        let current = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(PipelineError::IssueNotFound { id })?;
        if !is_valid_transition(current.status, to) {
            return Err(PipelineError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }
        self.store.update(id, IssuePatch::status(to)).await?;
        info!(issue_id = %id, from = %current.status, to = %to, "Status transition");
        Ok(())
    }

    /// Terminal failure write. Error detail stays in the server log; the
    /// polled record only ever shows the `failed` status.
    async fn mark_failed(&self, id: Uuid) {
        let current = match self.store.find_by_id(id).await {
            Ok(Some(issue)) => issue,
            Ok(None) => return,
            Err(e) => {
                error!(issue_id = %id, error = %format!("{:#}", e), "Cannot load issue to mark failed");
                return;
            }
        };
        if current.status.is_terminal() {
            warn!(issue_id = %id, status = %current.status, "Not overwriting terminal status with failed");
            return;
        }
        if let Err(e) = self
            .store
            .update(id, IssuePatch::status(IssueStatus::Failed))
            .await
        {
            error!(issue_id = %id, error = %format!("{:#}", e), "Failed to persist failed status");
        }
    }
}
