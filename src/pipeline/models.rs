use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current position of an issue in the resolution pipeline.
///
/// `Merged`, `Notified` and `Failed` are terminal. `PrOpened` is
/// pipeline-complete but not terminal: a human may still merge the PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Received,
    Classifying,
    Sandboxing,
    Fixing,
    PrOpened,
    Merged,
    Notified,
    Failed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Classifying => "classifying",
            Self::Sandboxing => "sandboxing",
            Self::Fixing => "fixing",
            Self::PrOpened => "pr_opened",
            Self::Merged => "merged",
            Self::Notified => "notified",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Notified | Self::Failed)
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "classifying" => Ok(Self::Classifying),
            "sandboxing" => Ok(Self::Sandboxing),
            "fixing" => Ok(Self::Fixing),
            "pr_opened" => Ok(Self::PrOpened),
            "merged" => Ok(Self::Merged),
            "notified" => Ok(Self::Notified),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// Triage decision for an issue: fix automatically or hand to a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiDecision {
    Automated,
    Manual,
}

impl AiDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automated => "AUTOMATED",
            Self::Manual => "MANUAL",
        }
    }
}

impl FromStr for AiDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTOMATED" => Ok(Self::Automated),
            "MANUAL" => Ok(Self::Manual),
            _ => Err(format!("Invalid decision: {}", s)),
        }
    }
}

/// Result of classifying an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub decision: AiDecision,
    pub reason: String,
    /// 0-100, 0 for synthetic fallback classifications.
    pub confidence: u8,
}

/// A submitted bug report and its entire resolution lifecycle.
///
/// Input fields are immutable after creation; pipeline fields are mutated
/// exclusively by the orchestrator as the run progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub steps_to_reproduce: String,
    pub severity: Severity,
    pub repo_url: String,
    pub status: IssueStatus,
    pub ai_decision: Option<AiDecision>,
    pub ai_reason: Option<String>,
    pub sandbox_id: Option<String>,
    /// Append-only execution trace; never reordered or truncated.
    pub logs: Vec<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub patch_summary: Option<String>,
    pub commit_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Issue {
    /// Build a fresh record in the `received` state from validated input.
    pub fn new(submission: IssueSubmission) -> Self {
        let now = timestamp();
        Self {
            id: Uuid::new_v4(),
            title: submission.title,
            description: submission.description,
            steps_to_reproduce: submission.steps_to_reproduce,
            severity: submission.severity,
            repo_url: submission.repo_url,
            status: IssueStatus::Received,
            ai_decision: None,
            ai_reason: None,
            sandbox_id: None,
            logs: Vec::new(),
            branch_name: None,
            pr_url: None,
            patch_summary: None,
            commit_message: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Validated submission input. Construction is the API layer's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSubmission {
    pub title: String,
    pub description: String,
    pub steps_to_reproduce: String,
    pub severity: Severity,
    pub repo_url: String,
}

/// Partial update applied to an issue record. `None` fields are left
/// untouched; `logs` entries are appended, never replacing the trace.
#[derive(Debug, Clone, Default)]
pub struct IssuePatch {
    pub status: Option<IssueStatus>,
    pub ai_decision: Option<AiDecision>,
    pub ai_reason: Option<String>,
    pub sandbox_id: Option<String>,
    pub append_logs: Vec<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub patch_summary: Option<String>,
    pub commit_message: Option<String>,
}

impl IssuePatch {
    pub fn status(status: IssueStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn logs(lines: Vec<String>) -> Self {
        Self {
            append_logs: lines,
            ..Self::default()
        }
    }
}

/// What the fix agent produced for one run. Transient: folded into the
/// issue record, never stored as-is.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub patch_summary: String,
    pub commit_message: String,
    pub files_changed: Vec<String>,
    pub transcript: Vec<String>,
    pub error: Option<String>,
}

impl AgentResult {
    pub fn failure(transcript: Vec<String>, error: String) -> Self {
        Self {
            success: false,
            patch_summary: String::new(),
            commit_message: String::new(),
            files_changed: Vec::new(),
            transcript,
            error: Some(error),
        }
    }
}

/// One file in a submission set, with its post-fix content re-read from
/// the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub content: String,
}

/// Outcome of handing a change set to the code host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub branch_name: String,
    pub pr_url: String,
    pub pr_number: u64,
    pub merged: bool,
}

/// Aggregate counts for the dashboard. Pure projection over the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total: usize,
    pub received: usize,
    pub classifying: usize,
    pub sandboxing: usize,
    pub fixing: usize,
    pub pr_opened: usize,
    pub merged: usize,
    pub notified: usize,
    pub failed: usize,
    pub automated: usize,
    pub manual: usize,
}

pub fn compute_stats(issues: &[Issue]) -> DashboardStats {
    let mut stats = DashboardStats {
        total: issues.len(),
        ..DashboardStats::default()
    };
    for issue in issues {
        match issue.status {
            IssueStatus::Received => stats.received += 1,
            IssueStatus::Classifying => stats.classifying += 1,
            IssueStatus::Sandboxing => stats.sandboxing += 1,
            IssueStatus::Fixing => stats.fixing += 1,
            IssueStatus::PrOpened => stats.pr_opened += 1,
            IssueStatus::Merged => stats.merged += 1,
            IssueStatus::Notified => stats.notified += 1,
            IssueStatus::Failed => stats.failed += 1,
        }
        match issue.ai_decision {
            Some(AiDecision::Automated) => stats.automated += 1,
            Some(AiDecision::Manual) => stats.manual += 1,
            None => {}
        }
    }
    stats
}

/// RFC 3339 with fixed microsecond precision so timestamps sort
/// lexicographically.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
