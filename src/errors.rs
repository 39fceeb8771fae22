//! Typed error hierarchy for the Mend pipeline.
//!
//! Three top-level enums cover the three subsystems:
//! - `PipelineError` — orchestrator run failures
//! - `SandboxError` — sandbox provisioning and execution failures
//! - `AgentError` — fix-agent step failures (always caught at the agent
//!   boundary and folded into an `AgentResult`)

use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::models::IssueStatus;

/// Errors from the orchestrator subsystem.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Issue {id} not found")]
    IssueNotFound { id: Uuid },

    #[error("Pipeline already running for issue {id}")]
    AlreadyRunning { id: Uuid },

    #[error("Invalid status transition {from} -> {to} for issue {id}")]
    InvalidTransition {
        id: Uuid,
        from: IssueStatus,
        to: IssueStatus,
    },

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the sandboxed execution environment.
///
/// `Expired` is kept distinguishable so the orchestrator routes a
/// past-deadline sandbox to `failed` instead of hanging on it.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox {id} expired after {timeout_secs}s")]
    Expired { id: String, timeout_secs: u64 },

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path {path} escapes the sandbox workspace")]
    PathEscape { path: String },

    #[error("Failed to provision sandbox workspace: {0}")]
    Provision(#[source] std::io::Error),
}

/// Errors from a single fix-agent step.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Model call failed: {0}")]
    Model(String),

    #[error("File selection output was not valid JSON")]
    UnparseableSelection,

    #[error("Fix output was not valid JSON: {0}")]
    UnparseableFix(String),

    #[error("No relevant file could be read from the sandbox")]
    NoReadableFiles,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}
