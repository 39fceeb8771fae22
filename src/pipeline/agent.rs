//! The code-fix agent: a bounded five-step reasoning loop.
//!
//! 1. List repository files.
//! 2. Ask the model which files are most likely involved (heuristic
//!    fallback when the reply doesn't parse).
//! 3. Read the selected files; unreadable ones are skipped.
//! 4. Ask the model for full-content replacements plus a commit message
//!    and summary (unparseable output is a hard failure here — there is
//!    no safe heuristic for code content).
//! 5. Write the replacements back and run verification.
//!
//! Every failure is caught at the boundary and folded into an
//! `AgentResult`; nothing is thrown past the agent. The orchestrator
//! treats a failed agent as an ordinary escalation to manual review.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info};

use crate::errors::AgentError;

use super::llm::{LlmClient, extract_json_object};
use super::models::{AgentResult, ChangedFile, Issue};
use super::sandbox::Sandbox;

/// Max files the model may select for inspection.
const MAX_SELECTED_FILES: usize = 5;
/// Cap on the file listing sent to the model, to bound request size.
const MAX_LISTED_FILES: usize = 300;
/// Fallback selection size when the model reply doesn't parse.
const FALLBACK_FILES: usize = 3;
/// Per-file content preview length in the human-readable patch summary.
const PREVIEW_CHARS: usize = 500;

const SOURCE_EXTENSIONS: &[&str] = &["rs", "ts", "tsx", "js", "jsx", "py"];

/// The agent's full-file patch plan for one issue.
#[derive(Debug, Clone, Deserialize)]
pub struct FixPlan {
    #[serde(rename = "commitMessage")]
    pub commit_message: String,
    #[serde(rename = "patchSummary")]
    pub patch_summary: String,
    pub files: Vec<ChangedFile>,
}

/// Reasoning capability the agent consumes: file selection and fix
/// generation. Mockable for tests.
#[async_trait]
pub trait FixModel: Send + Sync {
    async fn select_files(
        &self,
        issue: &Issue,
        files: &[String],
    ) -> Result<Vec<String>, AgentError>;

    async fn generate_fix(
        &self,
        issue: &Issue,
        sources: &[(String, String)],
    ) -> Result<FixPlan, AgentError>;
}

/// Agent boundary consumed by the orchestrator.
#[async_trait]
pub trait CodeFixAgent: Send + Sync {
    async fn run(&self, issue: &Issue, sandbox: &mut dyn Sandbox) -> AgentResult;
}

pub struct FixAgent {
    model: Arc<dyn FixModel>,
}

impl FixAgent {
    pub fn new(model: Arc<dyn FixModel>) -> Self {
        Self { model }
    }

    /// First few source files by extension, used when selection output
    /// doesn't parse.
    fn fallback_selection(files: &[String]) -> Vec<String> {
        files
            .iter()
            .filter(|f| {
                f.rsplit('.')
                    .next()
                    .map(|ext| SOURCE_EXTENSIONS.contains(&ext))
                    .unwrap_or(false)
            })
            .take(FALLBACK_FILES)
            .cloned()
            .collect()
    }

    async fn run_steps(
        &self,
        issue: &Issue,
        sandbox: &mut dyn Sandbox,
        transcript: &mut Vec<String>,
    ) -> Result<(FixPlan, Vec<String>), AgentError> {
        // Step 1: list files
        transcript.push("Step 1: Listing repository files...".to_string());
        let all_files = sandbox.list_files().await?;
        transcript.push(format!("Found {} files.", all_files.len()));

        // Step 2: select candidates
        transcript.push("Step 2: Identifying relevant files...".to_string());
        let selected = match self.model.select_files(issue, &all_files).await {
            Ok(files) => files.into_iter().take(MAX_SELECTED_FILES).collect(),
            Err(AgentError::UnparseableSelection) => {
                transcript
                    .push("Selection reply was unparseable, using heuristic fallback.".to_string());
                Self::fallback_selection(&all_files)
            }
            Err(e) => return Err(e),
        };
        transcript.push(format!("Relevant files: {}", selected.join(", ")));

        // Step 3: read them; unreadable files are skipped, not fatal
        transcript.push("Step 3: Reading relevant files...".to_string());
        let mut sources = Vec::new();
        for path in &selected {
            match sandbox.read_file(path).await {
                Ok(content) => {
                    transcript.push(format!("Read: {} ({} chars)", path, content.len()));
                    sources.push((path.clone(), content));
                }
                Err(_) => {
                    transcript.push(format!("Skipped (read error): {}", path));
                }
            }
        }
        if sources.is_empty() {
            return Err(AgentError::NoReadableFiles);
        }

        // Step 4: generate the fix
        transcript.push("Step 4: Generating fix...".to_string());
        let plan = self.model.generate_fix(issue, &sources).await?;
        transcript.push(format!("Fix generated. Files changed: {}", plan.files.len()));
        transcript.push(format!("Commit message: {}", plan.commit_message));

        // Step 5: write back and verify
        transcript.push("Step 5: Writing fixed files to sandbox...".to_string());
        let mut written = Vec::new();
        for file in &plan.files {
            sandbox.write_file(&file.path, &file.content).await?;
            transcript.push(format!("Written: {}", file.path));
            written.push(file.path.clone());
        }

        match sandbox.run_checks().await {
            Ok(outcome) => {
                transcript.push(format!("Verification success={}", outcome.success));
            }
            Err(e) => {
                // Verification is advisory: its outcome is recorded but a
                // broken check run does not retract an applied fix.
                transcript.push(format!("Verification could not run: {}", e));
            }
        }

        Ok((plan, written))
    }
}

#[async_trait]
impl CodeFixAgent for FixAgent {
    async fn run(&self, issue: &Issue, sandbox: &mut dyn Sandbox) -> AgentResult {
        let mut transcript = Vec::new();

        match self.run_steps(issue, sandbox, &mut transcript).await {
            Ok((plan, written)) => {
                info!(issue_id = %issue.id, files = written.len(), "Agent produced a fix");
                let patch_summary = build_patch_summary(&plan);
                AgentResult {
                    success: true,
                    patch_summary,
                    commit_message: plan.commit_message,
                    files_changed: written,
                    transcript,
                    error: None,
                }
            }
            Err(e) => {
                let message = e.to_string();
                transcript.push(format!("Agent error: {}", message));
                error!(issue_id = %issue.id, error = %message, "Fix agent failed");
                AgentResult::failure(transcript, message)
            }
        }
    }
}

/// Human-readable summary with a short content preview per file. Used in
/// notifications and the PR body, never for submission content.
fn build_patch_summary(plan: &FixPlan) -> String {
    let previews: Vec<String> = plan
        .files
        .iter()
        .map(|f| {
            let cut = f
                .content
                .char_indices()
                .nth(PREVIEW_CHARS)
                .map(|(i, _)| i)
                .unwrap_or(f.content.len());
            format!("## {}\n```\n{}...\n```", f.path, &f.content[..cut])
        })
        .collect();
    format!("{}\n\n{}", plan.patch_summary, previews.join("\n\n"))
}

// ── Claude-backed model ───────────────────────────────────────────────

const SELECT_SYSTEM: &str = r#"You are a senior software engineer.
Given a bug report and the full list of files in a repository, identify which files (up to 5) are most likely to contain the bug.
Respond with VALID JSON only. No markdown. Schema:
{ "files": ["path/to/file1.ts", "path/to/file2.ts"] }"#;

const FIX_SYSTEM: &str = r#"You are an expert software engineer performing automated bug fixing.
You will receive a bug description, reproduction steps, and the relevant source files.
Your task is to produce fixed versions of all files that need changes.

Rules:
- Only change what is necessary to fix the reported bug.
- Do NOT refactor unrelated code.
- Do NOT change import paths or package names.
- Always provide the COMPLETE file content (not a diff) so it can be written directly.
- If a file does not need changes, omit it.

Respond with VALID JSON only. No markdown. Schema:
{
  "commitMessage": "<imperative short commit message, max 72 chars>",
  "patchSummary": "<one-paragraph human-readable explanation of the fix>",
  "files": [
    { "path": "relative/path/from/repo/root.ts", "content": "<full file content>" }
  ]
}"#;

pub struct ClaudeFixModel {
    llm: LlmClient,
}

impl ClaudeFixModel {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[derive(Deserialize)]
struct RawSelection {
    files: Vec<String>,
}

#[async_trait]
impl FixModel for ClaudeFixModel {
    async fn select_files(
        &self,
        issue: &Issue,
        files: &[String],
    ) -> Result<Vec<String>, AgentError> {
        let listing = files
            .iter()
            .take(MAX_LISTED_FILES)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        let user = format!(
            "Bug Title: {}\nDescription: {}\nSteps to Reproduce: {}\n\nRepository files:\n{}",
            issue.title, issue.description, issue.steps_to_reproduce, listing,
        );

        let raw = self
            .llm
            .complete(SELECT_SYSTEM, &user, 512)
            .await
            .map_err(|e| AgentError::Model(format!("{:#}", e)))?;

        let candidate = extract_json_object(&raw).unwrap_or(&raw);
        serde_json::from_str::<RawSelection>(candidate)
            .map(|s| s.files)
            .map_err(|_| AgentError::UnparseableSelection)
    }

    async fn generate_fix(
        &self,
        issue: &Issue,
        sources: &[(String, String)],
    ) -> Result<FixPlan, AgentError> {
        let file_blocks = sources
            .iter()
            .map(|(path, content)| format!("=== FILE: {} ===\n{}", path, content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let user = format!(
            "Bug Report:\nTitle: {}\nSeverity: {}\nDescription: {}\nSteps to Reproduce: {}\n\nSource Files:\n{}",
            issue.title,
            issue.severity.as_str(),
            issue.description,
            issue.steps_to_reproduce,
            file_blocks,
        );

        let raw = self
            .llm
            .complete(FIX_SYSTEM, &user, 8192)
            .await
            .map_err(|e| AgentError::Model(format!("{:#}", e)))?;

        let candidate = extract_json_object(&raw).unwrap_or(&raw);
        serde_json::from_str::<FixPlan>(candidate)
            .map_err(|_| AgentError::UnparseableFix(raw.chars().take(200).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SandboxError;
    use crate::pipeline::models::{IssueSubmission, Severity};
    use crate::pipeline::sandbox::CheckOutcome;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;

    fn issue() -> Issue {
        Issue::new(IssueSubmission {
            title: "Null crash in parser".to_string(),
            description: "Parser panics on empty input".to_string(),
            steps_to_reproduce: "Feed it an empty string".to_string(),
            severity: Severity::Low,
            repo_url: "https://github.com/acme/webapp".to_string(),
        })
    }

    /// In-memory sandbox double; `fail_reads` makes specific paths
    /// unreadable.
    struct FakeSandbox {
        files: Mutex<BTreeMap<String, String>>,
        fail_reads: Vec<String>,
    }

    impl FakeSandbox {
        fn with_files(entries: &[(&str, &str)]) -> Self {
            Self {
                files: Mutex::new(
                    entries
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                fail_reads: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn id(&self) -> &str {
            "sbx-fake"
        }

        async fn clone_repo(&mut self, _repo_url: &str) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn install_dependencies(&mut self) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn list_files(&self) -> Result<Vec<String>, SandboxError> {
            Ok(self.files.lock().await.keys().cloned().collect())
        }

        async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
            if self.fail_reads.iter().any(|p| p == path) {
                return Err(SandboxError::Read {
                    path: path.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
                });
            }
            self.files
                .lock()
                .await
                .get(path)
                .cloned()
                .ok_or_else(|| SandboxError::Read {
                    path: path.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                })
        }

        async fn write_file(&mut self, path: &str, content: &str) -> Result<(), SandboxError> {
            self.files
                .lock()
                .await
                .insert(path.to_string(), content.to_string());
            Ok(())
        }

        async fn run_checks(&mut self) -> Result<CheckOutcome, SandboxError> {
            Ok(CheckOutcome {
                success: true,
                output: String::new(),
            })
        }

        async fn destroy(&mut self) -> Result<(), SandboxError> {
            Ok(())
        }

        fn take_logs(&mut self) -> Vec<String> {
            Vec::new()
        }
    }

    struct ScriptedModel {
        selection: Result<Vec<String>, AgentError>,
        plan: Result<FixPlan, AgentError>,
    }

    #[async_trait]
    impl FixModel for ScriptedModel {
        async fn select_files(
            &self,
            _issue: &Issue,
            _files: &[String],
        ) -> Result<Vec<String>, AgentError> {
            match &self.selection {
                Ok(v) => Ok(v.clone()),
                Err(AgentError::UnparseableSelection) => Err(AgentError::UnparseableSelection),
                Err(e) => Err(AgentError::Model(e.to_string())),
            }
        }

        async fn generate_fix(
            &self,
            _issue: &Issue,
            _sources: &[(String, String)],
        ) -> Result<FixPlan, AgentError> {
            match &self.plan {
                Ok(p) => Ok(p.clone()),
                Err(AgentError::UnparseableFix(s)) => Err(AgentError::UnparseableFix(s.clone())),
                Err(e) => Err(AgentError::Model(e.to_string())),
            }
        }
    }

    fn plan_for(path: &str, content: &str) -> FixPlan {
        FixPlan {
            commit_message: "Fix empty-input crash".to_string(),
            patch_summary: "Guard against empty input.".to_string(),
            files: vec![ChangedFile {
                path: path.to_string(),
                content: content.to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn happy_path_writes_files_and_reports_success() {
        let mut sandbox = FakeSandbox::with_files(&[("src/parser.rs", "old")]);
        let agent = FixAgent::new(Arc::new(ScriptedModel {
            selection: Ok(vec!["src/parser.rs".to_string()]),
            plan: Ok(plan_for("src/parser.rs", "new content")),
        }));

        let result = agent.run(&issue(), &mut sandbox).await;
        assert!(result.success);
        assert_eq!(result.files_changed, vec!["src/parser.rs"]);
        assert_eq!(result.commit_message, "Fix empty-input crash");
        assert!(result.patch_summary.contains("Guard against empty input."));
        assert!(result.error.is_none());
        assert_eq!(
            sandbox.files.lock().await.get("src/parser.rs").unwrap(),
            "new content"
        );
        // Transcript covers all five steps.
        assert!(result.transcript.iter().any(|l| l.starts_with("Step 1")));
        assert!(result.transcript.iter().any(|l| l.starts_with("Step 5")));
    }

    #[tokio::test]
    async fn unparseable_selection_falls_back_to_source_files() {
        let mut sandbox = FakeSandbox::with_files(&[
            ("README.md", "docs"),
            ("src/a.rs", "a"),
            ("src/b.ts", "b"),
            ("src/c.py", "c"),
            ("src/d.rs", "d"),
        ]);
        let agent = FixAgent::new(Arc::new(ScriptedModel {
            selection: Err(AgentError::UnparseableSelection),
            plan: Ok(plan_for("src/a.rs", "fixed")),
        }));

        let result = agent.run(&issue(), &mut sandbox).await;
        assert!(result.success);
        let read_line = result
            .transcript
            .iter()
            .find(|l| l.starts_with("Relevant files:"))
            .unwrap();
        // First three source files by extension, README excluded.
        assert!(read_line.contains("src/a.rs"));
        assert!(!read_line.contains("README.md"));
    }

    #[tokio::test]
    async fn unreadable_files_are_skipped_but_all_unreadable_is_fatal() {
        let mut sandbox = FakeSandbox::with_files(&[("src/a.rs", "a")]);
        sandbox.fail_reads = vec!["src/a.rs".to_string()];
        let agent = FixAgent::new(Arc::new(ScriptedModel {
            selection: Ok(vec!["src/a.rs".to_string()]),
            plan: Ok(plan_for("src/a.rs", "fixed")),
        }));

        let result = agent.run(&issue(), &mut sandbox).await;
        assert!(!result.success);
        assert!(
            result
                .error
                .as_deref()
                .unwrap()
                .contains("No relevant file could be read")
        );
        assert!(result.files_changed.is_empty());
    }

    #[tokio::test]
    async fn unparseable_fix_is_a_hard_failure() {
        let mut sandbox = FakeSandbox::with_files(&[("src/a.rs", "a")]);
        let agent = FixAgent::new(Arc::new(ScriptedModel {
            selection: Ok(vec!["src/a.rs".to_string()]),
            plan: Err(AgentError::UnparseableFix("not json".to_string())),
        }));

        let result = agent.run(&issue(), &mut sandbox).await;
        assert!(!result.success);
        assert!(result.error.is_some());
        // The original file is untouched.
        assert_eq!(sandbox.files.lock().await.get("src/a.rs").unwrap(), "a");
    }

    #[tokio::test]
    async fn selection_is_capped_at_five_files() {
        let listing: Vec<(String, String)> = (0..8)
            .map(|i| (format!("src/f{}.rs", i), "x".to_string()))
        .collect();
        let entries: Vec<(&str, &str)> = listing
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let mut sandbox = FakeSandbox::with_files(&entries);
        let agent = FixAgent::new(Arc::new(ScriptedModel {
            selection: Ok((0..8).map(|i| format!("src/f{}.rs", i)).collect()),
            plan: Ok(plan_for("src/f0.rs", "fixed")),
        }));

        let result = agent.run(&issue(), &mut sandbox).await;
        assert!(result.success);
        let reads = result
            .transcript
            .iter()
            .filter(|l| l.starts_with("Read: "))
            .count();
        assert_eq!(reads, 5);
    }

    #[test]
    fn patch_summary_previews_are_truncated() {
        let long = "x".repeat(2000);
        let plan = plan_for("src/big.rs", &long);
        let summary = build_patch_summary(&plan);
        assert!(summary.contains("## src/big.rs"));
        assert!(summary.len() < 1200);
    }
}
