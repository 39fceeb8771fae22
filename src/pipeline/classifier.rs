//! AUTOMATED/MANUAL triage of incoming issues.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::llm::{LlmClient, extract_json_object};
use super::models::{AiDecision, ClassificationResult, Issue};

/// Triage capability consumed by the orchestrator. May fail outright or
/// return malformed output; the orchestrator degrades either case to a
/// synthetic MANUAL decision.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, issue: &Issue) -> Result<ClassificationResult>;
}

const SYSTEM_PROMPT: &str = r#"You are a senior software engineering triage assistant for an autonomous bug remediation system called "Mend".

Your job is to classify incoming bug reports and decide one of two things:
1. AUTOMATED - The bug is simple enough that an AI coding agent can likely fix it automatically.
2. MANUAL - The bug is too complex, too risky, or too ambiguous for automated fixing and requires human review.

Rules for AUTOMATED classification:
- Typos, text changes, small CSS/style fixes
- Simple logic errors with a clear expected behaviour
- Missing null checks or guard clauses
- Small configuration changes
- Bugs with a clear reproduction path in a well-known framework
- Severity is "low" or "medium"

Rules for MANUAL classification:
- Security vulnerabilities (SQL injection, XSS, auth bypass, etc.)
- Data-loss risks
- Architecture changes required
- Critical severity bugs with unclear reproduction
- Bugs requiring business-logic decisions
- Anything involving payments, PII, or sensitive data

Always respond with VALID JSON only. Do not wrap in markdown. Use this exact schema:
{
  "decision": "AUTOMATED" | "MANUAL",
  "reason": "<one paragraph explanation>",
  "confidence": <integer 0-100>
}"#;

/// Claude-backed classifier.
pub struct ClaudeClassifier {
    llm: LlmClient,
}

impl ClaudeClassifier {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Classifier for ClaudeClassifier {
    async fn classify(&self, issue: &Issue) -> Result<ClassificationResult> {
        info!(issue_id = %issue.id, "Classifying issue");

        let user_message = format!(
            "Bug Report:\n\
             - Title: {}\n\
             - Severity: {}\n\
             - Description: {}\n\
             - Steps to Reproduce: {}\n\
             - Repository: {}\n\n\
             Please classify this bug report.",
            issue.title,
            issue.severity.as_str(),
            issue.description,
            issue.steps_to_reproduce,
            issue.repo_url,
        );

        let raw = self.llm.complete(SYSTEM_PROMPT, &user_message, 512).await?;
        let result = parse_classification(&raw);

        info!(
            issue_id = %issue.id,
            decision = result.decision.as_str(),
            confidence = result.confidence,
            "Classification result"
        );
        Ok(result)
    }
}

#[derive(Deserialize)]
struct RawClassification {
    decision: AiDecision,
    reason: String,
    #[serde(default)]
    confidence: u8,
}

/// Parse the model reply. Unparseable output falls back to MANUAL with
/// zero confidence rather than failing the run.
fn parse_classification(raw: &str) -> ClassificationResult {
    let candidate = extract_json_object(raw).unwrap_or(raw);
    match serde_json::from_str::<RawClassification>(candidate) {
        Ok(parsed) => ClassificationResult {
            decision: parsed.decision,
            reason: parsed.reason,
            confidence: parsed.confidence.min(100),
        },
        Err(e) => {
            warn!(error = %e, "Failed to parse classification response, defaulting to MANUAL");
            ClassificationResult {
                decision: AiDecision::Manual,
                reason: "Failed to parse AI response.".to_string(),
                confidence: 0,
            }
        }
    }
}
