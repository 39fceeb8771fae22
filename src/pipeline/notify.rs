//! Notification delivery for pipeline outcomes.
//!
//! Two events exist: an issue escalated for manual review, and an
//! automated fix submitted (merged or awaiting review). Delivery is
//! fire-and-forget from the orchestrator's perspective: failures are
//! logged and swallowed, never fatal to a run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use tracing::info;

use super::models::Issue;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Alert the recipient that an issue needs human review.
    async fn manual_review(&self, issue: &Issue) -> Result<()>;

    /// Summarize an automated fix: PR opened, optionally merged.
    async fn fix_submitted(&self, issue: &Issue, pr_url: &str, merged: bool) -> Result<()>;
}

/// SMTP settings for the email delivery path.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// Delivers to a fixed recipient over webhook POST and/or SMTP email,
/// whichever is configured. With neither, events are logged only.
pub struct RecipientNotifier {
    http: reqwest::Client,
    webhook_urls: Vec<String>,
    smtp: Option<SmtpSettings>,
    recipient: Option<String>,
}

impl RecipientNotifier {
    pub fn new(
        webhook_urls: Vec<String>,
        smtp: Option<SmtpSettings>,
        recipient: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_urls,
            smtp,
            recipient,
        }
    }

    async fn deliver(&self, subject: &str, body: &str) -> Result<()> {
        for url in &self.webhook_urls {
            self.post_webhook(url, subject, body).await?;
        }
        if let (Some(smtp), Some(recipient)) = (&self.smtp, &self.recipient) {
            self.send_email(smtp, recipient, subject, body).await?;
        }
        if self.webhook_urls.is_empty() && (self.smtp.is_none() || self.recipient.is_none()) {
            info!(subject, "No notification channel configured; event logged only");
        }
        Ok(())
    }

    async fn post_webhook(&self, url: &str, subject: &str, body: &str) -> Result<()> {
        let payload = if url.contains("slack.com") {
            serde_json::json!({ "text": format!("*{}*\n{}", subject, body) })
        } else {
            serde_json::json!({ "title": subject, "message": body })
        };

        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("Failed to send webhook")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Webhook POST failed with status {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn send_email(
        &self,
        smtp: &SmtpSettings,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<()> {
        let message = Message::builder()
            .from(smtp.from.parse().context("Invalid from address")?)
            .to(recipient.parse().context("Invalid recipient address")?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .context("Failed to build email")?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
            .context("Failed to configure SMTP relay")?
            .port(smtp.port)
            .credentials(Credentials::new(
                smtp.username.clone(),
                smtp.password.clone(),
            ))
            .build();

        transport
            .send(message)
            .await
            .context("Failed to send email")?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecipientNotifier {
    async fn manual_review(&self, issue: &Issue) -> Result<()> {
        let subject = format!("[Mend] Manual Review Required: {}", issue.title);
        let body = manual_review_body(issue);
        self.deliver(&subject, &body).await?;
        info!(issue_id = %issue.id, "Manual review notification sent");
        Ok(())
    }

    async fn fix_submitted(&self, issue: &Issue, pr_url: &str, merged: bool) -> Result<()> {
        let label = if merged { "Merged" } else { "PR Opened" };
        let subject = format!("[Mend] Automated Fix {}: {}", label, issue.title);
        let body = fix_submitted_body(issue, pr_url, merged);
        self.deliver(&subject, &body).await?;
        info!(issue_id = %issue.id, pr_url, "Fix notification sent");
        Ok(())
    }
}

fn manual_review_body(issue: &Issue) -> String {
    format!(
        "The triage assistant classified this bug report as requiring human review.\n\n\
         Issue ID: {}\n\
         Title: {}\n\
         Severity: {}\n\
         Repository: {}\n\
         Reason: {}\n\
         Reported At: {}\n\n\
         Description:\n{}\n\n\
         Steps to Reproduce:\n{}\n",
        issue.id,
        issue.title,
        issue.severity.as_str().to_uppercase(),
        issue.repo_url,
        issue.ai_reason.as_deref().unwrap_or("-"),
        issue.created_at,
        issue.description,
        issue.steps_to_reproduce,
    )
}

fn fix_submitted_body(issue: &Issue, pr_url: &str, merged: bool) -> String {
    let status = if merged {
        "Merged"
    } else {
        "PR opened (pending review)"
    };
    format!(
        "Mend analysed and fixed the following bug report.\n\n\
         Status: {}\n\
         Issue ID: {}\n\
         Title: {}\n\
         Severity: {}\n\
         Repository: {}\n\
         Pull Request: {}\n\n\
         What was fixed:\n{}\n",
        status,
        issue.id,
        issue.title,
        issue.severity.as_str().to_uppercase(),
        issue.repo_url,
        pr_url,
        issue
            .patch_summary
            .as_deref()
            .unwrap_or("See pull request for the full diff."),
    )
}
