//! Pull-request submission to the code host.
//!
//! Takes the re-read change set from the orchestrator, materializes it as
//! a branch + commit via the GitHub REST API, opens a pull request and
//! optionally merges it.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{ChangedFile, Issue, SubmissionResult};

const USER_AGENT: &str = "mend-pipeline";

/// Submission capability consumed by the orchestrator.
#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn submit_fix(
        &self,
        issue: &Issue,
        files: &[ChangedFile],
        commit_message: &str,
        auto_merge: bool,
    ) -> Result<SubmissionResult>;
}

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() <= max_len {
        return slug;
    }
    let mut cut = max_len;
    while cut > 0 && !slug.is_char_boundary(cut) {
        cut -= 1;
    }
    slug[..cut].trim_end_matches('-').to_string()
}

/// Parse the `owner/repo` slug from a GitHub URL.
///
/// Handles `https://github.com/owner/repo[.git]`, `git@github.com:owner/repo`
/// and bare `owner/repo`.
pub fn parse_owner_repo(url: &str) -> Option<String> {
    let url = url.trim().trim_end_matches('/').trim_end_matches(".git");
    if let Some(pos) = url.find("github.com/") {
        let rest = &url[pos + "github.com/".len()..];
        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        if parts.len() >= 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            return Some(format!("{}/{}", parts[0], parts[1]));
        }
    }
    if let Some(rest) = url.strip_prefix("git@github.com:") {
        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        if parts.len() >= 2 {
            return Some(format!("{}/{}", parts[0], parts[1]));
        }
    }
    let parts: Vec<&str> = url.splitn(3, '/').collect();
    if parts.len() == 2
        && !parts[0].is_empty()
        && !parts[1].is_empty()
        && !parts[0].contains(':')
        && !parts[0].contains('.')
    {
        return Some(format!("{}/{}", parts[0], parts[1]));
    }
    None
}

/// Branch name for an issue's fix, e.g. `mend/issue-1a2b3c4d-login-crash`.
pub fn branch_name_for(issue_id: Uuid, title: &str) -> String {
    let short_id = issue_id.simple().to_string();
    format!(
        "mend/issue-{}-{}",
        &short_id[..8],
        slugify(title, 40)
    )
}

#[derive(Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Deserialize)]
struct ContentInfo {
    sha: String,
}

#[derive(Deserialize)]
struct PullRequest {
    number: u64,
    html_url: String,
}

#[derive(Deserialize)]
struct MergeOutcome {
    #[serde(default)]
    merged: bool,
}

/// GitHub REST implementation.
pub struct GitHubClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
}

impl GitHubClient {
    pub fn new(token: String) -> Self {
        Self::with_base(token, "https://api.github.com".to_string())
    }

    pub fn with_base(token: String, api_base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            api_base,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.api_base, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    async fn default_branch(&self, owner_repo: &str) -> Result<String> {
        let info: RepoInfo = self
            .request(reqwest::Method::GET, &format!("repos/{}", owner_repo))
            .send()
            .await
            .context("Failed to fetch repository metadata")?
            .error_for_status()
            .context("Repository lookup returned error status")?
            .json()
            .await
            .context("Failed to parse repository metadata")?;
        Ok(info.default_branch)
    }

    async fn head_sha(&self, owner_repo: &str, branch: &str) -> Result<String> {
        let reference: GitRef = self
            .request(
                reqwest::Method::GET,
                &format!("repos/{}/git/ref/heads/{}", owner_repo, branch),
            )
            .send()
            .await
            .context("Failed to fetch branch head")?
            .error_for_status()
            .context("Branch head lookup returned error status")?
            .json()
            .await
            .context("Failed to parse branch head")?;
        Ok(reference.object.sha)
    }

    async fn create_branch(&self, owner_repo: &str, branch: &str, sha: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("repos/{}/git/refs", owner_repo),
            )
            .json(&serde_json::json!({
                "ref": format!("refs/heads/{}", branch),
                "sha": sha,
            }))
            .send()
            .await
            .context("Failed to create branch ref")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Branch creation failed ({}): {}", status, body);
        }
        Ok(())
    }

    /// Existing blob sha for a path on a branch, `None` when the file is
    /// new. Needed by the contents API to update in place.
    async fn existing_sha(&self, owner_repo: &str, path: &str, branch: &str) -> Option<String> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("repos/{}/contents/{}?ref={}", owner_repo, path, branch),
            )
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response
            .json::<ContentInfo>()
            .await
            .ok()
            .map(|info| info.sha)
    }

    async fn put_file(
        &self,
        owner_repo: &str,
        branch: &str,
        file: &ChangedFile,
        commit_message: &str,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "message": commit_message,
            "content": BASE64.encode(file.content.as_bytes()),
            "branch": branch,
        });
        if let Some(sha) = self.existing_sha(owner_repo, &file.path, branch).await {
            body["sha"] = serde_json::Value::String(sha);
        }

        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("repos/{}/contents/{}", owner_repo, file.path),
            )
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", file.path))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("Upload of {} failed ({}): {}", file.path, status, text);
        }
        Ok(())
    }

    async fn open_pull_request(
        &self,
        owner_repo: &str,
        issue: &Issue,
        head: &str,
        base: &str,
    ) -> Result<PullRequest> {
        let body = format!(
            "## Summary\n\nAutomated fix for: **{}**\n\n{}\n\n---\n*Opened by Mend*",
            issue.title,
            if issue.description.is_empty() {
                "No description provided."
            } else {
                &issue.description
            }
        );

        let response = self
            .request(reqwest::Method::POST, &format!("repos/{}/pulls", owner_repo))
            .json(&serde_json::json!({
                "title": format!("[mend] Fix: {}", issue.title),
                "head": head,
                "base": base,
                "body": body,
            }))
            .send()
            .await
            .context("Failed to open pull request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("Pull request creation failed ({}): {}", status, text);
        }
        response
            .json()
            .await
            .context("Failed to parse pull request response")
    }

    /// Attempt a squash merge. A refused merge is an outcome, not an
    /// error: the PR stays open for a human.
    async fn merge(&self, owner_repo: &str, pr_number: u64) -> bool {
        let result = self
            .request(
                reqwest::Method::PUT,
                &format!("repos/{}/pulls/{}/merge", owner_repo, pr_number),
            )
            .json(&serde_json::json!({ "merge_method": "squash" }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => response
                .json::<MergeOutcome>()
                .await
                .map(|o| o.merged)
                .unwrap_or(false),
            Ok(response) => {
                warn!(pr_number, status = %response.status(), "Merge refused, leaving PR open");
                false
            }
            Err(e) => {
                warn!(pr_number, error = %e, "Merge request failed, leaving PR open");
                false
            }
        }
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn submit_fix(
        &self,
        issue: &Issue,
        files: &[ChangedFile],
        commit_message: &str,
        auto_merge: bool,
    ) -> Result<SubmissionResult> {
        let owner_repo = parse_owner_repo(&issue.repo_url)
            .with_context(|| format!("Not a GitHub repository reference: {}", issue.repo_url))?;
        let branch = branch_name_for(issue.id, &issue.title);

        let base = self.default_branch(&owner_repo).await?;
        let head_sha = self.head_sha(&owner_repo, &base).await?;
        self.create_branch(&owner_repo, &branch, &head_sha).await?;
        info!(issue_id = %issue.id, branch = %branch, "Branch created");

        for file in files {
            self.put_file(&owner_repo, &branch, file, commit_message)
                .await?;
        }

        let pr = self
            .open_pull_request(&owner_repo, issue, &branch, &base)
            .await?;
        info!(issue_id = %issue.id, pr_url = %pr.html_url, "Pull request opened");

        let merged = if auto_merge {
            self.merge(&owner_repo, pr.number).await
        } else {
            false
        };

        Ok(SubmissionResult {
            branch_name: branch,
            pr_url: pr.html_url,
            pr_number: pr.number,
            merged,
        })
    }
}
