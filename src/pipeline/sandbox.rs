//! Ephemeral sandboxed execution environments.
//!
//! A sandbox is an isolated workspace holding a clone of the target
//! repository, with a bounded lifetime fixed at creation. Exactly one
//! orchestrator run owns a sandbox; the owner destroys it on every exit
//! path. Every operation re-checks the deadline so work issued after
//! expiry fails with `SandboxError::Expired` instead of hanging.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::SandboxError;

/// Directories never surfaced to the fix agent.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "dist",
    "build",
    ".next",
    "__pycache__",
    "venv",
    "coverage",
    "target",
];

/// Output cap for command logs folded into the issue trace.
const LOG_TAIL: usize = 2000;

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub success: bool,
    pub output: String,
}

/// Factory for sandboxes. One call per orchestrator run.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, repo_url: &str) -> Result<Box<dyn Sandbox>, SandboxError>;
}

/// Operations the pipeline performs inside a sandbox. Each may fail
/// independently; `destroy` must be safe to call exactly once on every
/// exit path.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    async fn clone_repo(&mut self, repo_url: &str) -> Result<(), SandboxError>;

    async fn install_dependencies(&mut self) -> Result<(), SandboxError>;

    /// Repo-relative paths of all files, excluding build, dependency and
    /// version-control directories. Sorted for determinism.
    async fn list_files(&self) -> Result<Vec<String>, SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), SandboxError>;

    /// Run the repository's tests or build, whichever is configured.
    async fn run_checks(&mut self) -> Result<CheckOutcome, SandboxError>;

    async fn destroy(&mut self) -> Result<(), SandboxError>;

    /// Drain accumulated trace lines for folding into the issue record.
    fn take_logs(&mut self) -> Vec<String>;
}

/// Normalize a repository reference into a bare clone URL.
pub fn clone_url(repo_url: &str) -> String {
    let cleaned = repo_url.trim_end_matches('/').trim_end_matches(".git");
    format!("{}.git", cleaned)
}

/// Last path segment of the repository URL, used as the checkout
/// directory name.
pub fn repo_name(repo_url: &str) -> String {
    repo_url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("repo")
        .to_string()
}

fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        text
    } else {
        &text[text.len() - limit..]
    }
}

/// Provider that provisions workspace directories under a configurable
/// root on the host and runs commands as local subprocesses.
pub struct HostSandboxProvider {
    root: PathBuf,
    timeout: Duration,
}

impl HostSandboxProvider {
    pub fn new(root: PathBuf, timeout: Duration) -> Self {
        Self { root, timeout }
    }
}

#[async_trait]
impl SandboxProvider for HostSandboxProvider {
    async fn create(&self, repo_url: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
        let id = format!("sbx-{}", Uuid::new_v4().simple());
        let workspace = self.root.join(&id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(SandboxError::Provision)?;

        let repo_dir = workspace.join(repo_name(repo_url));
        info!(sandbox_id = %id, workspace = %workspace.display(), "Sandbox created");

        Ok(Box::new(HostSandbox {
            logs: vec![format!("Sandbox created: {}", id)],
            id,
            workspace,
            repo_dir,
            deadline: Instant::now() + self.timeout,
            timeout_secs: self.timeout.as_secs(),
            destroyed: false,
        }))
    }
}

pub struct HostSandbox {
    id: String,
    workspace: PathBuf,
    repo_dir: PathBuf,
    deadline: Instant,
    timeout_secs: u64,
    logs: Vec<String>,
    destroyed: bool,
}

impl HostSandbox {
    pub fn repo_path(&self) -> &Path {
        &self.repo_dir
    }

    fn ensure_alive(&self) -> Result<(), SandboxError> {
        if Instant::now() >= self.deadline {
            return Err(SandboxError::Expired {
                id: self.id.clone(),
                timeout_secs: self.timeout_secs,
            });
        }
        Ok(())
    }

    /// Repo-relative path resolution. Absolute paths and `..` components
    /// never leave the checkout.
    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let rel = Path::new(path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(SandboxError::PathEscape {
                path: path.to_string(),
            });
        }
        Ok(self.repo_dir.join(rel))
    }

    /// Run a subprocess inside the sandbox, capped at the sandbox deadline.
    async fn exec(
        &self,
        program: &str,
        args: &[&str],
        cwd: &Path,
    ) -> Result<std::process::Output, SandboxError> {
        self.ensure_alive()?;
        let command_line = format!("{} {}", program, args.join(" "));

        let child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        match tokio::time::timeout_at(self.deadline, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| SandboxError::Spawn {
                command: command_line,
                source,
            }),
            Err(_) => Err(SandboxError::Expired {
                id: self.id.clone(),
                timeout_secs: self.timeout_secs,
            }),
        }
    }
}

#[async_trait]
impl Sandbox for HostSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn clone_repo(&mut self, repo_url: &str) -> Result<(), SandboxError> {
        let url = clone_url(repo_url);
        info!(sandbox_id = %self.id, url = %url, "Cloning repository");

        let repo_dir = self.repo_dir.to_string_lossy().to_string();
        let output = self
            .exec(
                "git",
                &["clone", "--depth", "1", &url, &repo_dir],
                &self.workspace,
            )
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stdout.trim().is_empty() {
            stderr.to_string()
        } else {
            stdout.to_string()
        };
        self.logs
            .push(format!("[clone] {}", tail(combined.trim(), LOG_TAIL)));

        if !output.status.success() {
            return Err(SandboxError::CommandFailed {
                command: format!("git clone {}", url),
                code: output.status.code().unwrap_or(-1),
                stderr: tail(stderr.trim(), LOG_TAIL).to_string(),
            });
        }
        Ok(())
    }

    async fn install_dependencies(&mut self) -> Result<(), SandboxError> {
        self.ensure_alive()?;

        let has = |name: &str| self.repo_dir.join(name).exists();
        let install: Option<(&str, Vec<&str>)> = if has("package-lock.json") {
            Some(("npm", vec!["install", "--legacy-peer-deps"]))
        } else if has("yarn.lock") {
            Some(("yarn", vec!["install", "--non-interactive"]))
        } else if has("pnpm-lock.yaml") {
            Some(("pnpm", vec!["install", "--frozen-lockfile"]))
        } else if has("requirements.txt") {
            Some(("pip", vec!["install", "-r", "requirements.txt"]))
        } else if has("pyproject.toml") {
            Some(("pip", vec!["install", "."]))
        } else if has("Cargo.toml") {
            Some(("cargo", vec!["fetch"]))
        } else {
            None
        };

        let Some((program, args)) = install else {
            self.logs
                .push("[install] No package manager detected, skipping.".to_string());
            return Ok(());
        };

        self.logs.push(format!("[detect] Using {}", program));
        let repo_dir = self.repo_dir.clone();
        let output = self.exec(program, &args, &repo_dir).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        self.logs
            .push(format!("[install] {}", tail(stdout.trim(), LOG_TAIL)));

        // A failed install is not fatal: plenty of fixes don't need the
        // dependency tree, and the verification step will surface real
        // breakage.
        if !output.status.success() {
            warn!(
                sandbox_id = %self.id,
                code = output.status.code().unwrap_or(-1),
                "Dependency install returned non-zero exit code"
            );
        }
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<String>, SandboxError> {
        self.ensure_alive()?;

        let mut files = Vec::new();
        let walker = walkdir::WalkDir::new(&self.repo_dir)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry
                        .file_name()
                        .to_str()
                        .map(|name| IGNORED_DIRS.contains(&name))
                        .unwrap_or(false)
            });

        for entry in walker {
            let entry = entry.map_err(|e| SandboxError::Read {
                path: self.repo_dir.display().to_string(),
                source: e.into(),
            })?;
            if entry.file_type().is_file()
                && let Ok(rel) = entry.path().strip_prefix(&self.repo_dir)
            {
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }

        files.sort();
        Ok(files)
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.ensure_alive()?;
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|source| SandboxError::Read {
                path: path.to_string(),
                source,
            })
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        let full = self.resolve(path)?;

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SandboxError::Write {
                    path: path.to_string(),
                    source,
                })?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|source| SandboxError::Write {
                path: path.to_string(),
                source,
            })?;

        self.logs.push(format!("[write] {}", path));
        Ok(())
    }

    async fn run_checks(&mut self) -> Result<CheckOutcome, SandboxError> {
        self.ensure_alive()?;
        info!(sandbox_id = %self.id, "Running verification");

        let repo_dir = self.repo_dir.clone();
        let command: Option<(&str, Vec<&str>)> = if repo_dir.join("package.json").exists() {
            let raw = tokio::fs::read_to_string(repo_dir.join("package.json"))
                .await
                .unwrap_or_default();
            let scripts = serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .and_then(|pkg| pkg.get("scripts").cloned());
            match scripts {
                Some(s) if s.get("test").is_some() => {
                    Some(("npm", vec!["test", "--", "--passWithNoTests"]))
                }
                Some(s) if s.get("build").is_some() => Some(("npm", vec!["run", "build"])),
                _ => None,
            }
        } else if repo_dir.join("Cargo.toml").exists() {
            Some(("cargo", vec!["test", "--quiet"]))
        } else if repo_dir.join("requirements.txt").exists()
            || repo_dir.join("pyproject.toml").exists()
        {
            Some(("python", vec!["-m", "pytest", "--tb=short", "-q"]))
        } else {
            None
        };

        let Some((program, args)) = command else {
            self.logs
                .push("[verify] No test or build step configured.".to_string());
            return Ok(CheckOutcome {
                success: true,
                output: "No test or build step configured.".to_string(),
            });
        };

        let output = self.exec(program, &args, &repo_dir).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}{}", stdout, stderr);
        let success = output.status.success();

        self.logs.push(format!("[verify] success={}", success));
        self.logs
            .push(format!("[verify] {}", tail(combined.trim(), LOG_TAIL)));

        Ok(CheckOutcome {
            success,
            output: combined,
        })
    }

    async fn destroy(&mut self) -> Result<(), SandboxError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        tokio::fs::remove_dir_all(&self.workspace)
            .await
            .map_err(SandboxError::Provision)?;
        info!(sandbox_id = %self.id, "Sandbox destroyed");
        Ok(())
    }

    fn take_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.logs)
    }
}

impl Drop for HostSandbox {
    fn drop(&mut self) {
        // Last-resort cleanup for runs that never reached destroy.
        if !self.destroyed {
            let _ = std::fs::remove_dir_all(&self.workspace);
        }
    }
}
