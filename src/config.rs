//! Runtime configuration.
//!
//! Settings come from an optional `mend.toml` next to the working
//! directory, with environment variables taking precedence. Secrets
//! (API keys, SMTP password) are expected via the environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::pipeline::llm::DEFAULT_MODEL;
use crate::pipeline::notify::SmtpSettings;

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub github_token: Option<String>,
    pub sandbox_root: PathBuf,
    pub sandbox_timeout_secs: u64,
    pub webhook_urls: Vec<String>,
    pub smtp: Option<SmtpSettings>,
    pub notification_recipient: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            anthropic_api_key: None,
            anthropic_model: DEFAULT_MODEL.to_string(),
            github_token: None,
            sandbox_root: std::env::temp_dir().join("mend-sandboxes"),
            sandbox_timeout_secs: DEFAULT_SANDBOX_TIMEOUT_SECS,
            webhook_urls: Vec::new(),
            smtp: None,
            notification_recipient: None,
        }
    }
}

/// Raw TOML structure for `mend.toml`.
#[derive(Debug, Deserialize)]
struct ConfigToml {
    server: Option<ServerSection>,
    ai: Option<AiSection>,
    sandbox: Option<SandboxSection>,
    notify: Option<NotifySection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct AiSection {
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    root: Option<PathBuf>,
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NotifySection {
    webhooks: Option<Vec<String>>,
    recipient: Option<String>,
    smtp: Option<SmtpSettings>,
}

impl Config {
    /// Load configuration: defaults, then `mend.toml` (if present), then
    /// environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("mend.toml"));
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let toml: ConfigToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let mut config = Self::default();
        if let Some(server) = toml.server
            && let Some(port) = server.port
        {
            config.port = port;
        }
        if let Some(ai) = toml.ai
            && let Some(model) = ai.model
        {
            config.anthropic_model = model;
        }
        if let Some(sandbox) = toml.sandbox {
            if let Some(root) = sandbox.root {
                config.sandbox_root = root;
            }
            if let Some(timeout) = sandbox.timeout {
                config.sandbox_timeout_secs = timeout;
            }
        }
        if let Some(notify) = toml.notify {
            if let Some(webhooks) = notify.webhooks {
                config.webhook_urls = webhooks;
            }
            if let Some(recipient) = notify.recipient {
                config.notification_recipient = Some(recipient);
            }
            if let Some(smtp) = notify.smtp {
                config.smtp = Some(smtp);
            }
        }
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("MEND_PORT")
            && let Ok(port) = port.parse()
        {
            self.port = port;
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.anthropic_api_key = Some(key);
        }
        if let Ok(model) = std::env::var("MEND_MODEL") {
            self.anthropic_model = model;
        }
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            self.github_token = Some(token);
        }
        if let Ok(root) = std::env::var("MEND_SANDBOX_ROOT") {
            self.sandbox_root = PathBuf::from(root);
        }
        if let Ok(timeout) = std::env::var("MEND_SANDBOX_TIMEOUT")
            && let Ok(timeout) = timeout.parse()
        {
            self.sandbox_timeout_secs = timeout;
        }
        if let Ok(url) = std::env::var("MEND_WEBHOOK_URL") {
            self.webhook_urls.push(url);
        }
        if let Ok(recipient) = std::env::var("NOTIFICATION_EMAIL") {
            self.notification_recipient = Some(recipient);
        }
        if let (Ok(host), Ok(user), Ok(pass)) = (
            std::env::var("SMTP_HOST"),
            std::env::var("SMTP_USER"),
            std::env::var("SMTP_PASS"),
        ) {
            let port = std::env::var("SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(587);
            let from = std::env::var("SMTP_FROM").unwrap_or_else(|_| user.clone());
            self.smtp = Some(SmtpSettings {
                host,
                port,
                username: user,
                password: pass,
                from,
            });
        }
    }
}
