use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::Config;
use crate::pipeline::agent::{ClaudeFixModel, FixAgent};
use crate::pipeline::classifier::ClaudeClassifier;
use crate::pipeline::hosting::GitHubClient;
use crate::pipeline::llm::LlmClient;
use crate::pipeline::notify::RecipientNotifier;
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::sandbox::HostSandboxProvider;
use crate::pipeline::store::InMemoryIssueStore;

/// Server-level settings taken from the CLI.
pub struct ServerConfig {
    pub port: u16,
    pub dev_mode: bool,
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Wire the concrete adapters into an orchestrator. The store stays
/// behind its trait so a durable backend can replace it here without
/// touching the pipeline.
pub fn compose(config: &Config) -> Result<Arc<AppState>> {
    let api_key = config
        .anthropic_api_key
        .clone()
        .context("ANTHROPIC_API_KEY is required (set it in the environment)")?;
    let github_token = config
        .github_token
        .clone()
        .context("GITHUB_TOKEN is required (set it in the environment)")?;

    if config.webhook_urls.is_empty() && config.smtp.is_none() {
        warn!("No notification channel configured; alerts will only be logged");
    }

    let llm = LlmClient::new(api_key, config.anthropic_model.clone());
    let store = InMemoryIssueStore::shared();
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::new(ClaudeClassifier::new(llm.clone())),
        Arc::new(HostSandboxProvider::new(
            config.sandbox_root.clone(),
            Duration::from_secs(config.sandbox_timeout_secs),
        )),
        Arc::new(FixAgent::new(Arc::new(ClaudeFixModel::new(llm)))),
        Arc::new(GitHubClient::new(github_token)),
        Arc::new(RecipientNotifier::new(
            config.webhook_urls.clone(),
            config.smtp.clone(),
            config.notification_recipient.clone(),
        )),
    );

    Ok(Arc::new(AppState {
        store,
        orchestrator,
    }))
}

/// Start the server and serve until interrupted.
pub async fn start_server(config: Config, server: ServerConfig) -> Result<()> {
    let state = compose(&config)?;

    let mut app = build_router(state);
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Mend running");
    println!("Mend running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compose_requires_api_key() {
        let config = Config {
            anthropic_api_key: None,
            github_token: Some("ghp_test".to_string()),
            ..Config::default()
        };
        let err = compose(&config).unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[tokio::test]
    async fn compose_requires_github_token() {
        let config = Config {
            anthropic_api_key: Some("sk-ant-test".to_string()),
            github_token: None,
            ..Config::default()
        };
        let err = compose(&config).unwrap_err();
        assert!(err.to_string().contains("GITHUB_TOKEN"));
    }

    #[tokio::test]
    async fn compose_wires_a_complete_state() {
        let config = Config {
            anthropic_api_key: Some("sk-ant-test".to_string()),
            github_token: Some("ghp_test".to_string()),
            ..Config::default()
        };
        let state = compose(&config).unwrap();
        let _router = build_router(state);
    }
}
