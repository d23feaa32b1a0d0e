//! Startup helpers for the chat server.
//!
//! Reads configuration from the environment, builds the shared state,
//! checks the Ollama connection once and serves until Ctrl+C.

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::llm::ClientConfig;
use crate::server::{self, AppState};

/// Environment variable overriding the Ollama base URL.
pub const ENV_URL: &str = "OLLAMA_CHAT_URL";
/// Environment variable overriding the model name.
pub const ENV_MODEL: &str = "OLLAMA_CHAT_MODEL";
/// Environment variable overriding the HTTP port.
pub const ENV_PORT: &str = "OLLAMA_CHAT_PORT";
/// Environment variable overriding the `SQLite` storage path.
pub const ENV_DB: &str = "OLLAMA_CHAT_DB";
/// Environment variable overriding the request timeout, in seconds.
pub const ENV_TIMEOUT_SECS: &str = "OLLAMA_CHAT_TIMEOUT_SECS";

/// Default storage file.
pub const DEFAULT_STORAGE_PATH: &str = "ollama-chat.sqlite";

/// Process configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP port.
    pub port: u16,
    /// `SQLite` file holding persisted conversations.
    pub storage_path: PathBuf,
    /// Inference client settings.
    pub client: ClientConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: server::DEFAULT_PORT,
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            client: ClientConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults overridden by `OLLAMA_CHAT_*` environment variables.
    ///
    /// # Errors
    /// Returns an error if a variable is set but malformed, or the result
    /// fails validation.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`.
    ///
    /// # Errors
    /// Returns an error if a value is malformed or the result fails
    /// validation.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_URL) {
            config.client = config.client.with_base_url(url);
        }
        if let Some(model) = lookup(ENV_MODEL) {
            config.client = config.client.with_model(model);
        }
        if let Some(port) = lookup(ENV_PORT) {
            config.port = port
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PORT} must be a port number, got {port:?}"))?;
        }
        if let Some(path) = lookup(ENV_DB) {
            config.storage_path = PathBuf::from(path);
        }
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS) {
            let secs: u64 = secs.trim().parse().with_context(|| {
                format!("{ENV_TIMEOUT_SECS} must be whole seconds, got {secs:?}")
            })?;
            config.client = config.client.with_timeout(Duration::from_secs(secs));
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration.
    ///
    /// # Errors
    /// Returns an error if the client settings are invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.client.validate().context("invalid Ollama client settings")?;
        Ok(())
    }
}

/// Run the server until Ctrl+C.
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting ollama-chat v{}", env!("CARGO_PKG_VERSION"));

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e:#}");
            return ExitCode::from(1);
        }
    };
    tracing::info!(
        "Ollama endpoint: {} (model {})",
        config.client.base_url,
        config.client.model
    );

    let state = match initialize(&config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Failed to create state: {e:#}");
            return ExitCode::from(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let result = rt.block_on(async {
        let mut store = state.store.lock().await;
        if let Err(e) = store.check_connection().await {
            tracing::warn!("Ollama not reachable yet: {e}");
        }
        drop(store);
        run_server_with_shutdown(state, config.port, shutdown_signal()).await
    });
    if let Err(e) = result {
        tracing::error!("Server error: {e:#}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Build application state without starting the server.
///
/// # Errors
/// Returns an error if the client or the storage cannot be created.
pub fn initialize(config: &AppConfig) -> anyhow::Result<Arc<AppState>> {
    AppState::new(config).context("failed to create application state")
}

/// Run the server with graceful shutdown.
///
/// # Errors
/// Returns an error if the server fails.
pub async fn run_server_with_shutdown<F>(
    state: Arc<AppState>,
    port: u16,
    shutdown_signal: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    server::run_server_with_shutdown(state, port, shutdown_signal).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
