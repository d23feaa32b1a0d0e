//! Application state shared across all request handlers.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::chat::{ChatStore, GenerationMonitor, LocalStorage, SqliteLocalStorage};
use crate::llm::OllamaClient;
use crate::start_ollama_chat::AppConfig;

/// Shared application state.
pub struct AppState {
    /// Conversation store; held for the whole duration of a generation.
    pub store: Mutex<ChatStore>,
    /// Live generation state, readable while the store is locked.
    pub monitor: Arc<GenerationMonitor>,
    /// Ollama client for model listing and health.
    pub client: Arc<OllamaClient>,
}

impl AppState {
    /// Create the state from process configuration.
    ///
    /// # Errors
    /// Returns an error if the Ollama client or the storage cannot be
    /// created.
    pub fn new(config: &AppConfig) -> anyhow::Result<Arc<Self>> {
        let client = Arc::new(OllamaClient::new(config.client.clone())?);
        let storage = SqliteLocalStorage::open(&config.storage_path)?;
        tracing::info!("Conversations stored in {}", config.storage_path.display());
        Ok(Self::from_parts(client, Box::new(storage)))
    }

    /// Assemble the state from an existing client and storage backend.
    #[must_use]
    pub fn from_parts(client: Arc<OllamaClient>, storage: Box<dyn LocalStorage>) -> Arc<Self> {
        let store = ChatStore::new(storage, client.clone());
        let monitor = store.monitor();
        Arc::new(Self {
            store: Mutex::new(store),
            monitor,
            client,
        })
    }
}
