//! Async Ollama client: connection checks, NDJSON chat streaming, retries.
//!
//! Behaviour:
//! - `check_connection` lists installed models via `GET /api/tags` and
//!   verifies the configured model is among them.
//! - `generate_response` streams `POST /api/chat` output chunk by chunk,
//!   retrying failed attempts with linear backoff as long as nothing was
//!   yielded yet.
//! - `cancel` aborts the in-flight generation through a cancellation token
//!   raced against every network read and backoff sleep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::backend::{BackendFuture, ChunkStream, InferenceBackend};
use crate::llm::config::{ClientConfig, ConfigUpdate, GenerationOptions};
use crate::llm::errors::{InferenceError, InferenceResult};
use crate::llm::protocol::{
    ChatRequest, ChatTurn, LineBuffer, ModelInfo, StreamEvent, TagsResponse, parse_stream_line,
};

/// Lifecycle of the most recent connection check or generation attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GenerationPhase {
    /// Nothing has happened yet.
    #[default]
    Idle,
    /// Checking connectivity or waiting for response headers.
    Connecting,
    /// Reading the response body.
    Streaming,
    /// The last generation ended normally.
    Completed,
    /// The last generation was canceled.
    Canceled,
    /// The last generation failed.
    Failed,
}

#[derive(Debug, Default)]
struct HealthState {
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
    phase: GenerationPhase,
}

#[derive(Debug, Default)]
struct CancelSlot {
    current: Option<(u64, CancellationToken)>,
}

/// Streaming client for the Ollama chat API.
pub struct OllamaClient {
    http: reqwest::Client,
    config: RwLock<ClientConfig>,
    health: Mutex<HealthState>,
    cancel_slot: Mutex<CancelSlot>,
    next_slot_id: AtomicU64,
}

/// Disarms the cancel slot when a generation stream finishes or is dropped.
struct SlotGuard<'a> {
    client: &'a OllamaClient,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.client.disarm(self.id);
    }
}

impl OllamaClient {
    /// Create a client with the given configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: ClientConfig) -> InferenceResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            config: RwLock::new(config),
            health: Mutex::new(HealthState::default()),
            cancel_slot: Mutex::new(CancelSlot::default()),
            next_slot_id: AtomicU64::new(1),
        })
    }

    /// Snapshot of the effective configuration.
    #[must_use]
    pub fn config(&self) -> ClientConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `update` and return the new effective configuration.
    ///
    /// Connection health is reset so the next generation re-validates.
    ///
    /// # Errors
    /// Returns an error if the resulting configuration is invalid; the
    /// previous configuration stays in effect.
    pub fn update_config(&self, update: &ConfigUpdate) -> InferenceResult<ClientConfig> {
        let next = update.apply(&self.config());
        next.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        self.with_health(|health| {
            health.last_check = None;
            health.last_error = None;
        });
        info!("Inference client reconfigured: {} @ {}", next.model, next.base_url);
        Ok(next)
    }

    /// Switch the model used for subsequent requests.
    ///
    /// # Errors
    /// Returns an error if the model name is empty.
    pub fn set_model(&self, model: &str) -> InferenceResult<ClientConfig> {
        self.update_config(&ConfigUpdate {
            model: Some(model.to_string()),
            ..ConfigUpdate::default()
        })
    }

    /// Whether the last check succeeded and no error was recorded since.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.with_health(|health| health.last_error.is_none() && health.last_check.is_some())
    }

    /// Human-readable text of the last connection failure.
    #[must_use]
    pub fn connection_error(&self) -> Option<String> {
        self.with_health(|health| health.last_error.clone())
    }

    /// Time of the last successful connection check.
    #[must_use]
    pub fn last_connection_check(&self) -> Option<DateTime<Utc>> {
        self.with_health(|health| health.last_check)
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> GenerationPhase {
        self.with_health(|health| health.phase)
    }

    /// List models installed on the server.
    ///
    /// # Errors
    /// Returns an error if the request fails, times out, or the body is malformed.
    pub async fn list_models(&self) -> InferenceResult<Vec<ModelInfo>> {
        let url = self.config().endpoint("tags");
        let tags: TagsResponse = self.get_json(&url).await?;
        Ok(tags.models)
    }

    /// Verify that the server is reachable and the configured model is installed.
    ///
    /// # Errors
    /// Returns `ModelNotFound` if the model is missing, or the transport error.
    pub async fn check_connection(&self) -> InferenceResult<()> {
        self.with_health(|health| {
            health.phase = GenerationPhase::Connecting;
            health.last_error = None;
        });

        let model = self.config().model;
        let result = match self.list_models().await {
            Ok(models) if models.iter().any(|m| m.matches(&model)) => Ok(()),
            Ok(_) => Err(InferenceError::ModelNotFound(model.clone())),
            Err(err) => Err(err),
        };

        self.with_health(|health| {
            health.phase = GenerationPhase::Idle;
            match &result {
                Ok(()) => {
                    health.last_check = Some(Utc::now());
                    health.last_error = None;
                }
                Err(err) => {
                    health.last_check = None;
                    health.last_error = Some(err.to_string());
                }
            }
        });

        match &result {
            Ok(()) => debug!("Ollama reachable with model {model}"),
            Err(err) => warn!("Ollama connection check failed: {err}"),
        }
        result
    }

    /// Stream a chat response for `messages`.
    ///
    /// Connectivity is re-checked first when the client is not connected.
    /// Failed attempts are retried up to `max_retries` times with linear
    /// backoff, unless a chunk was already yielded or the caller canceled.
    pub fn generate_response(
        &self,
        messages: Vec<ChatTurn>,
        options: GenerationOptions,
    ) -> ChunkStream<'_> {
        let (slot_id, token) = self.arm();

        Box::pin(async_stream::stream! {
            let _guard = SlotGuard { client: self, id: slot_id };

            if !self.is_connected() {
                if let Err(err) = self.check_connection().await {
                    self.set_phase(GenerationPhase::Failed);
                    yield Err(InferenceError::NotConnected(err.to_string()));
                    return;
                }
            }

            let config = self.config();
            let url = config.endpoint("chat");
            let options = options.resolve();
            let request = ChatRequest {
                model: &config.model,
                messages: &messages,
                stream: true,
                options: &options,
            };
            let body = match serde_json::to_vec(&request) {
                Ok(body) => body,
                Err(err) => {
                    self.set_phase(GenerationPhase::Failed);
                    yield Err(InferenceError::Decode(err));
                    return;
                }
            };

            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                let mut yielded = false;
                self.set_phase(GenerationPhase::Connecting);

                let outcome: InferenceResult<()> = 'attempt: {
                    let send = self
                        .http
                        .post(&url)
                        .header(reqwest::header::CONTENT_TYPE, "application/json")
                        .body(body.clone())
                        .send();
                    let response = tokio::select! {
                        biased;
                        () = token.cancelled() => None,
                        response = send => Some(response),
                    };
                    let response = match response {
                        None => break 'attempt Err(InferenceError::Canceled),
                        Some(Err(err)) => break 'attempt Err(InferenceError::Transport(err)),
                        Some(Ok(response)) => response,
                    };
                    let status = response.status();
                    if !status.is_success() {
                        break 'attempt Err(InferenceError::HttpStatus(status.as_u16()));
                    }

                    self.set_phase(GenerationPhase::Streaming);
                    let mut bytes = response.bytes_stream();
                    let mut lines = LineBuffer::new();
                    loop {
                        let next = tokio::select! {
                            biased;
                            () = token.cancelled() => None,
                            next = bytes.next() => Some(next),
                        };
                        let (batch, ended) = match next {
                            None => break 'attempt Err(InferenceError::Canceled),
                            Some(Some(Err(err))) => {
                                break 'attempt Err(InferenceError::Transport(err));
                            }
                            Some(Some(Ok(chunk))) => (lines.push(&chunk), false),
                            Some(None) => (lines.finish().into_iter().collect::<Vec<_>>(), true),
                        };

                        for line in batch {
                            let events = match parse_stream_line(&line) {
                                Ok(events) => events,
                                Err(err) => {
                                    warn!("Failed to parse streaming response line: {err}");
                                    continue;
                                }
                            };
                            for event in events {
                                match event {
                                    StreamEvent::Content(text) => {
                                        if token.is_cancelled() {
                                            break 'attempt Err(InferenceError::Canceled);
                                        }
                                        yielded = true;
                                        yield Ok(text);
                                    }
                                    StreamEvent::Error(message) => {
                                        break 'attempt Err(InferenceError::Server(message));
                                    }
                                    StreamEvent::Done => break 'attempt Ok(()),
                                    StreamEvent::Empty => {}
                                }
                            }
                        }

                        if ended {
                            break 'attempt Ok(());
                        }
                    }
                };

                let err = match outcome {
                    Ok(()) => {
                        self.set_phase(GenerationPhase::Completed);
                        return;
                    }
                    Err(err) if err.is_canceled() => {
                        info!("Generation canceled on attempt {attempt}");
                        self.set_phase(GenerationPhase::Canceled);
                        yield Err(err);
                        return;
                    }
                    Err(err) => err,
                };

                if yielded || !err.is_retryable() || attempt > config.max_retries {
                    let failure = InferenceError::GenerationFailed {
                        attempts: attempt,
                        source: Box::new(err),
                    };
                    if failure.is_connection_loss() {
                        self.mark_connection_lost();
                    }
                    warn!("Generation failed after {attempt} attempt(s): {failure}");
                    self.set_phase(GenerationPhase::Failed);
                    yield Err(failure);
                    return;
                }

                let delay = config.backoff(attempt);
                warn!(
                    "Retry attempt {}/{} in {:?} after error: {}",
                    attempt,
                    config.max_retries,
                    delay,
                    err
                );
                let canceled = tokio::select! {
                    biased;
                    () = token.cancelled() => true,
                    () = tokio::time::sleep(delay) => false,
                };
                if canceled {
                    self.set_phase(GenerationPhase::Canceled);
                    yield Err(InferenceError::Canceled);
                    return;
                }
            }
        })
    }

    /// Generate a full response and return the concatenated text.
    ///
    /// # Errors
    /// Returns the first error produced by the stream.
    pub async fn generate_simple_response(
        &self,
        messages: Vec<ChatTurn>,
        options: GenerationOptions,
    ) -> InferenceResult<String> {
        let mut stream = self.generate_response(messages, options);
        let mut full = String::new();
        while let Some(chunk) = stream.next().await {
            full.push_str(&chunk?);
        }
        Ok(full)
    }

    /// Abort the in-flight generation; does nothing when idle.
    pub fn cancel(&self) {
        let current = self
            .cancel_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .take();
        if let Some((id, token)) = current {
            debug!("Canceling generation {id}");
            token.cancel();
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> InferenceResult<T> {
        let timeout = self.config().timeout;
        let request = async {
            let response = self.http.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(InferenceError::HttpStatus(status.as_u16()));
            }
            let body = response.bytes().await?;
            Ok::<T, InferenceError>(serde_json::from_slice(&body)?)
        };

        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| InferenceError::Timeout(timeout))?
    }

    fn arm(&self) -> (u64, CancellationToken) {
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut slot = self
            .cancel_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((_, previous)) = slot.current.replace((id, token.clone())) {
            previous.cancel();
        }
        (id, token)
    }

    fn disarm(&self, id: u64) {
        let mut slot = self
            .cancel_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.current.as_ref().is_some_and(|(current, _)| *current == id) {
            slot.current = None;
        }
    }

    fn mark_connection_lost(&self) {
        self.with_health(|health| {
            health.last_check = None;
            health.last_error = Some("Connection lost".to_string());
        });
    }

    fn set_phase(&self, phase: GenerationPhase) {
        self.with_health(|health| health.phase = phase);
    }

    fn with_health<R>(&self, f: impl FnOnce(&mut HealthState) -> R) -> R {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut health)
    }
}

impl InferenceBackend for OllamaClient {
    fn is_connected(&self) -> bool {
        Self::is_connected(self)
    }

    fn check_connection(&self) -> BackendFuture<'_, InferenceResult<()>> {
        Box::pin(Self::check_connection(self))
    }

    fn generate_response(
        &self,
        messages: Vec<ChatTurn>,
        options: GenerationOptions,
    ) -> ChunkStream<'_> {
        Self::generate_response(self, messages, options)
    }

    fn cancel(&self) {
        Self::cancel(self);
    }
}
