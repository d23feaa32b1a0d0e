//! Live generation state shared between the store and its observers.
//!
//! The store holds the only writer (a [`GenerationGuard`]); observers read
//! snapshots and may request a stop without touching conversation state.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::chat::ids::ConversationId;
use crate::chat::projection::{DisplayMessage, display_messages};
use crate::chat::types::Message;
use crate::llm::backend::InferenceBackend;

/// Point-in-time view of the running generation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveGeneration {
    /// Whether a generation is running.
    pub generating: bool,
    /// Text received so far.
    pub content: String,
    /// Conversation the reply will be committed to.
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Default)]
struct LiveState {
    generating: bool,
    buffer: String,
    stop_requested: bool,
    conversation_id: Option<ConversationId>,
    history: Vec<Message>,
}

/// Tracks the single in-flight generation.
pub struct GenerationMonitor {
    state: Mutex<LiveState>,
    backend: Arc<dyn InferenceBackend>,
}

impl GenerationMonitor {
    /// Create an idle monitor that cancels through `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LiveState::default()),
            backend,
        })
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> LiveGeneration {
        self.with_state(|state| LiveGeneration {
            generating: state.generating,
            content: state.buffer.clone(),
            conversation_id: state.conversation_id.clone(),
        })
    }

    /// The generating conversation as a chat view would render it.
    ///
    /// Returns `None` when idle.
    #[must_use]
    pub fn display_messages(&self, now: DateTime<Utc>) -> Option<Vec<DisplayMessage>> {
        self.with_state(|state| {
            state
                .generating
                .then(|| display_messages(&state.history, &state.buffer, true, now))
        })
    }

    /// Whether a generation is running.
    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.with_state(|state| state.generating)
    }

    /// Request cancellation of the running generation.
    ///
    /// Returns `false` when nothing is running.
    pub fn stop(&self) -> bool {
        let was_running = self.with_state(|state| {
            if state.generating {
                state.stop_requested = true;
            }
            state.generating
        });
        if was_running {
            debug!("Stop requested for running generation");
            self.backend.cancel();
        }
        was_running
    }

    /// Mark a generation as started for `conversation_id`.
    ///
    /// Returns `None` if one is already running.
    #[must_use]
    pub fn begin(self: &Arc<Self>, conversation_id: ConversationId) -> Option<GenerationGuard> {
        let started = self.with_state(|state| {
            if state.generating {
                return false;
            }
            *state = LiveState {
                generating: true,
                conversation_id: Some(conversation_id),
                ..LiveState::default()
            };
            true
        });
        started.then(|| GenerationGuard {
            monitor: Arc::clone(self),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LiveState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

/// Write handle for the running generation; resets the monitor on drop.
pub struct GenerationGuard {
    monitor: Arc<GenerationMonitor>,
}

impl GenerationGuard {
    /// Record the persisted messages the reply will follow.
    pub fn publish_history(&self, messages: Vec<Message>) {
        self.monitor.with_state(|state| state.history = messages);
    }

    /// Append a received chunk to the live buffer.
    pub fn append(&self, chunk: &str) {
        self.monitor.with_state(|state| state.buffer.push_str(chunk));
    }

    /// Whether an observer asked to stop.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.monitor.with_state(|state| state.stop_requested)
    }

    /// Text received so far.
    #[must_use]
    pub fn content(&self) -> String {
        self.monitor.with_state(|state| state.buffer.clone())
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.monitor.with_state(|state| *state = LiveState::default());
    }
}
