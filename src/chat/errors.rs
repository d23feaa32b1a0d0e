//! Error types for the conversation store.

use std::fmt;

use thiserror::Error;

use crate::chat::storage::StorageError;
use crate::llm::errors::InferenceError;

/// Why a message cannot be sent right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotReadyReason {
    /// Another generation is still running.
    Generating,
    /// The inference server is not connected.
    Disconnected,
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generating => write!(f, "Please wait for the current response to complete"),
            Self::Disconnected => write!(
                f,
                "Not connected to Ollama. Please check your connection."
            ),
        }
    }
}

/// Conversation store error type.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Message content was empty after trimming.
    #[error("Message content cannot be empty")]
    EmptyContent,
    /// A generation is running or the server is disconnected.
    #[error("{0}")]
    NotReady(NotReadyReason),
    /// The model finished without producing text.
    #[error("Received empty response from the model")]
    EmptyResponse,
    /// Retry was requested on a conversation without user messages.
    #[error("No user message to retry")]
    NoUserMessage,
    /// No message with the given id exists in the active conversation.
    #[error("Message not found")]
    MessageNotFound,
    /// Only user messages can be edited.
    #[error("Only user messages can be edited")]
    InvalidEditTarget,
    /// The operation is not allowed while a response is generating.
    #[error("Cannot modify the conversation while generating a response")]
    GenerationInProgress,
    /// Export format is not one of `json`, `txt`, `md`.
    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),
    /// Inference client failure.
    #[error(transparent)]
    Inference(#[from] InferenceError),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Convenience result alias for store operations.
pub type ChatResult<T> = Result<T, ChatError>;
