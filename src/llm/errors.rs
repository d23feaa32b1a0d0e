//! Error types for the inference client.

use std::time::Duration;

use thiserror::Error;

/// Inference client error type.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The configured model is not installed on the server.
    #[error("Model \"{0}\" not found. Please install it using: ollama pull {0}")]
    ModelNotFound(String),
    /// Transport-level failure (connect, read, TLS).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Server answered with a non-success status.
    #[error("HTTP error! status: {0}")]
    HttpStatus(u16),
    /// A non-streaming request exceeded its timeout.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// The request was canceled by the caller.
    #[error("Request canceled")]
    Canceled,
    /// The server reported an error inside the stream.
    #[error("server error: {0}")]
    Server(String),
    /// A response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    /// Connectivity could not be established before generating.
    #[error("{0}")]
    NotConnected(String),
    /// Generation failed after the allowed attempts.
    #[error("Failed to generate response: {source}")]
    GenerationFailed {
        /// Number of attempts made.
        attempts: u32,
        /// Last error observed.
        #[source]
        source: Box<InferenceError>,
    },
}

impl InferenceError {
    /// Whether this error is the caller-initiated cancellation.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Whether this error means the server can no longer be assumed reachable.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::GenerationFailed { source, .. } => source.is_connection_loss(),
            _ => false,
        }
    }

    /// Whether another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Canceled | Self::InvalidConfig(_) | Self::ModelNotFound(_)
        )
    }
}

/// Convenience result alias for inference operations.
pub type InferenceResult<T> = Result<T, InferenceError>;
