//! Trait seam between the conversation store and the inference server.

use std::future::Future;
use std::pin::Pin;

use futures::Stream;

use crate::llm::config::GenerationOptions;
use crate::llm::errors::InferenceResult;
use crate::llm::protocol::ChatTurn;

/// Boxed future type for backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lazy sequence of generated text chunks.
pub type ChunkStream<'a> = Pin<Box<dyn Stream<Item = InferenceResult<String>> + Send + 'a>>;

/// Abstraction over a streaming chat model.
pub trait InferenceBackend: Send + Sync {
    /// Whether the last connection check succeeded and nothing failed since.
    fn is_connected(&self) -> bool;

    /// Verify the server is reachable and the configured model is installed.
    ///
    /// # Errors
    /// Returns an error if the server cannot be reached or lacks the model.
    fn check_connection(&self) -> BackendFuture<'_, InferenceResult<()>>;

    /// Stream a response for the given context.
    ///
    /// The stream ends after the last chunk; a cancellation surfaces as a
    /// final `InferenceError::Canceled` item.
    fn generate_response(
        &self,
        messages: Vec<ChatTurn>,
        options: GenerationOptions,
    ) -> ChunkStream<'_>;

    /// Abort the in-flight generation, if any.
    fn cancel(&self);
}
