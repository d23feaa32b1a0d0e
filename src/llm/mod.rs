//! Inference client for a local Ollama server.
//!
//! - `config`: connection settings and sampling options
//! - `errors`: inference error taxonomy
//! - `protocol`: wire types and NDJSON decoding
//! - `backend`: the trait the conversation store streams through
//! - `client`: the reqwest-based Ollama implementation

pub mod backend;
pub mod client;
pub mod config;
pub mod errors;
pub mod protocol;

pub use backend::{BackendFuture, ChunkStream, InferenceBackend};
pub use client::{GenerationPhase, OllamaClient};
pub use config::{ClientConfig, ConfigUpdate, GenerationOptions};
pub use errors::{InferenceError, InferenceResult};
pub use protocol::{ChatTurn, ModelInfo};
