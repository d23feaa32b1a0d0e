//! Wire types for the Ollama HTTP API and NDJSON stream decoding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A role/content pair sent as conversation context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatTurn {
    /// Build a turn from a role and content.
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Body of `POST /api/chat`.
#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    /// Model name.
    pub model: &'a str,
    /// Conversation context.
    pub messages: &'a [ChatTurn],
    /// Always `true`; the client consumes NDJSON.
    pub stream: bool,
    /// Resolved sampling options.
    pub options: &'a Map<String, Value>,
}

/// One installed model, as listed by `GET /api/tags`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name including tag, e.g. `gpt-oss:20b`.
    pub name: String,
    /// Remaining fields (`size`, `digest`, ...), kept opaque.
    #[serde(default, flatten)]
    pub details: Map<String, Value>,
}

impl ModelInfo {
    /// Whether this model satisfies the configured model name.
    ///
    /// Matches the exact name, or `configured:<tag>` when the configured
    /// name carries no tag of its own.
    #[must_use]
    pub fn matches(&self, configured: &str) -> bool {
        self.name == configured
            || self
                .name
                .strip_prefix(configured)
                .is_some_and(|rest| rest.starts_with(':'))
    }
}

/// Body of `GET /api/tags`.
#[derive(Debug, Default, Deserialize)]
pub struct TagsResponse {
    /// Installed models.
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Decoded meaning of one NDJSON line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Next text chunk.
    Content(String),
    /// Server-side error; aborts the stream.
    Error(String),
    /// Final line; the stream ended successfully.
    Done,
    /// Line carried nothing of interest.
    Empty,
}

/// Decode one NDJSON line into the events it carries.
///
/// A line may carry content and `done` at once, so up to two events are
/// returned in order.
///
/// # Errors
/// Returns the JSON error for malformed lines; callers skip those.
pub fn parse_stream_line(line: &str) -> Result<Vec<StreamEvent>, serde_json::Error> {
    let parsed: StreamLine = serde_json::from_str(line)?;

    if let Some(error) = parsed.error {
        return Ok(vec![StreamEvent::Error(error)]);
    }

    let mut events = Vec::with_capacity(2);
    if let Some(content) = parsed.message.and_then(|m| m.content) {
        if !content.is_empty() {
            events.push(StreamEvent::Content(content));
        }
    }
    if parsed.done {
        events.push(StreamEvent::Done);
    }
    if events.is_empty() {
        events.push(StreamEvent::Empty);
    }
    Ok(events)
}

/// Splits a byte stream into complete lines.
///
/// Network reads may end mid-line and mid-codepoint, so bytes are buffered
/// until a newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Feed bytes and drain every complete, non-blank line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Drain whatever remains once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&raw);
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}
