//! Conversation and message model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chat::ids::{ConversationId, MessageId};
use crate::chat::title::derive_title;
use crate::llm::protocol::ChatTurn;

/// Title given to conversations before the first user message.
pub const DEFAULT_TITLE: &str = "New Chat";
/// Maximum number of messages retained per conversation.
pub const MAX_MESSAGES: usize = 1000;

/// Author of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Human input.
    User,
    /// Model output.
    Assistant,
}

impl Role {
    /// Stable string form used on the wire and in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Speaker label used in exports.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::User => "You",
            Self::Assistant => "Assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted chat message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier.
    #[serde(default)]
    pub id: MessageId,
    /// Author.
    pub role: Role,
    /// Trimmed text.
    pub content: String,
    /// Creation time.
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    /// Extra fields carried through storage untouched.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Build a message with trimmed content and a fresh id.
    #[must_use]
    pub fn new(role: Role, content: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.trim().to_string(),
            timestamp,
            metadata: Map::new(),
        }
    }

    /// Role/content pair sent as model context.
    #[must_use]
    pub fn to_turn(&self) -> ChatTurn {
        ChatTurn::new(self.role.as_str(), self.content.clone())
    }
}

/// A conversation thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Unique identifier.
    pub id: ConversationId,
    /// Display title.
    pub title: String,
    /// Creation time.
    #[serde(with = "iso_millis")]
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    #[serde(with = "iso_millis")]
    pub updated_at: DateTime<Utc>,
    /// Messages, oldest first.
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Create an empty conversation with the default title.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: ConversationId::new(),
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Append a message, enforcing retention and deriving the title from
    /// the first user message while the title is still the default.
    pub fn push(&mut self, message: Message, now: DateTime<Utc>) {
        let is_user = message.role == Role::User;
        self.messages.push(message);
        self.enforce_retention();
        if is_user && self.has_default_title() {
            if let Some(title) = derive_title(&self.messages) {
                self.title = title;
            }
        }
        self.updated_at = now;
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Whether the title has never been set.
    #[must_use]
    pub fn has_default_title(&self) -> bool {
        self.title.is_empty() || self.title == DEFAULT_TITLE
    }

    /// Drop the oldest messages beyond [`MAX_MESSAGES`].
    pub fn enforce_retention(&mut self) {
        if self.messages.len() > MAX_MESSAGES {
            let overflow = self.messages.len() - MAX_MESSAGES;
            self.messages.drain(..overflow);
        }
    }
}

/// Serde adapter for ISO-8601 UTC timestamps with millisecond precision.
pub mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Format a timestamp as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
    #[must_use]
    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Serialize a timestamp.
    ///
    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(value))
    }

    /// Deserialize any RFC 3339 timestamp into UTC.
    ///
    /// # Errors
    /// Fails on malformed timestamps.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
