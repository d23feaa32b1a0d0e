//! Read-only view merging persisted messages with the live stream buffer.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chat::types::{Message, Role, iso_millis};

/// Id of the synthetic in-progress assistant entry.
pub const STREAMING_ID: &str = "streaming";

/// Message as rendered by a chat view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMessage {
    /// Message id, or [`STREAMING_ID`].
    pub id: String,
    /// Author.
    pub role: Role,
    /// Text.
    pub content: String,
    /// Creation time.
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    /// Whether this entry is still being generated.
    pub is_streaming: bool,
}

impl From<&Message> for DisplayMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.to_string(),
            role: message.role,
            content: message.content.clone(),
            timestamp: message.timestamp,
            is_streaming: false,
        }
    }
}

/// Persisted messages followed by the live assistant reply, if any.
///
/// The streaming entry is present only while generating with a non-empty
/// buffer.
#[must_use]
pub fn display_messages(
    persisted: &[Message],
    buffer: &str,
    generating: bool,
    now: DateTime<Utc>,
) -> Vec<DisplayMessage> {
    let mut out: Vec<DisplayMessage> = persisted.iter().map(DisplayMessage::from).collect();
    if generating && !buffer.is_empty() {
        out.push(DisplayMessage {
            id: STREAMING_ID.to_string(),
            role: Role::Assistant,
            content: buffer.to_string(),
            timestamp: now,
            is_streaming: true,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_entry_only_while_generating() {
        let now = Utc::now();
        let persisted = vec![Message::new(Role::User, "hi", now)];

        let idle = display_messages(&persisted, "partial", false, now);
        assert_eq!(idle.len(), 1);

        let empty = display_messages(&persisted, "", true, now);
        assert_eq!(empty.len(), 1);

        let live = display_messages(&persisted, "Hel", true, now);
        assert_eq!(live.len(), 2);
        assert_eq!(live[1].id, STREAMING_ID);
        assert_eq!(live[1].content, "Hel");
        assert!(live[1].is_streaming);
        assert!(!live[0].is_streaming);
    }
}
