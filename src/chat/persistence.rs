//! Loading, saving and migrating the persisted conversation set.
//!
//! The current layout is a JSON array of conversations under
//! [`CONVERSATIONS_KEY`]. Older clients kept a single flat message list
//! under [`LEGACY_MESSAGES_KEY`]; it is migrated into one conversation on
//! first load and left in place.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::chat::errors::ChatResult;
use crate::chat::storage::LocalStorage;
use crate::chat::title::derive_title;
use crate::chat::types::{Conversation, DEFAULT_TITLE, MAX_MESSAGES, Message};

/// Storage key of the multi-conversation layout.
pub const CONVERSATIONS_KEY: &str = "chatgpt-at-home-conversations";
/// Storage key of the legacy single-thread message list.
pub const LEGACY_MESSAGES_KEY: &str = "chatgpt-at-home-messages";

/// Load the conversation set, migrating legacy state when needed.
///
/// Unreadable or corrupted state yields an empty set.
#[must_use]
pub fn load_conversations(storage: &dyn LocalStorage, now: DateTime<Utc>) -> Vec<Conversation> {
    match try_load(storage, now) {
        Ok(conversations) => conversations,
        Err(e) => {
            warn!("Failed to load conversations from storage: {e}");
            Vec::new()
        }
    }
}

fn try_load(storage: &dyn LocalStorage, now: DateTime<Utc>) -> ChatResult<Vec<Conversation>> {
    if let Some(raw) = storage.get_item(CONVERSATIONS_KEY)? {
        let mut conversations: Vec<Conversation> = serde_json::from_str(&raw)?;
        for conversation in &mut conversations {
            conversation.enforce_retention();
        }
        return Ok(conversations);
    }

    let Some(raw) = storage.get_item(LEGACY_MESSAGES_KEY)? else {
        return Ok(Vec::new());
    };
    let messages: Vec<Message> = serde_json::from_str(&raw)?;
    let mut conversation = Conversation::new(now);
    conversation.title = derive_title(&messages).unwrap_or_else(|| DEFAULT_TITLE.to_string());
    let skip = messages.len().saturating_sub(MAX_MESSAGES);
    conversation.messages = messages.into_iter().skip(skip).collect();

    let migrated = vec![conversation];
    save_conversations(storage, &migrated)?;
    info!(
        "Migrated {} legacy messages into conversation {}",
        migrated[0].messages.len(),
        migrated[0].id
    );
    Ok(migrated)
}

/// Serialize and write the full conversation set.
///
/// Each conversation is truncated to its newest [`MAX_MESSAGES`] messages
/// in the written form.
///
/// # Errors
/// Returns an error if serialization or the storage write fails.
pub fn save_conversations(
    storage: &dyn LocalStorage,
    conversations: &[Conversation],
) -> ChatResult<()> {
    let needs_trim = conversations.iter().any(|c| c.messages.len() > MAX_MESSAGES);
    let raw = if needs_trim {
        let trimmed: Vec<Conversation> = conversations
            .iter()
            .cloned()
            .map(|mut c| {
                c.enforce_retention();
                c
            })
            .collect();
        serde_json::to_string(&trimmed)?
    } else {
        serde_json::to_string(conversations)?
    };
    storage.set_item(CONVERSATIONS_KEY, &raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::chat::storage::MemoryLocalStorage;
    use crate::chat::types::Role;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }

    const LEGACY: &str = r#"[
        {"id":"1700000000000-abc","role":"user","content":"Explain borrowing\nplease","timestamp":"2023-11-14T22:13:20.000Z"},
        {"id":"1700000000001-def","role":"assistant","content":"Sure.","timestamp":"2023-11-14T22:13:21.000Z","model":"gpt-oss:20b"}
    ]"#;

    #[test]
    fn test_empty_storage_loads_nothing() {
        let storage = MemoryLocalStorage::new();
        assert!(load_conversations(&storage, at(0)).is_empty());
    }

    #[test]
    fn test_legacy_migration_keeps_legacy_key() {
        let storage = MemoryLocalStorage::new();
        assert!(storage.set_item(LEGACY_MESSAGES_KEY, LEGACY).is_ok());

        let conversations = load_conversations(&storage, at(5));
        assert_eq!(conversations.len(), 1);
        let migrated = &conversations[0];
        assert_eq!(migrated.title, "Explain borrowing");
        assert_eq!(migrated.created_at, at(5));
        assert_eq!(migrated.messages.len(), 2);
        assert_eq!(migrated.messages[0].id, "1700000000000-abc");
        assert_eq!(migrated.messages[1].role, Role::Assistant);
        assert_eq!(
            migrated.messages[1].metadata.get("model").and_then(|v| v.as_str()),
            Some("gpt-oss:20b")
        );

        assert_eq!(
            storage.get_item(LEGACY_MESSAGES_KEY).ok().flatten().as_deref(),
            Some(LEGACY)
        );
        assert!(storage.get_item(CONVERSATIONS_KEY).ok().flatten().is_some());

        // Second load reads the new layout, not the legacy one again.
        let reloaded = load_conversations(&storage, at(9));
        assert_eq!(reloaded, conversations);
    }

    #[test]
    fn test_legacy_without_user_message_gets_default_title() {
        let storage = MemoryLocalStorage::new();
        let legacy = r#"[{"id":"x","role":"assistant","content":"hi","timestamp":"2023-11-14T22:13:20.000Z"}]"#;
        assert!(storage.set_item(LEGACY_MESSAGES_KEY, legacy).is_ok());
        let conversations = load_conversations(&storage, at(0));
        assert_eq!(conversations[0].title, DEFAULT_TITLE);
    }

    #[test]
    fn test_legacy_migration_keeps_newest_messages() {
        let storage = MemoryLocalStorage::new();
        let legacy: Vec<Message> = (0..MAX_MESSAGES + 25)
            .map(|i| {
                let secs = i64::try_from(i).unwrap_or_default();
                Message::new(Role::User, &format!("m{i}"), at(secs))
            })
            .collect();
        let raw = serde_json::to_string(&legacy).unwrap_or_default();
        assert!(storage.set_item(LEGACY_MESSAGES_KEY, &raw).is_ok());

        let conversations = load_conversations(&storage, at(0));
        let migrated = &conversations[0];
        assert_eq!(migrated.messages.len(), MAX_MESSAGES);
        assert_eq!(migrated.messages[0].content, "m25");
        assert_eq!(
            migrated.messages.last().map(|m| m.content.as_str()),
            Some(format!("m{}", MAX_MESSAGES + 24).as_str())
        );
        assert_eq!(migrated.title, "m0");
        assert_eq!(load_conversations(&storage, at(1))[0].messages.len(), MAX_MESSAGES);
    }

    #[test]
    fn test_corrupted_state_degrades_to_empty() {
        let storage = MemoryLocalStorage::new();
        assert!(storage.set_item(CONVERSATIONS_KEY, "{not json").is_ok());
        assert!(load_conversations(&storage, at(0)).is_empty());

        let storage = MemoryLocalStorage::new();
        assert!(storage
            .set_item(LEGACY_MESSAGES_KEY, r#"[{"role":"system","content":"x","timestamp":"2023-11-14T22:13:20.000Z"}]"#)
            .is_ok());
        assert!(load_conversations(&storage, at(0)).is_empty());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let storage = MemoryLocalStorage::new();
        let mut conversation = Conversation::new(at(1));
        conversation.push(Message::new(Role::User, "hello", at(2)), at(2));
        assert!(save_conversations(&storage, std::slice::from_ref(&conversation)).is_ok());
        assert_eq!(load_conversations(&storage, at(3)), vec![conversation]);
    }

    #[test]
    fn test_save_truncates_oversized_conversations() {
        let storage = MemoryLocalStorage::new();
        let mut conversation = Conversation::new(at(0));
        conversation.messages = (0..MAX_MESSAGES + 5)
            .map(|i| Message::new(Role::User, &format!("m{i}"), at(0)))
            .collect();
        assert!(save_conversations(&storage, &[conversation]).is_ok());

        let loaded = load_conversations(&storage, at(0));
        assert_eq!(loaded[0].messages.len(), MAX_MESSAGES);
        assert_eq!(loaded[0].messages[0].content, "m5");
    }
}
