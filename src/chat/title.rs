//! Conversation title derivation.

use crate::chat::types::{Message, Role};

/// Maximum title length in characters.
pub const TITLE_MAX_CHARS: usize = 50;

/// Title taken from the first line of the first user message.
#[must_use]
pub fn derive_title(messages: &[Message]) -> Option<String> {
    let first_user = messages.iter().find(|m| m.role == Role::User)?;
    let first_line = first_user.content.lines().next().unwrap_or_default();
    let title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    (!title.trim().is_empty()).then_some(title)
}
