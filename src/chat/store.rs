//! Conversation store: threads, messages, streaming replies, persistence.
//!
//! Behaviour:
//! - every mutation re-serializes the full conversation set to storage;
//!   write failures are logged and do not fail the operation
//! - `send_message` appends the user turn, streams the reply through the
//!   [`InferenceBackend`] into the [`GenerationMonitor`] buffer, then
//!   commits it; failures roll the user turn back, cancellation keeps
//!   whatever text arrived, and so does dropping the future mid-stream
//! - exactly one conversation is active; deleting the last one creates a
//!   fresh one

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chat::clock::{Clock, SystemClock};
use crate::chat::errors::{ChatError, ChatResult, NotReadyReason};
use crate::chat::export::{ExportFormat, ExportedFile, export_messages};
use crate::chat::ids::{ConversationId, MessageId};
use crate::chat::monitor::{GenerationGuard, GenerationMonitor};
use crate::chat::persistence::{load_conversations, save_conversations};
use crate::chat::projection::{DisplayMessage, display_messages};
use crate::chat::storage::LocalStorage;
use crate::chat::types::{Conversation, DEFAULT_TITLE, Message, Role};
use crate::llm::backend::InferenceBackend;
use crate::llm::config::GenerationOptions;
use crate::llm::protocol::ChatTurn;

/// Number of most recent messages sent as model context.
pub const CONTEXT_WINDOW: usize = 20;

/// How a generation ended without error.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    /// The full reply was committed.
    Completed {
        /// Committed assistant message.
        message: Message,
    },
    /// The generation was stopped; any partial text was committed.
    Canceled {
        /// Committed partial reply, if any text arrived.
        partial: Option<Message>,
    },
}

impl SendOutcome {
    /// The committed assistant message, if any.
    #[must_use]
    pub const fn message(&self) -> Option<&Message> {
        match self {
            Self::Completed { message } => Some(message),
            Self::Canceled { partial } => partial.as_ref(),
        }
    }
}

/// Owner of all conversation state.
pub struct ChatStore {
    conversations: Vec<Conversation>,
    active_id: ConversationId,
    storage: Box<dyn LocalStorage>,
    backend: Arc<dyn InferenceBackend>,
    monitor: Arc<GenerationMonitor>,
    clock: Arc<dyn Clock>,
    last_error: Option<String>,
}

impl ChatStore {
    /// Load state from `storage` using the system clock.
    #[must_use]
    pub fn new(storage: Box<dyn LocalStorage>, backend: Arc<dyn InferenceBackend>) -> Self {
        Self::with_clock(storage, backend, Arc::new(SystemClock))
    }

    /// Load state from `storage` using `clock` for timestamps.
    ///
    /// The first stored conversation becomes active; an empty set gets a
    /// fresh conversation.
    #[must_use]
    pub fn with_clock(
        storage: Box<dyn LocalStorage>,
        backend: Arc<dyn InferenceBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut conversations = load_conversations(storage.as_ref(), clock.now());
        let created = conversations.is_empty();
        if created {
            conversations.push(Conversation::new(clock.now()));
        }
        let active_id = conversations
            .first()
            .map(|c| c.id.clone())
            .unwrap_or_default();
        let monitor = GenerationMonitor::new(Arc::clone(&backend));
        let store = Self {
            conversations,
            active_id,
            storage,
            backend,
            monitor,
            clock,
            last_error: None,
        };
        if created {
            store.persist();
        }
        info!("Chat store ready with {} conversation(s)", store.conversations.len());
        store
    }

    // ===== Read access =======================================================

    /// All conversations, most recently created first.
    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Id of the active conversation.
    #[must_use]
    pub const fn active_conversation_id(&self) -> &ConversationId {
        &self.active_id
    }

    /// The active conversation.
    #[must_use]
    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == self.active_id)
    }

    /// Persisted messages of the active conversation.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.active_conversation()
            .map(|c| c.messages.as_slice())
            .unwrap_or_default()
    }

    /// Active messages plus the in-progress reply for that conversation.
    #[must_use]
    pub fn display_messages(&self) -> Vec<DisplayMessage> {
        let live = self.monitor.snapshot();
        let streaming_here = live.conversation_id.as_ref() == Some(&self.active_id);
        display_messages(
            self.messages(),
            &live.content,
            live.generating && streaming_here,
            self.clock.now(),
        )
    }

    /// Message with `id` in the active conversation.
    #[must_use]
    pub fn get_message_by_id(&self, id: &str) -> Option<&Message> {
        self.messages().iter().find(|m| m.id == id)
    }

    /// Whether the active conversation has any message.
    #[must_use]
    pub fn has_messages(&self) -> bool {
        !self.messages().is_empty()
    }

    /// Whether a reply is being generated.
    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.monitor.is_generating()
    }

    /// Whether a message could be sent right now.
    #[must_use]
    pub fn can_send_message(&self) -> bool {
        !self.is_generating() && self.backend.is_connected()
    }

    /// Whether the inference backend is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    /// Text of the last failure, cleared by the next send.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Shared handle to the live generation state.
    #[must_use]
    pub fn monitor(&self) -> Arc<GenerationMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Case-insensitive substring search over the active conversation.
    #[must_use]
    pub fn search_messages(&self, query: &str) -> Vec<Message> {
        if query.trim().is_empty() {
            return Vec::new();
        }
        let needle = query.to_lowercase();
        self.messages()
            .iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// Render the active conversation as `format` (`json`, `txt`, `md`).
    ///
    /// # Errors
    /// Returns [`ChatError::UnsupportedFormat`] for unknown formats.
    pub fn export_conversation(&self, format: &str) -> ChatResult<ExportedFile> {
        let format: ExportFormat = format.parse()?;
        export_messages(self.messages(), format, self.clock.as_ref())
    }

    // ===== Messaging =========================================================

    /// Send a user message and stream the assistant reply.
    ///
    /// # Errors
    /// - [`ChatError::EmptyContent`] / [`ChatError::NotReady`] before any
    ///   state changes
    /// - [`ChatError::EmptyResponse`] when the model produced no text; the
    ///   user message is kept
    /// - [`ChatError::Inference`] on failure; the user message is removed
    pub async fn send_message(
        &mut self,
        content: &str,
        options: GenerationOptions,
    ) -> ChatResult<SendOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        self.ensure_ready()?;

        self.last_error = None;
        let conversation_id = self.active_id.clone();
        let now = self.clock.now();
        let user = Message::new(Role::User, content, now);
        let user_id = user.id.clone();
        if let Some(conversation) = self.conversation_mut(&conversation_id) {
            conversation.push(user, now);
        }
        self.persist();

        self.generate(conversation_id, user_id, options).await
    }

    /// Re-send the most recent user message.
    ///
    /// The assistant reply that followed it, if any, is discarded first;
    /// the content is then sent again as a new user turn.
    ///
    /// # Errors
    /// Returns [`ChatError::NoUserMessage`] if there is nothing to retry,
    /// plus the errors of [`ChatStore::send_message`].
    pub async fn retry_last_message(
        &mut self,
        options: GenerationOptions,
    ) -> ChatResult<SendOutcome> {
        let messages = self.messages();
        let Some(user_index) = messages.iter().rposition(|m| m.role == Role::User) else {
            return Err(ChatError::NoUserMessage);
        };
        let content = messages[user_index].content.clone();
        let reply_index = messages
            .iter()
            .skip(user_index + 1)
            .position(|m| m.role == Role::Assistant)
            .map(|offset| user_index + 1 + offset);
        self.ensure_ready()?;

        if let Some(index) = reply_index {
            let now = self.clock.now();
            let active = self.active_id.clone();
            if let Some(conversation) = self.conversation_mut(&active) {
                conversation.messages.remove(index);
                conversation.touch(now);
            }
            self.persist();
            debug!("Discarded previous reply before retry");
        }

        self.send_message(&content, options).await
    }

    /// Replace a user message and everything after it with a new turn.
    ///
    /// Blank `new_content` only truncates and returns `Ok(None)`.
    ///
    /// # Errors
    /// - [`ChatError::MessageNotFound`] for unknown ids
    /// - [`ChatError::InvalidEditTarget`] for assistant messages
    /// - [`ChatError::GenerationInProgress`] while generating
    /// - errors of [`ChatStore::send_message`] for the new turn
    pub async fn edit_message(
        &mut self,
        id: &str,
        new_content: &str,
        options: GenerationOptions,
    ) -> ChatResult<Option<SendOutcome>> {
        let index = self
            .messages()
            .iter()
            .position(|m| m.id == id)
            .ok_or(ChatError::MessageNotFound)?;
        if self.messages()[index].role != Role::User {
            return Err(ChatError::InvalidEditTarget);
        }
        if self.is_generating() {
            return Err(ChatError::GenerationInProgress);
        }

        let now = self.clock.now();
        let active = self.active_id.clone();
        if let Some(conversation) = self.conversation_mut(&active) {
            conversation.messages.truncate(index);
            conversation.touch(now);
        }
        self.persist();

        if new_content.trim().is_empty() {
            return Ok(None);
        }
        self.send_message(new_content, options).await.map(Some)
    }

    /// Remove one message from the active conversation.
    ///
    /// Returns `Ok(false)` if no message has that id.
    ///
    /// # Errors
    /// Returns [`ChatError::GenerationInProgress`] while generating.
    pub fn delete_message(&mut self, id: &str) -> ChatResult<bool> {
        let Some(index) = self.messages().iter().position(|m| m.id == id) else {
            return Ok(false);
        };
        if self.is_generating() {
            return Err(ChatError::GenerationInProgress);
        }
        let now = self.clock.now();
        let active = self.active_id.clone();
        if let Some(conversation) = self.conversation_mut(&active) {
            conversation.messages.remove(index);
            conversation.touch(now);
        }
        self.persist();
        Ok(true)
    }

    /// Empty the active conversation and reset its title.
    ///
    /// # Errors
    /// Returns [`ChatError::GenerationInProgress`] while generating.
    pub fn clear_conversation(&mut self) -> ChatResult<()> {
        if self.is_generating() {
            return Err(ChatError::GenerationInProgress);
        }
        let now = self.clock.now();
        let active = self.active_id.clone();
        if let Some(conversation) = self.conversation_mut(&active) {
            conversation.messages.clear();
            conversation.title = DEFAULT_TITLE.to_string();
            conversation.touch(now);
        }
        self.last_error = None;
        self.persist();
        Ok(())
    }

    /// Request cancellation of the running generation.
    ///
    /// Returns `false` when nothing is running.
    pub fn stop_generation(&self) -> bool {
        self.monitor.stop()
    }

    /// Re-check connectivity of the inference backend.
    ///
    /// # Errors
    /// Returns the backend's connection error.
    pub async fn check_connection(&mut self) -> ChatResult<()> {
        match self.backend.check_connection().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.last_error = Some(err.to_string());
                Err(err.into())
            }
        }
    }

    // ===== Conversations =====================================================

    /// Create an empty conversation at the front and activate it.
    pub fn new_conversation(&mut self) -> ConversationId {
        let conversation = Conversation::new(self.clock.now());
        let id = conversation.id.clone();
        self.conversations.insert(0, conversation);
        self.active_id = id.clone();
        self.persist();
        id
    }

    /// Activate conversation `id`; unknown ids are ignored.
    pub fn set_active_conversation(&mut self, id: &str) -> bool {
        match self.conversations.iter().find(|c| c.id == id) {
            Some(conversation) => {
                self.active_id = conversation.id.clone();
                true
            }
            None => false,
        }
    }

    /// Rename conversation `id`; a blank title keeps the current one.
    ///
    /// Returns `false` for unknown ids.
    pub fn rename_conversation(&mut self, id: &str, title: &str) -> bool {
        let now = self.clock.now();
        let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        let title = title.trim();
        if !title.is_empty() {
            conversation.title = title.to_string();
        }
        conversation.touch(now);
        self.persist();
        true
    }

    /// Delete conversation `id`.
    ///
    /// If it was active, the first remaining conversation becomes active,
    /// or a fresh one is created. Returns `false` for unknown ids.
    pub fn delete_conversation(&mut self, id: &str) -> bool {
        let Some(index) = self.conversations.iter().position(|c| c.id == id) else {
            return false;
        };
        let removed = self.conversations.remove(index);
        if removed.id == self.active_id {
            match self.conversations.first() {
                Some(next) => self.active_id = next.id.clone(),
                None => {
                    self.new_conversation();
                    return true;
                }
            }
        }
        self.persist();
        true
    }

    // ===== Internals =========================================================

    fn ensure_ready(&self) -> ChatResult<()> {
        if self.is_generating() {
            return Err(ChatError::NotReady(NotReadyReason::Generating));
        }
        if !self.backend.is_connected() {
            return Err(ChatError::NotReady(NotReadyReason::Disconnected));
        }
        Ok(())
    }

    /// Stream a reply into `conversation_id` from its current context.
    ///
    /// `user_id` is the turn removed again if generation fails. If the
    /// returned future is dropped mid-stream, [`PendingTurn`] settles the
    /// turn on drop.
    async fn generate(
        &mut self,
        conversation_id: ConversationId,
        user_id: MessageId,
        options: GenerationOptions,
    ) -> ChatResult<SendOutcome> {
        let guard = self
            .monitor
            .begin(conversation_id.clone())
            .ok_or(ChatError::NotReady(NotReadyReason::Generating))?;

        let history = self
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default();
        let start = history.len().saturating_sub(CONTEXT_WINDOW);
        let context: Vec<ChatTurn> = history[start..].iter().map(Message::to_turn).collect();
        guard.publish_history(history);

        let backend = Arc::clone(&self.backend);
        let mut turn = PendingTurn {
            store: self,
            conversation_id,
            user_id,
            guard: Some(guard),
        };
        let mut stream = backend.generate_response(context, options);
        let mut canceled = false;
        let mut failure = None;
        loop {
            if turn.stop_requested() {
                canceled = true;
                break;
            }
            match stream.next().await {
                None => break,
                Some(Ok(chunk)) => turn.append(&chunk),
                Some(Err(err)) if err.is_canceled() => {
                    canceled = true;
                    break;
                }
                Some(Err(err)) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        drop(stream);
        let text = turn.release();
        let store = &mut *turn.store;

        if let Some(err) = failure {
            store.rollback_user_message(&turn.conversation_id, &turn.user_id);
            store.last_error = Some(err.to_string());
            return Err(err.into());
        }

        let text = text.trim();
        if canceled {
            info!("Generation stopped with {} chars received", text.len());
            let partial =
                (!text.is_empty()).then(|| store.commit_reply(&turn.conversation_id, text));
            return Ok(SendOutcome::Canceled { partial });
        }
        if text.is_empty() {
            let err = ChatError::EmptyResponse;
            store.last_error = Some(err.to_string());
            return Err(err);
        }
        let message = store.commit_reply(&turn.conversation_id, text);
        Ok(SendOutcome::Completed { message })
    }

    fn commit_reply(&mut self, conversation_id: &ConversationId, text: &str) -> Message {
        let now = self.clock.now();
        let message = Message::new(Role::Assistant, text, now);
        if let Some(conversation) = self.conversation_mut(conversation_id) {
            conversation.push(message.clone(), now);
        }
        self.persist();
        message
    }

    fn rollback_user_message(&mut self, conversation_id: &ConversationId, user_id: &MessageId) {
        let now = self.clock.now();
        let Some(conversation) = self.conversation_mut(conversation_id) else {
            return;
        };
        if conversation.messages.last().is_some_and(|m| &m.id == user_id) {
            conversation.messages.pop();
            conversation.touch(now);
            warn!("Rolled back user message {user_id} after failed generation");
            self.persist();
        }
    }

    fn conversation_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| &c.id == id)
    }

    fn persist(&self) {
        if let Err(e) = save_conversations(self.storage.as_ref(), &self.conversations) {
            warn!("Failed to save conversations to storage: {e}");
        }
    }
}

/// A user turn whose reply is still streaming.
///
/// Dropped while still holding the generation guard (the caller abandoned
/// the future), it commits the text received so far, or removes the user
/// turn when nothing arrived.
struct PendingTurn<'a> {
    store: &'a mut ChatStore,
    conversation_id: ConversationId,
    user_id: MessageId,
    guard: Option<GenerationGuard>,
}

impl PendingTurn<'_> {
    fn stop_requested(&self) -> bool {
        self.guard
            .as_ref()
            .is_some_and(GenerationGuard::stop_requested)
    }

    fn append(&self, chunk: &str) {
        if let Some(guard) = &self.guard {
            guard.append(chunk);
        }
    }

    /// End the generation and return the text received.
    fn release(&mut self) -> String {
        let text = self
            .guard
            .as_ref()
            .map(GenerationGuard::content)
            .unwrap_or_default();
        self.guard = None;
        text
    }
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if self.guard.is_none() {
            return;
        }
        let text = self.release();
        let text = text.trim();
        if text.is_empty() {
            warn!("Generation abandoned before any text arrived");
            self.store.rollback_user_message(&self.conversation_id, &self.user_id);
        } else {
            warn!("Generation abandoned; keeping {} chars received", text.len());
            self.store.commit_reply(&self.conversation_id, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::*;
    use crate::chat::clock::FixedClock;
    use crate::chat::persistence::CONVERSATIONS_KEY;
    use crate::chat::storage::{MemoryLocalStorage, StorageError, StorageResult};
    use crate::llm::backend::testing::{ScriptedBackend, Step};
    use crate::llm::errors::InferenceError;

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default()
    }

    struct Harness {
        store: ChatStore,
        backend: Arc<ScriptedBackend>,
        clock: Arc<FixedClock>,
    }

    fn harness() -> Harness {
        harness_with(Box::new(MemoryLocalStorage::new()))
    }

    fn harness_with(storage: Box<dyn LocalStorage>) -> Harness {
        let backend = ScriptedBackend::new();
        let clock = Arc::new(FixedClock::new(start()));
        let store = ChatStore::with_clock(storage, backend.clone(), clock.clone());
        Harness {
            store,
            backend,
            clock,
        }
    }

    fn contents(store: &ChatStore) -> Vec<(Role, String)> {
        store
            .messages()
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect()
    }

    async fn send(h: &mut Harness, text: &str, reply: &'static str) {
        h.backend.push_script(vec![Step::Chunk(reply)]);
        let outcome = h.store.send_message(text, GenerationOptions::default()).await;
        assert!(outcome.is_ok(), "send failed: {outcome:?}");
    }

    #[test]
    fn test_new_store_has_one_active_conversation() {
        let h = harness();
        assert_eq!(h.store.conversations().len(), 1);
        assert_eq!(h.store.active_conversation_id(), &h.store.conversations()[0].id);
        assert!(!h.store.has_messages());
    }

    #[tokio::test]
    async fn test_send_message_commits_reply() {
        let mut h = harness();
        h.backend
            .push_script(vec![Step::Chunk("Hel"), Step::Chunk("lo "), Step::Chunk("there ")]);

        let outcome = h
            .store
            .send_message("  Hi model  ", GenerationOptions::default())
            .await;
        let message = outcome.ok().and_then(|o| o.message().cloned());
        assert_eq!(message.map(|m| m.content), Some("Hello there".to_string()));
        assert_eq!(
            contents(&h.store),
            vec![
                (Role::User, "Hi model".to_string()),
                (Role::Assistant, "Hello there".to_string()),
            ]
        );
        assert_eq!(h.store.active_conversation().map(|c| c.title.as_str()), Some("Hi model"));
        assert!(!h.store.is_generating());
        assert!(h.store.last_error().is_none());
    }

    #[tokio::test]
    async fn test_send_rejects_empty_and_not_ready() {
        let mut h = harness();
        let empty = h.store.send_message("   ", GenerationOptions::default()).await;
        assert!(matches!(empty, Err(ChatError::EmptyContent)));

        h.backend.set_connected(false);
        let offline = h.store.send_message("hi", GenerationOptions::default()).await;
        assert!(matches!(
            offline,
            Err(ChatError::NotReady(NotReadyReason::Disconnected))
        ));
        assert!(!h.store.can_send_message());

        let guard = h.store.monitor().begin(ConversationId::new());
        h.backend.set_connected(true);
        let busy = h.store.send_message("hi", GenerationOptions::default()).await;
        assert!(matches!(busy, Err(ChatError::NotReady(NotReadyReason::Generating))));
        drop(guard);

        assert!(!h.store.has_messages());
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_context_is_last_twenty_messages() {
        let mut h = harness();
        for i in 0..12 {
            send(&mut h, &format!("q{i}"), "a").await;
        }
        h.backend.push_script(vec![Step::Chunk("final")]);
        let _ = h.store.send_message("last", GenerationOptions::default()).await;

        let requests = h.backend.requests();
        let context = requests.last().cloned().unwrap_or_default();
        assert_eq!(context.len(), CONTEXT_WINDOW);
        assert_eq!(context.last().map(|t| t.content.as_str()), Some("last"));
        assert_eq!(context[0].role, "assistant");
        assert_eq!(context[1].content, "q3");
    }

    #[tokio::test]
    async fn test_empty_response_keeps_user_message() {
        let mut h = harness();
        h.backend.push_script(vec![Step::Chunk("   ")]);
        let result = h.store.send_message("hello", GenerationOptions::default()).await;
        assert!(matches!(result, Err(ChatError::EmptyResponse)));
        assert_eq!(contents(&h.store), vec![(Role::User, "hello".to_string())]);
        assert_eq!(
            h.store.last_error(),
            Some("Received empty response from the model")
        );
        assert!(!h.store.is_generating());
    }

    #[tokio::test]
    async fn test_failure_rolls_back_user_message() {
        let mut h = harness();
        send(&mut h, "first", "one").await;
        h.backend
            .push_script(vec![Step::Chunk("partial"), Step::Fail("model crashed")]);

        let result = h.store.send_message("second", GenerationOptions::default()).await;
        assert!(matches!(
            result,
            Err(ChatError::Inference(InferenceError::Server(_)))
        ));
        assert_eq!(
            contents(&h.store),
            vec![
                (Role::User, "first".to_string()),
                (Role::Assistant, "one".to_string()),
            ]
        );
        assert!(h.store.last_error().is_some_and(|e| e.contains("model crashed")));
        assert_eq!(h.store.monitor().snapshot().content, "");
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_commits_partial() {
        let mut h = harness();
        h.backend.push_script(vec![
            Step::Chunk("Hel"),
            Step::Chunk("lo"),
            Step::WaitForCancel,
        ]);
        let monitor = h.store.monitor();

        let canceller = async {
            loop {
                if monitor.snapshot().content == "Hello" {
                    assert!(monitor.stop());
                    break;
                }
                tokio::task::yield_now().await;
            }
        };
        let (outcome, ()) = tokio::join!(
            h.store.send_message("Say hello", GenerationOptions::default()),
            canceller
        );

        let partial = match outcome {
            Ok(SendOutcome::Canceled { partial }) => partial,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(partial.map(|m| m.content), Some("Hello".to_string()));
        assert_eq!(
            contents(&h.store),
            vec![
                (Role::User, "Say hello".to_string()),
                (Role::Assistant, "Hello".to_string()),
            ]
        );
        assert!(!h.store.is_generating());
        assert!(!h.store.stop_generation());
    }

    #[tokio::test]
    async fn test_cancel_before_any_text_keeps_only_user_message() {
        let mut h = harness();
        h.backend.push_script(vec![Step::WaitForCancel]);
        let monitor = h.store.monitor();

        let canceller = async {
            while !monitor.stop() {
                tokio::task::yield_now().await;
            }
        };
        let (outcome, ()) = tokio::join!(
            h.store.send_message("hi", GenerationOptions::default()),
            canceller
        );

        assert!(matches!(outcome, Ok(SendOutcome::Canceled { partial: None })));
        assert_eq!(contents(&h.store), vec![(Role::User, "hi".to_string())]);
    }

    #[tokio::test]
    async fn test_abandoned_send_keeps_partial_reply() {
        let mut h = harness();
        h.backend.push_script(vec![
            Step::Chunk("Hel"),
            Step::Chunk("lo"),
            Step::WaitForCancel,
        ]);

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            h.store.send_message("Say hello", GenerationOptions::default()),
        )
        .await;

        assert!(result.is_err());
        assert!(!h.store.is_generating());
        assert_eq!(
            contents(&h.store),
            vec![
                (Role::User, "Say hello".to_string()),
                (Role::Assistant, "Hello".to_string()),
            ]
        );
        assert!(h.store.can_send_message());
    }

    #[tokio::test]
    async fn test_abandoned_send_without_text_removes_user_turn() {
        let mut h = harness();
        h.backend.push_script(vec![Step::WaitForCancel]);

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            h.store.send_message("hi", GenerationOptions::default()),
        )
        .await;

        assert!(result.is_err());
        assert!(!h.store.is_generating());
        assert!(!h.store.has_messages());
    }

    #[tokio::test]
    async fn test_retry_replaces_last_reply() {
        let mut h = harness();
        send(&mut h, "question", "bad answer").await;
        h.backend.push_script(vec![Step::Chunk("good answer")]);

        let outcome = h.store.retry_last_message(GenerationOptions::default()).await;
        assert!(outcome.is_ok());
        assert_eq!(
            contents(&h.store),
            vec![
                (Role::User, "question".to_string()),
                (Role::User, "question".to_string()),
                (Role::Assistant, "good answer".to_string()),
            ]
        );
        let last_request = h.backend.requests().last().cloned().unwrap_or_default();
        assert_eq!(
            last_request,
            vec![
                ChatTurn::new("user", "question"),
                ChatTurn::new("user", "question"),
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_failure_keeps_original_user_message() {
        let mut h = harness();
        send(&mut h, "question", "answer").await;
        h.backend.push_script(vec![Step::Fail("boom")]);

        let result = h.store.retry_last_message(GenerationOptions::default()).await;
        assert!(result.is_err());
        assert_eq!(contents(&h.store), vec![(Role::User, "question".to_string())]);
    }

    #[tokio::test]
    async fn test_retry_without_user_message() {
        let mut h = harness();
        let result = h.store.retry_last_message(GenerationOptions::default()).await;
        assert!(matches!(result, Err(ChatError::NoUserMessage)));
    }

    #[tokio::test]
    async fn test_edit_truncates_and_resends() {
        let mut h = harness();
        send(&mut h, "m0", "r0").await;
        send(&mut h, "m1", "r1").await;
        send(&mut h, "m2", "r2").await;
        let target = h.store.messages()[2].id.to_string();

        h.backend.push_script(vec![Step::Chunk("r1 edited")]);
        let outcome = h
            .store
            .edit_message(&target, "m1 edited", GenerationOptions::default())
            .await;
        assert!(matches!(outcome, Ok(Some(SendOutcome::Completed { .. }))));
        assert_eq!(
            contents(&h.store),
            vec![
                (Role::User, "m0".to_string()),
                (Role::Assistant, "r0".to_string()),
                (Role::User, "m1 edited".to_string()),
                (Role::Assistant, "r1 edited".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_edit_with_blank_content_only_truncates() {
        let mut h = harness();
        send(&mut h, "m0", "r0").await;
        let target = h.store.messages()[0].id.to_string();
        let outcome = h
            .store
            .edit_message(&target, "  ", GenerationOptions::default())
            .await;
        assert!(matches!(outcome, Ok(None)));
        assert!(!h.store.has_messages());
    }

    #[tokio::test]
    async fn test_edit_validation_order() {
        let mut h = harness();
        send(&mut h, "m0", "r0").await;
        let reply = h.store.messages()[1].id.to_string();
        let user = h.store.messages()[0].id.to_string();

        let missing = h
            .store
            .edit_message("nope", "x", GenerationOptions::default())
            .await;
        assert!(matches!(missing, Err(ChatError::MessageNotFound)));

        let wrong_role = h
            .store
            .edit_message(&reply, "x", GenerationOptions::default())
            .await;
        assert!(matches!(wrong_role, Err(ChatError::InvalidEditTarget)));

        let guard = h.store.monitor().begin(ConversationId::new());
        let busy = h
            .store
            .edit_message(&user, "x", GenerationOptions::default())
            .await;
        assert!(matches!(busy, Err(ChatError::GenerationInProgress)));
        drop(guard);
        assert_eq!(h.store.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_message() {
        let mut h = harness();
        send(&mut h, "m0", "r0").await;
        let reply = h.store.messages()[1].id.to_string();

        assert!(matches!(h.store.delete_message("nope"), Ok(false)));
        let guard = h.store.monitor().begin(ConversationId::new());
        assert!(matches!(
            h.store.delete_message(&reply),
            Err(ChatError::GenerationInProgress)
        ));
        drop(guard);
        assert!(matches!(h.store.delete_message(&reply), Ok(true)));
        assert_eq!(contents(&h.store), vec![(Role::User, "m0".to_string())]);
        assert!(h.store.get_message_by_id(&reply).is_none());
    }

    #[tokio::test]
    async fn test_clear_conversation_resets_title() {
        let mut h = harness();
        send(&mut h, "Topic", "reply").await;
        h.clock.advance(Duration::seconds(10));
        assert!(h.store.clear_conversation().is_ok());
        let active = h.store.active_conversation();
        assert_eq!(active.map(|c| c.title.as_str()), Some(DEFAULT_TITLE));
        assert_eq!(active.map(|c| c.updated_at), Some(start() + Duration::seconds(10)));
        assert!(!h.store.has_messages());
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let mut h = harness();
        send(&mut h, "Tell me about Rust", "Rust is a language").await;
        assert_eq!(h.store.search_messages("rUST").len(), 2);
        assert_eq!(h.store.search_messages("language").len(), 1);
        assert!(h.store.search_messages("   ").is_empty());
        assert!(h.store.search_messages("python").is_empty());
    }

    #[tokio::test]
    async fn test_export_json_round_trip() {
        let mut h = harness();
        send(&mut h, "hi", "hello").await;
        let file = h
            .store
            .export_conversation("json")
            .unwrap_or_else(|e| panic!("{e}"));
        let parsed: serde_json::Value = serde_json::from_str(&file.data).unwrap_or_default();
        let back: Vec<Message> =
            serde_json::from_value(parsed["messages"].clone()).unwrap_or_default();
        assert_eq!(back, h.store.messages());
        assert!(matches!(
            h.store.export_conversation("pdf"),
            Err(ChatError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_conversation_crud() {
        let mut h = harness();
        let first = h.store.active_conversation_id().clone();
        let second = h.store.new_conversation();
        assert_eq!(h.store.conversations()[0].id, second);
        assert_eq!(h.store.active_conversation_id(), &second);

        assert!(h.store.set_active_conversation(first.as_str()));
        assert!(!h.store.set_active_conversation("missing"));
        assert_eq!(h.store.active_conversation_id(), &first);

        h.clock.advance(Duration::seconds(1));
        assert!(h.store.rename_conversation(first.as_str(), "  Renamed  "));
        assert!(h.store.rename_conversation(first.as_str(), "   "));
        assert!(!h.store.rename_conversation("missing", "x"));
        let renamed = h.store.active_conversation();
        assert_eq!(renamed.map(|c| c.title.as_str()), Some("Renamed"));
        assert_eq!(renamed.map(|c| c.updated_at), Some(start() + Duration::seconds(1)));

        assert!(h.store.delete_conversation(first.as_str()));
        assert_eq!(h.store.active_conversation_id(), &second);
        assert!(!h.store.delete_conversation("missing"));
    }

    #[test]
    fn test_deleting_last_conversation_creates_fresh_one() {
        let mut h = harness();
        let only = h.store.active_conversation_id().clone();
        assert!(h.store.delete_conversation(only.as_str()));
        assert_eq!(h.store.conversations().len(), 1);
        assert_ne!(h.store.active_conversation_id(), &only);
        assert_eq!(h.store.active_conversation_id(), &h.store.conversations()[0].id);
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let storage = Arc::new(MemoryLocalStorage::new());
        struct Shared(Arc<MemoryLocalStorage>);
        impl LocalStorage for Shared {
            fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
                self.0.get_item(key)
            }
            fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
                self.0.set_item(key, value)
            }
            fn remove_item(&self, key: &str) -> StorageResult<()> {
                self.0.remove_item(key)
            }
        }

        let mut h = harness_with(Box::new(Shared(Arc::clone(&storage))));
        send(&mut h, "persist me", "ok").await;
        let id = h.store.active_conversation_id().clone();
        assert!(storage.get_item(CONVERSATIONS_KEY).ok().flatten().is_some());

        let reloaded = harness_with(Box::new(Shared(storage)));
        assert_eq!(reloaded.store.active_conversation_id(), &id);
        assert_eq!(reloaded.store.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_storage_failures_do_not_fail_operations() {
        struct Broken;
        impl LocalStorage for Broken {
            fn get_item(&self, _key: &str) -> StorageResult<Option<String>> {
                Ok(None)
            }
            fn set_item(&self, _key: &str, _value: &str) -> StorageResult<()> {
                Err(StorageError::Sqlite(rusqlite::Error::InvalidQuery))
            }
            fn remove_item(&self, _key: &str) -> StorageResult<()> {
                Ok(())
            }
        }

        let mut h = harness_with(Box::new(Broken));
        send(&mut h, "still works", "yes").await;
        assert_eq!(h.store.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_display_projection_includes_stream() {
        let mut h = harness();
        send(&mut h, "hi", "hello").await;
        let guard = h.store.monitor().begin(h.store.active_conversation_id().clone());
        if let Some(guard) = guard.as_ref() {
            guard.append("stream");
        }
        let display = h.store.display_messages();
        assert_eq!(display.len(), 3);
        assert!(display[2].is_streaming);

        h.store.new_conversation();
        assert!(h.store.display_messages().is_empty());
        drop(guard);
    }

    #[tokio::test]
    async fn test_check_connection_records_error() {
        let mut h = harness();
        assert!(h.store.check_connection().await.is_ok());
        h.backend.set_connected(false);
        assert!(h.store.check_connection().await.is_err());
        assert_eq!(h.store.last_error(), Some("offline"));
    }
}
