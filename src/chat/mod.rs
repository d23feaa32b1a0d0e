//! Conversation store and its supporting pieces.
//!
//! - `types`, `ids`, `title`: conversation/message model
//! - `storage`, `persistence`: key/value backends and the persisted layout
//! - `monitor`, `projection`: live generation state and the display view
//! - `export`: JSON / text / Markdown export
//! - `store`: the [`ChatStore`] tying it together

pub mod clock;
pub mod errors;
pub mod export;
pub mod ids;
pub mod monitor;
pub mod persistence;
pub mod projection;
pub mod storage;
pub mod store;
pub mod title;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use errors::{ChatError, ChatResult, NotReadyReason};
pub use export::{ExportFormat, ExportedFile};
pub use ids::{ConversationId, MessageId};
pub use monitor::{GenerationMonitor, LiveGeneration};
pub use projection::DisplayMessage;
pub use storage::{
    LocalStorage, MemoryLocalStorage, SqliteLocalStorage, StorageError, StorageResult,
};
pub use store::{ChatStore, SendOutcome};
pub use types::{Conversation, Message, Role};
