//! Conversation ledger: documents, pricing, persistence and the store.
//!
//! ## Modules
//!
//! - `core`: config, errors, identifiers, messages and the document model
//! - `pricing`: per-model prices and cost arithmetic
//! - `storage`: durable backends for the serialized document
//! - `store`: folder/chat/message operations with all-or-nothing commits
//! - `text`: word counting and token estimation

pub mod core;
pub mod pricing;
pub mod storage;
pub mod store;
pub mod text;

pub use self::core::{
    ApiKeyEntry, BaseUrlKey, Chat, ChatId, ChatMessage, Folder, FolderId, LedgerConfig,
    LedgerDocument, LedgerError, LedgerResult, Message, PromptId, Role, SavedPrompt,
};
pub use pricing::{DEFAULT_MODEL_ID, ModelPricing, ModelSummary};
pub use storage::{DocumentStorage, MemoryDocumentStorage, SqliteDocumentStorage};
pub use store::ConversationStore;
