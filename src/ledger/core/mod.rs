//! Core ledger types: configuration, errors, identifiers, messages and the document.

pub mod config;
pub mod document;
pub mod errors;
pub mod ids;
pub mod message;

pub use config::{GatewayConfig, LedgerConfig, ServerConfig, StorageConfig};
pub use document::{
    ApiKeyEntry, BaseUrlKey, Chat, DEFAULT_FOLDER_NAME, Folder, LedgerDocument, NEW_CHAT_TITLE,
    SavedPrompt,
};
pub use errors::{LedgerError, LedgerResult};
pub use ids::{ChatId, DEFAULT_FOLDER_ID, FolderId, IdSequence, PromptId};
pub use message::{ChatMessage, Message, Role, RoleParseError};
