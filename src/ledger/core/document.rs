//! The persisted ledger document: folders, chats, keys, prompts and settings.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::core::errors::LedgerError;
use crate::ledger::core::ids::{ChatId, FolderId, PromptId};
use crate::ledger::core::message::{Message, Role};
use crate::ledger::pricing::DEFAULT_MODEL_ID;

/// Title given to chats until the first reply names them.
pub const NEW_CHAT_TITLE: &str = "New Chat";

/// Display name of the default folder.
pub const DEFAULT_FOLDER_NAME: &str = "Default";

/// A named grouping of chats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    /// Folder identifier.
    pub id: FolderId,
    /// Display name.
    pub name: String,
    /// Chats in display order.
    #[serde(default)]
    pub chats: Vec<Chat>,
}

impl Folder {
    /// Create an empty folder.
    #[must_use]
    pub fn new(id: FolderId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            chats: Vec::new(),
        }
    }

    /// The protected default folder, empty.
    #[must_use]
    pub fn default_folder() -> Self {
        Self::new(FolderId::default_folder(), DEFAULT_FOLDER_NAME)
    }

    /// Position of a chat inside this folder.
    #[must_use]
    pub fn position_of(&self, chat_id: &ChatId) -> Option<usize> {
        self.chats.iter().position(|chat| &chat.id == chat_id)
    }
}

/// One conversation thread with its running totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    /// Chat identifier.
    pub id: ChatId,
    /// Display title.
    pub title: String,
    /// Messages in append (chronological) order.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Tokens attributed to this chat across all requests.
    #[serde(default)]
    pub total_tokens: u64,
    /// Cost attributed to this chat across all requests.
    #[serde(default)]
    pub total_cost: f64,
    /// Messages at or before this instant are left out of future requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_context_timestamp: Option<DateTime<Utc>>,
}

impl Chat {
    /// Create an empty chat with the placeholder title.
    #[must_use]
    pub fn new(id: ChatId) -> Self {
        Self {
            id,
            title: NEW_CHAT_TITLE.to_string(),
            messages: Vec::new(),
            total_tokens: 0,
            total_cost: 0.0,
            clear_context_timestamp: None,
        }
    }

    /// Most recent user message and its index.
    #[must_use]
    pub fn last_user_message(&self) -> Option<(usize, &Message)> {
        self.messages
            .iter()
            .enumerate()
            .rev()
            .find(|(_, msg)| msg.role == Role::User)
    }

    /// Number of assistant messages in the canonical sequence.
    #[must_use]
    pub fn assistant_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|msg| msg.role == Role::Assistant)
            .count()
    }

    /// Timestamp for the next appended message: `now`, but never before the
    /// last message and always after the clear-context checkpoint.
    #[must_use]
    pub fn next_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let last = self.messages.last().map(|msg| msg.timestamp);
        let after_checkpoint = self
            .clear_context_timestamp
            .map(|cut| cut + TimeDelta::milliseconds(1));
        [last, after_checkpoint]
            .into_iter()
            .flatten()
            .fold(now, DateTime::max)
    }
}

/// A reusable system-instruction template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPrompt {
    /// Prompt identifier.
    pub id: PromptId,
    /// Display name.
    pub name: String,
    /// Instruction text.
    pub content: String,
}

/// A named API credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    /// Display name.
    pub name: String,
    /// Secret key value.
    pub key: String,
}

/// Provider selector for the completion base URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseUrlKey {
    /// `OpenRouter`.
    #[default]
    Openrouter,
    /// Together AI.
    Together,
    /// Groq.
    Groq,
}

impl BaseUrlKey {
    /// All known providers.
    pub const ALL: [Self; 3] = [Self::Openrouter, Self::Together, Self::Groq];

    /// Base URL of the provider's OpenAI-compatible API.
    #[must_use]
    pub const fn base_url(self) -> &'static str {
        match self {
            Self::Openrouter => "https://openrouter.ai/api/v1",
            Self::Together => "https://api.together.xyz/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
        }
    }

    /// Key as stored in the document.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Openrouter => "openrouter",
            Self::Together => "together",
            Self::Groq => "groq",
        }
    }
}

impl fmt::Display for BaseUrlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseUrlKey {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| LedgerError::Validation(format!("unknown base url key: {s}")))
    }
}

fn default_model() -> String {
    DEFAULT_MODEL_ID.to_string()
}

/// The whole persisted state, written as one JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDocument {
    /// Folders in display order.
    pub folders: Vec<Folder>,
    /// Registered API keys.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
    /// Key value used for all requests; empty when none is selected.
    #[serde(default)]
    pub selected_api_key: String,
    /// Model identifier used for all requests.
    #[serde(default = "default_model")]
    pub selected_model: String,
    /// Provider used for all requests.
    #[serde(default)]
    pub base_url_key: BaseUrlKey,
    /// Instruction prepended to every request; empty when unset.
    #[serde(default)]
    pub initial_system_instruction: String,
    /// Saved prompt templates.
    #[serde(default)]
    pub saved_prompts: Vec<SavedPrompt>,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            folders: vec![Folder::default_folder()],
            api_keys: Vec::new(),
            selected_api_key: String::new(),
            selected_model: default_model(),
            base_url_key: BaseUrlKey::default(),
            initial_system_instruction: String::new(),
            saved_prompts: Vec::new(),
        }
    }
}

impl LedgerDocument {
    /// Top-level keys an imported document must carry.
    pub const REQUIRED_KEYS: [&'static str; 5] = [
        "folders",
        "apiKeys",
        "initialSystemInstruction",
        "savedPrompts",
        "baseUrlKey",
    ];

    /// Find a folder by id.
    #[must_use]
    pub fn folder(&self, folder_id: &FolderId) -> Option<&Folder> {
        self.folders.iter().find(|folder| &folder.id == folder_id)
    }

    /// Find a folder by id, mutably.
    pub fn folder_mut(&mut self, folder_id: &FolderId) -> Option<&mut Folder> {
        self.folders.iter_mut().find(|folder| &folder.id == folder_id)
    }

    /// Find a chat in any folder.
    #[must_use]
    pub fn chat(&self, chat_id: &ChatId) -> Option<&Chat> {
        self.folders
            .iter()
            .flat_map(|folder| folder.chats.iter())
            .find(|chat| &chat.id == chat_id)
    }

    /// Find a chat in any folder, mutably.
    pub fn chat_mut(&mut self, chat_id: &ChatId) -> Option<&mut Chat> {
        self.folders
            .iter_mut()
            .flat_map(|folder| folder.chats.iter_mut())
            .find(|chat| &chat.id == chat_id)
    }

    /// Folder holding the chat.
    #[must_use]
    pub fn folder_of(&self, chat_id: &ChatId) -> Option<&FolderId> {
        self.folders
            .iter()
            .find(|folder| folder.position_of(chat_id).is_some())
            .map(|folder| &folder.id)
    }

    /// Total number of chats across folders.
    #[must_use]
    pub fn chat_count(&self) -> usize {
        self.folders.iter().map(|folder| folder.chats.len()).sum()
    }

    /// First chat in display order.
    #[must_use]
    pub fn first_chat_id(&self) -> Option<&ChatId> {
        self.folders
            .iter()
            .flat_map(|folder| folder.chats.iter())
            .map(|chat| &chat.id)
            .next()
    }

    /// Whether any folder, chat or prompt already uses this identifier.
    #[must_use]
    pub fn id_in_use(&self, id: &str) -> bool {
        self.folders.iter().any(|folder| {
            folder.id.as_str() == id || folder.chats.iter().any(|chat| chat.id.as_str() == id)
        }) || self.saved_prompts.iter().any(|prompt| prompt.id.as_str() == id)
    }

    /// First folder id that appears more than once, if any.
    #[must_use]
    pub fn duplicate_folder_id(&self) -> Option<&FolderId> {
        let mut seen = std::collections::HashSet::new();
        self.folders
            .iter()
            .map(|folder| &folder.id)
            .find(|id| !seen.insert(*id))
    }

    /// First chat id that appears more than once, if any.
    #[must_use]
    pub fn duplicate_chat_id(&self) -> Option<&ChatId> {
        let mut seen = std::collections::HashSet::new();
        self.folders
            .iter()
            .flat_map(|folder| folder.chats.iter())
            .map(|chat| &chat.id)
            .find(|id| !seen.insert(*id))
    }

    /// Re-create the default folder if it is missing. Returns whether it was added.
    pub fn ensure_default_folder(&mut self) -> bool {
        if self.folder(&FolderId::default_folder()).is_some() {
            return false;
        }
        self.folders.insert(0, Folder::default_folder());
        true
    }
}
