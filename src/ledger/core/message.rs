//! Message and role types.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::pricing::token_cost;
use crate::ledger::text::{count_words, estimate_tokens};

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message typed by the user.
    User,
    /// Reply produced by the model.
    Assistant,
    /// Instruction injected ahead of the conversation.
    System,
}

impl Role {
    /// Wire representation of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleParseError(pub String);

impl fmt::Display for RoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role: {}", self.0)
    }
}

impl std::error::Error for RoleParseError {}

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

/// One turn in a chat, with its computed metrics.
///
/// Messages are never edited after creation; regeneration produces a new
/// message instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Author role.
    pub role: Role,
    /// Raw text content.
    pub content: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Number of whitespace-separated words.
    #[serde(default)]
    pub word_count: u64,
    /// Estimated token count.
    #[serde(default)]
    pub token_count: u64,
    /// Estimated cost in dollars.
    #[serde(default)]
    pub cost: f64,
}

impl Message {
    /// Build a message, deriving word count, token estimate and cost.
    #[must_use]
    pub fn priced(
        role: Role,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        price_per_million: f64,
    ) -> Self {
        let content = content.into();
        let token_count = estimate_tokens(&content);
        Self {
            role,
            word_count: count_words(&content) as u64,
            token_count,
            cost: token_cost(token_count, price_per_million),
            content,
            timestamp,
        }
    }

    /// Strip the message down to what the provider sees.
    #[must_use]
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Provider-facing message: role and content only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,
    /// Text content.
    pub content: String,
}

impl ChatMessage {
    /// Build a system-role message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}
