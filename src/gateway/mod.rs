//! Completion gateway: the boundary to the external chat-completion provider.
//!
//! ## Modules
//!
//! - `openai_compat`: reqwest client for OpenAI-compatible endpoints

pub mod openai_compat;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ledger::core::errors::LedgerResult;
use crate::ledger::core::message::ChatMessage;

pub use openai_compat::OpenAiCompatibleGateway;

/// One completion request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionRequest {
    /// Context window, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Bearer credential.
    pub api_key: String,
    /// Model identifier.
    pub model: String,
    /// Provider base URL.
    pub base_url: String,
}

/// Text of the first choice returned by the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionReply {
    /// Assistant reply.
    pub content: String,
}

/// Usage report for an API key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyUsage {
    /// Report body.
    pub data: KeyUsageData,
}

/// Credit and rate-limit figures for an API key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyUsageData {
    /// Key label.
    #[serde(default)]
    pub label: String,
    /// Credit limit, when the key has one.
    #[serde(default)]
    pub limit: Option<f64>,
    /// Credits used.
    #[serde(default)]
    pub usage: f64,
    /// Credits left, when the key has a limit.
    #[serde(default)]
    pub limit_remaining: Option<f64>,
    /// Whether the key is on the free tier.
    #[serde(default)]
    pub is_free_tier: bool,
    /// Request rate limit.
    #[serde(default)]
    pub rate_limit: KeyRateLimit,
}

/// Request rate limit of an API key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRateLimit {
    /// Requests allowed per interval.
    #[serde(default)]
    pub requests: u64,
    /// Interval, e.g. `"10s"`.
    #[serde(default)]
    pub interval: String,
}

/// Abstraction over chat-completion providers.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Send the context and return the first choice.
    ///
    /// # Errors
    /// Returns `Auth`, `RateLimit`, `Network` or `Provider`.
    async fn complete(&self, request: CompletionRequest) -> LedgerResult<CompletionReply>;

    /// Query credit usage for a key.
    ///
    /// # Errors
    /// Returns `Auth`, `RateLimit`, `Network` or `Provider`.
    async fn key_usage(&self, api_key: &str, base_url: &str) -> LedgerResult<KeyUsage>;
}
