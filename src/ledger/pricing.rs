//! Per-model pricing table and cost arithmetic.

use serde::Serialize;

use crate::ledger::core::errors::{LedgerError, LedgerResult};

/// Model selected when the document does not name one.
pub const DEFAULT_MODEL_ID: &str = "openai/gpt-4o-mini-2024-07-18";

/// Pricing and limits of one hosted model.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ModelPricing {
    /// Display name.
    pub name: &'static str,
    /// Context window in tokens.
    pub context_length: u32,
    /// Dollars per million input tokens.
    pub input_cost_per_million: f64,
    /// Dollars per million output tokens.
    pub output_cost_per_million: f64,
    /// Dollars per thousand input images.
    pub image_cost_per_thousand: f64,
}

static MODELS: [(&str, ModelPricing); 6] = [
    (
        DEFAULT_MODEL_ID,
        ModelPricing {
            name: "GPT-4o Mini",
            context_length: 128_000,
            input_cost_per_million: 0.15,
            output_cost_per_million: 0.6,
            image_cost_per_thousand: 7.225,
        },
    ),
    (
        "anthropic/claude-3.5-sonnet",
        ModelPricing {
            name: "Claude 3.5 Sonnet",
            context_length: 200_000,
            input_cost_per_million: 3.0,
            output_cost_per_million: 15.0,
            image_cost_per_thousand: 4.8,
        },
    ),
    (
        "perplexity/llama-3.1-sonar-small-128k-online",
        ModelPricing {
            name: "Llama 3.1 Sonar Small",
            context_length: 131_072,
            input_cost_per_million: 0.2,
            output_cost_per_million: 0.2,
            image_cost_per_thousand: 5.0,
        },
    ),
    (
        "meta-llama/llama-3.1-405b-instruct",
        ModelPricing {
            name: "Llama 3.1 405B Instruct",
            context_length: 131_072,
            input_cost_per_million: 2.7,
            output_cost_per_million: 2.7,
            image_cost_per_thousand: 0.0,
        },
    ),
    (
        "meta-llama/llama-3.1-405b",
        ModelPricing {
            name: "Llama 3.1 405B (base)",
            context_length: 131_072,
            input_cost_per_million: 2.0,
            output_cost_per_million: 2.0,
            image_cost_per_thousand: 0.0,
        },
    ),
    (
        "meta-llama/llama-2-13b-chat",
        ModelPricing {
            name: "Llama 2 13B Chat",
            context_length: 4_096,
            input_cost_per_million: 0.025,
            output_cost_per_million: 0.075,
            image_cost_per_thousand: 0.0,
        },
    ),
];

/// Entry of the model picker.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelSummary {
    /// Model identifier sent to the provider.
    pub id: &'static str,
    /// Display name.
    pub name: &'static str,
    /// Context window in tokens.
    pub context_length: u32,
}

/// Pricing for a model id.
///
/// # Errors
/// Returns `Configuration` when the model is not in the table.
pub fn lookup(model_id: &str) -> LedgerResult<&'static ModelPricing> {
    MODELS
        .iter()
        .find(|(id, _)| *id == model_id)
        .map(|(_, pricing)| pricing)
        .ok_or_else(|| LedgerError::Configuration(format!("unknown model: {model_id}")))
}

/// All known models in table order.
#[must_use]
pub fn catalog() -> Vec<ModelSummary> {
    MODELS
        .iter()
        .map(|(id, pricing)| ModelSummary {
            id: *id,
            name: pricing.name,
            context_length: pricing.context_length,
        })
        .collect()
}

/// Cost of `tokens` at `price_per_million` dollars per million tokens.
#[must_use]
pub fn token_cost(tokens: u64, price_per_million: f64) -> f64 {
    tokens as f64 / 1_000_000.0 * price_per_million
}

/// Cost of `images` at `price_per_thousand` dollars per thousand images.
#[must_use]
pub fn image_cost(images: u64, price_per_thousand: f64) -> f64 {
    images as f64 / 1_000.0 * price_per_thousand
}
