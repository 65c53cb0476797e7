//! Client for OpenAI-compatible chat-completion APIs (`OpenRouter`, Together, Groq).

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::gateway::{CompletionGateway, CompletionReply, CompletionRequest, KeyUsage};
use crate::ledger::core::config::GatewayConfig;
use crate::ledger::core::errors::{LedgerError, LedgerResult};
use crate::ledger::core::message::ChatMessage;

/// Provider error when the response carries no choice.
pub const NO_CHOICES_MESSAGE: &str = "No choices returned from the API";

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: Option<ProviderErrorDetail>,
}

#[derive(Deserialize)]
struct ProviderErrorDetail {
    message: Option<String>,
}

/// Gateway speaking the OpenAI chat-completions protocol over HTTPS.
#[derive(Clone)]
pub struct OpenAiCompatibleGateway {
    client: reqwest::Client,
}

impl OpenAiCompatibleGateway {
    /// Build the HTTP client with the attribution headers and timeouts.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if a header value is invalid or the client cannot be built.
    pub fn new(config: &GatewayConfig) -> LedgerResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("http-referer"),
            header_value(&config.referer)?,
        );
        headers.insert(HeaderName::from_static("x-title"), header_value(&config.title)?);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| LedgerError::InvalidConfig(format!("http client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl CompletionGateway for OpenAiCompatibleGateway {
    async fn complete(&self, request: CompletionRequest) -> LedgerResult<CompletionReply> {
        let url = endpoint(&request.base_url, "chat/completions")?;
        let body = CompletionBody {
            model: &request.model,
            messages: &request.messages,
            stream: false,
        };

        tracing::debug!(
            "Requesting completion from {} with {} messages",
            url,
            request.messages.len()
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(&request.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        parse_completion(&text)
    }

    async fn key_usage(&self, api_key: &str, base_url: &str) -> LedgerResult<KeyUsage> {
        let url = endpoint(base_url, "auth/key")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| LedgerError::Provider(format!("invalid usage payload: {e}")))
    }
}

fn header_value(value: &str) -> LedgerResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| LedgerError::InvalidConfig(format!("header value {value:?}: {e}")))
}

/// Join a provider base URL and an API path.
///
/// # Errors
/// Returns `Url` if the result is not a valid URL.
pub fn endpoint(base_url: &str, path: &str) -> LedgerResult<Url> {
    let joined = format!("{}/{}", base_url.trim_end_matches('/'), path);
    Ok(Url::parse(&joined)?)
}

fn transport_error(error: reqwest::Error) -> LedgerError {
    if error.is_timeout() {
        LedgerError::Network("request timed out".to_string())
    } else {
        LedgerError::Network(error.to_string())
    }
}

/// Map a non-success status to a gateway error.
///
/// The provider's `error.message` is used when the body carries one.
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> LedgerError {
    let message = serde_json::from_str::<ProviderErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error)
        .and_then(|detail| detail.message)
        .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16()));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LedgerError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => LedgerError::RateLimit(message),
        _ => LedgerError::Provider(message),
    }
}

/// Extract the first choice of a completion response body.
///
/// # Errors
/// Returns `Provider` for a malformed body or an empty `choices` list.
pub fn parse_completion(body: &str) -> LedgerResult<CompletionReply> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| LedgerError::Provider(format!("invalid completion payload: {e}")))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LedgerError::Provider(NO_CHOICES_MESSAGE.to_string()))?;

    Ok(CompletionReply {
        content: choice.message.content.unwrap_or_default(),
    })
}
