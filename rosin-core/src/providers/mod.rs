//! LLM provider adapters.
//!
//! Every provider is reached through the [`ChatClient`] capability: stream a
//! stage answer as text deltas, or complete a short non-streaming call. The
//! HTTP implementation dispatches over the closed [`ProviderAdapter`] union:
//! - OpenAI-compatible chat completions (OpenAI and xAI)
//! - Anthropic Messages API
//! - Google Gemini `streamGenerateContent`
//!
//! Tests replace the HTTP client with [`ScriptedChatClient`].

pub mod anthropic;
pub mod gemini;
pub mod openai_compat;
pub mod scripted;

use crate::config::ProvidersConfig;
use crate::credentials::CredentialStore;
use crate::error::LlmError;
use crate::sse::sse_payloads;
use crate::types::{ModelRef, Provider};
use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use scripted::{ScriptedChatClient, ScriptedReply};

/// A finite, non-restartable stream of text deltas. Dropping it aborts the transfer.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Provider-neutral request for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub user_content: String,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(system_prompt: impl Into<String>, user_content: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_content: user_content.into(),
            max_tokens,
        }
    }
}

/// Capability the pipeline needs from the outside world.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Start a streaming call. Fails before yielding anything on missing
    /// credentials, transport errors, and non-2xx responses.
    async fn stream(&self, model: &ModelRef, request: &ChatRequest) -> Result<TokenStream, LlmError>;

    /// Non-streaming call returning the whole answer.
    async fn complete(&self, model: &ModelRef, request: &ChatRequest) -> Result<String, LlmError>;

    /// Whether a credential is available for `provider`.
    fn has_credential(&self, provider: Provider) -> bool;
}

/// Wire-format family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderAdapter {
    /// `/chat/completions` with bearer auth (OpenAI, xAI).
    OpenAiCompatible { provider: Provider },
    Anthropic,
    Gemini,
}

impl ProviderAdapter {
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::OpenAi | Provider::Xai => ProviderAdapter::OpenAiCompatible { provider },
            Provider::Anthropic => ProviderAdapter::Anthropic,
            Provider::Gemini => ProviderAdapter::Gemini,
        }
    }

    pub fn provider(self) -> Provider {
        match self {
            ProviderAdapter::OpenAiCompatible { provider } => provider,
            ProviderAdapter::Anthropic => Provider::Anthropic,
            ProviderAdapter::Gemini => Provider::Gemini,
        }
    }

    async fn stream(
        self,
        endpoint: &Endpoint<'_>,
        model: &str,
        request: &ChatRequest,
    ) -> Result<TokenStream, LlmError> {
        match self {
            ProviderAdapter::OpenAiCompatible { provider } => {
                openai_compat::stream(provider, endpoint, model, request).await
            }
            ProviderAdapter::Anthropic => anthropic::stream(endpoint, model, request).await,
            ProviderAdapter::Gemini => gemini::stream(endpoint, model, request).await,
        }
    }

    async fn complete(
        self,
        endpoint: &Endpoint<'_>,
        model: &str,
        request: &ChatRequest,
    ) -> Result<String, LlmError> {
        match self {
            ProviderAdapter::OpenAiCompatible { provider } => {
                openai_compat::complete(provider, endpoint, model, request).await
            }
            ProviderAdapter::Anthropic => anthropic::complete(endpoint, model, request).await,
            ProviderAdapter::Gemini => gemini::complete(endpoint, model, request).await,
        }
    }
}

/// Resolved connection details for one call.
pub(crate) struct Endpoint<'a> {
    pub http: &'a reqwest::Client,
    pub base_url: String,
    pub api_key: String,
}

/// What a single SSE payload means for the text stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delta {
    Text(String),
    Skip,
    Stop,
    Error(String),
}

/// reqwest-backed client for every provider.
pub struct HttpChatClient {
    http: reqwest::Client,
    providers: ProvidersConfig,
    credentials: Arc<dyn CredentialStore>,
}

impl HttpChatClient {
    pub fn new(
        providers: ProvidersConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| LlmError::Request {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            providers,
            credentials,
        })
    }

    fn endpoint(&self, provider: Provider) -> Result<Endpoint<'_>, LlmError> {
        let api_key = self
            .credentials
            .get_key(provider)
            .map_err(|_| LlmError::MissingCredential { provider })?;
        Ok(Endpoint {
            http: &self.http,
            base_url: self.providers.base_url(provider),
            api_key,
        })
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn stream(&self, model: &ModelRef, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        let endpoint = self.endpoint(model.provider)?;
        ProviderAdapter::for_provider(model.provider)
            .stream(&endpoint, &model.model, request)
            .await
    }

    async fn complete(&self, model: &ModelRef, request: &ChatRequest) -> Result<String, LlmError> {
        let endpoint = self.endpoint(model.provider)?;
        ProviderAdapter::for_provider(model.provider)
            .complete(&endpoint, &model.model, request)
            .await
    }

    fn has_credential(&self, provider: Provider) -> bool {
        self.credentials.has_key(provider)
    }
}

/// Send a request and turn non-2xx responses into `LlmError::Api`.
pub(crate) async fn send_checked(
    provider: Provider,
    builder: reqwest::RequestBuilder,
) -> Result<reqwest::Response, LlmError> {
    let response = builder.send().await.map_err(|e| LlmError::Request {
        message: format!("Request to {provider} failed: {e}"),
    })?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        debug!(%provider, status = status.as_u16(), "Provider returned error status");
        return Err(LlmError::Api {
            provider,
            status: status.as_u16(),
            message: error_message_from_body(&body_text),
        });
    }
    Ok(response)
}

/// Pull `error.message` out of a JSON error body, falling back to the raw text.
pub(crate) fn error_message_from_body(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v["error"]["message"]
                .as_str()
                .or_else(|| v["message"].as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Read a successful response as JSON.
pub(crate) async fn read_json(provider: Provider, response: reqwest::Response) -> Result<Value, LlmError> {
    response.json::<Value>().await.map_err(|e| LlmError::ResponseParse {
        message: format!("Invalid {provider} response body: {e}"),
    })
}

/// Decode an SSE response body into text deltas with a provider-specific decoder.
pub(crate) fn decode_stream(
    provider: Provider,
    response: reqwest::Response,
    decode: fn(&str) -> Delta,
) -> TokenStream {
    let payloads = Box::pin(sse_payloads(response.bytes_stream()));
    Box::pin(stream::unfold(
        (payloads, false),
        move |(mut payloads, finished)| async move {
            if finished {
                return None;
            }
            loop {
                match payloads.next().await? {
                    Ok(payload) => match decode(&payload) {
                        Delta::Text(text) => return Some((Ok(text), (payloads, false))),
                        Delta::Skip => continue,
                        Delta::Stop => return None,
                        Delta::Error(message) => {
                            let err = LlmError::Streaming {
                                message: format!("{provider} stream error: {message}"),
                            };
                            return Some((Err(err), (payloads, true)));
                        }
                    },
                    Err(e) => {
                        let err = LlmError::Streaming {
                            message: format!("Failed to read streaming chunk: {e}"),
                        };
                        return Some((Err(err), (payloads, true)));
                    }
                }
            }
        },
    ))
}

/// Decoded JSON payload, or `None` for undecodable data.
pub(crate) fn parse_payload(provider: Provider, payload: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(payload) {
        Ok(v) => Some(v),
        Err(e) => {
            let preview: String = payload.chars().take(200).collect();
            tracing::warn!(%provider, error = %e, data_preview = %preview, "Failed to parse SSE JSON chunk");
            None
        }
    }
}

/// Text delta or skip, for an optional string field.
pub(crate) fn text_or_skip(text: Option<&str>) -> Delta {
    match text {
        Some(t) if !t.is_empty() => Delta::Text(t.to_string()),
        _ => Delta::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentialStore;

    #[test]
    fn test_adapter_selection() {
        assert_eq!(
            ProviderAdapter::for_provider(Provider::Xai),
            ProviderAdapter::OpenAiCompatible {
                provider: Provider::Xai
            }
        );
        assert_eq!(
            ProviderAdapter::for_provider(Provider::Anthropic),
            ProviderAdapter::Anthropic
        );
        for p in Provider::ALL {
            assert_eq!(ProviderAdapter::for_provider(p).provider(), p);
        }
    }

    #[test]
    fn test_error_message_from_body() {
        assert_eq!(
            error_message_from_body(r#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
        assert_eq!(error_message_from_body("upstream timeout\n"), "upstream timeout");
    }

    #[test]
    fn test_text_or_skip() {
        assert_eq!(text_or_skip(Some("hi")), Delta::Text("hi".into()));
        assert_eq!(text_or_skip(Some("")), Delta::Skip);
        assert_eq!(text_or_skip(None), Delta::Skip);
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_request() {
        let client = HttpChatClient::new(
            ProvidersConfig::default(),
            Arc::new(InMemoryCredentialStore::new()),
        )
        .unwrap();
        let model = ModelRef::new(Provider::Gemini, "gemini-2.5-pro");
        assert!(!client.has_credential(Provider::Gemini));
        let err = client
            .stream(&model, &ChatRequest::new("s", "u", 16))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            LlmError::MissingCredential {
                provider: Provider::Gemini
            }
        ));
    }
}
