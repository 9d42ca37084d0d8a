//! OpenAI-compatible chat completions adapter.
//!
//! Used for OpenAI and for xAI, which serves the same wire format from a
//! different base URL.

use super::{
    ChatRequest, Delta, Endpoint, TokenStream, decode_stream, parse_payload, read_json,
    send_checked, text_or_skip,
};
use crate::error::LlmError;
use crate::types::Provider;
use serde_json::{Value, json};
use tracing::debug;

/// The output budget field. Newer OpenAI models reject `max_tokens`.
fn max_tokens_field(provider: Provider) -> &'static str {
    match provider {
        Provider::OpenAi => "max_completion_tokens",
        _ => "max_tokens",
    }
}

/// Request body for `/chat/completions`.
pub fn build_body(provider: Provider, model: &str, request: &ChatRequest, stream: bool) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [
            { "role": "system", "content": request.system_prompt },
            { "role": "user", "content": request.user_content },
        ],
        "stream": stream,
    });
    body[max_tokens_field(provider)] = json!(request.max_tokens);
    body
}

fn decode_openai(payload: &str) -> Delta {
    decode_payload(Provider::OpenAi, payload)
}

fn decode_xai(payload: &str) -> Delta {
    decode_payload(Provider::Xai, payload)
}

/// Map one SSE payload to a text delta: `choices[0].delta.content`.
pub(crate) fn decode_payload(provider: Provider, payload: &str) -> Delta {
    let Some(data) = parse_payload(provider, payload) else {
        return Delta::Skip;
    };
    if let Some(message) = data["error"]["message"].as_str() {
        return Delta::Error(message.to_string());
    }
    text_or_skip(data["choices"][0]["delta"]["content"].as_str())
}

fn url(endpoint: &Endpoint<'_>) -> String {
    format!("{}/chat/completions", endpoint.base_url)
}

pub(crate) async fn stream(
    provider: Provider,
    endpoint: &Endpoint<'_>,
    model: &str,
    request: &ChatRequest,
) -> Result<TokenStream, LlmError> {
    let url = url(endpoint);
    debug!(%provider, model, url = %url, "Sending streaming chat completions request");

    let response = send_checked(
        provider,
        endpoint
            .http
            .post(&url)
            .bearer_auth(&endpoint.api_key)
            .json(&build_body(provider, model, request, true)),
    )
    .await?;

    let decode: fn(&str) -> Delta = match provider {
        Provider::Xai => decode_xai,
        _ => decode_openai,
    };
    Ok(decode_stream(provider, response, decode))
}

pub(crate) async fn complete(
    provider: Provider,
    endpoint: &Endpoint<'_>,
    model: &str,
    request: &ChatRequest,
) -> Result<String, LlmError> {
    let url = url(endpoint);
    debug!(%provider, model, url = %url, "Sending chat completions request");

    let response = send_checked(
        provider,
        endpoint
            .http
            .post(&url)
            .bearer_auth(&endpoint.api_key)
            .json(&build_body(provider, model, request, false)),
    )
    .await?;

    let body = read_json(provider, response).await?;
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| LlmError::ResponseParse {
            message: format!("{provider} response has no choices[0].message.content"),
        })
}
