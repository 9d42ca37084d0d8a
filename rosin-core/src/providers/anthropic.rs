//! Anthropic Messages API adapter.

use super::{
    ChatRequest, Delta, Endpoint, TokenStream, decode_stream, parse_payload, read_json,
    send_checked, text_or_skip,
};
use crate::error::LlmError;
use crate::types::Provider;
use serde_json::{Value, json};
use tracing::debug;

/// The Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Request body for `/messages`.
pub fn build_body(model: &str, request: &ChatRequest, stream: bool) -> Value {
    json!({
        "model": model,
        "system": request.system_prompt,
        "messages": [
            { "role": "user", "content": request.user_content },
        ],
        "max_tokens": request.max_tokens,
        "stream": stream,
    })
}

/// Map one SSE payload by its `type`.
///
/// `event:` lines are dropped by the frame parser; every data payload repeats
/// its event name in `type`.
pub(crate) fn decode_payload(payload: &str) -> Delta {
    let Some(data) = parse_payload(Provider::Anthropic, payload) else {
        return Delta::Skip;
    };
    match data["type"].as_str().unwrap_or("") {
        "content_block_delta" if data["delta"]["type"].as_str() == Some("text_delta") => {
            text_or_skip(data["delta"]["text"].as_str())
        }
        "message_stop" => Delta::Stop,
        "error" => Delta::Error(
            data["error"]["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string(),
        ),
        // message_start, content_block_start/stop, message_delta, ping
        _ => Delta::Skip,
    }
}

fn post(endpoint: &Endpoint<'_>, body: &Value) -> reqwest::RequestBuilder {
    endpoint
        .http
        .post(format!("{}/messages", endpoint.base_url))
        .header("x-api-key", &endpoint.api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(body)
}

pub(crate) async fn stream(
    endpoint: &Endpoint<'_>,
    model: &str,
    request: &ChatRequest,
) -> Result<TokenStream, LlmError> {
    debug!(model, base_url = %endpoint.base_url, "Sending streaming Anthropic request");
    let response = send_checked(
        Provider::Anthropic,
        post(endpoint, &build_body(model, request, true)),
    )
    .await?;
    Ok(decode_stream(Provider::Anthropic, response, decode_payload))
}

pub(crate) async fn complete(
    endpoint: &Endpoint<'_>,
    model: &str,
    request: &ChatRequest,
) -> Result<String, LlmError> {
    debug!(model, base_url = %endpoint.base_url, "Sending Anthropic request");
    let response = send_checked(
        Provider::Anthropic,
        post(endpoint, &build_body(model, request, false)),
    )
    .await?;

    let body = read_json(Provider::Anthropic, response).await?;
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| LlmError::ResponseParse {
            message: "Anthropic response has no content array".to_string(),
        })?;
    Ok(blocks
        .iter()
        .filter(|b| b["type"].as_str() == Some("text"))
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join(""))
}
