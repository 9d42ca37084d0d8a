//! Google Gemini adapter.
//!
//! Gemini has no system role on this endpoint, so the system prompt and user
//! content travel as a single user part separated by a blank line.

use super::{
    ChatRequest, Delta, Endpoint, TokenStream, decode_stream, parse_payload, read_json,
    send_checked, text_or_skip,
};
use crate::error::LlmError;
use crate::types::Provider;
use serde_json::{Value, json};
use tracing::debug;

pub fn build_body(request: &ChatRequest) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": format!("{}\n\n{}", request.system_prompt, request.user_content) }],
        }],
        "generationConfig": {
            "maxOutputTokens": request.max_tokens,
        },
    })
}

/// Map one SSE payload: `candidates[0].content.parts[0].text`.
pub(crate) fn decode_payload(payload: &str) -> Delta {
    let Some(data) = parse_payload(Provider::Gemini, payload) else {
        return Delta::Skip;
    };
    if let Some(message) = data["error"]["message"].as_str() {
        return Delta::Error(message.to_string());
    }
    text_or_skip(data["candidates"][0]["content"]["parts"][0]["text"].as_str())
}

fn post(endpoint: &Endpoint<'_>, url: String, request: &ChatRequest) -> reqwest::RequestBuilder {
    endpoint
        .http
        .post(url)
        .header("x-goog-api-key", &endpoint.api_key)
        .json(&build_body(request))
}

pub(crate) async fn stream(
    endpoint: &Endpoint<'_>,
    model: &str,
    request: &ChatRequest,
) -> Result<TokenStream, LlmError> {
    let url = format!(
        "{}/models/{}:streamGenerateContent?alt=sse",
        endpoint.base_url, model
    );
    debug!(model, url = %url, "Sending streaming Gemini request");
    let response = send_checked(Provider::Gemini, post(endpoint, url, request)).await?;
    Ok(decode_stream(Provider::Gemini, response, decode_payload))
}

pub(crate) async fn complete(
    endpoint: &Endpoint<'_>,
    model: &str,
    request: &ChatRequest,
) -> Result<String, LlmError> {
    let url = format!("{}/models/{}:generateContent", endpoint.base_url, model);
    debug!(model, url = %url, "Sending Gemini request");
    let response = send_checked(Provider::Gemini, post(endpoint, url, request)).await?;

    let body = read_json(Provider::Gemini, response).await?;
    let parts = body["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or_else(|| LlmError::ResponseParse {
            message: "Gemini response has no candidates[0].content.parts".to_string(),
        })?;
    Ok(parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect::<Vec<_>>()
        .join(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_body_concatenates_prompts() {
        let body = build_body(&ChatRequest::new("sys", "query", 3072));
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "sys\n\nquery");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 3072);
    }

    #[test]
    fn test_decode_candidate_text() {
        let payload = r#"{"candidates":[{"content":{"parts":[{"text":"Bonjour"}],"role":"model"}}]}"#;
        assert_eq!(decode_payload(payload), Delta::Text("Bonjour".into()));
    }

    #[test]
    fn test_decode_skips_usage_only_chunk() {
        let payload = r#"{"usageMetadata":{"promptTokenCount":5}}"#;
        assert_eq!(decode_payload(payload), Delta::Skip);
    }
}
