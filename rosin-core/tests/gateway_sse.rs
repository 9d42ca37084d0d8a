//! Integration tests for the SSE gateway.

use axum::body::Body;
use rosin_core::gateway::{GatewayConfig, GatewayState, SharedGateway, gateway_router};
use rosin_core::{
    InMemoryRunLog, ModelRef, Provider, RosinConfig, ScriptedChatClient, ScriptedReply,
    VerificationPipeline,
};
use std::sync::Arc;
use tower::ServiceExt;

fn make_gateway(client: Arc<ScriptedChatClient>, config: GatewayConfig) -> SharedGateway {
    let runs = Arc::new(InMemoryRunLog::default());
    let pipeline = VerificationPipeline::from_config(&RosinConfig::default(), client, runs.clone());
    Arc::new(GatewayState::new(config, Arc::new(pipeline), runs))
}

fn verify_request(body: serde_json::Value, token: Option<&str>) -> axum::http::Request<Body> {
    let mut builder = axum::http::Request::builder()
        .method("POST")
        .uri("/api/verify")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn two_stage_body() -> serde_json::Value {
    serde_json::json!({
        "query": "What is the capital of France?",
        "chain": [
            {"provider": "openai", "model": "gpt-4o"},
            {"provider": "xai", "model": "grok-3"}
        ]
    })
}

/// The JSON payload of every `data:` frame, in order.
fn data_frames(body: &str) -> Vec<serde_json::Value> {
    body.split("\n\n")
        .filter_map(|frame| frame.lines().find_map(|l| l.strip_prefix("data: ")))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}

#[tokio::test]
async fn test_verify_streams_pipeline_events() {
    let client = Arc::new(ScriptedChatClient::new());
    client.push_reply(
        &ModelRef::new(Provider::OpenAi, "gpt-4o"),
        ScriptedReply::tokens(&["Par", "is"]),
    );
    let app = gateway_router(make_gateway(client, GatewayConfig::default()));

    let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, verify_request(two_stage_body(), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
        .await
        .unwrap();
    let frames = data_frames(std::str::from_utf8(&body).unwrap());
    let types: Vec<_> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(
        types,
        vec![
            "stage_start",
            "stage_content",
            "stage_content",
            "stage_complete",
            "stage_start",
            "stage_content",
            "stage_complete",
            "summary",
            "done"
        ]
    );
    assert_eq!(frames[0]["model"]["provider"], "openai");
    assert_eq!(frames[1]["content"], "Par");
    assert_eq!(frames[7]["summary"]["isAnalyzed"], false);
}

#[tokio::test]
async fn test_finished_run_is_listed() {
    let gw = make_gateway(Arc::new(ScriptedChatClient::new()), GatewayConfig::default());
    let resp = gateway_router(gw.clone())
        .oneshot(verify_request(two_stage_body(), None))
        .await
        .unwrap();
    axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();

    // The run is recorded on its task after `done` is sent.
    let listing = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let resp = gateway_router(gw.clone())
                .oneshot(
                    axum::http::Request::builder()
                        .uri("/api/runs")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let bytes = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            if !json["runs"].as_array().unwrap().is_empty() {
                break json;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let run = &listing["runs"][0];
    assert_eq!(run["query"], "What is the capital of France?");
    assert_eq!(run["chain"], "gpt-4o → grok-3");
    assert_eq!(run["completed"], true);

    let id = run["id"].as_str().unwrap();
    let resp = gateway_router(gw)
        .oneshot(
            axum::http::Request::builder()
                .uri(format!("/api/runs/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let bytes = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
    let record: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(record["stages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_verify_with_valid_token() {
    let config = GatewayConfig {
        auth_tokens: vec!["t0ken".into()],
        ..GatewayConfig::default()
    };
    let gw = make_gateway(Arc::new(ScriptedChatClient::new()), config);

    let denied = gateway_router(gw.clone())
        .oneshot(verify_request(two_stage_body(), Some("wrong")))
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    let allowed = gateway_router(gw)
        .oneshot(verify_request(two_stage_body(), Some("t0ken")))
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
}

#[tokio::test]
async fn test_verify_rejects_empty_query() {
    let gw = make_gateway(Arc::new(ScriptedChatClient::new()), GatewayConfig::default());
    let mut body = two_stage_body();
    body["query"] = serde_json::json!("   ");
    let resp = gateway_router(gw)
        .oneshot(verify_request(body, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let bytes = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["error"], "Invalid request");
    assert!(json["details"].as_str().unwrap().contains("query"));
}

#[tokio::test]
async fn test_verify_over_capacity_returns_429() {
    let config = GatewayConfig {
        max_concurrent_runs: 0,
        ..GatewayConfig::default()
    };
    let gw = make_gateway(Arc::new(ScriptedChatClient::new()), config);
    let resp = gateway_router(gw)
        .oneshot(verify_request(two_stage_body(), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
}
