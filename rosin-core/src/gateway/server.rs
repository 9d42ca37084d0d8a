//! SSE gateway server built on axum.

use super::GatewayConfig;
use super::auth::GatewayAuth;
use crate::error::PipelineError;
use crate::history::InMemoryRunLog;
use crate::pipeline::{RunHandle, RunOutcome, RunRequest, VerificationPipeline};
use crate::types::{Chain, Provider, catalog};
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Thread-safe shared gateway reference for axum handlers.
pub type SharedGateway = Arc<GatewayState>;

/// Everything the handlers need.
pub struct GatewayState {
    config: GatewayConfig,
    auth: GatewayAuth,
    pipeline: Arc<VerificationPipeline>,
    runs: Arc<InMemoryRunLog>,
    active_runs: Arc<AtomicUsize>,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("config", &self.config)
            .field("active_runs", &self.active_runs())
            .finish()
    }
}

impl GatewayState {
    /// `runs` should be the recorder the pipeline was built with.
    pub fn new(
        config: GatewayConfig,
        pipeline: Arc<VerificationPipeline>,
        runs: Arc<InMemoryRunLog>,
    ) -> Self {
        let auth = GatewayAuth::from_config(&config);
        Self {
            config,
            auth,
            pipeline,
            runs,
            active_runs: Arc::new(AtomicUsize::new(0)),
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }

    /// Uptime in seconds since the state was created.
    pub fn uptime_secs(&self) -> u64 {
        let elapsed = Utc::now() - self.started_at;
        elapsed.num_seconds().max(0) as u64
    }
}

/// Decrements the active-run counter when the run task ends.
struct ActiveRun(Arc<AtomicUsize>);

impl ActiveRun {
    fn acquire(counter: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| ActiveRun(Arc::clone(counter)))
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build the axum router for the gateway.
pub fn router(shared: SharedGateway) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/api/verify", post(verify_handler))
        .route("/api/models", get(models_handler))
        .route("/api/runs", get(runs_handler))
        .route("/api/runs/{id}", get(run_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared)
}

fn error_response(status: StatusCode, error: &str, details: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": error, "details": details.into() })),
    )
        .into_response()
}

/// Start a run and stream its events as SSE.
async fn verify_handler(
    State(gw): State<SharedGateway>,
    headers: HeaderMap,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    if !gw.auth.authorize(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", "missing or invalid bearer token");
    }

    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, "Invalid request", rejection.body_text());
        }
    };

    if let Err(e) = request.validate() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid request", e.to_string());
    }

    let Some(active) = ActiveRun::acquire(&gw.active_runs, gw.config.max_concurrent_runs) else {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many concurrent runs",
            format!("limit is {}", gw.config.max_concurrent_runs),
        );
    };

    let cancel = CancellationToken::new();
    let RunHandle { events, task, .. } = match gw.pipeline.spawn(request, cancel.clone()) {
        Ok(handle) => handle,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "Invalid request", e.to_string()),
    };
    info!(active_runs = gw.active_runs(), "Verification run started");

    tokio::spawn(async move {
        let _active = active;
        match task.await {
            Ok(Ok(RunOutcome::Completed(record))) => debug!(run_id = %record.id, "Run finished"),
            Ok(Ok(RunOutcome::Cancelled)) => debug!("Run cancelled"),
            Ok(Err(PipelineError::StageFailed { stage, message })) => {
                debug!(stage, error = %message, "Run failed")
            }
            Ok(Err(e)) => warn!(error = %e, "Run ended with error"),
            Err(e) => warn!(error = %e, "Run task panicked"),
        }
    });

    // Client disconnect drops the body stream, which cancels the run.
    let disconnect_guard = cancel.drop_guard();
    let stream = ReceiverStream::new(events).map(move |event| {
        let _guard = &disconnect_guard;
        Event::default().json_data(&event)
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(gw.config.keep_alive_secs.max(1))))
        .into_response()
}

/// Model catalog and default chains.
async fn models_handler() -> impl IntoResponse {
    let models = catalog();
    let providers: Vec<_> = Provider::ALL
        .iter()
        .map(|p| {
            let names: Vec<&str> = models
                .iter()
                .filter(|m| m.provider == *p)
                .map(|m| m.model.as_str())
                .collect();
            json!({
                "id": p.id(),
                "name": p.display_name(),
                "models": names,
            })
        })
        .collect();
    Json(json!({
        "providers": providers,
        "defaultChains": {
            "two": Chain::default_two(),
            "three": Chain::default_three(),
        },
    }))
}

/// Recent runs, newest first.
async fn runs_handler(State(gw): State<SharedGateway>, headers: HeaderMap) -> Response {
    if !gw.auth.authorize(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", "missing or invalid bearer token");
    }
    let runs: Vec<_> = gw
        .runs
        .list()
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "query": r.query,
                "chain": r.chain_summary(),
                "completed": r.summary.is_some(),
                "createdAt": r.created_at,
            })
        })
        .collect();
    Json(json!({ "runs": runs })).into_response()
}

/// One recorded run in full.
async fn run_handler(
    State(gw): State<SharedGateway>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !gw.auth.authorize(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", "missing or invalid bearer token");
    }
    let Ok(id) = id.parse::<uuid::Uuid>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid request", "run id must be a UUID");
    };
    match gw.runs.get(id) {
        Some(record) => Json(record).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Not found", format!("no run {id}")),
    }
}

/// Health check endpoint.
async fn health_handler(State(gw): State<SharedGateway>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": gw.uptime_secs(),
        "active_runs": gw.active_runs(),
    }))
}

/// Bind and serve until the process is stopped.
pub async fn run(gw: SharedGateway) -> Result<(), std::io::Error> {
    let addr = format!("{}:{}", gw.config.host, gw.config.port);
    let app = router(gw);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
