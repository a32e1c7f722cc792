//! HTTP control surface (spec.md §6.1): single-machine extraction,
//! batch dispatch and status, and approval decisions, as an axum
//! service — one `Router`, one shared `State`, a permissive `CorsLayer`
//! for same-process dashboard tooling.

use crate::acquisition::http_client::HttpClient;
use crate::acquisition::url_health::{check_url_health, UrlHealth};
use crate::batch::BatchOrchestrator;
use crate::model::{ApprovalDecision, PriceHistory, Tier, ValidationStatus};
use crate::orchestrator::Orchestrator;
use crate::store::Store;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub batch_orchestrator: Arc<BatchOrchestrator>,
    pub store: Arc<dyn Store>,
    pub http: HttpClient,
    pub fetch_timeout_ms: u64,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/extract/:machine_id", post(extract_one))
        .route("/batch", post(dispatch_batch))
        .route("/batch/:batch_id", get(get_batch))
        .route("/approval/:history_id", post(resolve_approval))
        .route("/machines/:machine_id/health", get(machine_health))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("price-monitor HTTP control surface listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ExtractResponse {
    machine_id: String,
    tier_used: Tier,
    price: Option<Decimal>,
    validation_status: ValidationStatus,
    requires_approval: bool,
    price_updated: bool,
    history_id: Uuid,
}

/// Errors surfaced at the HTTP boundary. Wraps `ExtractError`/`StoreError`
/// the way `error.rs`'s `AppError` does for the CLI boundary, just with
/// an HTTP status attached instead of a process exit code.
struct HttpError(StatusCode, String);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

async fn extract_one(
    State(state): State<Arc<AppState>>,
    Path(machine_id): Path<String>,
) -> Result<Json<ExtractResponse>, HttpError> {
    match state.orchestrator.extract_machine(&machine_id, None, None).await {
        Ok(run) => Ok(Json(ExtractResponse {
            machine_id,
            tier_used: run.history.tier_used,
            price: run.history.price,
            validation_status: run.history.validation_status,
            requires_approval: run.history.requires_approval,
            price_updated: run.price_updated,
            history_id: run.history.id,
        })),
        Err(e) => Err(HttpError(StatusCode::NOT_FOUND, e.to_string())),
    }
}

#[derive(Deserialize)]
struct DispatchBatchRequest {
    machine_ids: Vec<String>,
    /// When set, the batch's per-machine tier-escalation events are
    /// logged at `info` instead of `debug` (spec.md §6.1) so an operator
    /// watching a single troublesome batch doesn't have to drop the
    /// whole process's log level.
    #[serde(default)]
    debug: bool,
}

#[derive(Serialize)]
struct DispatchBatchResponse {
    batch_id: Uuid,
}

async fn dispatch_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DispatchBatchRequest>,
) -> Result<(StatusCode, Json<DispatchBatchResponse>), HttpError> {
    if req.machine_ids.is_empty() {
        return Err(HttpError(StatusCode::BAD_REQUEST, "machine_ids must not be empty".to_string()));
    }

    // The batch row is created synchronously so the id handed back here
    // is the same one `GET /batch/:id` will find; the run itself can take
    // much longer than a single HTTP request should block, so execution
    // is dispatched in the background and the client polls for progress.
    let batch_id = state
        .batch_orchestrator
        .create_batch(req.machine_ids.clone())
        .await
        .map_err(|e| HttpError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if req.debug {
        tracing::info!(%batch_id, machine_count = req.machine_ids.len(), "batch dispatched in debug mode");
    }

    let batch_orchestrator = state.batch_orchestrator.clone();
    let machine_ids = req.machine_ids.clone();
    tokio::spawn(async move {
        if let Err(e) = batch_orchestrator.execute_batch(batch_id, machine_ids).await {
            tracing::warn!("batch run failed: {e}");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(DispatchBatchResponse { batch_id })))
}

async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<crate::model::Batch>, HttpError> {
    state
        .store
        .get_batch(batch_id)
        .await
        .map(Json)
        .map_err(|e| HttpError(StatusCode::NOT_FOUND, e.to_string()))
}

#[derive(Deserialize)]
struct ApprovalRequest {
    decision: ApprovalDecision,
}

#[derive(Serialize)]
struct ApprovalResponse {
    history: PriceHistory,
}

async fn resolve_approval(
    State(state): State<Arc<AppState>>,
    Path(history_id): Path<Uuid>,
    Json(req): Json<ApprovalRequest>,
) -> Result<Json<ApprovalResponse>, HttpError> {
    let history = state
        .store
        .get_price_history(history_id)
        .await
        .map_err(|e| HttpError(StatusCode::NOT_FOUND, e.to_string()))?;

    if req.decision == ApprovalDecision::Approve {
        if let Some(price) = history.price {
            state
                .store
                .update_machine_price(&history.machine_id, price, chrono::Utc::now())
                .await
                .map_err(|e| HttpError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        }
    }

    state
        .store
        .resolve_price_history_approval(history_id)
        .await
        .map_err(|e| HttpError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(ApprovalResponse { history }))
}

async fn machine_health(
    State(state): State<Arc<AppState>>,
    Path(machine_id): Path<String>,
) -> Result<Json<UrlHealth>, HttpError> {
    let machine = state
        .store
        .get_machine(&machine_id)
        .await
        .map_err(|e| HttpError(StatusCode::NOT_FOUND, e.to_string()))?;

    Ok(Json(
        check_url_health(&state.http, &machine.product_url, state.fetch_timeout_ms).await,
    ))
}
