use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::error::{ExecuteError, StoreError, TemplateError};
use crate::pipeline::Pipeline;
use crate::templates::TemplateKey;
use crate::types::{Delivery, DocumentQuery, ExecutionStatus};

const DEFAULT_PAGE_SIZE: u32 = 50;

const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    started_at: Instant,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/health", get(handle_health))
        .route("/api/webhooks", get(list_events))
        .route("/api/webhooks/{id}", get(get_event).delete(delete_event))
        .route("/api/webhooks/{id}/payload", get(get_event_payload))
        .route("/api/prompts", get(list_templates))
        .route(
            "/api/prompts/generic/{event_type}",
            get(get_generic_template)
                .post(save_generic_template)
                .delete(delete_generic_template),
        )
        .route(
            "/api/prompts/repo/{repo}/{event_type}",
            get(get_repo_template)
                .post(save_repo_template)
                .delete(delete_repo_template),
        )
        .route("/api/parsed-prompts", get(list_documents))
        .route("/api/parsed-prompts/{id}", get(get_document))
        .route("/api/claude-responses/{prompt_id}", get(latest_execution))
        .route("/api/claude-execute/{id}", post(execute_document))
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(&'static str),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.to_string()),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!("store error: {e}");
        ApiError::Internal(e.to_string())
    }
}

impl From<TemplateError> for ApiError {
    fn from(e: TemplateError) -> Self {
        match e {
            TemplateError::NotFound => ApiError::NotFound("Prompt not found"),
            TemplateError::InvalidKey(_) => ApiError::BadRequest(e.to_string()),
            TemplateError::Io(_) => ApiError::Internal(e.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Numeric row id from the path. Anything else is a JSON 400.
struct RecordId(i64);

impl<S: Send + Sync> FromRequestParts<S> for RecordId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        raw.parse()
            .map(RecordId)
            .map_err(|_| ApiError::BadRequest(format!("invalid id: {raw:?}")))
    }
}

// ─── Ingress ─────────────────────────────────────────────────────────────────

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let delivery = Delivery {
        event_type: header_str(&headers, EVENT_HEADER),
        delivery_id: header_str(&headers, DELIVERY_HEADER),
        signature: header_str(&headers, SIGNATURE_HEADER),
        content_type: header_str(&headers, header::CONTENT_TYPE.as_str()),
        body: body.to_vec(),
    };

    match state.pipeline.ingest(delivery).await {
        Ok(ack) => Json(ack).into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Failed to log webhook" })),
        )
            .into_response(),
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
    }))
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// Paging parameters. Anything unparseable falls back to the default.
#[derive(Debug, Default, Deserialize)]
struct PageParams {
    limit: Option<String>,
    offset: Option<String>,
    webhook_id: Option<String>,
}

impl PageParams {
    fn limit(&self) -> u32 {
        self.limit
            .as_deref()
            .and_then(|v| v.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    fn offset(&self) -> u32 {
        self.offset
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn webhook_id(&self) -> Option<i64> {
        self.webhook_id.as_deref().and_then(|v| v.parse().ok())
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(page): Query<PageParams>,
) -> ApiResult<Response> {
    let events = state
        .pipeline
        .store()
        .list_events(page.limit(), page.offset())
        .await?;
    Ok(Json(events).into_response())
}

async fn get_event(State(state): State<AppState>, RecordId(id): RecordId) -> ApiResult<Response> {
    let event = state
        .pipeline
        .store()
        .get_event(id)
        .await?
        .ok_or(ApiError::NotFound("Webhook not found"))?;
    Ok(Json(event).into_response())
}

async fn get_event_payload(
    State(state): State<AppState>,
    RecordId(id): RecordId,
) -> ApiResult<Response> {
    let raw = state
        .pipeline
        .store()
        .get_event_payload(id)
        .await?
        .ok_or(ApiError::NotFound("Webhook not found"))?;
    Ok(([(header::CONTENT_TYPE, "application/json")], raw).into_response())
}

async fn delete_event(State(state): State<AppState>, RecordId(id): RecordId) -> ApiResult<Response> {
    if !state.pipeline.store().delete_event(id).await? {
        return Err(ApiError::NotFound("Webhook not found"));
    }
    tracing::info!(event_id = id, "event deleted");
    Ok(Json(json!({ "deleted": true, "id": id })).into_response())
}

// ─── Templates ───────────────────────────────────────────────────────────────

async fn list_templates(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.pipeline.templates().list().await?).into_response())
}

async fn get_generic_template(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
) -> ApiResult<String> {
    let key = TemplateKey::generic(&event_type)?;
    Ok(state.pipeline.templates().get(&key).await?)
}

async fn save_generic_template(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
    body: String,
) -> ApiResult<Json<Value>> {
    let key = TemplateKey::generic(&event_type)?;
    state.pipeline.templates().put(&key, &body).await?;
    tracing::info!(event_type = %event_type, "generic template saved");
    Ok(Json(json!({ "success": true })))
}

async fn delete_generic_template(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
) -> ApiResult<Json<Value>> {
    let key = TemplateKey::generic(&event_type)?;
    state.pipeline.templates().delete(&key).await?;
    tracing::info!(event_type = %event_type, "generic template deleted");
    Ok(Json(json!({ "success": true })))
}

async fn get_repo_template(
    State(state): State<AppState>,
    Path((repo, event_type)): Path<(String, String)>,
) -> ApiResult<String> {
    let key = TemplateKey::repository(&repo, &event_type)?;
    Ok(state.pipeline.templates().get(&key).await?)
}

async fn save_repo_template(
    State(state): State<AppState>,
    Path((repo, event_type)): Path<(String, String)>,
    body: String,
) -> ApiResult<Json<Value>> {
    let key = TemplateKey::repository(&repo, &event_type)?;
    state.pipeline.templates().put(&key, &body).await?;
    tracing::info!(repository = %repo, event_type = %event_type, "repository template saved");
    Ok(Json(json!({ "success": true })))
}

async fn delete_repo_template(
    State(state): State<AppState>,
    Path((repo, event_type)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let key = TemplateKey::repository(&repo, &event_type)?;
    state.pipeline.templates().delete(&key).await?;
    tracing::info!(repository = %repo, event_type = %event_type, "repository template deleted");
    Ok(Json(json!({ "success": true })))
}

// ─── Rendered documents and executions ───────────────────────────────────────

async fn list_documents(
    State(state): State<AppState>,
    Query(page): Query<PageParams>,
) -> ApiResult<Response> {
    let docs = state
        .pipeline
        .store()
        .list_documents(DocumentQuery {
            webhook_id: page.webhook_id(),
            limit: page.limit(),
            offset: page.offset(),
        })
        .await?;
    Ok(Json(docs).into_response())
}

async fn get_document(State(state): State<AppState>, RecordId(id): RecordId) -> ApiResult<Response> {
    let doc = state
        .pipeline
        .store()
        .get_document(id)
        .await?
        .ok_or(ApiError::NotFound("Parsed prompt not found"))?;
    Ok(Json(doc).into_response())
}

async fn latest_execution(
    State(state): State<AppState>,
    RecordId(prompt_id): RecordId,
) -> ApiResult<Response> {
    let record = state
        .pipeline
        .store()
        .latest_execution(prompt_id)
        .await?
        .ok_or(ApiError::NotFound("No agent response found for this prompt"))?;
    Ok(Json(record).into_response())
}

async fn execute_document(
    State(state): State<AppState>,
    RecordId(id): RecordId,
) -> ApiResult<Response> {
    let (document, record) = match state.pipeline.execute_now(id).await {
        Ok(done) => done,
        Err(ExecuteError::DocumentNotFound(_)) => {
            return Err(ApiError::NotFound("Parsed prompt not found"))
        }
        Err(ExecuteError::Store(e)) => return Err(e.into()),
    };

    let stderr = record.error_message.clone().unwrap_or_default();
    let response = match record.status {
        ExecutionStatus::Succeeded => Json(json!({
            "success": true,
            "output": record.response_content,
            "execution_time": record.execution_time,
            "repository": document.repository,
            "event_type": document.event_type,
            "prompt_id": document.id,
            "webhook_id": document.webhook_id,
        }))
        .into_response(),
        ExecutionStatus::Failed | ExecutionStatus::TimedOut => {
            let error = if record.status == ExecutionStatus::TimedOut {
                "Agent execution timed out"
            } else {
                "Agent execution failed"
            };
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": error,
                    "exit_code": record.exit_code,
                    "stderr": stderr,
                    "execution_time": record.execution_time,
                })),
            )
                .into_response()
        }
        ExecutionStatus::LaunchFailed => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Failed to execute agent command",
                "message": stderr,
            })),
        )
            .into_response(),
    };
    Ok(response)
}
