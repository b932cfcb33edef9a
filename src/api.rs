//! HTTP API for the Telegram Mini App and internal services.
//!
//! Every task route goes through the authentication boundary: Mini App init
//! data (`Authorization: tma <initData>`) or the internal service key
//! (`Authorization: Bearer <key>` plus an explicit `owner` query parameter).
//! Spawned as a background task in the gateway, same pattern as the sweeper.

use crate::engine::{Engine, IngestOutcome, InteractionEvent, Outcome};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use nudge_core::{
    auth::{self, AuthContext, AuthKeys},
    config::ApiConfig,
    error::NudgeError,
    task::{NewTask, TaskAction},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

type ApiError = (StatusCode, Json<Value>);

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    engine: Arc<Engine>,
    keys: AuthKeys,
    uptime: Instant,
}

impl ApiState {
    pub fn new(engine: Arc<Engine>, keys: AuthKeys, uptime: Instant) -> Self {
        Self {
            engine,
            keys,
            uptime,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct OwnerQuery {
    owner: Option<String>,
    #[serde(default)]
    include_completed: bool,
}

/// `POST /api/tasks` body.
#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    description: String,
    due_at: DateTime<Utc>,
    /// Idempotency key; retries with the same key return the same task.
    dedup_key: Option<String>,
    /// Chat to deliver into. Defaults to the owner's private chat.
    reply_target: Option<String>,
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnoozeRequest {
    minutes: u32,
}

fn error_json(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into()})))
}

/// Map an engine error onto an HTTP status.
fn engine_error(e: NudgeError) -> ApiError {
    let status = match &e {
        NudgeError::NotFound(_) => StatusCode::NOT_FOUND,
        NudgeError::Auth(_) => StatusCode::FORBIDDEN,
        NudgeError::InvalidTransition { .. } | NudgeError::Conflict(_) => StatusCode::CONFLICT,
        NudgeError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        NudgeError::Parser(_) | NudgeError::Channel(_) | NudgeError::Calendar(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => {
            error!("api: {e}");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    error_json(status, e.to_string())
}

/// Run the authentication boundary for a request.
fn authenticate(
    headers: &HeaderMap,
    owner: Option<&str>,
    state: &ApiState,
) -> Result<AuthContext, ApiError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| error_json(StatusCode::UNAUTHORIZED, "missing Authorization header"))?
        .to_str()
        .map_err(|_| error_json(StatusCode::UNAUTHORIZED, "invalid Authorization header"))?;

    auth::authenticate(header, owner, &state.keys, state.engine.now()).map_err(|e| {
        warn!("api: rejected request: {e}");
        error_json(StatusCode::UNAUTHORIZED, e.to_string())
    })
}

/// `GET /api/health`: liveness plus task counts. No auth.
async fn health(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let stats = state.engine.stats().await.map_err(engine_error)?;
    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime.elapsed().as_secs(),
        "armed_timers": state.engine.armed_timers(),
        "tasks": {
            "created": stats.created,
            "scheduled": stats.scheduled,
            "sent": stats.sent,
            "completed": stats.completed,
        },
    })))
}

/// `GET /api/tasks`: the caller's tasks, soonest first.
async fn list_tasks(
    headers: HeaderMap,
    Query(query): Query<OwnerQuery>,
    State(state): State<ApiState>,
) -> Result<Json<Value>, ApiError> {
    let ctx = authenticate(&headers, query.owner.as_deref(), &state)?;
    let tasks = state
        .engine
        .store()
        .tasks_for_owner(&ctx.owner, query.include_completed)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "tasks": tasks })))
}

/// `POST /api/tasks`: create a task with an explicit due time.
async fn create_task(
    headers: HeaderMap,
    Query(query): Query<OwnerQuery>,
    State(state): State<ApiState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ctx = authenticate(&headers, query.owner.as_deref(), &state)?;
    let dedup_key = match request.dedup_key {
        Some(key) if !key.trim().is_empty() => format!("api:{}:{}", ctx.owner, key.trim()),
        _ => format!("api:{}:{}", ctx.owner, Uuid::new_v4()),
    };

    let outcome = state
        .engine
        .create(NewTask {
            reply_target: request.reply_target.unwrap_or_else(|| ctx.owner.clone()),
            channel: request.channel.unwrap_or_else(|| "telegram".to_string()),
            owner: ctx.owner,
            description: request.description.trim().to_string(),
            due_at: request.due_at,
            dedup_key,
        })
        .await
        .map_err(engine_error)?;

    match outcome {
        IngestOutcome::Created(task) => {
            info!("api: created {} for {}", task.id, task.owner);
            Ok((
                StatusCode::CREATED,
                Json(json!({"status": "created", "task": task})),
            ))
        }
        IngestOutcome::Duplicate(task) => Ok((
            StatusCode::OK,
            Json(json!({"status": "duplicate", "task": task})),
        )),
        IngestOutcome::Rejected { reason } | IngestOutcome::Unparseable { reason } => {
            Err(error_json(StatusCode::UNPROCESSABLE_ENTITY, reason))
        }
    }
}

async fn act(
    state: &ApiState,
    ctx: AuthContext,
    task_id: String,
    action: TaskAction,
) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .engine
        .handle(InteractionEvent {
            task_id,
            actor: ctx.owner,
            action,
        })
        .await
        .map_err(engine_error)?;
    let status = match outcome {
        Outcome::Applied(_) => "applied",
        Outcome::AlreadyResolved(_) => "already_resolved",
    };
    Ok(Json(json!({"status": status, "task": outcome.task()})))
}

/// `POST /api/tasks/{id}/cancel`
async fn cancel_task(
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<OwnerQuery>,
    State(state): State<ApiState>,
) -> Result<Json<Value>, ApiError> {
    let ctx = authenticate(&headers, query.owner.as_deref(), &state)?;
    act(&state, ctx, id, TaskAction::Cancel).await
}

/// `POST /api/tasks/{id}/complete`
async fn complete_task(
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<OwnerQuery>,
    State(state): State<ApiState>,
) -> Result<Json<Value>, ApiError> {
    let ctx = authenticate(&headers, query.owner.as_deref(), &state)?;
    act(&state, ctx, id, TaskAction::Complete).await
}

/// `POST /api/tasks/{id}/snooze` with `{"minutes": N}`.
async fn snooze_task(
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<OwnerQuery>,
    State(state): State<ApiState>,
    Json(request): Json<SnoozeRequest>,
) -> Result<Json<Value>, ApiError> {
    let ctx = authenticate(&headers, query.owner.as_deref(), &state)?;
    if request.minutes == 0 {
        return Err(error_json(StatusCode::BAD_REQUEST, "minutes must be positive"));
    }
    act(
        &state,
        ctx,
        id,
        TaskAction::Snooze {
            minutes: request.minutes,
        },
    )
    .await
}

/// Build the axum router with shared state.
fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/complete", post(complete_task))
        .route("/api/tasks/{id}/snooze", post(snooze_task))
        .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}

/// Start the API server. Called from `Gateway::run()`.
pub async fn serve(config: ApiConfig, state: ApiState) {
    if state.keys.internal_api_key.is_empty() && state.keys.bot_token.is_empty() {
        warn!("API server has neither a bot token nor an internal key; every task route will reject");
    }

    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("API server failed to bind to {addr}: {e}");
            return;
        }
    };

    info!("API server listening on {addr}");

    if let Err(e) = axum::serve(listener, app).await {
        error!("API server error: {e}");
    }
}
