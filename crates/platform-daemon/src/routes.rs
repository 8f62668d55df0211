//! Axum router and HTTP handlers for `platform-daemon` (spec §6 contract,
//! SPEC_FULL §11). `build_router` is the single entry point; `main.rs`
//! calls it and attaches the CORS/trace middleware layers, matching the
//! teacher's `mqk-daemon::routes` split.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::{
    api_types::{ErrorResponse, HealthResponse},
    state::{uptime_secs, AppState, BusMsg, CommandAcceptedResponse, StatusSnapshot},
};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/commands/:name", post(accept_command))
        .route("/processes/:id", get(get_process))
        .route("/processes/:id/log", get(get_process_log))
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /commands/{name}
// ---------------------------------------------------------------------------

/// Accept a command (spec §6): `Idempotency-Key` is mandatory — the bus has
/// no other way to recognize a retried client request as the same logical
/// command (spec §4.4). `Business-Key` is optional.
pub(crate) async fn accept_command(
    State(st): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let Some(idempotency_key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "missing required Idempotency-Key header".to_string(),
            }),
        )
            .into_response();
    };

    let business_key = headers.get("Business-Key").and_then(|v| v.to_str().ok());

    match st
        .command_bus
        .accept(&name, idempotency_key, business_key, payload, BTreeMap::new())
        .await
    {
        Ok(command_id) => {
            let mut response = (
                StatusCode::ACCEPTED,
                Json(CommandAcceptedResponse { command_id }),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&command_id.to_string()) {
                response.headers_mut().insert("X-Command-Id", value);
            }
            response
        }
        Err(err) => {
            tracing::error!(%err, command_name = %name, "accept_command failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse { error: err.to_string() }),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /processes/{id}
// ---------------------------------------------------------------------------

pub(crate) async fn get_process(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match st.process_manager.find_by_id(id).await {
        Ok(Some(instance)) => (StatusCode::OK, Json(instance)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse { error: format!("no process instance {id}") }),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: err.to_string() }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /processes/{id}/log
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct LogQuery {
    limit: Option<i64>,
}

pub(crate) async fn get_process_log(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<LogQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(1_000);
    match st.process_manager.log(id, limit).await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: err.to_string() }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let ok = platform_db::status(&st.pool).await.map(|s| s.ok).unwrap_or(false);
    (
        if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE },
        Json(HealthResponse {
            ok,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let db = platform_db::status(&st.pool).await;
    let snap = StatusSnapshot {
        daemon_uptime_secs: uptime_secs(),
        db_ok: db.as_ref().map(|s| s.ok).unwrap_or(false),
        has_command_table: db.as_ref().map(|s| s.has_command_table).unwrap_or(false),
    };
    (StatusCode::OK, Json(snap))
}

// ---------------------------------------------------------------------------
// GET /v1/stream (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(rx: broadcast::Receiver<BusMsg>) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::CommandReply { .. } => "reply",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None,
        }
    })
}
