// src/api/routes.rs
// Thin handlers over the executor, store, and pool.

use crate::api::status::build_status_all;
use crate::api::types::{
    ChatLockRequest, ChatUnlockRequest, ReportQuery, SolveRequest, StatusResponse,
};
use crate::reports;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/v1/solve", post(solve))
        .route("/v1/status", get(status_one))
        .route("/v1/status/all", get(status_all))
        .route("/v1/chat/lock", post(chat_lock))
        .route("/v1/chat/unlock", post(chat_unlock))
        // Spelling aliases kept for operator tooling.
        .route("/v1/chats/lock", post(chat_lock))
        .route("/v1/chats/unlock", post(chat_unlock))
        .route("/v1/profiles/blocked", get(profiles_blocked))
        .route("/v1/profiles/{profile_id}/guest/clear", post(clear_guest_chats))
        .route("/v1/profiles/{profile_id}/chats/archive", post(archive_chats))
        .route("/v1/reports/containers", get(report_containers))
        .route("/v1/reports/profiles", get(report_profiles))
        .route("/v1/reports/prompts", get(report_prompts))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

async fn solve(
    State(state): State<AppState>,
    Json(req): Json<SolveRequest>,
) -> impl IntoResponse {
    let started = Instant::now();
    let request_id = req
        .request_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        request_id = %request_id,
        profile_id = req.options.profile_id.as_deref(),
        prompt_id = %req.options.prompt_id,
        "solve start"
    );

    let (status, response) = state.executor.execute(&req, &request_id).await;

    info!(
        request_id = %request_id,
        duration_ms = started.elapsed().as_millis() as u64,
        status = if response.ok { "succeeded" } else { "failed" },
        error_code = response.error.as_ref().map(|e| e.code.as_str()),
        "solve done"
    );

    (status, Json(response))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    container_id: Option<String>,
}

async fn status_one(
    State(state): State<AppState>,
    Query(q): Query<StatusQuery>,
) -> impl IntoResponse {
    let container_id = match q.container_id {
        Some(cid) => cid,
        // Without an explicit id, report the first enabled container.
        None => match state.pool.list_enabled().into_iter().next() {
            Some(cid) => cid,
            None => {
                return Json(StatusResponse {
                    ok: false,
                    status: json!({"error": "no enabled containers"}),
                });
            }
        },
    };

    let Some(client) = state.pool.get(&container_id) else {
        return Json(StatusResponse {
            ok: false,
            status: json!({"error": format!("unknown container_id: {container_id}")}),
        });
    };

    match client.status(None).await {
        Ok(status) => Json(StatusResponse {
            ok: true,
            status: json!({"container_id": container_id, "status": status.raw}),
        }),
        Err(e) => Json(StatusResponse {
            ok: false,
            status: json!({"container_id": container_id, "error": e.to_string()}),
        }),
    }
}

async fn status_all(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        ok: true,
        status: build_status_all(&state).await,
    })
}

async fn chat_lock(
    State(state): State<AppState>,
    Json(req): Json<ChatLockRequest>,
) -> impl IntoResponse {
    match state
        .store
        .lock_chat_by_url(&req.chat_url, &req.locked_by, req.ttl_seconds)
        .await
    {
        Ok(session) => Json(json!({"ok": true, "chat_session": session})).into_response(),
        Err(e) => {
            error!(error = %e, chat_url = %req.chat_url, "chat lock failed");
            storage_error()
        }
    }
}

async fn chat_unlock(
    State(state): State<AppState>,
    Json(req): Json<ChatUnlockRequest>,
) -> impl IntoResponse {
    match state
        .store
        .unlock_chat_by_url(&req.chat_url, &req.locked_by)
        .await
    {
        Ok(unlocked) => Json(json!({"ok": unlocked})).into_response(),
        Err(e) => {
            error!(error = %e, chat_url = %req.chat_url, "chat unlock failed");
            storage_error()
        }
    }
}

async fn profiles_blocked(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_blocked_profiles().await {
        Ok(profiles) => Json(json!({
            "ok": true,
            "reason": "guest",
            "profiles": profiles,
            "hint_clear_guest": "POST /v1/profiles/{profile_id}/guest/clear",
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "blocked profiles listing failed");
            storage_error()
        }
    }
}

async fn clear_guest_chats(
    State(state): State<AppState>,
    Path(profile_id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_guest_chats_for_profile(&profile_id).await {
        Ok(deleted) => {
            info!(profile_id = %profile_id, deleted, "guest chats cleared");
            Json(json!({"ok": true, "profile_id": profile_id, "deleted": deleted})).into_response()
        }
        Err(e) => {
            error!(error = %e, profile_id = %profile_id, "guest chat clearing failed");
            storage_error()
        }
    }
}

async fn archive_chats(
    State(state): State<AppState>,
    Path(profile_id): Path<String>,
) -> impl IntoResponse {
    match state.store.archive_chats_for_profile(&profile_id).await {
        Ok(archived) => {
            info!(profile_id = %profile_id, archived, "chats archived");
            Json(json!({"ok": true, "profile_id": profile_id, "archived": archived})).into_response()
        }
        Err(e) => {
            error!(error = %e, profile_id = %profile_id, "chat archiving failed");
            storage_error()
        }
    }
}

async fn report_containers(
    State(state): State<AppState>,
    Query(q): Query<ReportQuery>,
) -> impl IntoResponse {
    match reports::containers_usage(&state.store, &q.from, &q.to, q.limit, q.offset).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!(error = %e, "containers report failed");
            storage_error()
        }
    }
}

async fn report_profiles(
    State(state): State<AppState>,
    Query(q): Query<ReportQuery>,
) -> impl IntoResponse {
    match reports::profiles_usage(&state.store, &q.from, &q.to, q.limit, q.offset).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!(error = %e, "profiles report failed");
            storage_error()
        }
    }
}

async fn report_prompts(
    State(state): State<AppState>,
    Query(q): Query<ReportQuery>,
) -> impl IntoResponse {
    match reports::prompts_usage(&state.store, &q.from, &q.to, q.limit, q.offset).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!(error = %e, "prompts report failed");
            storage_error()
        }
    }
}

fn storage_error() -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"ok": false, "error": "storage error"})),
    )
        .into_response()
}
