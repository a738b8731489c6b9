//! REST API — 매칭 수명주기와 보상 조회
//!
//! WebSocket은 시그널링 전용이고, 매칭/보상 같은 요청-응답 성격의
//! 작업은 전부 여기로 들어온다.

use crate::error::AppError;
use crate::identity::{IdentityGateway, User, UserRole};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// API 라우트 구성
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/matching/start", post(start_matching))
        .route("/api/matching/cancel", post(cancel_matching))
        .route("/api/matching/accept", post(accept_match))
        .route("/api/matching/decline", post(decline_match))
        .route("/api/matching/queue", get(queue_status))
        .route("/api/calls/end", post(end_call))
        .route("/api/rewards/user/:user_id", get(user_rewards))
        .route("/api/rewards/stats", get(reward_stats))
        .route("/api/rewards/retry", post(retry_failed_rewards))
        .route("/api/directory/sync", post(sync_directory))
        .with_state(state)
}

/// Bearer 토큰에서 호출자 신원 복원
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthenticated)?;
    state.gateway.verify(token)
}

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

#[derive(Debug, Deserialize)]
pub struct StartMatchingRequest {
    pub category: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub timeout_ms: Option<u64>,
}

fn default_priority() -> u8 {
    5
}

#[derive(Debug, Deserialize)]
pub struct MatchActionRequest {
    pub room_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EndCallRequest {
    pub room_id: String,
    pub reason: Option<String>,
    pub rating: Option<u8>,
}

/// 디렉터리 동기화 항목. 신뢰된 신원 서비스가 사용자 스냅샷과
/// 세션 토큰을 함께 내려보낸다.
#[derive(Debug, Deserialize)]
pub struct SyncUser {
    #[serde(flatten)]
    pub user: User,
    pub session_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SyncDirectoryRequest {
    pub users: Vec<SyncUser>,
}

#[derive(Debug, Serialize)]
struct SyncDirectoryResponse {
    synced: usize,
}

async fn start_matching(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartMatchingRequest>,
) -> Result<Json<Value>, AppError> {
    let user = authenticate(&state, &headers)?;
    if user.role != UserRole::HelpSeeker {
        return Err(AppError::NotAuthorized(
            "only help seekers can request matching".to_string(),
        ));
    }
    let timeout_ms = req
        .timeout_ms
        .unwrap_or(state.config.matching.default_timeout_ms);
    let outcome = state
        .matching
        .start_matching(&user.id, &req.category, req.priority, timeout_ms)
        .await?;
    Ok(ok(serde_json::to_value(outcome).map_err(|e| {
        AppError::Internal(e.to_string())
    })?))
}

async fn cancel_matching(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let user = authenticate(&state, &headers)?;
    state.matching.cancel_matching(&user.id)?;
    Ok(ok(json!({ "cancelled": true })))
}

async fn accept_match(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MatchActionRequest>,
) -> Result<Json<Value>, AppError> {
    let user = authenticate(&state, &headers)?;
    if user.role != UserRole::Volunteer {
        return Err(AppError::NotAuthorized(
            "only volunteers can accept a match".to_string(),
        ));
    }
    state.matching.accept_match(&req.room_id, &user.id)?;
    Ok(ok(json!({ "room_id": req.room_id, "accepted": true })))
}

async fn decline_match(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MatchActionRequest>,
) -> Result<Json<Value>, AppError> {
    let user = authenticate(&state, &headers)?;
    if user.role != UserRole::Volunteer {
        return Err(AppError::NotAuthorized(
            "only volunteers can decline a match".to_string(),
        ));
    }
    let reason = req.reason.as_deref().unwrap_or("declined");
    state
        .matching
        .decline_match(&req.room_id, &user.id, reason)
        .await?;
    Ok(ok(json!({ "room_id": req.room_id, "declined": true })))
}

async fn queue_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    authenticate(&state, &headers)?;
    let status = state.matching.queue_status();
    Ok(ok(serde_json::to_value(status).map_err(|e| {
        AppError::Internal(e.to_string())
    })?))
}

async fn end_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EndCallRequest>,
) -> Result<Json<Value>, AppError> {
    let user = authenticate(&state, &headers)?;
    let reason = req.reason.as_deref().unwrap_or("ended");
    let duration_secs = state
        .matching
        .end_call(&req.room_id, &user.id, reason, req.rating)
        .await?;
    Ok(ok(json!({ "room_id": req.room_id, "duration_secs": duration_secs })))
}

async fn user_rewards(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let user = authenticate(&state, &headers)?;
    // 본인 보상 내역만 조회할 수 있다
    if user.id != user_id {
        return Err(AppError::NotAuthorized(
            "cannot read another user's rewards".to_string(),
        ));
    }
    let transactions = state.rewards.transactions_for_user(&user_id);
    Ok(ok(serde_json::to_value(transactions).map_err(|e| {
        AppError::Internal(e.to_string())
    })?))
}

async fn reward_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    authenticate(&state, &headers)?;
    let stats = state.rewards.stats();
    Ok(ok(serde_json::to_value(stats).map_err(|e| {
        AppError::Internal(e.to_string())
    })?))
}

async fn retry_failed_rewards(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    authenticate(&state, &headers)?;
    let requeued = state.rewards.retry_failed().await;
    Ok(ok(json!({ "requeued": requeued })))
}

/// 신원 서비스로부터의 사용자 스냅샷 수용.
/// 내부 네트워크 전용 엔드포인트로, 리버스 프록시에서 외부 노출을 막는다.
async fn sync_directory(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncDirectoryRequest>,
) -> Result<Json<Value>, AppError> {
    let synced = req.users.len();
    for entry in req.users {
        if let Some(token) = &entry.session_token {
            state.gateway.register_token(token, &entry.user.id);
        }
        state.directory.upsert(entry.user);
    }
    tracing::info!(synced, "Directory synced");
    Ok(ok(serde_json::to_value(SyncDirectoryResponse { synced })
        .map_err(|e| AppError::Internal(e.to_string()))?))
}
