//! WebRTC 시그널링 릴레이 핸들러
//!
//! SDP와 ICE 후보는 내용을 해석하지 않고 같은 방의 상대에게 그대로 전달한다.

use crate::handlers::room::broadcast_to_room_except;
use crate::protocol::{CallStatusKind, ServerMessage};
use crate::state::{AppState, RoomStatus};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// 발신 세션의 (송신 채널, user_id, room_id) 조회.
/// 방에 참여하지 않은 연결이면 에러를 돌려주고 None.
async fn sender_context(
    state: &Arc<AppState>,
    connection_id: &str,
) -> Option<(UnboundedSender<ServerMessage>, String, String)> {
    let session = state.connections.get(connection_id)?;
    let sender = session.sender.clone();
    let user_id = session.user_id.read().await.clone();
    let room_id = session.room_id.read().await.clone();

    match (user_id, room_id) {
        (Some(user_id), Some(room_id)) => Some((sender, user_id, room_id)),
        _ => {
            let _ = sender.send(ServerMessage::Error {
                code: "NOT_IN_ROOM".to_string(),
                message: "join a room before signaling".to_string(),
            });
            None
        }
    }
}

/// 같은 방의 대상에게 메시지 전달. 대상이 방에 없으면 발신자에게만 에러.
async fn relay_to_target(
    state: &Arc<AppState>,
    sender: &UnboundedSender<ServerMessage>,
    room_id: &str,
    target_user_id: &str,
    message: ServerMessage,
) {
    let target_connection_id = match state.rooms.get(room_id) {
        Some(room) => room
            .participants
            .read()
            .await
            .get(target_user_id)
            .map(|p| p.connection_id.clone()),
        None => None,
    };

    match target_connection_id {
        Some(connection_id) => {
            if let Some(session) = state.connections.get(&connection_id) {
                let _ = session.sender.send(message);
            }
        }
        None => {
            let _ = sender.send(ServerMessage::Error {
                code: "TARGET_NOT_IN_ROOM".to_string(),
                message: format!("user {target_user_id} is not in room {room_id}"),
            });
            tracing::warn!(
                room_id = %room_id,
                target_user_id = %target_user_id,
                "Relay target not in room"
            );
        }
    }
}

/// Offer 릴레이
pub async fn handle_offer(
    state: Arc<AppState>,
    connection_id: &str,
    target_user_id: &str,
    sdp: String,
) {
    let Some((sender, user_id, room_id)) = sender_context(&state, connection_id).await else {
        return;
    };
    tracing::debug!(from = %user_id, to = %target_user_id, room_id = %room_id, "Relaying offer");
    relay_to_target(
        &state,
        &sender,
        &room_id,
        target_user_id,
        ServerMessage::Offer { from: user_id, sdp },
    )
    .await;
}

/// Answer 릴레이
pub async fn handle_answer(
    state: Arc<AppState>,
    connection_id: &str,
    target_user_id: &str,
    sdp: String,
) {
    let Some((sender, user_id, room_id)) = sender_context(&state, connection_id).await else {
        return;
    };
    tracing::debug!(from = %user_id, to = %target_user_id, room_id = %room_id, "Relaying answer");
    relay_to_target(
        &state,
        &sender,
        &room_id,
        target_user_id,
        ServerMessage::Answer { from: user_id, sdp },
    )
    .await;
}

/// ICE 후보 릴레이
pub async fn handle_ice_candidate(
    state: Arc<AppState>,
    connection_id: &str,
    target_user_id: &str,
    candidate: String,
) {
    let Some((sender, user_id, room_id)) = sender_context(&state, connection_id).await else {
        return;
    };
    relay_to_target(
        &state,
        &sender,
        &room_id,
        target_user_id,
        ServerMessage::IceCandidate {
            from: user_id,
            candidate,
        },
    )
    .await;
}

/// 통화 상태 전이 처리. active는 방 상태만 바꾸고,
/// 종료 계열은 매칭 엔진의 통화 수명주기로 넘긴다.
pub async fn handle_call_status(
    state: Arc<AppState>,
    connection_id: &str,
    status: CallStatusKind,
    reason: Option<String>,
) {
    let Some((_sender, user_id, room_id)) = sender_context(&state, connection_id).await else {
        return;
    };

    match status {
        CallStatusKind::Active => {
            if let Some(room) = state.rooms.get(&room_id) {
                *room.status.write().await = RoomStatus::Active;
            }
            // 매칭 기록도 방 상태를 따라간다
            state.matching.mark_active(&room_id);
            tracing::info!(room_id = %room_id, "Call is now active");
        }
        CallStatusKind::Completed | CallStatusKind::Ended => {
            let end_reason = reason.clone().unwrap_or_else(|| "ended".to_string());
            if let Err(e) = state
                .matching
                .end_call(&room_id, &user_id, &end_reason, None)
                .await
            {
                tracing::warn!(room_id = %room_id, error = %e, "Call end via signaling failed");
            }
        }
        CallStatusKind::Failed => {
            let fail_reason = reason.clone().unwrap_or_else(|| "failed".to_string());
            state.matching.fail_call(&room_id, &fail_reason);
        }
    }

    broadcast_to_room_except(
        &state,
        &room_id,
        &user_id,
        ServerMessage::CallStatus {
            room_id: room_id.clone(),
            status,
            reason,
        },
    )
    .await;
}
