//! 연결 핸들러

use crate::handlers::room::{remove_participant, LeaveKind};
use crate::protocol::ServerMessage;
use crate::state::{AppState, ConnectionSession};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc::UnboundedSender, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 새 연결 처리. 하트비트 타임아웃 시 강제 종료할 수 있도록
/// 세션별 CancellationToken을 함께 돌려준다.
pub async fn handle_connection(
    state: Arc<AppState>,
    sender: UnboundedSender<ServerMessage>,
) -> (String, CancellationToken) {
    let connection_id = Uuid::new_v4().to_string();
    let cancel = CancellationToken::new();

    let session = ConnectionSession {
        id: connection_id.clone(),
        user_id: RwLock::new(None),
        user_type: RwLock::new(None),
        room_id: RwLock::new(None),
        sender: sender.clone(),
        last_pong: RwLock::new(Instant::now()),
        cancel: cancel.clone(),
        connected_at: Instant::now(),
    };
    state.connections.insert(connection_id.clone(), session);

    let _ = sender.send(ServerMessage::Connected {
        connection_id: connection_id.clone(),
    });

    tracing::info!(connection_id = %connection_id, "New connection established");
    (connection_id, cancel)
}

/// 연결 해제 처리. 방에 있었다면 leave_room과 동일하게 정리하고,
/// 활성 통화였다면 통화를 실패로 종결한다.
pub async fn handle_disconnect(state: Arc<AppState>, connection_id: &str) {
    if let Some((_, session)) = state.connections.remove(connection_id) {
        let room_id = session.room_id.read().await.clone();
        let user_id = session.user_id.read().await.clone();
        if let (Some(room_id), Some(user_id)) = (room_id, user_id) {
            remove_participant(&state, &room_id, &user_id, LeaveKind::Disconnected).await;
        }
    }
    tracing::info!(connection_id = %connection_id, "Connection closed");
}

/// 클라이언트 ping에 pong 응답
pub fn handle_ping(sender: &UnboundedSender<ServerMessage>) {
    let _ = sender.send(ServerMessage::Pong);
}

/// 클라이언트 pong 수신 — liveness 갱신
pub async fn handle_pong(state: &Arc<AppState>, connection_id: &str) {
    if let Some(session) = state.connections.get(connection_id) {
        *session.last_pong.write().await = Instant::now();
    }
}

/// 하트비트 스윕. 지난 주기에 pong이 없었던 연결은 강제 종료하고,
/// 나머지에는 ping을 보낸다.
pub async fn heartbeat_sweep(state: Arc<AppState>) {
    let interval_secs = state.config.room.heartbeat_interval_secs;

    for session in state.connections.iter() {
        let elapsed = session.last_pong.read().await.elapsed().as_secs();
        if elapsed > interval_secs {
            tracing::warn!(
                connection_id = %session.id,
                silent_secs = elapsed,
                "Heartbeat missed, terminating connection"
            );
            session.cancel.cancel();
        } else {
            let _ = session.sender.send(ServerMessage::Ping);
        }
    }
}
