//! 방 관리 핸들러

use crate::protocol::{unix_ms, ParticipantInfo, ServerMessage, UserType};
use crate::state::{AppState, Participant, Room, RoomStatus};
use std::sync::Arc;
use std::time::Duration;

/// 방 이탈 종류 — 명시적 퇴장과 끊김은 통지와 통화 처리 경로가 다르다
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveKind {
    Left,
    Disconnected,
}

/// 방 참여 처리
pub async fn handle_join_room(
    state: Arc<AppState>,
    connection_id: &str,
    room_id: &str,
    user_id: &str,
    user_type: UserType,
) {
    let room_id = room_id.trim().to_string();
    let max_participants = state.config.room.max_participants;

    let (sender, prev_room, prev_user) = match state.connections.get(connection_id) {
        Some(session) => (
            session.sender.clone(),
            session.room_id.read().await.clone(),
            session.user_id.read().await.clone(),
        ),
        None => return,
    };

    // 다른 방에 남아 있었다면 먼저 나간다 (멱등 정리)
    if let (Some(prev_room_id), Some(prev_user_id)) = (prev_room, prev_user) {
        if prev_room_id != room_id {
            remove_participant(&state, &prev_room_id, &prev_user_id, LeaveKind::Left).await;
        }
    }

    // 방 획득/생성과 참여 로직은 스코프로 제한해 락을 빨리 놓는다
    let joined = {
        let room = state.rooms.entry(room_id.clone()).or_insert_with(|| {
            tracing::info!(room_id = %room_id, "Room created");
            Room::new(room_id.clone())
        });

        let mut participants = room.participants.write().await;
        // 이미 방에 있는 사용자의 재접속은 세 번째 참여자가 아니다
        if participants.len() >= max_participants && !participants.contains_key(user_id) {
            None
        } else {
            let others: Vec<String> = participants
                .values()
                .filter(|p| p.connection_id != connection_id)
                .map(|p| p.connection_id.clone())
                .collect();
            participants.insert(
                user_id.to_string(),
                Participant {
                    connection_id: connection_id.to_string(),
                    user_type,
                    joined_at_ms: unix_ms(),
                    ready: true,
                },
            );
            let infos: Vec<ParticipantInfo> = participants
                .iter()
                .map(|(uid, p)| p.info(uid))
                .collect();
            let count = participants.len();
            drop(participants);

            if count >= 2 {
                let mut status = room.status.write().await;
                if *status == RoomStatus::Waiting {
                    *status = RoomStatus::Ready;
                }
            }
            Some((others, infos, count))
        }
    };

    let Some((others, infos, count)) = joined else {
        let _ = sender.send(ServerMessage::Error {
            code: "ROOM_FULL".to_string(),
            message: format!("room {room_id} already has {max_participants} participants"),
        });
        tracing::warn!(room_id = %room_id, user_id = %user_id, "Room full, rejected join");
        return;
    };

    // 세션을 인증 상태로 전환
    if let Some(session) = state.connections.get(connection_id) {
        *session.user_id.write().await = Some(user_id.to_string());
        *session.user_type.write().await = Some(user_type);
        *session.room_id.write().await = Some(room_id.clone());
    }

    let _ = sender.send(ServerMessage::RoomJoined {
        room_id: room_id.clone(),
        user_id: user_id.to_string(),
        participants: infos,
    });

    for other_connection_id in &others {
        if let Some(session) = state.connections.get(other_connection_id) {
            let _ = session.sender.send(ServerMessage::UserJoined {
                room_id: room_id.clone(),
                user_id: user_id.to_string(),
                user_type,
            });
        }
    }

    tracing::info!(
        connection_id = %connection_id,
        room_id = %room_id,
        user_id = %user_id,
        participant_count = count,
        "User joined room"
    );
}

/// 방 나가기 처리
pub async fn handle_leave_room(state: Arc<AppState>, connection_id: &str) {
    let (room_id, user_id) = match state.connections.get(connection_id) {
        Some(session) => (
            session.room_id.read().await.clone(),
            session.user_id.read().await.clone(),
        ),
        None => return,
    };

    if let (Some(room_id), Some(user_id)) = (room_id, user_id) {
        remove_participant(&state, &room_id, &user_id, LeaveKind::Left).await;
        if let Some(session) = state.connections.get(connection_id) {
            *session.room_id.write().await = None;
        }
    }
}

/// 참여자 제거의 공통 경로 (명시적 퇴장, 끊김, 방 이동).
/// 0명이 되면 같은 단계에서 방을 삭제하고, 활성 통화 중 끊김이면
/// 통화를 "peer disconnected"로 실패 처리한다.
pub async fn remove_participant(
    state: &Arc<AppState>,
    room_id: &str,
    user_id: &str,
    kind: LeaveKind,
) {
    // 남은 참여자들의 송신 핸들은 가드 안에서 모으고, 전송은 가드를
    // 놓은 뒤에 한다. 가드를 쥔 채 같은 샤드를 다시 읽으면 정리 스윕의
    // 쓰기 대기와 맞물려 교착할 수 있다.
    let mut peers = Vec::new();
    let mut was_active = false;
    let should_delete = if let Some(room) = state.rooms.get(room_id) {
        let mut participants = room.participants.write().await;
        if participants.remove(user_id).is_none() {
            return;
        }
        was_active = *room.status.read().await == RoomStatus::Active;
        for participant in participants.values() {
            if let Some(session) = state.connections.get(&participant.connection_id) {
                peers.push(session.sender.clone());
            }
        }
        let remaining = participants.len();
        drop(participants);

        if remaining > 0 {
            *room.status.write().await = RoomStatus::Waiting;
        }

        tracing::info!(
            room_id = %room_id,
            user_id = %user_id,
            kind = ?kind,
            remaining,
            "User left room"
        );
        remaining == 0
    } else {
        return;
    };

    let message = match kind {
        LeaveKind::Left => ServerMessage::UserLeft {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        },
        LeaveKind::Disconnected => ServerMessage::UserDisconnected {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        },
    };
    for sender in peers {
        let _ = sender.send(message.clone());
    }

    if should_delete {
        state.rooms.remove(room_id);
        tracing::info!(room_id = %room_id, "Room deleted");
    }

    if kind == LeaveKind::Disconnected && was_active {
        if state.matching.fail_call(room_id, "peer disconnected") {
            tracing::info!(room_id = %room_id, "Active call failed after disconnect");
        }
    }
}

/// 특정 사용자를 제외한 브로드캐스트
pub async fn broadcast_to_room_except(
    state: &Arc<AppState>,
    room_id: &str,
    except_user_id: &str,
    message: ServerMessage,
) {
    if let Some(room) = state.rooms.get(room_id) {
        let participants = room.participants.read().await;
        for (user_id, participant) in participants.iter() {
            if user_id != except_user_id {
                if let Some(session) = state.connections.get(&participant.connection_id) {
                    let _ = session.sender.send(message.clone());
                }
            }
        }
    }
}

/// 오래된 방 정리
pub async fn cleanup_old_rooms(state: Arc<AppState>) {
    let max_age = Duration::from_secs(state.config.room.max_age_secs);
    let mut deleted = 0;

    state.rooms.retain(|room_id, room| {
        if room.created_at.elapsed() > max_age {
            tracing::info!(room_id = %room_id, "Cleaned up old room");
            deleted += 1;
            false
        } else {
            true
        }
    });

    if deleted > 0 {
        tracing::info!(deleted_rooms = deleted, "Room cleanup completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::rewards::InMemoryLedger;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(
            Config::from_env(),
            Arc::new(InMemoryLedger::new()),
        ))
    }

    async fn connect(state: &Arc<AppState>) -> (String, UnboundedReceiver<ServerMessage>) {
        let (tx, mut rx) = unbounded_channel();
        let (connection_id, _cancel) =
            crate::handlers::connection::handle_connection(state.clone(), tx).await;
        let _ = rx.recv().await; // Connected
        (connection_id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }

    #[tokio::test]
    async fn two_joins_reach_ready_and_notify() {
        let state = test_state();
        let (conn_a, mut rx_a) = connect(&state).await;
        let (conn_b, mut rx_b) = connect(&state).await;

        handle_join_room(state.clone(), &conn_a, "r1", "seeker", UserType::HelpSeeker).await;
        assert!(matches!(
            rx_a.recv().await,
            Some(ServerMessage::RoomJoined { ref participants, .. }) if participants.len() == 1
        ));

        handle_join_room(state.clone(), &conn_b, "r1", "vol", UserType::Volunteer).await;
        assert!(matches!(
            rx_b.recv().await,
            Some(ServerMessage::RoomJoined { ref participants, .. }) if participants.len() == 2
        ));
        assert!(matches!(
            rx_a.recv().await,
            Some(ServerMessage::UserJoined { ref user_id, .. }) if user_id == "vol"
        ));

        let room = state.rooms.get("r1").unwrap();
        assert_eq!(*room.status.read().await, RoomStatus::Ready);
        assert_eq!(room.participants.read().await.len(), 2);
    }

    #[tokio::test]
    async fn third_join_is_rejected_with_room_full() {
        let state = test_state();
        let (conn_a, _rx_a) = connect(&state).await;
        let (conn_b, _rx_b) = connect(&state).await;
        let (conn_c, mut rx_c) = connect(&state).await;

        handle_join_room(state.clone(), &conn_a, "r1", "seeker", UserType::HelpSeeker).await;
        handle_join_room(state.clone(), &conn_b, "r1", "vol", UserType::Volunteer).await;
        handle_join_room(state.clone(), &conn_c, "r1", "intruder", UserType::Volunteer).await;

        assert!(matches!(
            rx_c.recv().await,
            Some(ServerMessage::Error { ref code, .. }) if code == "ROOM_FULL"
        ));
        // 참여자 수는 2를 넘지 않는다
        let room = state.rooms.get("r1").unwrap();
        assert_eq!(room.participants.read().await.len(), 2);
    }

    #[tokio::test]
    async fn rejoin_by_existing_participant_is_not_a_third_join() {
        let state = test_state();
        let (conn_a, _rx_a) = connect(&state).await;
        let (conn_b, _rx_b) = connect(&state).await;
        let (conn_b2, mut rx_b2) = connect(&state).await;

        handle_join_room(state.clone(), &conn_a, "r1", "seeker", UserType::HelpSeeker).await;
        handle_join_room(state.clone(), &conn_b, "r1", "vol", UserType::Volunteer).await;
        // 같은 user_id의 재접속 — 새 연결로 참여자 핸들이 교체된다
        handle_join_room(state.clone(), &conn_b2, "r1", "vol", UserType::Volunteer).await;

        assert!(matches!(rx_b2.recv().await, Some(ServerMessage::RoomJoined { .. })));
        let room = state.rooms.get("r1").unwrap();
        let participants = room.participants.read().await;
        assert_eq!(participants.len(), 2);
        assert_eq!(participants.get("vol").unwrap().connection_id, conn_b2);
    }

    #[tokio::test]
    async fn leave_reverts_to_waiting_and_empty_room_is_deleted() {
        let state = test_state();
        let (conn_a, mut rx_a) = connect(&state).await;
        let (conn_b, _rx_b) = connect(&state).await;

        handle_join_room(state.clone(), &conn_a, "r1", "seeker", UserType::HelpSeeker).await;
        handle_join_room(state.clone(), &conn_b, "r1", "vol", UserType::Volunteer).await;
        drain(&mut rx_a);

        handle_leave_room(state.clone(), &conn_b).await;
        assert!(matches!(
            rx_a.recv().await,
            Some(ServerMessage::UserLeft { ref user_id, .. }) if user_id == "vol"
        ));
        assert_eq!(
            *state.rooms.get("r1").unwrap().status.read().await,
            RoomStatus::Waiting
        );

        handle_leave_room(state.clone(), &conn_a).await;
        assert!(!state.rooms.contains_key("r1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn disconnect_races_room_sweep_without_stalling() {
        let mut config = Config::from_env();
        config.room.max_age_secs = 0;
        let state = Arc::new(AppState::new(config, Arc::new(InMemoryLedger::new())));

        for i in 0..20 {
            let room_id = format!("race-{i}");
            let (conn_a, _rx_a) = connect(&state).await;
            let (conn_b, _rx_b) = connect(&state).await;
            handle_join_room(state.clone(), &conn_a, &room_id, "seeker", UserType::HelpSeeker)
                .await;
            handle_join_room(state.clone(), &conn_b, &room_id, "vol", UserType::Volunteer).await;

            let disconnect = {
                let state = state.clone();
                tokio::spawn(async move {
                    crate::handlers::connection::handle_disconnect(state, &conn_b).await;
                })
            };
            let sweep = tokio::spawn(cleanup_old_rooms(state.clone()));

            tokio::time::timeout(std::time::Duration::from_secs(5), async {
                disconnect.await.unwrap();
                sweep.await.unwrap();
            })
            .await
            .expect("disconnect and room sweep must not block each other");
        }
    }

    #[tokio::test]
    async fn switching_rooms_leaves_previous_room_first() {
        let state = test_state();
        let (conn_a, _rx_a) = connect(&state).await;
        let (conn_b, mut rx_b) = connect(&state).await;

        handle_join_room(state.clone(), &conn_a, "r1", "seeker", UserType::HelpSeeker).await;
        handle_join_room(state.clone(), &conn_b, "r1", "vol", UserType::Volunteer).await;
        drain(&mut rx_b);

        handle_join_room(state.clone(), &conn_a, "r2", "seeker", UserType::HelpSeeker).await;

        // r1에는 vol만 남고 user_left가 통지된다
        assert!(matches!(
            rx_b.recv().await,
            Some(ServerMessage::UserLeft { ref user_id, .. }) if user_id == "seeker"
        ));
        assert_eq!(state.rooms.get("r1").unwrap().participants.read().await.len(), 1);
        assert_eq!(state.rooms.get("r2").unwrap().participants.read().await.len(), 1);
    }
}
