//! 클라이언트-서버 메시지 프로토콜 정의
//!
//! 봉투 형식은 `{type, data, timestamp}`. timestamp는 송신 직전에
//! [`to_envelope`]가 주입한다.

use super::unix_ms;
use serde::{Deserialize, Serialize};

/// 참여자 유형
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    HelpSeeker,
    Volunteer,
}

/// 통화 상태 (call_status 메시지)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatusKind {
    Active,
    Completed,
    Ended,
    Failed,
}

/// 클라이언트 → 서버 메시지
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    // Room Management
    JoinRoom {
        room_id: String,
        user_id: String,
        user_type: UserType,
    },
    LeaveRoom,

    // WebRTC Signaling (SDP/ICE는 검사 없이 그대로 중계)
    Offer {
        target_user_id: String,
        sdp: String,
    },
    Answer {
        target_user_id: String,
        sdp: String,
    },
    IceCandidate {
        target_user_id: String,
        candidate: String,
    },

    // Call lifecycle
    CallStatus {
        status: CallStatusKind,
        reason: Option<String>,
    },

    // Heartbeat
    Ping,
    Pong,
}

/// 서버 → 클라이언트 메시지
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    // Connection
    Connected {
        connection_id: String,
    },
    Error {
        code: String,
        message: String,
    },

    // Room Events
    RoomJoined {
        room_id: String,
        user_id: String,
        participants: Vec<ParticipantInfo>,
    },
    UserJoined {
        room_id: String,
        user_id: String,
        user_type: UserType,
    },
    UserLeft {
        room_id: String,
        user_id: String,
    },
    UserDisconnected {
        room_id: String,
        user_id: String,
    },
    CallStatus {
        room_id: String,
        status: CallStatusKind,
        reason: Option<String>,
    },

    // WebRTC Signaling
    Offer {
        from: String,
        sdp: String,
    },
    Answer {
        from: String,
        sdp: String,
    },
    IceCandidate {
        from: String,
        candidate: String,
    },

    // Heartbeat
    Ping,
    Pong,
}

/// 방 참여자 요약
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub user_type: UserType,
    pub joined_at_ms: u64,
    pub ready: bool,
}

/// 송신 봉투 생성 — 최상위에 timestamp 주입
pub fn to_envelope(msg: &ServerMessage) -> serde_json::Value {
    let mut value = serde_json::to_value(msg).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("timestamp".to_string(), serde_json::json!(unix_ms()));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_room_parses_with_envelope_timestamp() {
        let raw = r#"{
            "type": "join_room",
            "data": {"room_id": "r1", "user_id": "u1", "user_type": "volunteer"},
            "timestamp": 1700000000000
        }"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::JoinRoom {
                room_id,
                user_id,
                user_type,
            } => {
                assert_eq!(room_id, "r1");
                assert_eq!(user_id, "u1");
                assert_eq!(user_type, UserType::Volunteer);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn invalid_user_type_is_rejected() {
        let raw = r#"{"type": "join_room", "data": {"room_id": "r1", "user_id": "u1", "user_type": "admin"}}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn unit_variants_parse_without_data() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "pong"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Pong));
    }

    #[test]
    fn envelope_carries_type_data_timestamp() {
        let value = to_envelope(&ServerMessage::UserLeft {
            room_id: "r1".to_string(),
            user_id: "u1".to_string(),
        });
        assert_eq!(value["type"], "user_left");
        assert_eq!(value["data"]["user_id"], "u1");
        assert!(value["timestamp"].as_u64().is_some());
    }
}
