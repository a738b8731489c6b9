//! 애플리케이션 상태 관리

use crate::config::Config;
use crate::identity::{TokenGateway, UserDirectory};
use crate::matching::MatchingEngine;
use crate::protocol::{ParticipantInfo, ServerMessage, UserType};
use crate::rewards::{LedgerClient, RewardQueue};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc::UnboundedSender, RwLock};
use tokio_util::sync::CancellationToken;

/// 전역 애플리케이션 상태
pub struct AppState {
    /// 방 정보 (room_id -> Room)
    pub rooms: DashMap<String, Room>,
    /// 접속 세션 (connection_id -> ConnectionSession)
    pub connections: DashMap<String, ConnectionSession>,
    /// 사용자 디렉터리 (신원 시스템의 인메모리 사본)
    pub directory: Arc<UserDirectory>,
    /// 신원 게이트웨이
    pub gateway: Arc<TokenGateway>,
    /// 매칭 엔진
    pub matching: Arc<MatchingEngine>,
    /// 보상 큐
    pub rewards: Arc<RewardQueue>,
    /// 설정
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, ledger: Arc<dyn LedgerClient>) -> Self {
        let config = Arc::new(config);
        let directory = Arc::new(UserDirectory::new());
        let gateway = Arc::new(TokenGateway::new(directory.clone()));
        let rewards = Arc::new(RewardQueue::new(
            config.clone(),
            ledger,
            directory.clone(),
        ));
        let matching = Arc::new(MatchingEngine::new(
            config.clone(),
            directory.clone(),
            rewards.clone(),
        ));
        Self {
            rooms: DashMap::new(),
            connections: DashMap::new(),
            directory,
            gateway,
            matching,
            rewards,
            config,
        }
    }
}

/// 방 상태 머신: waiting(0~1명) → ready(2명) → active(call_status)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Waiting,
    Ready,
    Active,
}

/// 방 참여자
#[derive(Debug, Clone)]
pub struct Participant {
    pub connection_id: String,
    pub user_type: UserType,
    pub joined_at_ms: u64,
    pub ready: bool,
}

impl Participant {
    pub fn info(&self, user_id: &str) -> ParticipantInfo {
        ParticipantInfo {
            user_id: user_id.to_string(),
            user_type: self.user_type,
            joined_at_ms: self.joined_at_ms,
            ready: self.ready,
        }
    }
}

/// 방 정보 — 통화 하나당 하나, 참여자 0명이 되면 즉시 제거
pub struct Room {
    pub id: String,
    pub participants: RwLock<HashMap<String, Participant>>,
    pub status: RwLock<RoomStatus>,
    pub created_at: Instant,
}

impl Room {
    pub fn new(id: String) -> Self {
        Self {
            id,
            participants: RwLock::new(HashMap::new()),
            status: RwLock::new(RoomStatus::Waiting),
            created_at: Instant::now(),
        }
    }
}

/// 접속 세션 정보. user_id는 join_room 이후에만 설정된다.
pub struct ConnectionSession {
    pub id: String,
    pub user_id: RwLock<Option<String>>,
    pub user_type: RwLock<Option<UserType>>,
    pub room_id: RwLock<Option<String>>,
    pub sender: UnboundedSender<ServerMessage>,
    pub last_pong: RwLock<Instant>,
    /// 하트비트 타임아웃 시 강제 종료용
    pub cancel: CancellationToken,
    pub connected_at: Instant,
}
