//! 신원 게이트웨이 및 사용자 디렉터리
//!
//! 인증/프로필 저장은 외부 시스템 소관이다. 이 모듈은 그 시스템이
//! 푸시해 주는 사용자 레코드의 인메모리 사본과, 베어러 토큰을 사용자로
//! 변환하는 좁은 게이트웨이만 유지한다. 봉사자 가용성 플래그의 단일
//! 출처(single source of truth)이기도 하다.

use crate::error::AppError;
use crate::protocol::unix_ms;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// 사용자 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    HelpSeeker,
    Volunteer,
}

fn default_true() -> bool {
    true
}

fn default_now_ms() -> u64 {
    unix_ms()
}

/// 사용자 레코드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub role: UserRole,
    #[serde(default = "default_true")]
    pub online: bool,
    #[serde(default)]
    pub reputation: f64,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default = "default_now_ms")]
    pub last_active_ms: u64,
    #[serde(default)]
    pub calls_today: u32,
    #[serde(default)]
    pub total_calls: u64,
    #[serde(default)]
    pub avg_response_secs: Option<f64>,
    #[serde(skip)]
    pub response_samples: u32,
}

/// 봉사자 요약 (매칭 결과에 포함)
#[derive(Debug, Clone, Serialize)]
pub struct VolunteerSummary {
    pub user_id: String,
    pub name: String,
    pub reputation: f64,
    pub score: f64,
}

/// 인메모리 사용자 디렉터리
pub struct UserDirectory {
    users: DashMap<String, User>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
        }
    }

    pub fn upsert(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn get(&self, user_id: &str) -> Option<User> {
        self.users.get(user_id).map(|u| u.clone())
    }

    pub fn wallet_address(&self, user_id: &str) -> Option<String> {
        self.users.get(user_id).and_then(|u| u.wallet_address.clone())
    }

    /// 현재 매칭 가능한 봉사자 목록 (평판 내림차순)
    pub fn active_volunteers(&self) -> Vec<User> {
        let mut volunteers: Vec<User> = self
            .users
            .iter()
            .filter(|u| u.role == UserRole::Volunteer && u.online && u.available)
            .map(|u| u.clone())
            .collect();
        volunteers.sort_by(|a, b| {
            b.reputation
                .partial_cmp(&a.reputation)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        volunteers
    }

    /// 봉사자 선점 (compare-and-set). 매칭 엔진만 호출한다.
    pub fn try_claim(&self, volunteer_id: &str) -> bool {
        match self.users.get_mut(volunteer_id) {
            Some(mut u) if u.role == UserRole::Volunteer && u.available => {
                u.available = false;
                true
            }
            _ => false,
        }
    }

    /// 봉사자 가용 상태 복원
    pub fn release(&self, volunteer_id: &str) {
        if let Some(mut u) = self.users.get_mut(volunteer_id) {
            u.available = true;
            u.last_active_ms = unix_ms();
        }
    }

    pub fn set_online(&self, user_id: &str, online: bool) {
        if let Some(mut u) = self.users.get_mut(user_id) {
            u.online = online;
        }
    }

    /// 매칭 수락 응답 시간 반영 (이동 평균)
    pub fn record_response(&self, volunteer_id: &str, secs: f64) {
        if let Some(mut u) = self.users.get_mut(volunteer_id) {
            let n = u.response_samples as f64;
            u.avg_response_secs = Some(match u.avg_response_secs {
                Some(avg) => (avg * n + secs) / (n + 1.0),
                None => secs,
            });
            u.response_samples += 1;
        }
    }

    /// 통화 완료 반영, 누적 통화 수 반환 (마일스톤 판정용)
    pub fn record_completed_call(&self, volunteer_id: &str) -> u64 {
        match self.users.get_mut(volunteer_id) {
            Some(mut u) => {
                u.total_calls += 1;
                u.calls_today += 1;
                u.total_calls
            }
            None => 0,
        }
    }
}

impl Default for UserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// 호출자 신원 검증 — 외부 인증 시스템의 불투명한 능력으로 취급
pub trait IdentityGateway: Send + Sync {
    fn verify(&self, token: &str) -> Result<User, AppError>;
}

/// 토큰 → 사용자 매핑 기반 게이트웨이.
/// 신뢰된 신원 서비스가 디렉터리 동기화 시 세션 토큰을 함께 등록한다.
pub struct TokenGateway {
    tokens: DashMap<String, String>,
    directory: std::sync::Arc<UserDirectory>,
}

impl TokenGateway {
    pub fn new(directory: std::sync::Arc<UserDirectory>) -> Self {
        Self {
            tokens: DashMap::new(),
            directory,
        }
    }

    pub fn register_token(&self, token: &str, user_id: &str) {
        self.tokens.insert(token.to_string(), user_id.to_string());
    }
}

impl IdentityGateway for TokenGateway {
    fn verify(&self, token: &str) -> Result<User, AppError> {
        let user_id = self
            .tokens
            .get(token)
            .map(|id| id.clone())
            .ok_or(AppError::Unauthenticated)?;
        self.directory.get(&user_id).ok_or(AppError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn volunteer(id: &str, reputation: f64) -> User {
        User {
            id: id.to_string(),
            name: id.to_string(),
            role: UserRole::Volunteer,
            online: true,
            reputation,
            wallet_address: None,
            skills: vec![],
            available: true,
            last_active_ms: unix_ms(),
            calls_today: 0,
            total_calls: 0,
            avg_response_secs: None,
            response_samples: 0,
        }
    }

    #[test]
    fn active_volunteers_sorted_by_reputation_desc() {
        let dir = UserDirectory::new();
        dir.upsert(volunteer("a", 10.0));
        dir.upsert(volunteer("b", 90.0));
        dir.upsert(volunteer("c", 50.0));

        let active = dir.active_volunteers();
        let ids: Vec<&str> = active.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn claim_is_exclusive_until_release() {
        let dir = UserDirectory::new();
        dir.upsert(volunteer("v1", 50.0));

        assert!(dir.try_claim("v1"));
        assert!(!dir.try_claim("v1"));
        assert!(dir.active_volunteers().is_empty());

        dir.release("v1");
        assert!(dir.try_claim("v1"));
    }

    #[test]
    fn response_average_accumulates() {
        let dir = UserDirectory::new();
        dir.upsert(volunteer("v1", 50.0));

        dir.record_response("v1", 10.0);
        dir.record_response("v1", 30.0);

        let avg = dir.get("v1").unwrap().avg_response_secs.unwrap();
        assert!((avg - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn completed_call_counter_is_lifetime_total() {
        let dir = UserDirectory::new();
        dir.upsert(volunteer("v1", 50.0));

        assert_eq!(dir.record_completed_call("v1"), 1);
        assert_eq!(dir.record_completed_call("v1"), 2);
        assert_eq!(dir.get("v1").unwrap().calls_today, 2);
    }

    #[test]
    fn gateway_rejects_unknown_token() {
        let dir = Arc::new(UserDirectory::new());
        dir.upsert(volunteer("v1", 50.0));
        let gateway = TokenGateway::new(dir);
        gateway.register_token("tok-v1", "v1");

        assert!(gateway.verify("tok-v1").is_ok());
        assert!(matches!(
            gateway.verify("bogus"),
            Err(AppError::Unauthenticated)
        ));
    }
}
