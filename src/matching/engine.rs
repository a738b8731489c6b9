//! 매칭 엔진
//!
//! 대기열과 통화 기록을 소유하고, 점수 기반 봉사자 선발과 통화 수명주기
//! (pending → active → completed|failed)를 관리한다. 통화 완료 시 보상
//! 큐에 이벤트를 넘긴다.

use crate::config::Config;
use crate::error::{AppError, MatchingError};
use crate::identity::{UserDirectory, VolunteerSummary};
use crate::matching::scoring::rank_candidates;
use crate::protocol::unix_ms;
use crate::rewards::{call_reward, milestone_reward, RewardKind, RewardQueue};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// 대기 항목 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitingStatus {
    Waiting,
    Rematching,
}

/// 매칭을 기다리는 도움 요청자
#[derive(Debug, Clone)]
pub struct WaitingEntry {
    pub user_id: String,
    pub category: String,
    pub priority: u8,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub status: WaitingStatus,
}

/// 통화 상태 — 단조 전이만 허용
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl CallStatus {
    fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Completed | CallStatus::Failed)
    }
}

/// 도움 세션 기록 (room_id로 키잉)
#[derive(Debug, Clone)]
pub struct Call {
    pub id: String,
    pub help_seeker_id: String,
    pub volunteer_id: Option<String>,
    pub category: String,
    pub priority: u8,
    pub status: CallStatus,
    pub room_id: String,
    pub started_at: Instant,
    pub started_at_ms: u64,
    pub accepted_at: Option<Instant>,
    pub ended_at_ms: Option<u64>,
    pub duration_secs: Option<u64>,
    pub rating: Option<u8>,
    pub end_reason: Option<String>,
    pub reward_tx_id: Option<String>,
}

impl Call {
    /// 단조 전이 가드. 종결 상태에서의 모든 전이는 거부된다.
    fn transition(&mut self, next: CallStatus) -> bool {
        let allowed = match (self.status, next) {
            (CallStatus::Pending, CallStatus::Active)
            | (CallStatus::Pending, CallStatus::Completed)
            | (CallStatus::Pending, CallStatus::Failed)
            | (CallStatus::Active, CallStatus::Completed)
            | (CallStatus::Active, CallStatus::Failed) => true,
            _ => false,
        };
        if allowed {
            self.status = next;
        }
        allowed
    }
}

/// 매칭 성공 결과
#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub call_id: String,
    pub room_id: String,
    pub volunteer: VolunteerSummary,
}

/// 대기열 스냅샷 항목
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntrySnapshot {
    pub user_id: String,
    pub category: String,
    pub waiting_time_ms: u64,
    pub status: WaitingStatus,
}

/// 대기열 스냅샷
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub total_waiting: usize,
    pub entries: Vec<QueueEntrySnapshot>,
}

pub struct MatchingEngine {
    config: Arc<Config>,
    directory: Arc<UserDirectory>,
    rewards: Arc<RewardQueue>,
    /// 대기열 (help_seeker_id -> WaitingEntry)
    waiting: DashMap<String, WaitingEntry>,
    /// 통화 기록 (room_id -> Call)
    calls: DashMap<String, Call>,
}

impl MatchingEngine {
    pub fn new(
        config: Arc<Config>,
        directory: Arc<UserDirectory>,
        rewards: Arc<RewardQueue>,
    ) -> Self {
        Self {
            config,
            directory,
            rewards,
            waiting: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    /// 매칭 시작. 즉시 시도 후 2초 간격으로 재시도하며, 항목의 마감이
    /// 지나면 중단한다. 후보가 아예 없으면 재시도 없이 즉시 실패.
    pub async fn start_matching(
        &self,
        help_seeker_id: &str,
        category: &str,
        priority: u8,
        timeout_ms: u64,
    ) -> Result<MatchOutcome, AppError> {
        self.enqueue_and_match(
            help_seeker_id,
            category,
            priority,
            timeout_ms,
            WaitingStatus::Waiting,
        )
        .await
    }

    async fn enqueue_and_match(
        &self,
        help_seeker_id: &str,
        category: &str,
        priority: u8,
        timeout_ms: u64,
        status: WaitingStatus,
    ) -> Result<MatchOutcome, AppError> {
        if !(1..=10).contains(&priority) {
            return Err(AppError::Validation(
                "priority must be between 1 and 10".to_string(),
            ));
        }
        if category.trim().is_empty() {
            return Err(AppError::Validation("category must not be empty".to_string()));
        }

        let now = Instant::now();
        let deadline = now + Duration::from_millis(timeout_ms);
        match self.waiting.entry(help_seeker_id.to_string()) {
            Entry::Occupied(_) => return Err(MatchingError::AlreadyQueued.into()),
            Entry::Vacant(slot) => {
                slot.insert(WaitingEntry {
                    user_id: help_seeker_id.to_string(),
                    category: category.to_string(),
                    priority,
                    enqueued_at: now,
                    deadline,
                    status,
                });
            }
        }
        tracing::info!(
            help_seeker = %help_seeker_id,
            category = %category,
            priority,
            status = ?status,
            "Help seeker queued"
        );

        let max_attempts = self.config.matching.max_attempts;
        let retry_delay = Duration::from_millis(self.config.matching.retry_delay_ms);

        for attempt in 1..=max_attempts {
            // 취소 또는 타임아웃 스윕이 항목을 먼저 제거했을 수 있다
            if !self.waiting.contains_key(help_seeker_id) {
                return Err(MatchingError::Timeout.into());
            }
            if Instant::now() >= deadline {
                self.waiting.remove(help_seeker_id);
                tracing::info!(help_seeker = %help_seeker_id, "Matching deadline passed");
                return Err(MatchingError::Timeout.into());
            }

            // 가용 플래그는 시도마다 새로 읽는다
            let candidates = self.directory.active_volunteers();
            if candidates.is_empty() {
                self.waiting.remove(help_seeker_id);
                return Err(MatchingError::NoVolunteersAvailable.into());
            }

            let ranked = rank_candidates(&candidates, category, &self.config.scoring);
            for (volunteer, score) in &ranked {
                if !self.directory.try_claim(&volunteer.id) {
                    // 다른 매칭이 먼저 선점 — 다음 후보로
                    continue;
                }
                if self.waiting.remove(help_seeker_id).is_none() {
                    self.directory.release(&volunteer.id);
                    return Err(MatchingError::Timeout.into());
                }
                let outcome = self.create_call(help_seeker_id, category, priority, volunteer.id.clone(), volunteer.name.clone(), volunteer.reputation, *score);
                tracing::info!(
                    help_seeker = %help_seeker_id,
                    volunteer = %outcome.volunteer.user_id,
                    room_id = %outcome.room_id,
                    score = outcome.volunteer.score,
                    attempt,
                    "Match created"
                );
                return Ok(outcome);
            }

            if attempt < max_attempts {
                tokio::time::sleep(retry_delay).await;
            }
        }

        self.waiting.remove(help_seeker_id);
        tracing::info!(help_seeker = %help_seeker_id, "No suitable volunteer after retries");
        Err(MatchingError::NoVolunteersAvailable.into())
    }

    fn create_call(
        &self,
        help_seeker_id: &str,
        category: &str,
        priority: u8,
        volunteer_id: String,
        volunteer_name: String,
        reputation: f64,
        score: f64,
    ) -> MatchOutcome {
        let call_id = Uuid::new_v4().to_string();
        let room_id = Uuid::new_v4().to_string();
        let call = Call {
            id: call_id.clone(),
            help_seeker_id: help_seeker_id.to_string(),
            volunteer_id: Some(volunteer_id.clone()),
            category: category.to_string(),
            priority,
            status: CallStatus::Pending,
            room_id: room_id.clone(),
            started_at: Instant::now(),
            started_at_ms: unix_ms(),
            accepted_at: None,
            ended_at_ms: None,
            duration_secs: None,
            rating: None,
            end_reason: None,
            reward_tx_id: None,
        };
        self.calls.insert(room_id.clone(), call);
        MatchOutcome {
            call_id,
            room_id,
            volunteer: VolunteerSummary {
                user_id: volunteer_id,
                name: volunteer_name,
                reputation,
                score,
            },
        }
    }

    /// 대기열에서 제거
    pub fn cancel_matching(&self, help_seeker_id: &str) -> Result<(), AppError> {
        match self.waiting.remove(help_seeker_id) {
            Some(_) => {
                tracing::info!(help_seeker = %help_seeker_id, "Matching cancelled");
                Ok(())
            }
            None => Err(MatchingError::NotQueued.into()),
        }
    }

    /// 배정된 봉사자의 수락 — pending → active
    pub fn accept_match(&self, room_id: &str, volunteer_id: &str) -> Result<(), AppError> {
        let response_secs = {
            let mut call = self
                .calls
                .get_mut(room_id)
                .ok_or(MatchingError::MatchNotFound)?;
            if call.volunteer_id.as_deref() != Some(volunteer_id) {
                return Err(AppError::NotAuthorized(
                    "volunteer is not assigned to this call".to_string(),
                ));
            }
            match call.status {
                CallStatus::Active => return Err(MatchingError::AlreadyAccepted.into()),
                CallStatus::Completed | CallStatus::Failed => {
                    return Err(MatchingError::MatchClosed.into())
                }
                CallStatus::Pending => {}
            }
            call.transition(CallStatus::Active);
            let accepted = Instant::now();
            call.accepted_at = Some(accepted);
            accepted.duration_since(call.started_at).as_secs_f64()
        };

        self.directory.record_response(volunteer_id, response_secs);
        tracing::info!(room_id = %room_id, volunteer = %volunteer_id, response_secs, "Match accepted");
        Ok(())
    }

    /// 배정된 봉사자의 거절 — 통화 실패 처리 후 도움 요청자를
    /// fire-and-forget으로 재매칭한다. 재매칭 실패는 로그로만 남는다.
    pub async fn decline_match(
        self: &Arc<Self>,
        room_id: &str,
        volunteer_id: &str,
        reason: &str,
    ) -> Result<(), AppError> {
        let (help_seeker, category, priority) = {
            let mut call = self
                .calls
                .get_mut(room_id)
                .ok_or(MatchingError::MatchNotFound)?;
            if call.volunteer_id.as_deref() != Some(volunteer_id) {
                return Err(AppError::NotAuthorized(
                    "volunteer is not assigned to this call".to_string(),
                ));
            }
            match call.status {
                CallStatus::Active => return Err(MatchingError::AlreadyAccepted.into()),
                CallStatus::Completed | CallStatus::Failed => {
                    return Err(MatchingError::MatchClosed.into())
                }
                CallStatus::Pending => {}
            }
            call.transition(CallStatus::Failed);
            call.end_reason = Some(format!("declined: {reason}"));
            call.ended_at_ms = Some(unix_ms());
            (
                call.help_seeker_id.clone(),
                call.category.clone(),
                call.priority,
            )
        };

        self.directory.release(volunteer_id);
        tracing::info!(
            room_id = %room_id,
            volunteer = %volunteer_id,
            reason = %reason,
            "Match declined, rematching help seeker"
        );

        let engine = Arc::clone(self);
        let rematch_timeout = self.config.matching.rematch_timeout_ms;
        tokio::spawn(async move {
            match engine
                .enqueue_and_match(
                    &help_seeker,
                    &category,
                    priority,
                    rematch_timeout,
                    WaitingStatus::Rematching,
                )
                .await
            {
                Ok(outcome) => tracing::info!(
                    help_seeker = %help_seeker,
                    volunteer = %outcome.volunteer.user_id,
                    room_id = %outcome.room_id,
                    "Rematch succeeded"
                ),
                Err(e) => tracing::warn!(
                    help_seeker = %help_seeker,
                    error = %e,
                    "Rematch failed"
                ),
            }
        });
        Ok(())
    }

    /// 통화 종료 — completed 처리, 봉사자 해제, 보상 이벤트 발행.
    /// 반환값은 매칭 시점 기준 통화 시간 (초).
    pub async fn end_call(
        &self,
        room_id: &str,
        ended_by: &str,
        reason: &str,
        rating: Option<u8>,
    ) -> Result<u64, AppError> {
        if let Some(r) = rating {
            if !(1..=5).contains(&r) {
                return Err(AppError::Validation(
                    "rating must be between 1 and 5".to_string(),
                ));
            }
        }

        let (call_id, volunteer_id, duration_secs, response_secs, final_rating) = {
            let mut call = self
                .calls
                .get_mut(room_id)
                .ok_or(MatchingError::MatchNotFound)?;
            if call.status.is_terminal() {
                return Err(MatchingError::MatchClosed.into());
            }
            // 통화 당사자만 종료할 수 있다
            if ended_by != call.help_seeker_id && call.volunteer_id.as_deref() != Some(ended_by) {
                return Err(AppError::NotAuthorized(
                    "caller is not part of this call".to_string(),
                ));
            }
            // 별점은 도움 요청자만 남길 수 있다
            if rating.is_some() && ended_by == call.help_seeker_id {
                call.rating = rating;
            }
            let duration_secs = call.started_at.elapsed().as_secs();
            call.transition(CallStatus::Completed);
            call.duration_secs = Some(duration_secs);
            call.ended_at_ms = Some(unix_ms());
            call.end_reason = Some(reason.to_string());
            let response_secs = call
                .accepted_at
                .map(|accepted| accepted.duration_since(call.started_at).as_secs());
            (
                call.id.clone(),
                call.volunteer_id.clone(),
                duration_secs,
                response_secs,
                call.rating,
            )
        };

        tracing::info!(
            room_id = %room_id,
            ended_by = %ended_by,
            reason = %reason,
            duration_secs,
            "Call completed"
        );

        if let Some(volunteer_id) = volunteer_id {
            self.directory.release(&volunteer_id);
            self.settle_rewards(
                room_id,
                &call_id,
                &volunteer_id,
                duration_secs,
                final_rating,
                response_secs,
            )
            .await;
        }
        Ok(duration_secs)
    }

    /// 완료 보상 + 마일스톤 보상 발행. 실패는 로그로만 남긴다.
    async fn settle_rewards(
        &self,
        room_id: &str,
        call_id: &str,
        volunteer_id: &str,
        duration_secs: u64,
        rating: Option<u8>,
        response_secs: Option<u64>,
    ) {
        let amounts = &self.config.reward.amounts;
        let amount = call_reward(duration_secs, rating, response_secs, amounts);
        match self
            .rewards
            .queue_reward(
                volunteer_id,
                amount,
                "call completion reward",
                Some(call_id),
                RewardKind::Completion,
            )
            .await
        {
            Ok(tx_id) => {
                if let Some(mut call) = self.calls.get_mut(room_id) {
                    call.reward_tx_id = Some(tx_id.clone());
                }
                tracing::info!(call_id = %call_id, tx_id = %tx_id, amount, "Completion reward queued");
            }
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Failed to queue completion reward")
            }
        }

        let total_calls = self.directory.record_completed_call(volunteer_id);
        if let Some(bonus) = milestone_reward(total_calls, amounts) {
            let reason = format!("milestone: {total_calls} lifetime calls");
            match self
                .rewards
                .queue_reward(volunteer_id, bonus, &reason, None, RewardKind::Milestone)
                .await
            {
                Ok(tx_id) => tracing::info!(
                    volunteer = %volunteer_id,
                    total_calls,
                    tx_id = %tx_id,
                    "Milestone reward queued"
                ),
                Err(e) => tracing::warn!(
                    volunteer = %volunteer_id,
                    total_calls,
                    error = %e,
                    "Failed to queue milestone reward"
                ),
            }
        }
    }

    /// 시그널링 경로의 통화 활성화. 봉사자가 HTTP accept 없이 방에서 바로
    /// 통화를 시작한 경우 pending 기록을 active로 따라오게 한다.
    pub fn mark_active(&self, room_id: &str) -> bool {
        let Some(mut call) = self.calls.get_mut(room_id) else {
            return false;
        };
        if call.status != CallStatus::Pending {
            return false;
        }
        call.transition(CallStatus::Active);
        if call.accepted_at.is_none() {
            call.accepted_at = Some(Instant::now());
        }
        tracing::info!(room_id = %room_id, "Call activated via signaling");
        true
    }

    /// 통화 실패 처리 (상대 끊김 등). 종결 상태면 아무것도 하지 않는다.
    pub fn fail_call(&self, room_id: &str, reason: &str) -> bool {
        let volunteer_id = {
            let Some(mut call) = self.calls.get_mut(room_id) else {
                return false;
            };
            if !call.transition(CallStatus::Failed) {
                return false;
            }
            call.duration_secs = Some(call.started_at.elapsed().as_secs());
            call.ended_at_ms = Some(unix_ms());
            call.end_reason = Some(reason.to_string());
            call.volunteer_id.clone()
        };

        if let Some(volunteer_id) = volunteer_id {
            self.directory.release(&volunteer_id);
        }
        tracing::info!(room_id = %room_id, reason = %reason, "Call marked failed");
        true
    }

    pub fn get_call(&self, room_id: &str) -> Option<Call> {
        self.calls.get(room_id).map(|c| c.clone())
    }

    /// 테스트에서 임의의 방에 통화 기록을 붙이기 위한 헬퍼
    #[cfg(test)]
    pub fn insert_call_for_test(
        &self,
        room_id: &str,
        help_seeker_id: &str,
        volunteer_id: &str,
        status: CallStatus,
    ) {
        self.calls.insert(
            room_id.to_string(),
            Call {
                id: Uuid::new_v4().to_string(),
                help_seeker_id: help_seeker_id.to_string(),
                volunteer_id: Some(volunteer_id.to_string()),
                category: "visual_assist".to_string(),
                priority: 5,
                status,
                room_id: room_id.to_string(),
                started_at: Instant::now(),
                started_at_ms: unix_ms(),
                accepted_at: (status == CallStatus::Active).then(Instant::now),
                ended_at_ms: None,
                duration_secs: None,
                rating: None,
                end_reason: None,
                reward_tx_id: None,
            },
        );
    }

    /// 대기열 읽기 전용 스냅샷
    pub fn queue_status(&self) -> QueueStatus {
        let entries: Vec<QueueEntrySnapshot> = self
            .waiting
            .iter()
            .map(|entry| QueueEntrySnapshot {
                user_id: entry.user_id.clone(),
                category: entry.category.clone(),
                waiting_time_ms: entry.enqueued_at.elapsed().as_millis() as u64,
                status: entry.status,
            })
            .collect();
        QueueStatus {
            total_waiting: entries.len(),
            entries,
        }
    }

    /// 주기적 정리: 마감 지난 대기 항목 제거, 오래된 통화 기록 정리
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut evicted = 0;
        self.waiting.retain(|user_id, entry| {
            if now >= entry.deadline {
                tracing::info!(help_seeker = %user_id, "Waiting entry timed out");
                evicted += 1;
                false
            } else {
                true
            }
        });

        let retention = Duration::from_secs(self.config.matching.call_retention_secs);
        let mut pruned = 0;
        self.calls.retain(|room_id, call| {
            if call.started_at.elapsed() > retention {
                // 종결되지 못한 기록을 버릴 때는 선점된 봉사자도 풀어 준다
                if !call.status.is_terminal() {
                    if let Some(volunteer_id) = &call.volunteer_id {
                        self.directory.release(volunteer_id);
                    }
                    tracing::warn!(room_id = %room_id, status = ?call.status, "Pruning stale unfinished call");
                }
                pruned += 1;
                false
            } else {
                true
            }
        });

        if evicted > 0 || pruned > 0 {
            tracing::info!(evicted, pruned, "Matching cleanup completed");
        }
    }
}
