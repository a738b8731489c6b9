//! 보상 트랜잭션 큐
//!
//! 지급 계정 하나에 소비 루프 하나 — 이 단일 소비자 구조가 전송 직렬화의
//! 유일한 동시성 제어 장치다. 재시도로 다시 줄을 선 트랜잭션은 꼬리에
//! 붙으므로 원래 순서를 잃는다.

use crate::config::Config;
use crate::error::{AppError, RewardError};
use crate::identity::UserDirectory;
use crate::protocol::unix_ms;
use crate::rewards::ledger::LedgerClient;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 보상 유형
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    Completion,
    Milestone,
    Bonus,
}

/// 트랜잭션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    Queued,
    Completed,
    Failed,
}

/// 대기 중이거나 종결된 지급 기록
#[derive(Debug, Clone, Serialize)]
pub struct RewardTransaction {
    pub id: String,
    pub user_id: String,
    pub wallet_address: String,
    pub amount: f64,
    pub reason: String,
    pub call_id: Option<String>,
    pub kind: RewardKind,
    pub status: RewardStatus,
    pub retry_count: u32,
    pub signature: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// 큐 통계 스냅샷
#[derive(Debug, Clone, Serialize)]
pub struct RewardStats {
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_paid: f64,
}

/// 단일 소비자 FIFO 보상 큐
pub struct RewardQueue {
    config: Arc<Config>,
    ledger: Arc<dyn LedgerClient>,
    directory: Arc<UserDirectory>,
    /// FIFO 본체 (트랜잭션 id)
    queue: Mutex<VecDeque<String>>,
    /// 전체 기록 (tx_id -> RewardTransaction), 소비 루프만 변경
    records: DashMap<String, RewardTransaction>,
    /// 재시도 소진 후 종결 실패 집합
    failed: DashSet<String>,
    /// 통화당/마일스톤당 1회 지급 보장용 중복 방지 키
    dedupe: DashSet<String>,
    notify: Notify,
}

impl RewardQueue {
    pub fn new(
        config: Arc<Config>,
        ledger: Arc<dyn LedgerClient>,
        directory: Arc<UserDirectory>,
    ) -> Self {
        Self {
            config,
            ledger,
            directory,
            queue: Mutex::new(VecDeque::new()),
            records: DashMap::new(),
            failed: DashSet::new(),
            dedupe: DashSet::new(),
            notify: Notify::new(),
        }
    }

    /// 보상 등록. 검증 실패는 즉시 호출자에게 돌려주고,
    /// 등록 이후의 실패는 큐 내부에서만 처리된다.
    pub async fn queue_reward(
        &self,
        user_id: &str,
        amount: f64,
        reason: &str,
        call_id: Option<&str>,
        kind: RewardKind,
    ) -> Result<String, AppError> {
        if amount <= 0.0 {
            return Err(RewardError::InvalidAmount.into());
        }
        let wallet = self
            .directory
            .wallet_address(user_id)
            .ok_or(RewardError::NoWallet)?;
        if !self.ledger.validate_address(&wallet) {
            return Err(RewardError::NoWallet.into());
        }

        let dedupe_key = match kind {
            RewardKind::Completion => {
                let call_id = call_id.ok_or_else(|| {
                    AppError::Validation("completion reward requires a call id".to_string())
                })?;
                Some(format!("call:{call_id}"))
            }
            RewardKind::Milestone => Some(format!("milestone:{user_id}:{reason}")),
            RewardKind::Bonus => None,
        };
        if let Some(key) = dedupe_key {
            if !self.dedupe.insert(key) {
                return Err(RewardError::DuplicateReward.into());
            }
        }

        let now = unix_ms();
        let tx = RewardTransaction {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            wallet_address: wallet,
            amount,
            reason: reason.to_string(),
            call_id: call_id.map(str::to_string),
            kind,
            status: RewardStatus::Queued,
            retry_count: 0,
            signature: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        let tx_id = tx.id.clone();
        self.records.insert(tx_id.clone(), tx);
        self.queue.lock().await.push_back(tx_id.clone());
        self.notify.notify_one();

        tracing::info!(tx_id = %tx_id, user_id = %user_id, amount, kind = ?kind, "Reward queued");
        Ok(tx_id)
    }

    /// 소비 루프. 지급 계정당 정확히 하나만 실행해야 한다.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let tick = Duration::from_secs(self.config.reward.consumer_tick_secs);
        tracing::info!(
            funding = %self.config.reward.funding_account,
            tick_secs = tick.as_secs(),
            "Reward queue consumer starting"
        );
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Reward queue consumer shutting down");
                    return;
                }
            }
            self.drain(&shutdown).await;
            if shutdown.is_cancelled() {
                tracing::info!("Reward queue consumer shutting down");
                return;
            }
        }
    }

    /// 큐가 빌 때까지 선두부터 처리. 연속 전송 사이에 고정 지연을 둔다.
    pub async fn drain(&self, shutdown: &CancellationToken) {
        let submit_delay = Duration::from_millis(self.config.reward.submit_delay_ms);
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let next = { self.queue.lock().await.pop_front() };
            let Some(tx_id) = next else { return };
            self.process(&tx_id, shutdown).await;
            if !submit_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(submit_delay) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }

    async fn process(&self, tx_id: &str, shutdown: &CancellationToken) {
        let (amount, wallet) = match self.records.get(tx_id) {
            Some(tx) if tx.status == RewardStatus::Queued => {
                (tx.amount, tx.wallet_address.clone())
            }
            _ => return,
        };
        let funding = self.config.reward.funding_account.clone();
        let required = amount + self.config.reward.fee_buffer;

        let balance = match self.ledger.get_balance(&funding).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::warn!(tx_id = %tx_id, error = %e, "Funding balance check failed");
                self.record_failure(tx_id, &e.to_string()).await;
                return;
            }
        };

        if balance < required {
            tracing::warn!(
                tx_id = %tx_id,
                balance,
                required,
                "Insufficient funding balance, delaying retry"
            );
            let delay = Duration::from_secs(self.config.reward.insufficient_balance_delay_secs);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
            self.record_failure(tx_id, "insufficient funding balance").await;
            return;
        }

        match self.ledger.submit_transfer(&funding, &wallet, amount).await {
            Ok(signature) => {
                if let Some(mut tx) = self.records.get_mut(tx_id) {
                    tx.status = RewardStatus::Completed;
                    tx.signature = Some(signature.clone());
                    tx.updated_at_ms = unix_ms();
                }
                tracing::info!(tx_id = %tx_id, signature = %signature, amount, "Reward paid");
            }
            Err(e) => {
                tracing::warn!(tx_id = %tx_id, error = %e, "Reward submission failed");
                self.record_failure(tx_id, &e.to_string()).await;
            }
        }
    }

    /// 재시도 또는 종결 실패. 재시도는 꼬리에 다시 줄을 선다.
    async fn record_failure(&self, tx_id: &str, error: &str) {
        let exhausted = {
            let Some(mut tx) = self.records.get_mut(tx_id) else {
                return;
            };
            if tx.retry_count >= self.config.reward.max_retries {
                tx.status = RewardStatus::Failed;
                tx.updated_at_ms = unix_ms();
                true
            } else {
                tx.retry_count += 1;
                tx.updated_at_ms = unix_ms();
                false
            }
        };

        if exhausted {
            self.failed.insert(tx_id.to_string());
            tracing::warn!(tx_id = %tx_id, error = %error, "Reward moved to terminal failed set");
        } else {
            self.queue.lock().await.push_back(tx_id.to_string());
        }
    }

    /// 종결 실패 트랜잭션을 retry_count 0으로 되돌려 다시 큐에 올린다.
    pub async fn retry_failed(&self) -> usize {
        let ids: Vec<String> = self.failed.iter().map(|e| e.key().clone()).collect();
        let mut retried = 0;
        for tx_id in ids {
            if self.failed.remove(&tx_id).is_none() {
                continue;
            }
            if let Some(mut tx) = self.records.get_mut(&tx_id) {
                tx.status = RewardStatus::Queued;
                tx.retry_count = 0;
                tx.updated_at_ms = unix_ms();
            }
            self.queue.lock().await.push_back(tx_id);
            retried += 1;
        }
        if retried > 0 {
            self.notify.notify_one();
            tracing::info!(retried, "Failed rewards re-queued");
        }
        retried
    }

    /// 주기적 실패 재시도 스윕
    pub async fn run_retry_sweep(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.reward.retry_sweep_secs);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return,
            }
            self.retry_failed().await;
        }
    }

    pub fn get(&self, tx_id: &str) -> Option<RewardTransaction> {
        self.records.get(tx_id).map(|tx| tx.clone())
    }

    pub fn transactions_for_user(&self, user_id: &str) -> Vec<RewardTransaction> {
        let mut txs: Vec<RewardTransaction> = self
            .records
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .map(|tx| tx.clone())
            .collect();
        txs.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        txs
    }

    pub fn stats(&self) -> RewardStats {
        let mut stats = RewardStats {
            queued: 0,
            completed: 0,
            failed: 0,
            total_paid: 0.0,
        };
        for tx in self.records.iter() {
            match tx.status {
                RewardStatus::Queued => stats.queued += 1,
                RewardStatus::Completed => {
                    stats.completed += 1;
                    stats.total_paid += tx.amount;
                }
                RewardStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{User, UserRole};
    use crate::rewards::ledger::InMemoryLedger;

    const WALLET: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
    const FUNDING: &str = "funding-test";

    fn test_config() -> Config {
        let mut config = Config::from_env();
        config.reward.funding_account = FUNDING.to_string();
        config.reward.submit_delay_ms = 0;
        config.reward.insufficient_balance_delay_secs = 0;
        config.reward.max_retries = 3;
        config.reward.fee_buffer = 0.002;
        config
    }

    fn setup(balance: f64) -> (Arc<RewardQueue>, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::with_balance(FUNDING, balance));
        let directory = Arc::new(UserDirectory::new());
        directory.upsert(User {
            id: "vol-1".to_string(),
            name: "vol-1".to_string(),
            role: UserRole::Volunteer,
            online: true,
            reputation: 50.0,
            wallet_address: Some(WALLET.to_string()),
            skills: vec![],
            available: true,
            last_active_ms: unix_ms(),
            calls_today: 0,
            total_calls: 0,
            avg_response_secs: None,
            response_samples: 0,
        });
        directory.upsert(User {
            id: "no-wallet".to_string(),
            name: "no-wallet".to_string(),
            role: UserRole::Volunteer,
            online: true,
            reputation: 50.0,
            wallet_address: None,
            skills: vec![],
            available: true,
            last_active_ms: unix_ms(),
            calls_today: 0,
            total_calls: 0,
            avg_response_secs: None,
            response_samples: 0,
        });
        let queue = Arc::new(RewardQueue::new(
            Arc::new(test_config()),
            ledger.clone(),
            directory,
        ));
        (queue, ledger)
    }

    #[tokio::test]
    async fn queued_reward_is_paid_on_drain() {
        let (queue, ledger) = setup(1.0);
        let shutdown = CancellationToken::new();

        let tx_id = queue
            .queue_reward("vol-1", 0.02, "call completion reward", Some("c1"), RewardKind::Completion)
            .await
            .unwrap();
        queue.drain(&shutdown).await;

        let tx = queue.get(&tx_id).unwrap();
        assert_eq!(tx.status, RewardStatus::Completed);
        assert!(tx.signature.is_some());
        assert!((ledger.balance_of(FUNDING) - 0.98).abs() < 1e-9);
        assert!((ledger.balance_of(WALLET) - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn validation_failures_surface_immediately() {
        let (queue, _) = setup(1.0);

        let err = queue
            .queue_reward("vol-1", 0.0, "zero", None, RewardKind::Bonus)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Reward(RewardError::InvalidAmount)
        ));

        let err = queue
            .queue_reward("no-wallet", 0.01, "bonus", None, RewardKind::Bonus)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Reward(RewardError::NoWallet)));
    }

    #[tokio::test]
    async fn completion_reward_is_at_most_once_per_call() {
        let (queue, _) = setup(1.0);

        queue
            .queue_reward("vol-1", 0.02, "call completion reward", Some("c1"), RewardKind::Completion)
            .await
            .unwrap();
        let err = queue
            .queue_reward("vol-1", 0.02, "call completion reward", Some("c1"), RewardKind::Completion)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Reward(RewardError::DuplicateReward)
        ));
    }

    #[tokio::test]
    async fn milestone_reward_is_deduplicated_by_threshold() {
        let (queue, _) = setup(1.0);

        queue
            .queue_reward("vol-1", 0.05, "milestone: 10 lifetime calls", None, RewardKind::Milestone)
            .await
            .unwrap();
        let err = queue
            .queue_reward("vol-1", 0.05, "milestone: 10 lifetime calls", None, RewardKind::Milestone)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Reward(RewardError::DuplicateReward)
        ));
    }

    #[tokio::test]
    async fn insufficient_balance_exhausts_into_failed_set() {
        // 잔액 0.005 < 0.01 + 0.002 버퍼 → 재시도 3회 후 종결 실패
        let (queue, _) = setup(0.005);
        let shutdown = CancellationToken::new();

        let tx_id = queue
            .queue_reward("vol-1", 0.01, "call completion reward", Some("c1"), RewardKind::Completion)
            .await
            .unwrap();
        queue.drain(&shutdown).await;

        let tx = queue.get(&tx_id).unwrap();
        assert_eq!(tx.status, RewardStatus::Failed);
        assert_eq!(tx.retry_count, 3);
        assert!(tx.signature.is_none());
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn transient_submission_error_is_retried() {
        let (queue, ledger) = setup(1.0);
        let shutdown = CancellationToken::new();
        ledger.fail_next_submissions(1);

        let tx_id = queue
            .queue_reward("vol-1", 0.01, "call completion reward", Some("c1"), RewardKind::Completion)
            .await
            .unwrap();
        queue.drain(&shutdown).await;

        let tx = queue.get(&tx_id).unwrap();
        assert_eq!(tx.status, RewardStatus::Completed);
        assert_eq!(tx.retry_count, 1);
    }

    #[tokio::test]
    async fn retry_failed_resets_and_requeues() {
        let (queue, ledger) = setup(0.005);
        let shutdown = CancellationToken::new();

        let tx_id = queue
            .queue_reward("vol-1", 0.01, "call completion reward", Some("c1"), RewardKind::Completion)
            .await
            .unwrap();
        queue.drain(&shutdown).await;
        assert_eq!(queue.get(&tx_id).unwrap().status, RewardStatus::Failed);

        // 잔액 보충 후 재시도 스윕
        ledger.set_balance(FUNDING, 1.0);
        assert_eq!(queue.retry_failed().await, 1);
        queue.drain(&shutdown).await;

        let tx = queue.get(&tx_id).unwrap();
        assert_eq!(tx.status, RewardStatus::Completed);
        assert_eq!(tx.retry_count, 0);
        assert_eq!(queue.stats().failed, 0);
    }

    #[tokio::test]
    async fn fifo_order_is_preserved_for_clean_submissions() {
        let (queue, _) = setup(1.0);
        let shutdown = CancellationToken::new();

        let first = queue
            .queue_reward("vol-1", 0.01, "call completion reward", Some("c1"), RewardKind::Completion)
            .await
            .unwrap();
        let second = queue
            .queue_reward("vol-1", 0.01, "call completion reward", Some("c2"), RewardKind::Completion)
            .await
            .unwrap();
        queue.drain(&shutdown).await;

        let first_tx = queue.get(&first).unwrap();
        let second_tx = queue.get(&second).unwrap();
        assert_eq!(first_tx.status, RewardStatus::Completed);
        assert_eq!(second_tx.status, RewardStatus::Completed);
        assert!(first_tx.updated_at_ms <= second_tx.updated_at_ms);
    }
}
