//! 원장(ledger) 클라이언트 추상화
//!
//! 실제 체인 연동은 외부 협력자다. 보상 큐는 잔액 조회 / 전송 제출 /
//! 주소 검증 세 가지 능력만 요구하므로 그 폭 그대로 trait으로 자른다.
//! 인메모리 구현 하나로 테스트와 단독 실행을 모두 커버한다.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use uuid::Uuid;

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("transfer rejected: {0}")]
    Rejected(String),
}

/// 원장 클라이언트 — 불투명한 "전송 제출" 능력
#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_balance(&self, account: &str) -> Result<f64, LedgerError>;
    async fn submit_transfer(&self, from: &str, to: &str, amount: f64)
        -> Result<String, LedgerError>;
    fn validate_address(&self, address: &str) -> bool;
}

/// 인메모리 원장. 잔액 테이블 + 실패 주입 카운터.
pub struct InMemoryLedger {
    balances: DashMap<String, f64>,
    /// 다음 N회의 전송 제출을 강제로 실패시킨다 (테스트용)
    fail_submissions: AtomicU32,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            balances: DashMap::new(),
            fail_submissions: AtomicU32::new(0),
        }
    }

    pub fn with_balance(account: &str, amount: f64) -> Self {
        let ledger = Self::new();
        ledger.set_balance(account, amount);
        ledger
    }

    pub fn set_balance(&self, account: &str, amount: f64) {
        self.balances.insert(account.to_string(), amount);
    }

    pub fn balance_of(&self, account: &str) -> f64 {
        self.balances.get(account).map(|b| *b).unwrap_or(0.0)
    }

    pub fn fail_next_submissions(&self, count: u32) {
        self.fail_submissions.store(count, Ordering::SeqCst);
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LedgerClient for InMemoryLedger {
    async fn get_balance(&self, account: &str) -> Result<f64, LedgerError> {
        Ok(self.balance_of(account))
    }

    async fn submit_transfer(
        &self,
        from: &str,
        to: &str,
        amount: f64,
    ) -> Result<String, LedgerError> {
        if self
            .fail_submissions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LedgerError::Unavailable("injected failure".to_string()));
        }

        let from_balance = self.balance_of(from);
        if from_balance < amount {
            return Err(LedgerError::Rejected("insufficient funds".to_string()));
        }

        self.balances.insert(from.to_string(), from_balance - amount);
        let to_balance = self.balance_of(to);
        self.balances.insert(to.to_string(), to_balance + amount);

        Ok(format!("sig-{}", Uuid::new_v4()))
    }

    fn validate_address(&self, address: &str) -> bool {
        (32..=44).contains(&address.len())
            && address.chars().all(|c| BASE58_ALPHABET.contains(c))
    }
}
