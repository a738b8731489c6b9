//! 시그널링 프로토콜 모듈

pub mod messages;

pub use messages::*;

use std::time::{SystemTime, UNIX_EPOCH};

/// 공통 unix 타임스탬프 (ms)
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
