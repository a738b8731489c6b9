//! 환경 변수 기반 설정 관리

use std::env;
use std::str::FromStr;

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// 서버 설정
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub log_level: String,
    pub room: RoomConfig,
    pub matching: MatchingConfig,
    pub scoring: ScoringWeights,
    pub reward: RewardConfig,
}

/// 방(시그널링) 설정
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// 방 최대 참여자 수 (1:1 통화이므로 2)
    pub max_participants: usize,
    /// 서버 ping 주기 (초)
    pub heartbeat_interval_secs: u64,
    /// 방 보존 기간 (초)
    pub max_age_secs: u64,
}

/// 매칭 엔진 설정
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// 매칭 시도 횟수
    pub max_attempts: u32,
    /// 시도 간 대기 (ms)
    pub retry_delay_ms: u64,
    /// 거절 후 재매칭 대기열 타임아웃 (ms)
    pub rematch_timeout_ms: u64,
    /// 대기열/통화 기록 정리 주기 (초)
    pub cleanup_interval_secs: u64,
    /// 통화 기록 보존 기간 (초)
    pub call_retention_secs: u64,
    /// 요청에 timeout이 없을 때 기본값 (ms)
    pub default_timeout_ms: u64,
}

/// 봉사자 점수 가중치 — 매직 넘버 대신 이름 있는 설정으로 유지
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub reputation_weight: f64,
    pub idle_hour_rate: f64,
    pub idle_hour_cap: f64,
    pub calls_today_penalty: f64,
    pub calls_today_cap: f64,
    pub skill_bonus: f64,
    pub fast_response_bonus: f64,
    pub fast_response_threshold_secs: u64,
    pub offline_penalty: f64,
}

/// 보상 큐 설정
#[derive(Debug, Clone)]
pub struct RewardConfig {
    /// 지급 계정 식별자
    pub funding_account: String,
    /// 전송 수수료 버퍼
    pub fee_buffer: f64,
    /// 재시도 상한
    pub max_retries: u32,
    /// 연속 전송 사이 지연 (ms)
    pub submit_delay_ms: u64,
    /// 잔액 부족 시 재시도 지연 (초)
    pub insufficient_balance_delay_secs: u64,
    /// 소비 루프 주기적 트리거 (초)
    pub consumer_tick_secs: u64,
    /// 실패 트랜잭션 자동 재시도 주기 (초)
    pub retry_sweep_secs: u64,
    pub amounts: RewardAmounts,
}

/// 보상 금액표
#[derive(Debug, Clone)]
pub struct RewardAmounts {
    /// 30분 이하 통화
    pub quick_call: f64,
    /// 60분 이하 통화
    pub medium_call: f64,
    /// 60분 초과 통화
    pub long_call: f64,
    /// 별점 5점 보너스
    pub perfect_rating_bonus: f64,
    /// 30초 이내 응답 보너스
    pub quick_response_bonus: f64,
    /// 응답 보너스 기준 (초)
    pub quick_response_threshold_secs: u64,
    pub milestone_10: f64,
    pub milestone_50: f64,
    pub milestone_100: f64,
    pub milestone_500: f64,
    pub milestone_1000: f64,
}

impl Config {
    /// 환경 변수에서 설정 로드
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            port: env_parse("PORT", 5600),
            host: env_string("HOST", "0.0.0.0"),
            log_level: env_string("LOG_LEVEL", "info"),
            room: RoomConfig {
                max_participants: env_parse("MAX_ROOM_PARTICIPANTS", 2),
                heartbeat_interval_secs: env_parse("HEARTBEAT_INTERVAL", 30),
                max_age_secs: env_parse("ROOM_MAX_AGE", 86_400),
            },
            matching: MatchingConfig {
                max_attempts: env_parse("MATCH_MAX_ATTEMPTS", 3),
                retry_delay_ms: env_parse("MATCH_RETRY_DELAY", 2_000),
                rematch_timeout_ms: env_parse("REMATCH_TIMEOUT", 60_000),
                cleanup_interval_secs: env_parse("MATCH_CLEANUP_INTERVAL", 60),
                call_retention_secs: env_parse("CALL_RETENTION", 86_400),
                default_timeout_ms: env_parse("MATCH_DEFAULT_TIMEOUT", 30_000),
            },
            scoring: ScoringWeights {
                reputation_weight: env_parse("SCORE_REPUTATION_WEIGHT", 0.1),
                idle_hour_rate: env_parse("SCORE_IDLE_HOUR_RATE", 2.0),
                idle_hour_cap: env_parse("SCORE_IDLE_HOUR_CAP", 10.0),
                calls_today_penalty: env_parse("SCORE_CALLS_TODAY_PENALTY", 1.0),
                calls_today_cap: env_parse("SCORE_CALLS_TODAY_CAP", 5.0),
                skill_bonus: env_parse("SCORE_SKILL_BONUS", 10.0),
                fast_response_bonus: env_parse("SCORE_FAST_RESPONSE_BONUS", 5.0),
                fast_response_threshold_secs: env_parse("SCORE_FAST_RESPONSE_THRESHOLD", 30),
                offline_penalty: env_parse("SCORE_OFFLINE_PENALTY", 20.0),
            },
            reward: RewardConfig {
                funding_account: env_string("FUNDING_ACCOUNT", "visionlink-funding"),
                fee_buffer: env_parse("REWARD_FEE_BUFFER", 0.002),
                max_retries: env_parse("REWARD_MAX_RETRIES", 3),
                submit_delay_ms: env_parse("REWARD_SUBMIT_DELAY", 1_000),
                insufficient_balance_delay_secs: env_parse("REWARD_BALANCE_RETRY_DELAY", 60),
                consumer_tick_secs: env_parse("REWARD_CONSUMER_TICK", 30),
                retry_sweep_secs: env_parse("REWARD_RETRY_SWEEP", 60),
                amounts: RewardAmounts {
                    quick_call: env_parse("REWARD_QUICK_CALL", 0.01),
                    medium_call: env_parse("REWARD_MEDIUM_CALL", 0.02),
                    long_call: env_parse("REWARD_LONG_CALL", 0.03),
                    perfect_rating_bonus: env_parse("REWARD_PERFECT_RATING", 0.005),
                    quick_response_bonus: env_parse("REWARD_QUICK_RESPONSE", 0.002),
                    quick_response_threshold_secs: env_parse("REWARD_RESPONSE_THRESHOLD", 30),
                    milestone_10: env_parse("REWARD_MILESTONE_10", 0.05),
                    milestone_50: env_parse("REWARD_MILESTONE_50", 0.1),
                    milestone_100: env_parse("REWARD_MILESTONE_100", 0.25),
                    milestone_500: env_parse("REWARD_MILESTONE_500", 0.5),
                    milestone_1000: env_parse("REWARD_MILESTONE_1000", 1.0),
                },
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        // 테스트에서 환경 변수 없이 기본값으로 생성할 때 사용
        Self::from_env()
    }
}
