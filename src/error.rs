//! 오류 분류 및 HTTP 응답 변환

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// 매칭 엔진 도메인 오류
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchingError {
    #[error("no volunteers available")]
    NoVolunteersAvailable,
    #[error("help seeker is already queued")]
    AlreadyQueued,
    #[error("matching timed out")]
    Timeout,
    #[error("help seeker is not queued")]
    NotQueued,
    #[error("match not found")]
    MatchNotFound,
    #[error("match already accepted")]
    AlreadyAccepted,
    #[error("match already closed")]
    MatchClosed,
}

/// 보상 큐 도메인 오류
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewardError {
    #[error("recipient has no valid wallet address")]
    NoWallet,
    #[error("reward amount must be positive")]
    InvalidAmount,
    #[error("reward already queued for this trigger")]
    DuplicateReward,
}

/// 서비스 전체 오류 taxonomy
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("authentication required")]
    Unauthenticated,
    #[error("{0}")]
    NotAuthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error(transparent)]
    Matching(#[from] MatchingError),
    #[error(transparent)]
    Reward(#[from] RewardError),
    #[error("blockchain submission failed: {0}")]
    Blockchain(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// 클라이언트에 노출되는 오류 코드
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Unauthenticated => "UNAUTHENTICATED",
            AppError::NotAuthorized(_) => "NOT_AUTHORIZED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::RateLimited => "RATE_LIMITED",
            AppError::Matching(e) => match e {
                MatchingError::NoVolunteersAvailable => "NO_VOLUNTEERS_AVAILABLE",
                MatchingError::AlreadyQueued => "ALREADY_QUEUED",
                MatchingError::Timeout => "MATCHING_TIMEOUT",
                MatchingError::NotQueued => "NOT_QUEUED",
                MatchingError::MatchNotFound => "MATCH_NOT_FOUND",
                MatchingError::AlreadyAccepted => "MATCH_ALREADY_ACCEPTED",
                MatchingError::MatchClosed => "MATCH_CLOSED",
            },
            AppError::Reward(e) => match e {
                RewardError::NoWallet => "NO_WALLET",
                RewardError::InvalidAmount => "INVALID_AMOUNT",
                RewardError::DuplicateReward => "REWARD_ALREADY_QUEUED",
            },
            AppError::Blockchain(_) => "BLOCKCHAIN_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::NotAuthorized(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Matching(e) => match e {
                MatchingError::NoVolunteersAvailable
                | MatchingError::NotQueued
                | MatchingError::MatchNotFound => StatusCode::NOT_FOUND,
                MatchingError::AlreadyQueued
                | MatchingError::AlreadyAccepted
                | MatchingError::MatchClosed => StatusCode::CONFLICT,
                MatchingError::Timeout => StatusCode::REQUEST_TIMEOUT,
            },
            AppError::Reward(e) => match e {
                RewardError::NoWallet | RewardError::InvalidAmount => StatusCode::BAD_REQUEST,
                RewardError::DuplicateReward => StatusCode::CONFLICT,
            },
            AppError::Blockchain(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        });
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn matching_errors_map_to_http_status_codes() {
        assert_eq!(
            AppError::from(MatchingError::NoVolunteersAvailable).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(MatchingError::AlreadyQueued).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(MatchingError::AlreadyAccepted).code(),
            "MATCH_ALREADY_ACCEPTED"
        );
        assert_eq!(
            AppError::from(MatchingError::Timeout).status(),
            StatusCode::REQUEST_TIMEOUT
        );
    }

    #[test]
    fn reward_errors_are_client_errors() {
        assert_eq!(
            AppError::from(RewardError::NoWallet).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::from(RewardError::NoWallet).code(), "NO_WALLET");
        assert_eq!(
            AppError::from(RewardError::DuplicateReward).status(),
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn into_response_renders_error_envelope() {
        let response = AppError::Validation("priority out of range".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(value["error"]["message"], "priority out of range");
    }
}
