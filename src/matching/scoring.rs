//! 봉사자 선발 점수 계산
//!
//! 정책이 명시적으로 드러나도록 모든 가중치는 [`ScoringWeights`] 설정에
//! 이름을 붙여 둔다. 양수 점수만 선발 대상이다 — 비어 있지 않은 후보
//! 목록이라도 전원이 부적합(0 이하)이면 매칭은 실패해야 한다.

pub use crate::config::ScoringWeights;
use crate::identity::User;
use crate::protocol::unix_ms;

/// 단일 봉사자 점수
pub fn score_volunteer(volunteer: &User, category: &str, now_ms: u64, w: &ScoringWeights) -> f64 {
    let idle_hours = now_ms.saturating_sub(volunteer.last_active_ms) as f64 / 3_600_000.0;

    let mut score = volunteer.reputation * w.reputation_weight;
    score += (idle_hours * w.idle_hour_rate).min(w.idle_hour_cap);
    score -= (volunteer.calls_today as f64 * w.calls_today_penalty).min(w.calls_today_cap);

    if volunteer.skills.iter().any(|s| s == category) {
        score += w.skill_bonus;
    }
    if matches!(volunteer.avg_response_secs, Some(r) if r < w.fast_response_threshold_secs as f64)
    {
        score += w.fast_response_bonus;
    }
    if !volunteer.online {
        score -= w.offline_penalty;
    }

    score
}

/// 후보 순위 매기기 — 점수 내림차순, 양수 점수만 남긴다
pub fn rank_candidates<'a>(
    candidates: &'a [User],
    category: &str,
    w: &ScoringWeights,
) -> Vec<(&'a User, f64)> {
    let now_ms = unix_ms();
    let mut ranked: Vec<(&User, f64)> = candidates
        .iter()
        .map(|v| (v, score_volunteer(v, category, now_ms, w)))
        .filter(|(_, score)| *score > 0.0)
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}
