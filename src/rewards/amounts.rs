//! 보상 금액 산정 (순수 함수)

pub use crate::config::RewardAmounts;

/// 마일스톤이 되는 누적 통화 수.
/// 정확히 일치할 때 한 번만 발동한다 — 이상(以上) 판정이 아니다.
pub const MILESTONE_THRESHOLDS: [u64; 5] = [10, 50, 100, 500, 1000];

/// 통화 완료 보상: 시간 구간 기본액 + 별점/응답 보너스
pub fn call_reward(
    duration_secs: u64,
    rating: Option<u8>,
    response_secs: Option<u64>,
    amounts: &RewardAmounts,
) -> f64 {
    let base = if duration_secs <= 1_800 {
        amounts.quick_call
    } else if duration_secs <= 3_600 {
        amounts.medium_call
    } else {
        amounts.long_call
    };

    let mut total = base;
    if rating == Some(5) {
        total += amounts.perfect_rating_bonus;
    }
    if matches!(response_secs, Some(r) if r < amounts.quick_response_threshold_secs) {
        total += amounts.quick_response_bonus;
    }
    total
}

/// 누적 통화 수가 마일스톤에 정확히 도달했을 때의 보너스
pub fn milestone_reward(total_calls: u64, amounts: &RewardAmounts) -> Option<f64> {
    match total_calls {
        10 => Some(amounts.milestone_10),
        50 => Some(amounts.milestone_50),
        100 => Some(amounts.milestone_100),
        500 => Some(amounts.milestone_500),
        1000 => Some(amounts.milestone_1000),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amounts() -> RewardAmounts {
        RewardAmounts {
            quick_call: 0.01,
            medium_call: 0.02,
            long_call: 0.03,
            perfect_rating_bonus: 0.005,
            quick_response_bonus: 0.002,
            quick_response_threshold_secs: 30,
            milestone_10: 0.05,
            milestone_50: 0.1,
            milestone_100: 0.25,
            milestone_500: 0.5,
            milestone_1000: 1.0,
        }
    }

    #[test]
    fn duration_tiers_select_base_amount() {
        let a = amounts();
        assert_eq!(call_reward(1_800, None, None, &a), 0.01);
        assert_eq!(call_reward(1_801, None, None, &a), 0.02);
        assert_eq!(call_reward(3_601, None, None, &a), 0.03);
    }

    #[test]
    fn medium_call_with_perfect_rating_only() {
        // 1850초 (>30분, ≤60분), 별점 5, 응답 보너스 없음
        let a = amounts();
        let reward = call_reward(1_850, Some(5), Some(120), &a);
        assert!((reward - (a.medium_call + a.perfect_rating_bonus)).abs() < 1e-12);
    }

    #[test]
    fn sub_thirty_second_response_adds_bonus() {
        let a = amounts();
        let reward = call_reward(600, Some(4), Some(12), &a);
        assert!((reward - (a.quick_call + a.quick_response_bonus)).abs() < 1e-12);
    }

    #[test]
    fn four_star_rating_earns_no_bonus() {
        let a = amounts();
        assert_eq!(call_reward(600, Some(4), None, &a), a.quick_call);
    }

    #[test]
    fn milestones_are_exact_match_triggers() {
        let a = amounts();
        assert_eq!(milestone_reward(10, &a), Some(0.05));
        assert_eq!(milestone_reward(11, &a), None);
        assert_eq!(milestone_reward(9, &a), None);
        assert_eq!(milestone_reward(1000, &a), Some(1.0));
        for t in MILESTONE_THRESHOLDS {
            assert!(milestone_reward(t, &a).is_some());
        }
    }
}
