//! Bucketing functions
//!
//! Raw interaction counts become purchase weights and raw model scores
//! become star ratings. Both are total, monotonically non-decreasing and
//! always land in `1..=5`.

/// Interaction count thresholds, highest bucket first
const COUNT_THRESHOLDS: [(u64, i32); 3] = [(20, 5), (10, 4), (5, 3)];

/// Score thresholds, highest bucket first
const SCORE_THRESHOLDS: [(f32, i32); 4] = [(1.0, 5), (0.49, 4), (0.07, 3), (0.019, 2)];

/// Map an interaction count to an intensity bucket
pub fn interaction_weight(count: u64) -> i32 {
    for (threshold, bucket) in COUNT_THRESHOLDS {
        if count >= threshold {
            return bucket;
        }
    }
    if count > 1 {
        2
    } else {
        1
    }
}

/// Map a model score to a star rating. Negative and NaN scores rate 1.
pub fn score_rating(score: f32) -> i32 {
    SCORE_THRESHOLDS
        .iter()
        .find(|(threshold, _)| score >= *threshold)
        .map(|(_, bucket)| *bucket)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interaction_weight_fixed_points() {
        assert_eq!(interaction_weight(0), 1);
        assert_eq!(interaction_weight(1), 1);
        assert_eq!(interaction_weight(2), 2);
        assert_eq!(interaction_weight(4), 2);
        assert_eq!(interaction_weight(5), 3);
        assert_eq!(interaction_weight(9), 3);
        assert_eq!(interaction_weight(10), 4);
        assert_eq!(interaction_weight(19), 4);
        assert_eq!(interaction_weight(20), 5);
        assert_eq!(interaction_weight(u64::MAX), 5);
    }

    #[test]
    fn test_interaction_weight_monotonic() {
        let mut previous = interaction_weight(0);
        for count in 1..100 {
            let current = interaction_weight(count);
            assert!(current >= previous);
            assert!((1..=5).contains(&current));
            previous = current;
        }
    }

    #[test]
    fn test_score_rating_fixed_points() {
        assert_eq!(score_rating(0.0), 1);
        assert_eq!(score_rating(0.0189), 1);
        assert_eq!(score_rating(0.019), 2);
        assert_eq!(score_rating(0.07), 3);
        assert_eq!(score_rating(0.49), 4);
        assert_eq!(score_rating(1.0), 5);
        assert_eq!(score_rating(3.5), 5);
        assert_eq!(score_rating(-2.0), 1);
        assert_eq!(score_rating(f32::NAN), 1);
    }

    #[test]
    fn test_score_rating_monotonic() {
        let mut previous = score_rating(-1.0);
        for step in 0..300 {
            let current = score_rating(-1.0 + step as f32 * 0.01);
            assert!(current >= previous);
            previous = current;
        }
    }
}
