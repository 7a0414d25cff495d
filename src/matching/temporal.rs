use crate::entity::TemporalBounds;

/// Largest difference between comparable ends, or `None` when no end is known on both sides.
pub fn temporal_distance(local: &TemporalBounds, candidate: &TemporalBounds) -> Option<i32> {
    let start = local.start.zip(candidate.start).map(|(a, b)| (a - b).abs());
    let end = local.end.zip(candidate.end).map(|(a, b)| (a - b).abs());
    match (start, end) {
        (Some(s), Some(e)) => Some(s.max(e)),
        (Some(s), None) => Some(s),
        (None, Some(e)) => Some(e),
        (None, None) => None,
    }
}

/// True when the biographies contradict. With both ends comparable, both must differ
/// by more than `tolerance` years; with one comparable end, that end alone decides.
pub fn bounds_conflict(local: &TemporalBounds, candidate: &TemporalBounds, tolerance: i32) -> bool {
    let beyond = |a: Option<i32>, b: Option<i32>| a.zip(b).map(|(a, b)| (a - b).abs() > tolerance);
    match (beyond(local.start, candidate.start), beyond(local.end, candidate.end)) {
        (Some(start), Some(end)) => start && end,
        (Some(one), None) | (None, Some(one)) => one,
        (None, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_uses_comparable_ends_only() {
        let joan = TemporalBounds::new(Some(1412), Some(1431));
        assert_eq!(
            temporal_distance(&joan, &TemporalBounds::new(Some(1410), Some(1431))),
            Some(2)
        );
        assert_eq!(
            temporal_distance(&joan, &TemporalBounds::new(None, Some(1440))),
            Some(9)
        );
        assert_eq!(temporal_distance(&joan, &TemporalBounds::default()), None);
        assert_eq!(
            temporal_distance(&TemporalBounds::new(Some(1412), None), &TemporalBounds::new(None, Some(1431))),
            None
        );
    }

    #[test]
    fn test_conflict_beyond_tolerance() {
        let joan = TemporalBounds::new(Some(1412), Some(1431));
        assert!(bounds_conflict(&joan, &TemporalBounds::new(Some(1200), None), 5));
        assert!(!bounds_conflict(&joan, &TemporalBounds::new(Some(1415), Some(1431)), 5));
        assert!(!bounds_conflict(&joan, &TemporalBounds::default(), 5));
        assert!(!bounds_conflict(&TemporalBounds::default(), &TemporalBounds::new(Some(1200), None), 5));
    }

    #[test]
    fn test_one_end_off_is_not_a_conflict_when_both_ends_compare() {
        let joan = TemporalBounds::new(Some(1412), Some(1431));
        assert!(!bounds_conflict(&joan, &TemporalBounds::new(Some(1412), Some(1440)), 5));
        assert!(bounds_conflict(&joan, &TemporalBounds::new(Some(1380), Some(1440)), 5));
        assert!(bounds_conflict(&joan, &TemporalBounds::new(None, Some(1440)), 5));
    }
}
