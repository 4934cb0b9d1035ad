use crate::time::{Buckets, Instant, TimeRange};

/// Collapses ascending bucket starts into the minimal set of contiguous
/// half-open ranges.
///
/// `{0, D, 2D, 5D}` becomes `[0, 3D)` and `[5D, 6D)`. Calendar boundaries
/// play no role here. Repeated entries are tolerated.
pub fn merge_contiguous(sorted: &[Instant], buckets: &Buckets) -> Vec<TimeRange> {
    let mut ranges = Vec::new();
    let mut iter = sorted.iter().copied();

    let Some(first) = iter.next() else {
        return ranges;
    };
    let mut range_start = first;
    let mut last = first;

    for bucket_start in iter {
        if bucket_start == last {
            continue;
        }
        if bucket_start == last.saturating_add(buckets.duration()) {
            last = bucket_start;
        } else {
            ranges.push(TimeRange::new(range_start, buckets.end(last)));
            range_start = bucket_start;
            last = bucket_start;
        }
    }
    ranges.push(TimeRange::new(range_start, buckets.end(last)));

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: i64 = 3_600_000;

    fn buckets() -> Buckets {
        Buckets::new(D).unwrap()
    }

    #[test]
    fn test_merges_adjacent_and_splits_gaps() {
        let ranges = merge_contiguous(&[0, D, 2 * D, 5 * D], &buckets());
        assert_eq!(
            ranges,
            vec![TimeRange::new(0, 3 * D), TimeRange::new(5 * D, 6 * D)]
        );
    }

    #[test]
    fn test_single_bucket() {
        let ranges = merge_contiguous(&[7 * D], &buckets());
        assert_eq!(ranges, vec![TimeRange::new(7 * D, 8 * D)]);
    }

    #[test]
    fn test_empty_input() {
        assert!(merge_contiguous(&[], &buckets()).is_empty());
    }

    #[test]
    fn test_all_isolated() {
        let ranges = merge_contiguous(&[0, 2 * D, 4 * D], &buckets());
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[1], TimeRange::new(2 * D, 3 * D));
    }

    #[test]
    fn test_duplicates_do_not_split() {
        let ranges = merge_contiguous(&[0, 0, D, D, 2 * D], &buckets());
        assert_eq!(ranges, vec![TimeRange::new(0, 3 * D)]);
    }

    #[test]
    fn test_negative_buckets() {
        let ranges = merge_contiguous(&[-2 * D, -D, 0], &buckets());
        assert_eq!(ranges, vec![TimeRange::new(-2 * D, D)]);
    }
}
