//! Conversion of percentage weights into bucket ranges within `[1, 10000]`.
use crate::bucketer::MAX_TRAFFIC_VALUE;

/// Something that owns a weight (percent) and a bucket range.
pub(crate) trait Weighted {
    fn weight(&self) -> f64;
    fn set_weight(&mut self, weight: f64);
    /// Inclusive range. `(-1, -1)` when the item occupies no buckets.
    fn range(&self) -> (i32, i32);
    fn set_range(&mut self, start: i32, end: i32);

    fn contains_bucket(&self, bucket: u32) -> bool {
        let (start, end) = self.range();
        i64::from(start) <= i64::from(bucket) && i64::from(bucket) <= i64::from(end)
    }
}

/// Number of buckets a weight occupies: `ceil(weight * 100)` capped at 10000, zero for
/// non-positive weights.
pub(crate) fn bucket_range_for_weight(weight: f64) -> i32 {
    if weight <= 0.0 {
        return 0;
    }
    let step = (weight * 100.0).ceil();
    if step > f64::from(MAX_TRAFFIC_VALUE) {
        MAX_TRAFFIC_VALUE as i32
    } else {
        step as i32
    }
}

/// Lay out ranges back to back in declared order, starting at 1.
pub(crate) fn assign_ranges<T: Weighted>(items: &mut [T]) {
    let mut current = 0;
    for item in items.iter_mut() {
        let step = bucket_range_for_weight(item.weight());
        if step > 0 {
            item.set_range(current + 1, current + step);
        } else {
            item.set_range(-1, -1);
        }
        current += step;
    }
}

/// Scale weights so they sum to 100. If all weights are zero, split equally.
pub(crate) fn scale_weights<T: Weighted>(items: &mut [T]) {
    if items.is_empty() {
        return;
    }
    let total: f64 = items.iter().map(Weighted::weight).sum();
    if total == 0.0 {
        let equal = 100.0 / items.len() as f64;
        for item in items.iter_mut() {
            item.set_weight(equal);
        }
    } else {
        for item in items.iter_mut() {
            item.set_weight(item.weight() / total * 100.0);
        }
    }
}

/// Normalize weights only when they don't already add up to 100, then assign ranges.
pub(crate) fn allocate<T: Weighted>(items: &mut [T]) {
    let total: f64 = items.iter().map(Weighted::weight).sum();
    if (total - 100.0).abs() > 1e-9 {
        scale_weights(items);
    }
    assign_ranges(items);
}

/// Rollout and personalize variations: `[1, floor(weight * 100)]`. Traffic is gated separately.
pub(crate) fn assign_rollout_range<T: Weighted>(item: &mut T) {
    let end = (item.weight() * 100.0) as i32;
    item.set_range(1, end);
}

/// First item whose range contains `bucket`.
pub(crate) fn find_by_bucket<T: Weighted>(items: &[T], bucket: u32) -> Option<&T> {
    items.iter().find(|item| item.contains_bucket(bucket))
}
