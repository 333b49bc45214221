use serde::{Deserialize, Serialize};

/// Items at or above this latency (seconds) count as slow, independent of the histogram.
pub const SLOW_THRESHOLD_SECONDS: f64 = 5.0;

/// Upper bounds (seconds) of the latency histogram buckets.
///
/// Bucket `0` covers `[0, bounds[0])`, bucket `i` covers `[bounds[i-1], bounds[i])`,
/// and one trailing overflow bucket covers `[bounds[last], +inf)`.
pub const LATENCY_BUCKET_UPPER_BOUNDS_SECONDS: [f64; 10] =
    [0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0];

/// Histogram length including the overflow bucket.
pub const LATENCY_BUCKET_COUNT: usize = LATENCY_BUCKET_UPPER_BOUNDS_SECONDS.len() + 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageAggregate {
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub quota_consumed: u64,
}

impl UsageAggregate {
    /// A single request's contribution. `total_tokens` is derived here and never re-validated.
    pub fn single(prompt_tokens: u64, completion_tokens: u64, quota_consumed: u64) -> Self {
        Self {
            requests: 1,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            quota_consumed,
        }
    }

    pub fn merge(&mut self, delta: &UsageAggregate) {
        self.requests = self.requests.saturating_add(delta.requests);
        self.prompt_tokens = self.prompt_tokens.saturating_add(delta.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(delta.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(delta.total_tokens);
        self.quota_consumed = self.quota_consumed.saturating_add(delta.quota_consumed);
    }
}

/// Bounded response-time statistics; no per-request timings are kept.
///
/// `sum` and `max` are in seconds as reported by the upstream `use_time` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatencyAggregate {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
    pub slow_count: u64,
    pub unknown_count: u64,
    pub buckets: Vec<u64>,
}

impl Default for LatencyAggregate {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            max: 0.0,
            slow_count: 0,
            unknown_count: 0,
            buckets: vec![0; LATENCY_BUCKET_COUNT],
        }
    }
}

impl LatencyAggregate {
    /// Record one request whose latency is known (finite, non-negative seconds).
    pub fn record(&mut self, seconds: f64) {
        let index = latency_bucket_index(seconds);
        if self.buckets.len() <= index {
            self.buckets.resize(index + 1, 0);
        }
        self.count = self.count.saturating_add(1);
        self.sum += seconds;
        self.max = self.max.max(seconds);
        if seconds >= SLOW_THRESHOLD_SECONDS {
            self.slow_count = self.slow_count.saturating_add(1);
        }
        self.buckets[index] = self.buckets[index].saturating_add(1);
    }

    /// Record one request whose latency could not be parsed.
    pub fn record_unknown(&mut self) {
        self.count = self.count.saturating_add(1);
        self.unknown_count = self.unknown_count.saturating_add(1);
    }

    /// Position-wise merge. A longer `delta.buckets` zero-pads `self` first.
    pub fn merge(&mut self, delta: &LatencyAggregate) {
        self.count = self.count.saturating_add(delta.count);
        self.sum += delta.sum;
        self.max = self.max.max(delta.max);
        self.slow_count = self.slow_count.saturating_add(delta.slow_count);
        self.unknown_count = self.unknown_count.saturating_add(delta.unknown_count);

        if self.buckets.len() < delta.buckets.len() {
            self.buckets.resize(delta.buckets.len(), 0);
        }
        for (slot, add) in self.buckets.iter_mut().zip(delta.buckets.iter()) {
            *slot = slot.saturating_add(*add);
        }
    }

    #[cfg(test)]
    pub fn bucketed_total(&self) -> u64 {
        self.buckets.iter().copied().fold(0u64, u64::saturating_add)
    }
}

/// First `i` with `seconds < bounds[i]`, else the overflow index.
pub fn latency_bucket_index(seconds: f64) -> usize {
    LATENCY_BUCKET_UPPER_BOUNDS_SECONDS
        .iter()
        .position(|bound| seconds < *bound)
        .unwrap_or(LATENCY_BUCKET_UPPER_BOUNDS_SECONDS.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn bucket_ladder_is_right_open() {
        assert_eq!(latency_bucket_index(0.0), 0);
        assert_eq!(latency_bucket_index(0.2499), 0);
        assert_eq!(latency_bucket_index(0.25), 1);
        assert_eq!(latency_bucket_index(4.99), 5);
        assert_eq!(latency_bucket_index(5.0), 6);
        assert_eq!(latency_bucket_index(33.9), 9);
        assert_eq!(latency_bucket_index(34.0), 10);
        assert_eq!(latency_bucket_index(1_000.0), LATENCY_BUCKET_COUNT - 1);
    }

    #[test]
    fn usage_merge_is_pure_addition() {
        let mut a = UsageAggregate::single(10, 5, 100);
        let b = UsageAggregate::single(20, 0, 50);
        a.merge(&b);
        assert_eq!(
            a,
            UsageAggregate {
                requests: 2,
                prompt_tokens: 30,
                completion_tokens: 5,
                total_tokens: 35,
                quota_consumed: 150,
            }
        );

        let mut left = UsageAggregate::default();
        left.merge(&b);
        left.merge(&UsageAggregate::single(10, 5, 100));
        assert_eq!(left, a, "merge order must not matter");
    }

    #[test]
    fn latency_record_tracks_slow_unknown_and_conservation() {
        let mut agg = LatencyAggregate::default();
        agg.record(0.1);
        agg.record(5.0);
        agg.record(40.0);
        agg.record_unknown();

        assert_eq!(agg.count, 4);
        assert_eq!(agg.slow_count, 2);
        assert_eq!(agg.unknown_count, 1);
        assert_eq!(agg.max, 40.0);
        assert_eq!(agg.bucketed_total() + agg.unknown_count, agg.count);
        assert_eq!(agg.buckets[0], 1);
        assert_eq!(agg.buckets[6], 1);
        assert_eq!(agg.buckets[LATENCY_BUCKET_COUNT - 1], 1);
    }

    #[test]
    fn latency_merge_pads_shorter_target() {
        let mut target = LatencyAggregate {
            buckets: vec![1, 1],
            count: 2,
            sum: 0.5,
            max: 0.3,
            ..LatencyAggregate::default()
        };
        let mut delta = LatencyAggregate::default();
        delta.buckets = vec![0; LATENCY_BUCKET_COUNT + 2];
        delta.buckets[LATENCY_BUCKET_COUNT + 1] = 3;
        delta.count = 3;
        delta.max = 60.0;

        target.merge(&delta);
        assert_eq!(target.buckets.len(), LATENCY_BUCKET_COUNT + 2);
        assert_eq!(target.buckets[0], 1);
        assert_eq!(target.buckets[LATENCY_BUCKET_COUNT + 1], 3);
        assert_eq!(target.count, 5);
        assert_eq!(target.max, 60.0);
    }
}
