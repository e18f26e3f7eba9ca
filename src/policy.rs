/// Activity class of a page relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Hot,
    Warm,
    Cold,
}

/// Classification strategy. A tagged variant rather than a trait object:
/// each variant carries exactly the parameters it needs.
#[derive(Debug, Clone)]
pub enum Policy {
    /// Pure recency.
    Lru { hot_ms: u64, cold_ms: u64 },
    /// Pure access frequency since the page last changed tiers.
    Frequency { hot_count: u64, cold_count: u64 },
    /// Weighted combination of both signals.
    Hybrid {
        hot_ms: u64,
        cold_ms: u64,
        hot_count: u64,
        cold_count: u64,
        recency_weight: f64,
        frequency_weight: f64,
    },
}

impl Policy {
    /// Classify a metadata snapshot. `last_ms` and `count` may be stale by
    /// one scan cycle; the result is advisory.
    pub fn classify(&self, now_ms: u64, last_ms: u64, count: u64) -> PageStatus {
        let idle_ms = now_ms.saturating_sub(last_ms);
        match *self {
            Policy::Lru { hot_ms, cold_ms } => {
                if idle_ms <= hot_ms {
                    PageStatus::Hot
                } else if idle_ms >= cold_ms {
                    PageStatus::Cold
                } else {
                    PageStatus::Warm
                }
            }
            Policy::Frequency {
                hot_count,
                cold_count,
            } => {
                if count >= hot_count {
                    PageStatus::Hot
                } else if count <= cold_count {
                    PageStatus::Cold
                } else {
                    PageStatus::Warm
                }
            }
            Policy::Hybrid {
                hot_ms,
                cold_ms,
                hot_count,
                cold_count,
                recency_weight,
                frequency_weight,
            } => {
                let majority = (recency_weight + frequency_weight) / 2.0;
                let weight = |indicator: bool, w: f64| if indicator { w } else { 0.0 };
                let hot_score = weight(idle_ms <= hot_ms, recency_weight)
                    + weight(count >= hot_count, frequency_weight);
                let cold_score = weight(idle_ms >= cold_ms, recency_weight)
                    + weight(count <= cold_count, frequency_weight);
                // hot checked first: when both sides reach the majority,
                // hot wins
                if hot_score >= majority {
                    PageStatus::Hot
                } else if cold_score >= majority {
                    PageStatus::Cold
                } else {
                    PageStatus::Warm
                }
            }
        }
    }
}
