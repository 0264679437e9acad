//! Quota rules (§4.4). A `QuotaKeeper` holds one or more rules and is over
//! its soft/hard/target limit when *any* rule says so.

use async_trait::async_trait;

/// A single quota constraint evaluated against a candidate total usage (in
/// bytes). `MaxSize`, `DiskFreePercent`, and `ElasticSize` below are the
/// three kinds named in the specification; callers may add others.
pub trait QuotaRule: Send + Sync {
    fn name(&self) -> &str;

    /// True when `usage` is still within the soft limit -- the limit that
    /// triggers a non-blocking purge.
    fn is_inside_soft_limit(&self, usage: i64) -> bool;

    /// True when `usage` is still within the hard limit -- the limit that
    /// blocks a reservation until eviction frees space.
    fn is_inside_hard_limit(&self, usage: i64) -> bool;

    /// True when `usage` is within the steady-state target the purge loop
    /// aims to restore after an eviction pass.
    fn is_inside_target_limit(&self, usage: i64) -> bool;

    /// Rules that learn from history (`ElasticSize`) can be temporarily
    /// disabled and recomputed; most cannot.
    fn can_be_calibrated(&self) -> bool {
        false
    }

    /// Upcast to `Calibratable` for rules where `can_be_calibrated` is true.
    /// Kept as a trait method rather than a `dyn Any` downcast since the
    /// keeper only ever needs this one specific upcast.
    fn as_calibratable(&self) -> Option<&dyn Calibratable> {
        None
    }
}

/// Rules that support calibration implement this in addition to
/// `QuotaRule`. Kept separate so a plain `MaxSize` rule doesn't need a
/// no-op async fn.
#[async_trait]
pub trait Calibratable: QuotaRule {
    async fn calibrate(&self, observed_pin_size: i64);
}

/// Fixed absolute ceiling.
pub struct MaxSizeRule {
    pub soft_limit: i64,
    pub hard_limit: i64,
    pub target_limit: i64,
}

impl QuotaRule for MaxSizeRule {
    fn name(&self) -> &str {
        "MaxSize"
    }

    fn is_inside_soft_limit(&self, usage: i64) -> bool {
        usage <= self.soft_limit
    }

    fn is_inside_hard_limit(&self, usage: i64) -> bool {
        usage <= self.hard_limit
    }

    fn is_inside_target_limit(&self, usage: i64) -> bool {
        usage <= self.target_limit
    }
}

/// Ceiling expressed as "leave at least N% of the filesystem free",
/// evaluated against a caller-supplied total disk size.
pub struct DiskFreePercentRule {
    pub total_disk_bytes: i64,
    pub soft_free_percent: f64,
    pub hard_free_percent: f64,
    pub target_free_percent: f64,
}

impl DiskFreePercentRule {
    fn max_usage(&self, free_percent: f64) -> i64 {
        let reserved_fraction = (free_percent / 100.0).clamp(0.0, 1.0);
        ((self.total_disk_bytes as f64) * (1.0 - reserved_fraction)) as i64
    }
}

impl QuotaRule for DiskFreePercentRule {
    fn name(&self) -> &str {
        "DiskFreePercent"
    }

    fn is_inside_soft_limit(&self, usage: i64) -> bool {
        usage <= self.max_usage(self.soft_free_percent)
    }

    fn is_inside_hard_limit(&self, usage: i64) -> bool {
        usage <= self.max_usage(self.hard_free_percent)
    }

    fn is_inside_target_limit(&self, usage: i64) -> bool {
        usage <= self.max_usage(self.target_free_percent)
    }
}

/// Learns a ceiling from the recent history of pin (reservation) sizes,
/// rather than a fixed configured number -- §4.4 "learns from pin-size
/// history". Calibration recomputes the ceiling as a multiple of the
/// largest observed pin.
pub struct ElasticSizeRule {
    pub headroom_multiplier: f64,
    ceiling: std::sync::atomic::AtomicI64,
}

impl ElasticSizeRule {
    pub fn new(initial_ceiling: i64, headroom_multiplier: f64) -> Self {
        Self { headroom_multiplier, ceiling: std::sync::atomic::AtomicI64::new(initial_ceiling) }
    }

    fn ceiling(&self) -> i64 {
        self.ceiling.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl QuotaRule for ElasticSizeRule {
    fn name(&self) -> &str {
        "ElasticSize"
    }

    fn is_inside_soft_limit(&self, usage: i64) -> bool {
        usage <= self.ceiling()
    }

    fn is_inside_hard_limit(&self, usage: i64) -> bool {
        usage <= (self.ceiling() as f64 * self.headroom_multiplier) as i64
    }

    fn is_inside_target_limit(&self, usage: i64) -> bool {
        usage <= self.ceiling()
    }

    fn can_be_calibrated(&self) -> bool {
        true
    }

    fn as_calibratable(&self) -> Option<&dyn Calibratable> {
        Some(self)
    }
}

#[async_trait]
impl Calibratable for ElasticSizeRule {
    async fn calibrate(&self, observed_pin_size: i64) {
        let new_ceiling = (observed_pin_size as f64 * self.headroom_multiplier) as i64;
        self.ceiling.store(new_ceiling.max(observed_pin_size), std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn max_size_rule_respects_each_limit() {
        let rule = MaxSizeRule { soft_limit: 100, hard_limit: 200, target_limit: 50 };
        assert!(rule.is_inside_soft_limit(100));
        assert!(!rule.is_inside_soft_limit(101));
        assert!(rule.is_inside_hard_limit(200));
        assert!(!rule.is_inside_hard_limit(201));
        assert!(rule.is_inside_target_limit(50));
        assert!(!rule.is_inside_target_limit(51));
    }

    #[test]
    fn disk_free_percent_rule_scales_with_total() {
        let rule = DiskFreePercentRule {
            total_disk_bytes: 1_000,
            soft_free_percent: 20.0,
            hard_free_percent: 10.0,
            target_free_percent: 30.0,
        };
        assert!(rule.is_inside_soft_limit(800));
        assert!(!rule.is_inside_soft_limit(801));
        assert!(rule.is_inside_hard_limit(900));
        assert!(!rule.is_inside_hard_limit(901));
    }

    #[tokio::test]
    async fn elastic_size_rule_recalibrates_ceiling() {
        let rule = ElasticSizeRule::new(100, 1.5);
        assert!(rule.is_inside_soft_limit(100));
        assert!(!rule.is_inside_soft_limit(101));

        rule.calibrate(1_000).await;
        assert!(rule.is_inside_soft_limit(1_000));
        assert!(rule.is_inside_hard_limit(1_500));
        assert!(!rule.is_inside_hard_limit(1_501));
    }
}
