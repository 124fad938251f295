//! Sliding-window rate limiting (§4.5): total, per-service, per-edge
//! (stats-only), and kill-switch tiers. Grounded on the bucketed,
//! lock-light counter idiom of `peer_manager/trust_metric.rs`'s
//! `FadedMemory`/`History`, adapted from a decaying weighted average to a
//! fixed-size rotating bucket sum.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::RouterConfig;
use crate::identifiers::ServiceName;

/// A rotating-bucket request counter. `rps()` sums all buckets and divides
/// by the period length in seconds, so it behaves like a moving average
/// over the last `period`.
struct BucketCounter {
    buckets: Mutex<Vec<u64>>,
    bucket_stamp_ms: Mutex<Vec<u64>>,
    num_buckets: usize,
    bucket_width_ms: u64,
    limit: AtomicU64,
}

impl BucketCounter {
    fn new(num_buckets: usize, period_ms: u64, limit: u64) -> Self {
        let num_buckets = num_buckets.max(1);
        BucketCounter {
            buckets: Mutex::new(vec![0; num_buckets]),
            bucket_stamp_ms: Mutex::new(vec![0; num_buckets]),
            num_buckets,
            bucket_width_ms: (period_ms / num_buckets as u64).max(1),
            limit: AtomicU64::new(limit),
        }
    }

    fn bucket_index(&self, now_ms: u64) -> usize {
        ((now_ms / self.bucket_width_ms) as usize) % self.num_buckets
    }

    /// Zero out any bucket whose stamp has fallen outside the window.
    fn rotate(&self, now_ms: u64) {
        let mut buckets = self.buckets.lock();
        let mut stamps = self.bucket_stamp_ms.lock();
        let current_window = now_ms / self.bucket_width_ms;
        for i in 0..self.num_buckets {
            let bucket_window = stamps[i] / self.bucket_width_ms;
            if current_window.saturating_sub(bucket_window) >= self.num_buckets as u64 {
                buckets[i] = 0;
            }
        }
        let idx = self.bucket_index(now_ms);
        if stamps[idx] / self.bucket_width_ms != current_window {
            buckets[idx] = 0;
            stamps[idx] = now_ms;
        }
    }

    fn increment(&self, now_ms: u64) {
        self.rotate(now_ms);
        let idx = self.bucket_index(now_ms);
        self.buckets.lock()[idx] += 1;
    }

    fn sum(&self, now_ms: u64) -> u64 {
        self.rotate(now_ms);
        self.buckets.lock().iter().sum()
    }

    fn rps(&self, now_ms: u64, period_ms: u64) -> f64 {
        self.sum(now_ms) as f64 / (period_ms as f64 / 1000.0)
    }

    fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Release);
    }

    fn limit(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }
}

pub struct RateLimiter {
    num_buckets: usize,
    period_ms: u64,
    total: BucketCounter,
    total_kill_switch: BucketCounter,
    services: RwLock<HashMap<ServiceName, BucketCounter>>,
    service_kill_switch: RwLock<HashMap<ServiceName, BucketCounter>>,
    edges: RwLock<HashMap<String, BucketCounter>>,
    exempt_services: RwLock<HashSet<ServiceName>>,
    default_service_limit: AtomicU64,
    kill_switch_buffer: Mutex<f64>,
    enabled: std::sync::atomic::AtomicBool,
}

impl RateLimiter {
    pub fn new(cfg: &RouterConfig) -> Self {
        let ks_buffer = cfg.total_kill_switch_buffer;
        RateLimiter {
            num_buckets: cfg.rate_limiter_num_buckets,
            period_ms: cfg.rate_limiter_period_ms,
            total: BucketCounter::new(
                cfg.rate_limiter_num_buckets,
                cfg.rate_limiter_period_ms,
                cfg.total_rps_limit,
            ),
            total_kill_switch: BucketCounter::new(
                cfg.rate_limiter_num_buckets,
                cfg.rate_limiter_period_ms,
                (cfg.total_rps_limit as f64 * ks_buffer) as u64,
            ),
            services: RwLock::new(HashMap::new()),
            service_kill_switch: RwLock::new(HashMap::new()),
            edges: RwLock::new(HashMap::new()),
            exempt_services: RwLock::new(HashSet::new()),
            default_service_limit: AtomicU64::new(cfg.total_rps_limit),
            kill_switch_buffer: Mutex::new(ks_buffer),
            enabled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn is_exempt(&self, sn: &ServiceName) -> bool {
        self.exempt_services.read().contains(sn)
    }

    /// Lazily create the per-service and kill-switch counters for `sn`,
    /// seeded from the current default limit, if they don't exist yet.
    fn ensure_service_counters(&self, sn: &ServiceName) {
        if self.services.read().contains_key(sn) {
            return;
        }
        let limit = self.default_service_limit.load(Ordering::Acquire);
        self.services.write().entry(sn.clone()).or_insert_with(|| {
            BucketCounter::new(self.num_buckets, self.period_ms, limit)
        });
        let ks_buffer = *self.kill_switch_buffer.lock();
        self.service_kill_switch.write().entry(sn.clone()).or_insert_with(|| {
            BucketCounter::new(self.num_buckets, self.period_ms, (limit as f64 * ks_buffer) as u64)
        });
    }

    /// Increment the (cn, sn) edge counter. Stats-only; never gates.
    pub fn record_edge(&self, edge_key: &str, now_ms: u64) {
        if !self.edges.read().contains_key(edge_key) {
            self.edges
                .write()
                .entry(edge_key.to_owned())
                .or_insert_with(|| BucketCounter::new(self.num_buckets, self.period_ms, u64::MAX));
        }
        if let Some(c) = self.edges.read().get(edge_key) {
            c.increment(now_ms);
        }
    }

    pub fn should_kill_switch_total(&self, now_ms: u64) -> bool {
        self.total_kill_switch.sum(now_ms) >= self.total_kill_switch.limit()
    }

    pub fn should_kill_switch_service(&self, sn: &ServiceName, now_ms: u64) -> bool {
        if self.is_exempt(sn) {
            return false;
        }
        self.ensure_service_counters(sn);
        self.service_kill_switch
            .read()
            .get(sn)
            .map(|c| c.sum(now_ms) >= c.limit())
            .unwrap_or(false)
    }

    pub fn increment_kill_switch_counters(&self, sn: &ServiceName, is_exit: bool, now_ms: u64) {
        self.total_kill_switch.increment(now_ms);
        if is_exit {
            self.ensure_service_counters(sn);
            if let Some(c) = self.service_kill_switch.read().get(sn) {
                c.increment(now_ms);
            }
        }
    }

    pub fn should_rate_limit_total(&self, now_ms: u64) -> bool {
        self.total.sum(now_ms) >= self.total.limit()
    }

    pub fn should_rate_limit_service(&self, sn: &ServiceName, now_ms: u64) -> bool {
        if self.is_exempt(sn) {
            return false;
        }
        self.ensure_service_counters(sn);
        self.services
            .read()
            .get(sn)
            .map(|c| c.sum(now_ms) >= c.limit())
            .unwrap_or(false)
    }

    pub fn increment_request_counters(&self, sn: &ServiceName, is_exit: bool, now_ms: u64) {
        self.total.increment(now_ms);
        if is_exit {
            self.ensure_service_counters(sn);
            if let Some(c) = self.services.read().get(sn) {
                c.increment(now_ms);
            }
        }
    }

    pub fn total_rps(&self, now_ms: u64) -> f64 {
        self.total.rps(now_ms, self.period_ms)
    }

    pub fn total_limit(&self) -> u64 {
        self.total.limit()
    }

    pub fn service_limit(&self, sn: &ServiceName) -> u64 {
        self.ensure_service_counters(sn);
        self.services.read().get(sn).map(|c| c.limit()).unwrap_or(0)
    }

    /// Update the total RPS limit without resetting counters (§4.5).
    pub fn update_total_limit(&self, limit: u64) {
        self.total.set_limit(limit);
        self.total_kill_switch
            .set_limit((limit as f64 * *self.kill_switch_buffer.lock()) as u64);
    }

    pub fn update_service_limit(&self, sn: &ServiceName, limit: u64) {
        self.ensure_service_counters(sn);
        let ks_buffer = *self.kill_switch_buffer.lock();
        if let Some(c) = self.services.read().get(sn) {
            c.set_limit(limit);
        }
        if let Some(c) = self.service_kill_switch.read().get(sn) {
            c.set_limit((limit as f64 * ks_buffer) as u64);
        }
    }

    pub fn update_rps_limit_for_all_services(&self, limits: &HashMap<ServiceName, u64>) {
        for (sn, limit) in limits {
            self.update_service_limit(sn, *limit);
        }
    }

    pub fn update_exempt_services(&self, exempt: HashSet<ServiceName>) {
        *self.exempt_services.write() = exempt;
    }

    pub fn update_default_service_limit(&self, limit: u64) {
        self.default_service_limit.store(limit, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::*;

    fn cfg() -> RouterConfig {
        let mut c = RouterConfig::default();
        c.rate_limiter_num_buckets = 4;
        c.rate_limiter_period_ms = 1_000;
        c.total_rps_limit = 3;
        c
    }

    fn sn(s: &str) -> ServiceName {
        ServiceName::new(s).unwrap()
    }

    #[test]
    fn total_limit_trips_after_threshold() {
        let rl = RateLimiter::new(&cfg());
        for _ in 0..3 {
            assert!(!rl.should_rate_limit_total(0));
            rl.increment_request_counters(&sn("steve"), false, 0);
        }
        assert!(rl.should_rate_limit_total(0));
    }

    #[test]
    fn service_limit_independent_of_total() {
        let rl = RateLimiter::new(&cfg());
        rl.update_service_limit(&sn("steve"), 2);
        rl.increment_request_counters(&sn("steve"), true, 0);
        rl.increment_request_counters(&sn("steve"), true, 0);
        assert!(rl.should_rate_limit_service(&sn("steve"), 0));
    }

    #[test]
    fn exempt_service_never_limited() {
        let rl = RateLimiter::new(&cfg());
        rl.update_exempt_services(vec![sn("steve")].into_iter().collect());
        rl.update_service_limit(&sn("steve"), 1);
        rl.increment_request_counters(&sn("steve"), true, 0);
        rl.increment_request_counters(&sn("steve"), true, 0);
        assert!(!rl.should_rate_limit_service(&sn("steve"), 0));
    }

    #[test]
    fn update_total_limit_preserves_counters() {
        let rl = RateLimiter::new(&cfg());
        rl.increment_request_counters(&sn("steve"), false, 0);
        rl.increment_request_counters(&sn("steve"), false, 0);
        rl.update_total_limit(10);
        assert_eq!(rl.total.sum(0), 2);
        assert!(!rl.should_rate_limit_total(0));
    }

    #[test]
    fn window_rolls_off_old_buckets() {
        let rl = RateLimiter::new(&cfg());
        rl.increment_request_counters(&sn("steve"), false, 0);
        rl.increment_request_counters(&sn("steve"), false, 0);
        rl.increment_request_counters(&sn("steve"), false, 0);
        assert!(rl.should_rate_limit_total(0));
        // advance well past the window
        assert!(!rl.should_rate_limit_total(5_000));
    }

    /// The total limit's boundary-crossing behavior (§4.5): issued within a
    /// single bucket window, the limit trips iff the request count reaches
    /// it, for any count/limit pair, not just the one fixed example above.
    #[quickcheck]
    fn total_limit_trips_exactly_at_boundary(n_requests: u8, limit: u8) -> bool {
        let mut c = cfg();
        c.total_rps_limit = limit as u64;
        let rl = RateLimiter::new(&c);

        for _ in 0..n_requests {
            rl.increment_request_counters(&sn("steve"), false, 0);
        }

        rl.should_rate_limit_total(0) == (n_requests as u64 >= limit as u64)
    }
}
