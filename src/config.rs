//! Static and polled configuration, mirroring the shape of `core-network`'s
//! `Config` (`#[derive(Debug, Deserialize)]` + `impl Default`) while adding
//! the polled `RemoteConfig` snapshot described by the dispatch core's
//! external interfaces.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_derive::Deserialize;

/// Bind-time configuration for a single router instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub caller_name: String,

    pub default_k_value: usize,

    pub relay_ad_timeout_ms: u64,
    pub relay_ad_retry_time_ms: u64,
    pub max_relay_ad_attempts: u32,
    pub discover_forward_timeout_ms: u64,
    pub request_forward_timeout_ms: u64,

    pub peer_prune_period_ms: u64,
    pub peer_reap_period_ms: u64,
    pub service_purge_period_ms: u64,
    pub stat_emit_period_ms: u64,
    pub drain_timeout_ms: u64,

    pub rate_limiter_num_buckets: usize,
    pub rate_limiter_period_ms: u64,
    pub total_rps_limit: u64,
    pub total_kill_switch_buffer: f64,

    pub circuit_period_ms: u64,
    pub circuit_min_requests: u64,
    pub circuit_max_error_rate: f64,
    pub circuit_probation: u64,

    pub partial_affinity_enabled: bool,
    pub min_peers_per_worker: usize,
    pub min_peers_per_relay: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            caller_name: "autobahn".to_owned(),

            default_k_value: 10,

            relay_ad_timeout_ms: 500,
            relay_ad_retry_time_ms: 1_000,
            max_relay_ad_attempts: 2,
            discover_forward_timeout_ms: 1_000,
            request_forward_timeout_ms: 2_000,

            peer_prune_period_ms: 2 * 60 * 1_000,
            peer_reap_period_ms: 5 * 60 * 1_000,
            service_purge_period_ms: 5 * 60 * 1_000,
            stat_emit_period_ms: 30 * 1_000,
            drain_timeout_ms: 30 * 1_000,

            rate_limiter_num_buckets: 10,
            rate_limiter_period_ms: 1_000,
            total_rps_limit: 10_000,
            total_kill_switch_buffer: 2.0,

            circuit_period_ms: 10_000,
            circuit_min_requests: 10,
            circuit_max_error_rate: 0.5,
            circuit_probation: 5,

            partial_affinity_enabled: false,
            min_peers_per_worker: 3,
            min_peers_per_relay: 3,
        }
    }
}

impl RouterConfig {
    pub fn relay_ad_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_ad_timeout_ms)
    }

    pub fn relay_ad_retry_time(&self) -> Duration {
        Duration::from_millis(self.relay_ad_retry_time_ms)
    }

    pub fn discover_forward_timeout(&self) -> Duration {
        Duration::from_millis(self.discover_forward_timeout_ms)
    }

    pub fn request_forward_timeout(&self) -> Duration {
        Duration::from_millis(self.request_forward_timeout_ms)
    }

    pub fn peer_prune_period(&self) -> Duration {
        Duration::from_millis(self.peer_prune_period_ms)
    }

    pub fn peer_reap_period(&self) -> Duration {
        Duration::from_millis(self.peer_reap_period_ms)
    }

    pub fn service_purge_period(&self) -> Duration {
        Duration::from_millis(self.service_purge_period_ms)
    }

    pub fn stat_emit_period(&self) -> Duration {
        Duration::from_millis(self.stat_emit_period_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn rate_limiter_period(&self) -> Duration {
        Duration::from_millis(self.rate_limiter_period_ms)
    }

    pub fn circuit_period(&self) -> Duration {
        Duration::from_millis(self.circuit_period_ms)
    }
}

/// A snapshot of the polled remote configuration surface (§6). Applied to
/// the rate limiter, circuit registry, and dispatcher via their
/// `apply_remote_config` methods every poll tick.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub circuits_enabled: bool,
    pub rate_limiting_enabled: bool,
    pub total_rps_limit: Option<u64>,
    pub exempt_services: HashSet<String>,
    pub rps_limit_for_service_name: HashMap<String, u64>,
    pub k_value_default: Option<usize>,
    pub k_value_services: HashMap<String, usize>,
    pub kill_switch: Vec<String>,
    pub peer_reaper_period_ms: Option<u64>,
    pub partial_affinity_enabled: bool,
    pub lazy_handling_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RouterConfig::default();
        assert_eq!(cfg.default_k_value, 10);
        assert_eq!(cfg.max_relay_ad_attempts, 2);
    }

    #[test]
    fn remote_config_defaults_disabled() {
        let rc = RemoteConfig::default();
        assert!(!rc.circuits_enabled);
        assert!(!rc.rate_limiting_enabled);
    }
}
