//! The stats/metrics sink is an external collaborator (§1), mirroring the
//! role `common-apm`'s gauges play for `core-network`'s `metrics.rs`. This
//! module defines the boundary trait plus a `log`-based default that simply
//! records events at `debug`, suitable for tests and small deployments.

use crate::circuit::CircuitState;
use crate::identifiers::{CallerName, EndpointName, ServiceName};

pub trait StatsSink: Send + Sync {
    fn peer_connected(&self, service: &ServiceName, peer_count: usize);
    fn peer_disconnected(&self, service: &ServiceName, peer_count: usize);
    fn request_blocked(&self, cn: &str, sn: &str);
    fn request_rate_limited(&self, sn: &ServiceName, reason: &str);
    fn request_kill_switched(&self, sn: &ServiceName);
    fn circuit_state_change(
        &self,
        sn: &ServiceName,
        cn: &CallerName,
        en: &EndpointName,
        old: CircuitState,
        new: CircuitState,
    );
}

/// Default sink: logs every event through the `log` facade at the density
/// the teacher crate uses for its own metrics reporter (`debug!` for
/// high-volume per-request events, `info!` for state transitions).
#[derive(Default)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn peer_connected(&self, service: &ServiceName, peer_count: usize) {
        log::debug!("service {} now has {} connected peers", service, peer_count);
    }

    fn peer_disconnected(&self, service: &ServiceName, peer_count: usize) {
        log::debug!("service {} now has {} connected peers", service, peer_count);
    }

    fn request_blocked(&self, cn: &str, sn: &str) {
        log::debug!("blocked request cn={} sn={}", cn, sn);
    }

    fn request_rate_limited(&self, sn: &ServiceName, reason: &str) {
        log::debug!("rate limited request to {}: {}", sn, reason);
    }

    fn request_kill_switched(&self, sn: &ServiceName) {
        log::debug!("kill-switched request to {}", sn);
    }

    fn circuit_state_change(
        &self,
        sn: &ServiceName,
        cn: &CallerName,
        en: &EndpointName,
        old: CircuitState,
        new: CircuitState,
    ) {
        log::info!(
            "circuit ({}, {}, {}) transitioned {:?} -> {:?}",
            sn,
            cn,
            en,
            old,
            new
        );
    }
}
