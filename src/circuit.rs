//! Per-(caller, service, endpoint) health circuit breakers (§4.3), grounded
//! on `peer_manager/trust_metric.rs`'s `Arc<Inner>` + atomics idiom: a
//! circuit is a small piece of shared, lock-light state mutated from many
//! call sites without an owning task of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::RouterConfig;
use crate::context::RequestContext;
use crate::error::WireError;
use crate::identifiers::{unnamed_caller, CallerName, EndpointName, ServiceName};
use crate::ring::RingView;
use crate::stats::StatsSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub period_ms: u64,
    pub min_requests: u64,
    pub max_error_rate: f64,
    pub probation: u64,
    /// Probe requests admitted per period while Unhealthy, so the circuit
    /// can observe recovery without reopening the floodgates.
    pub probes_per_period: u64,
}

impl From<&RouterConfig> for CircuitConfig {
    fn from(cfg: &RouterConfig) -> Self {
        CircuitConfig {
            period_ms: cfg.circuit_period_ms,
            min_requests: cfg.circuit_min_requests,
            max_error_rate: cfg.circuit_max_error_rate,
            probation: cfg.circuit_probation,
            probes_per_period: 1,
        }
    }
}

struct Inner {
    config: CircuitConfig,
    healthy: AtomicBool,
    period_start_ms: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
    probes_used: AtomicU64,
    consecutive_successes: AtomicU64,
}

/// A single circuit breaker. Cheaply cloneable (`Arc`-backed), so callers
/// can hold one across an await point while recording its outcome.
#[derive(Clone)]
pub struct Circuit {
    inner: Arc<Inner>,
}

impl Circuit {
    fn new(config: CircuitConfig, now_ms: u64) -> Self {
        Circuit {
            inner: Arc::new(Inner {
                config,
                healthy: AtomicBool::new(true),
                period_start_ms: AtomicU64::new(now_ms),
                requests: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                probes_used: AtomicU64::new(0),
                consecutive_successes: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.inner.healthy.load(Ordering::Acquire) {
            CircuitState::Healthy
        } else {
            CircuitState::Unhealthy
        }
    }

    /// Roll the period forward if it has elapsed, evaluating the just-ended
    /// window's error rate (Healthy branch) before resetting counters.
    fn maybe_roll_period(&self, now_ms: u64) -> Option<(CircuitState, CircuitState)> {
        let start = self.inner.period_start_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(start) < self.inner.config.period_ms {
            return None;
        }

        let requests = self.inner.requests.swap(0, Ordering::AcqRel);
        let errors = self.inner.errors.swap(0, Ordering::AcqRel);
        self.inner.probes_used.store(0, Ordering::Release);
        self.inner.period_start_ms.store(now_ms, Ordering::Release);

        let was_healthy = self.inner.healthy.load(Ordering::Acquire);
        if was_healthy
            && requests >= self.inner.config.min_requests
            && self.inner.config.min_requests > 0
            && (errors as f64 / requests as f64) > self.inner.config.max_error_rate
        {
            self.inner.healthy.store(false, Ordering::Release);
            self.inner.consecutive_successes.store(0, Ordering::Release);
            return Some((CircuitState::Healthy, CircuitState::Unhealthy));
        }
        // min_requests == 0 means "evaluate even with zero requests required";
        // treat any requests at all as eligible for evaluation.
        if was_healthy
            && self.inner.config.min_requests == 0
            && requests > 0
            && (errors as f64 / requests as f64) > self.inner.config.max_error_rate
        {
            self.inner.healthy.store(false, Ordering::Release);
            self.inner.consecutive_successes.store(0, Ordering::Release);
            return Some((CircuitState::Healthy, CircuitState::Unhealthy));
        }
        None
    }

    /// Whether a request should be admitted right now. Rolls the period as
    /// a side effect so callers don't need to drive it separately.
    pub fn should_request(&self, now_ms: u64) -> bool {
        self.maybe_roll_period(now_ms);
        if self.inner.healthy.load(Ordering::Acquire) {
            return true;
        }
        self.inner.probes_used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            if used < self.inner.config.probes_per_period {
                Some(used + 1)
            } else {
                None
            }
        }).is_ok()
    }

    /// Record the outcome of a request this circuit admitted.
    /// Returns `Some(transition)` if this call caused Unhealthy -> Healthy.
    pub fn record_result(&self, is_error: bool, now_ms: u64) -> Option<(CircuitState, CircuitState)> {
        self.maybe_roll_period(now_ms);
        self.inner.requests.fetch_add(1, Ordering::AcqRel);
        if is_error {
            self.inner.errors.fetch_add(1, Ordering::AcqRel);
        }

        if self.inner.healthy.load(Ordering::Acquire) {
            return None;
        }

        if is_error {
            self.inner.consecutive_successes.store(0, Ordering::Release);
            return None;
        }

        let successes = self.inner.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        if successes >= self.inner.config.probation {
            self.inner.healthy.store(true, Ordering::Release);
            self.inner.consecutive_successes.store(0, Ordering::Release);
            return Some((CircuitState::Unhealthy, CircuitState::Healthy));
        }
        None
    }
}

type EndpointMap = HashMap<EndpointName, Circuit>;
type CallerMap = HashMap<CallerName, EndpointMap>;

/// Three-level circuit registry: `service -> caller -> endpoint -> Circuit`
/// (§4.3). Circuits are created lazily in the Healthy state.
pub struct CircuitRegistry {
    config: RwLock<CircuitConfig>,
    enabled: AtomicBool,
    services: RwLock<HashMap<ServiceName, CallerMap>>,
    stats: Arc<dyn StatsSink>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig, stats: Arc<dyn StatsSink>) -> Self {
        CircuitRegistry {
            config: RwLock::new(config),
            enabled: AtomicBool::new(false),
            services: RwLock::new(HashMap::new()),
            stats,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn circuit_for(&self, sn: &ServiceName, cn: &CallerName, en: &EndpointName, now_ms: u64) -> Circuit {
        if let Some(circuit) = self
            .services
            .read()
            .get(sn)
            .and_then(|callers| callers.get(cn))
            .and_then(|endpoints| endpoints.get(en))
        {
            return circuit.clone();
        }

        let config = self.config.read().clone();
        let mut services = self.services.write();
        services
            .entry(sn.clone())
            .or_default()
            .entry(cn.clone())
            .or_default()
            .entry(en.clone())
            .or_insert_with(|| Circuit::new(config, now_ms))
            .clone()
    }

    /// Resolve the circuit gating `req`, or a [`WireError`] if it declines
    /// the request outright (§4.3's `circuit_for_request`).
    pub fn circuit_for_request(&self, req: &RequestContext, now_ms: u64) -> Result<Circuit, WireError> {
        if !self.enabled.load(Ordering::Acquire) {
            let cn = req.caller_name.clone().unwrap_or_else(unnamed_caller);
            return Ok(self.circuit_for(req.effective_service_name(), &cn, &req.endpoint_name, now_ms));
        }

        let cn = req.caller_name.clone().unwrap_or_else(unnamed_caller);
        let circuit = self.circuit_for(req.effective_service_name(), &cn, &req.endpoint_name, now_ms);
        if !circuit.should_request(now_ms) {
            return Err(WireError::Declined("Service is not healthy".to_owned()));
        }
        Ok(circuit)
    }

    /// Record a completed request's outcome and emit a stats event on any
    /// state transition.
    pub fn record_result(
        &self,
        sn: &ServiceName,
        cn: &CallerName,
        en: &EndpointName,
        is_error: bool,
        now_ms: u64,
    ) {
        let circuit = self.circuit_for(sn, cn, en, now_ms);
        if let Some((old, new)) = circuit.record_result(is_error, now_ms) {
            self.stats.circuit_state_change(sn, cn, en, old, new);
        }
    }

    /// Drop circuit subtrees for services this router no longer owns
    /// (called from `Dispatcher::update_service_channels`, §4.2).
    pub fn update_services(&self, ring: &dyn RingView, self_host_port: &crate::identifiers::HostPort) {
        self.services
            .write()
            .retain(|sn, _| ring.is_exit_for(sn, self_host_port));
    }

    pub fn known_service_count(&self) -> usize {
        self.services.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::EndpointName;

    fn cfg(min_requests: u64, max_error_rate: f64, probation: u64) -> CircuitConfig {
        CircuitConfig {
            period_ms: 10,
            min_requests,
            max_error_rate,
            probation,
            probes_per_period: 1,
        }
    }

    #[test]
    fn trips_unhealthy_after_error_budget_exceeded_in_period() {
        let c = Circuit::new(cfg(0, 0.5, 5), 0);
        for _ in 0..8 {
            c.record_result(true, 5);
        }
        for _ in 0..2 {
            c.record_result(false, 5);
        }
        // force period roll
        assert_eq!(c.state(), CircuitState::Healthy);
        c.should_request(20);
        assert_eq!(c.state(), CircuitState::Unhealthy);
    }

    #[test]
    fn recovers_after_probation_successes() {
        let c = Circuit::new(cfg(0, 0.5, 2), 0);
        for _ in 0..10 {
            c.record_result(true, 5);
        }
        c.should_request(20);
        assert_eq!(c.state(), CircuitState::Unhealthy);

        // Unhealthy circuits admit a bounded number of probes per period.
        assert!(c.should_request(25));
        c.record_result(false, 25);
        assert_eq!(c.state(), CircuitState::Unhealthy);

        c.should_request(40);
        assert!(c.should_request(45));
        c.record_result(false, 45);
        assert_eq!(c.state(), CircuitState::Healthy);
    }

    #[test]
    fn registry_creates_circuits_lazily_healthy() {
        let stats = Arc::new(crate::stats::LogStatsSink::default());
        let reg = CircuitRegistry::new(cfg(10, 0.5, 5), stats);
        reg.set_enabled(true);
        let req = RequestContext::new(
            ServiceName::new("steve").unwrap(),
            EndpointName::new("ifyousayso").unwrap(),
        );
        let circuit = reg.circuit_for_request(&req, 0).unwrap();
        assert_eq!(circuit.state(), CircuitState::Healthy);
    }

    #[test]
    fn missing_service_name_rejected_upstream_not_here() {
        // circuit_for_request itself doesn't validate service-name presence;
        // that's the dispatcher's job in step 2 of admission (§4.2).
    }
}
