//! The admission pipeline and service-routing glue (§4.2), grounded on
//! `core-network`'s `service.rs` (`NetworkService`, the struct that wires
//! together `PeerManager`, `MessageRouter`, `Metrics`, and the RPC map) and
//! `peer_manager/mod.rs`'s `PeerManager` (event-driven peer lifecycle).

pub mod service_channel;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::blocking::BlockingTable;
use crate::circuit::{Circuit, CircuitConfig, CircuitRegistry};
use crate::common::now_ms;
use crate::config::{RemoteConfig, RouterConfig};
use crate::context::RequestContext;
use crate::error::WireError;
use crate::identifiers::{edge_key, unnamed_caller, HostPort, ServiceName};
use crate::interval_scanner::IntervalScanner;
use crate::partial_range::PartialRange;
use crate::peer_index::{PeerIndex, PruneReason};
use crate::rate_limiter::RateLimiter;
use crate::ring::RingView;
use crate::stats::StatsSink;
use crate::transport::{ConnectionDirection, DrainGoal, Transport, TransportError};

use service_channel::{ChannelMode, ServiceChannel};

/// The outcome of running a request through admission: either it should be
/// dispatched to a peer, or it was rejected/dropped and nothing further
/// happens.
#[derive(Debug, PartialEq)]
pub enum Admission {
    Dispatch { target_service: ServiceName, peers: Vec<HostPort> },
    Reject(WireError),
    /// Blocked or kill-switched: no response frame at all.
    Drop,
}

/// Per-router dispatch core: owns the service-channel table, the peer
/// indices, rate limiter, circuit registry, and blocking table, and
/// reconciles all of them against ring membership changes.
pub struct Dispatcher<R, T> {
    self_host_port: HostPort,
    config: RouterConfig,
    ring: Arc<R>,
    transport: Arc<T>,
    stats: Arc<dyn StatsSink>,

    channels: RwLock<HashMap<ServiceName, ServiceChannel>>,
    peer_index: PeerIndex,
    blocking: BlockingTable,
    pub rate_limiter: RateLimiter,
    pub circuits: CircuitRegistry,

    partial_affinity_enabled: AtomicBool,
    /// Gates the admission-pipeline "missing cn header" rejection (§4.2
    /// step 3, lazy-handling path only). Off by default, like rate
    /// limiting and circuits, until a polled `RemoteConfig` turns it on.
    lazy_handling_enabled: AtomicBool,
    /// Shared with any `IntervalScanner` built by `reap_scanner` so a
    /// polled `peer_reaper_period_ms` retunes its cadence directly.
    reap_period_ms: Arc<AtomicU64>,
}

impl<R, T> Dispatcher<R, T>
where
    R: RingView,
    T: Transport,
{
    pub fn new(
        self_host_port: HostPort,
        config: RouterConfig,
        ring: Arc<R>,
        transport: Arc<T>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(&config);
        let circuits = CircuitRegistry::new(CircuitConfig::from(&config), stats.clone());
        let partial_affinity_enabled = AtomicBool::new(config.partial_affinity_enabled);
        let reap_period_ms = Arc::new(AtomicU64::new(config.peer_reap_period_ms));

        Dispatcher {
            self_host_port,
            config,
            ring,
            transport,
            stats,
            channels: RwLock::new(HashMap::new()),
            peer_index: PeerIndex::new(),
            blocking: BlockingTable::new(),
            rate_limiter,
            circuits,
            partial_affinity_enabled,
            lazy_handling_enabled: AtomicBool::new(false),
            reap_period_ms,
        }
    }

    pub fn block(&self, cn: &str, sn: &str) {
        self.blocking.block(cn, sn);
    }

    pub fn unblock(&self, cn: &str, sn: &str) {
        self.blocking.unblock(cn, sn);
    }

    /// Apply a freshly polled remote-config snapshot (§6) to every
    /// subsystem that has one.
    pub fn apply_remote_config(&self, remote: &RemoteConfig) {
        self.circuits.set_enabled(remote.circuits_enabled);
        self.rate_limiter.set_enabled(remote.rate_limiting_enabled);
        if let Some(limit) = remote.total_rps_limit {
            self.rate_limiter.update_total_limit(limit);
        }
        self.rate_limiter.update_exempt_services(
            remote
                .exempt_services
                .iter()
                .filter_map(|s| ServiceName::new(s.clone()).ok())
                .collect(),
        );
        let mut limits = HashMap::new();
        for (sn, limit) in &remote.rps_limit_for_service_name {
            if let Ok(sn) = ServiceName::new(sn.clone()) {
                limits.insert(sn, *limit);
            }
        }
        self.rate_limiter.update_rps_limit_for_all_services(&limits);
        self.blocking.apply_remote_kill_switch(remote.kill_switch.clone());
        self.partial_affinity_enabled
            .store(remote.partial_affinity_enabled, Ordering::Release);
        self.lazy_handling_enabled
            .store(remote.lazy_handling_enabled, Ordering::Release);

        if remote.k_value_default.is_some() || !remote.k_value_services.is_empty() {
            let default_k = remote.k_value_default.unwrap_or(self.config.default_k_value);
            let overrides: HashMap<ServiceName, usize> = remote
                .k_value_services
                .iter()
                .filter_map(|(sn, k)| ServiceName::new(sn.clone()).ok().map(|sn| (sn, *k)))
                .collect();
            self.ring.set_k_values(default_k, &overrides);
        }

        if let Some(period_ms) = remote.peer_reaper_period_ms {
            self.reap_period_ms.store(period_ms, Ordering::Release);
        }
    }

    /// Handle shared with any `IntervalScanner` built by [`reap_scanner`],
    /// so a polled `peer_reaper_period_ms` retunes that scanner's cadence.
    pub fn reap_period_handle(&self) -> Arc<AtomicU64> {
        self.reap_period_ms.clone()
    }

    fn is_exit_for(&self, sn: &ServiceName) -> bool {
        self.ring.is_exit_for(sn, &self.self_host_port)
    }

    fn partial_affinity_enabled(&self) -> bool {
        self.partial_affinity_enabled.load(Ordering::Acquire)
    }

    // --- admission (§4.2) -------------------------------------------------

    /// Run the full admission pipeline for an inbound request. Returns the
    /// decision; the caller (the transport-facing layer) is responsible for
    /// actually sending a response frame, or sending none at all on `Drop`.
    pub fn admit(&self, req: &RequestContext) -> Admission {
        let now = now_ms();
        // `ServiceName` rejects the empty string at construction, so the
        // "no service name given" rejection (§4.2 step 2) is enforced by
        // `RequestContext` never holding one in the first place.
        let effective_sn = req.effective_service_name().clone();

        // §4.2 step 3: under lazy handling, a request with no `cn` header
        // is rejected outright rather than silently assigned the sentinel
        // caller name.
        if self.lazy_handling_enabled.load(Ordering::Acquire) && req.caller_name.is_none() {
            return Admission::Reject(WireError::BadRequest("missing cn header".to_owned()));
        }

        let cn = match &req.caller_name {
            Some(cn) => cn.clone(),
            None => unnamed_caller(),
        };

        if self.blocking.is_blocked(cn.as_str(), effective_sn.as_str()) {
            self.stats.request_blocked(cn.as_str(), effective_sn.as_str());
            return Admission::Drop;
        }

        if self.rate_limiter.is_enabled() {
            if let Some(outcome) = self.admit_rate_limit(&cn, &effective_sn, now) {
                return outcome;
            }
        }

        let peers = self.peers_for(&effective_sn);
        Admission::Dispatch {
            target_service: effective_sn,
            peers,
        }
    }

    fn admit_rate_limit(&self, cn: &crate::identifiers::CallerName, sn: &ServiceName, now: u64) -> Option<Admission> {
        self.rate_limiter.record_edge(&edge_key(cn.as_str(), sn.as_str()), now);

        let is_exit = self.is_exit_for(sn);

        if self.rate_limiter.should_kill_switch_total(now)
            || (is_exit && self.rate_limiter.should_kill_switch_service(sn, now))
        {
            self.rate_limiter.increment_kill_switch_counters(sn, is_exit, now);
            self.stats.request_kill_switched(sn);
            return Some(Admission::Drop);
        }
        self.rate_limiter.increment_kill_switch_counters(sn, is_exit, now);

        if self.rate_limiter.should_rate_limit_total(now) {
            self.stats.request_rate_limited(sn, "total rps");
            return Some(Admission::Reject(WireError::Busy(format!(
                "hyperbahn node is rate-limited by the total rps of {}",
                self.rate_limiter.total_limit()
            ))));
        }

        if is_exit && self.rate_limiter.should_rate_limit_service(sn, now) {
            self.stats.request_rate_limited(sn, "service rps");
            return Some(Admission::Reject(WireError::Busy(format!(
                "{} is rate-limited by the service rps of {}",
                sn,
                self.rate_limiter.service_limit(sn)
            ))));
        }

        self.rate_limiter.increment_request_counters(sn, is_exit, now);
        None
    }

    /// Resolve the circuit gating one admitted request's dispatch to a
    /// specific endpoint, and record its outcome once known. Kept separate
    /// from `admit` because the endpoint name, and the outcome, are only
    /// known after peer selection / the relay call completes.
    pub fn circuit_for(&self, req: &RequestContext) -> Result<Circuit, WireError> {
        self.circuits.circuit_for_request(req, now_ms())
    }

    /// Record a completed dispatch's outcome against its circuit.
    /// `Declined`/`Unhealthy` outcomes never reach here (the circuit itself
    /// rejected them before a forward was attempted); everything else's
    /// classification comes from [`WireError::counts_toward_circuit_errors`]
    /// rather than requiring the caller to classify it (§4.3, §7).
    pub fn record_dispatch_result(&self, req: &RequestContext, outcome: &Result<(), WireError>) {
        let is_error = match outcome {
            Ok(()) => false,
            Err(e) => e.counts_toward_circuit_errors(),
        };
        let cn = req.caller_name.clone().unwrap_or_else(unnamed_caller);
        self.circuits.record_result(
            req.effective_service_name(),
            &cn,
            &req.endpoint_name,
            is_error,
            now_ms(),
        );
    }

    /// Run a request through the full admission pipeline, forward it to a
    /// selected peer, and record the outcome against its circuit — the
    /// production relay-completion path that ties admission, the circuit
    /// registry, and the transport together (§2, §4.2, §4.3).
    pub async fn dispatch(&self, req: &RequestContext) -> Result<(), WireError> {
        let peers = match self.admit(req) {
            Admission::Dispatch { peers, .. } => peers,
            Admission::Reject(e) => return Err(e),
            Admission::Drop => return Ok(()),
        };

        self.circuit_for(req)?;

        let peer = match peers.first() {
            Some(hp) => hp.clone(),
            None => return Err(WireError::Declined("no peer available for request".to_owned())),
        };

        let outcome = self
            .transport
            .forward(&peer, self.config.request_forward_timeout())
            .await
            .map_err(|e| match e {
                TransportError::Timeout(_) => WireError::Timeout(e.to_string()),
                _ => WireError::NetworkError(e.to_string()),
            });

        self.record_dispatch_result(req, &outcome);
        outcome
    }

    fn peers_for(&self, sn: &ServiceName) -> Vec<HostPort> {
        self.channels
            .read()
            .get(sn)
            .map(|ch| ch.peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    // --- service channel lifecycle (§4.2) ----------------------------------

    /// Get or lazily create the service channel for `sn`, deriving its mode
    /// from ring membership.
    fn ensure_channel(&self, sn: &ServiceName) {
        if self.channels.read().contains_key(sn) {
            return;
        }
        let channel = if self.is_exit_for(sn) {
            ServiceChannel::new_exit(sn.clone())
        } else {
            ServiceChannel::new_forward(sn.clone(), self.ring.exits_for(sn))
        };
        self.channels.write().entry(sn.clone()).or_insert(channel);
    }

    /// Handle an inbound `relay-ad` for one (service, host_port) pair
    /// (§4.2 "peer refresh on advertise"). No-ops in forward mode.
    pub async fn refresh_service_peer(&self, sn: &ServiceName, hp: &HostPort) {
        self.ensure_channel(sn);
        let now = now_ms();

        let is_exit_mode = matches!(
            self.channels.read().get(sn).map(|c| c.mode),
            Some(ChannelMode::Exit)
        );
        if !is_exit_mode {
            log::debug!("dropping advertise for {} (not exit for this service)", sn);
            return;
        }

        if self.partial_affinity_enabled() {
            {
                let mut channels = self.channels.write();
                if let Some(ch) = channels.get_mut(sn) {
                    ch.add_worker(hp.clone());
                }
            }
            self.peer_index.mark_known(hp, sn, now);
            self.ensure_partial_connections(sn, now).await;
        } else {
            self.peer_index.cancel_prune(hp);
            self.peer_index.mark_known(hp, sn, now);
            {
                let mut channels = self.channels.write();
                if let Some(ch) = channels.get_mut(sn) {
                    ch.add_worker(hp.clone());
                }
            }
            self.peer_index.connect(sn, hp);
            if let Err(e) = self.transport.ensure_connected(hp).await {
                log::warn!("failed to connect to peer {}: {}", hp, e);
            }
            let count = self.peer_index.connected_peers_for_service(sn).len();
            self.stats.peer_connected(sn, count);
        }
        log::info!("peer {} advertised for service {}", hp, sn);
    }

    /// Handle an inbound `relay-unad` for one (service, host_port) pair.
    pub async fn remove_service_peer(&self, sn: &ServiceName, hp: &HostPort) {
        {
            let mut channels = self.channels.write();
            if let Some(ch) = channels.get_mut(sn) {
                ch.remove_worker(hp);
            }
        }
        self.peer_index.forget(hp, sn);

        if self.partial_affinity_enabled() {
            let now = now_ms();
            self.recompute_partial_range(sn);
            self.ensure_partial_connections(sn, now).await;
            return;
        }

        self.peer_index.disconnect(sn, hp);
        let count = self.peer_index.connected_peers_for_service(sn).len();
        self.stats.peer_disconnected(sn, count);

        if self.peer_index.has_any_service(hp) {
            log::debug!("peer {} still serves other services, not closing", hp);
            return;
        }

        self.transport
            .drain(hp, DrainGoal::ClosePeer, self.config.drain_timeout())
            .await;
    }

    fn recompute_partial_range(&self, sn: &ServiceName) {
        let mut channels = self.channels.write();
        let ch = match channels.get_mut(sn) {
            Some(ch) => ch,
            None => return,
        };
        let relays = self.ring.exits_for(sn).into_iter().collect::<Vec<_>>();
        let mut relays = relays;
        relays.sort();
        let workers = ch.workers_sorted();
        ch.partial_range = PartialRange::compute(
            &relays,
            &workers,
            &self.self_host_port,
            self.config.min_peers_per_worker,
            self.config.min_peers_per_relay,
        );
    }

    /// Reconcile this service's held connections against its current
    /// affine window (§4.4 `ensure_partial_connections`).
    async fn ensure_partial_connections(&self, sn: &ServiceName, now: u64) {
        self.recompute_partial_range(sn);

        let affine: HashSet<HostPort> = self
            .channels
            .read()
            .get(sn)
            .and_then(|ch| ch.partial_range.as_ref())
            .map(|pr| pr.affine_workers.iter().cloned().collect())
            .unwrap_or_default();

        debug_assert!(
            !(self.channels.read().get(sn).map(|c| !c.peers.is_empty()).unwrap_or(false) && affine.is_empty()),
            "partial affinity audit fail: service {} has workers but an empty affine window",
            sn
        );

        let currently_connected = self.peer_index.connected_peers_for_service(sn);

        let to_connect: Vec<HostPort> = affine.difference(&currently_connected).cloned().collect();
        let to_disconnect: Vec<HostPort> = currently_connected
            .difference(&affine)
            .filter(|hp| !self.peer_index.is_pending_prune(hp))
            .cloned()
            .collect();

        for hp in &to_connect {
            self.peer_index.cancel_prune(hp);
            self.peer_index.connect(sn, hp);
            if let Err(e) = self.transport.ensure_connected(hp).await {
                log::warn!("failed to connect affine peer {}: {}", hp, e);
            }
        }

        for hp in &to_disconnect {
            self.peer_index.disconnect(sn, hp);
            if !self.peer_index.has_any_service(hp) {
                self.peer_index.schedule_prune(hp, PruneReason::FellOutOfAffinity, now);
            }
        }

        let count = self.peer_index.connected_peers_for_service(sn).len();
        self.stats.peer_connected(sn, count);
    }

    // --- membership reconciliation (§4.2) ---------------------------------

    /// Recompute every known service channel's mode and peer set against
    /// current ring membership. Called on the ring's `changed` event.
    pub async fn update_service_channels(&self) {
        let service_names: Vec<ServiceName> = self.channels.read().keys().cloned().collect();

        for sn in service_names {
            let exits = self.ring.exits_for(&sn);
            let now_exit = self.is_exit_for(&sn);
            let was_exit = matches!(
                self.channels.read().get(&sn).map(|c| c.mode),
                Some(ChannelMode::Exit)
            );

            if was_exit && !now_exit {
                let workers: Vec<HostPort> = self
                    .channels
                    .read()
                    .get(&sn)
                    .map(|c| c.peers.iter().cloned().collect())
                    .unwrap_or_default();
                for hp in &workers {
                    self.peer_index.disconnect(&sn, hp);
                    if !self.peer_index.has_any_service(hp) {
                        self.transport.disconnect(hp, ConnectionDirection::Out).await;
                    }
                }
                if let Some(ch) = self.channels.write().get_mut(&sn) {
                    ch.change_to_forward(exits);
                }
                log::info!("service {} transitioned exit -> forward", sn);
            } else if !was_exit && now_exit {
                if let Some(ch) = self.channels.write().get_mut(&sn) {
                    ch.change_to_exit();
                }
                log::info!("service {} transitioned forward -> exit", sn);
            } else if !now_exit {
                if let Some(ch) = self.channels.write().get_mut(&sn) {
                    ch.peers = exits;
                }
            } else if self.partial_affinity_enabled() {
                self.ensure_partial_connections(&sn, now_ms()).await;
            }
        }

        self.circuits.update_services(self.ring.as_ref(), &self.self_host_port);
    }

    // --- periodic maintenance (§4.6, §5) -----------------------------------

    /// Close outbound connections to peers scheduled for pruning.
    pub async fn run_prune_tick(&self) {
        let now = now_ms();
        let scheduled = self.peer_index.drain_prune_list();
        for (hp, (since, _reason)) in scheduled {
            if now.saturating_sub(since) < self.config.peer_prune_period().as_millis() as u64 {
                self.peer_index.schedule_prune(&hp, PruneReason::FellOutOfAffinity, since);
                continue;
            }
            self.transport.disconnect(&hp, ConnectionDirection::Out).await;
        }
    }

    /// Reap peers that went silent for two consecutive reap windows.
    pub async fn run_reap_tick(&self) {
        let dead = self.peer_index.rotate_reap();
        for (hp, _services) in dead {
            log::info!("reaping dead peer {}", hp);
            self.transport.drain(&hp, DrainGoal::CloseDrained, self.config.drain_timeout()).await;
            for (_sn, ch) in self.channels.write().iter_mut() {
                ch.remove_worker(&hp);
            }
        }
    }

    /// Purge service channels whose advertisements have expired.
    pub fn run_purge_tick(&self) {
        let now = now_ms();
        let ttl = self.config.service_purge_period().as_millis() as u64;
        let expired: Vec<ServiceName> = self
            .channels
            .read()
            .iter()
            .filter(|(_, ch)| ch.is_expired(now, ttl))
            .map(|(sn, _)| sn.clone())
            .collect();
        for sn in expired {
            log::info!("purging expired service channel {}", sn);
            self.channels.write().remove(&sn);
        }
    }

    /// Emit the current connected-peer count for every known service
    /// (§4.6's stat-emit tick; §5).
    pub fn run_stat_emit_tick(&self) {
        for sn in self.known_service_names() {
            let count = self.peer_index.connected_peers_for_service(&sn).len();
            self.stats.peer_connected(&sn, count);
        }
    }

    pub fn known_service_names(&self) -> Vec<ServiceName> {
        self.channels.read().keys().cloned().collect()
    }

    pub fn peers_for_discovery(&self, sn: &ServiceName) -> (ChannelMode, Vec<HostPort>) {
        let channels = self.channels.read();
        match channels.get(sn) {
            Some(ch) => (ch.mode, ch.peers.iter().cloned().collect()),
            None => (ChannelMode::Forward, Vec::new()),
        }
    }
}

/// Build the four periodic maintenance scanners (§4.6, §5), each driven by
/// `dispatcher`'s configured period. `IntervalScanner`'s own poll loop is
/// synchronous, so the prune and reap ticks (which await transport calls)
/// spawn their tick as a background task each time they fire rather than
/// blocking the scanner future.
pub fn prune_scanner<R, T>(dispatcher: Arc<Dispatcher<R, T>>) -> IntervalScanner<impl FnMut(u64) + Send>
where
    R: RingView + 'static,
    T: Transport + 'static,
{
    let keys_d = dispatcher.clone();
    let tick_d = dispatcher.clone();
    IntervalScanner::new("peer-prune", dispatcher.config.peer_prune_period(), move |_now| {
        let d = tick_d.clone();
        tokio::spawn(async move { d.run_prune_tick().await });
    })
    .with_keys(move || keys_d.peer_index.pending_prune_host_ports())
}

pub fn reap_scanner<R, T>(dispatcher: Arc<Dispatcher<R, T>>) -> IntervalScanner<impl FnMut(u64) + Send>
where
    R: RingView + 'static,
    T: Transport + 'static,
{
    let keys_d = dispatcher.clone();
    let tick_d = dispatcher.clone();
    let period = dispatcher.reap_period_handle();
    IntervalScanner::with_shared_interval("peer-reap", period, move |_now| {
        let d = tick_d.clone();
        tokio::spawn(async move { d.run_reap_tick().await });
    })
    .with_keys(move || keys_d.peer_index.known_host_ports())
}

pub fn purge_scanner<R, T>(dispatcher: Arc<Dispatcher<R, T>>) -> IntervalScanner<impl FnMut(u64) + Send>
where
    R: RingView + 'static,
    T: Transport + 'static,
{
    let keys_d = dispatcher.clone();
    IntervalScanner::new("service-purge", dispatcher.config.service_purge_period(), move |_now| {
        dispatcher.run_purge_tick();
    })
    .with_keys(move || keys_d.known_service_names().iter().map(|sn| sn.to_string()).collect())
}

pub fn stat_emit_scanner<R, T>(dispatcher: Arc<Dispatcher<R, T>>) -> IntervalScanner<impl FnMut(u64) + Send>
where
    R: RingView + 'static,
    T: Transport + 'static,
{
    let keys_d = dispatcher.clone();
    IntervalScanner::new("stat-emit", dispatcher.config.stat_emit_period(), move |_now| {
        dispatcher.run_stat_emit_tick();
    })
    .with_keys(move || keys_d.known_service_names().iter().map(|sn| sn.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::identifiers::{CallerName, EndpointName};
    use crate::ring::StaticRing;
    use crate::stats::LogStatsSink;
    use crate::transport::MockTransport;

    lazy_static::lazy_static! {
        /// Shared default config fixture, in the style of the teacher's
        /// `test/mock.rs` lazily-built fixtures.
        static ref TEST_CONFIG: RouterConfig = RouterConfig::default();
    }

    fn dispatcher(self_hp: &str) -> Dispatcher<StaticRing, MockTransport> {
        let ring = Arc::new(StaticRing::new(10));
        let transport = Arc::new(MockTransport::new());
        let stats = Arc::new(LogStatsSink::default());
        Dispatcher::new(
            HostPort::new(self_hp).unwrap(),
            TEST_CONFIG.clone(),
            ring,
            transport,
            stats,
        )
    }

    fn sn(s: &str) -> ServiceName {
        ServiceName::new(s).unwrap()
    }
    fn hp(s: &str) -> HostPort {
        HostPort::new(s).unwrap()
    }

    #[test]
    fn admit_drops_blocked_request_silently() {
        let d = dispatcher("10.0.0.1:1");
        let req = RequestContext::new(ServiceName::new("x").unwrap(), EndpointName::new("y").unwrap())
            .with_caller_name(CallerName::new("alice").unwrap());
        d.block("alice", "x");
        assert_eq!(d.admit(&req), Admission::Drop);
    }

    #[test]
    fn admit_rejects_missing_cn_under_lazy_handling() {
        let d = dispatcher("10.0.0.1:1");
        let mut remote = RemoteConfig::default();
        remote.lazy_handling_enabled = true;
        d.apply_remote_config(&remote);

        let req = RequestContext::new(ServiceName::new("x").unwrap(), EndpointName::new("y").unwrap());
        assert_eq!(
            d.admit(&req),
            Admission::Reject(WireError::BadRequest("missing cn header".to_owned()))
        );
    }

    #[test]
    fn admit_allows_missing_cn_when_lazy_handling_disabled() {
        let d = dispatcher("10.0.0.1:1");
        d.ring.set_hosts(sn("steve"), vec![hp("10.0.0.1:1")]);
        let req = RequestContext::new(sn("steve"), EndpointName::new("y").unwrap());
        assert!(matches!(d.admit(&req), Admission::Dispatch { .. }));
    }

    #[test]
    fn apply_remote_config_updates_ring_k_values() {
        let d = dispatcher("10.0.0.1:1");
        d.ring.set_hosts(
            sn("steve"),
            vec![hp("10.0.0.1:1"), hp("10.0.0.2:1"), hp("10.0.0.3:1")],
        );

        let mut remote = RemoteConfig::default();
        remote.k_value_default = Some(1);
        d.apply_remote_config(&remote);

        assert_eq!(d.ring.exits_for(&sn("steve")).len(), 1);
    }

    #[test]
    fn apply_remote_config_retunes_reap_period() {
        let d = dispatcher("10.0.0.1:1");
        let mut remote = RemoteConfig::default();
        remote.peer_reaper_period_ms = Some(42);
        d.apply_remote_config(&remote);
        assert_eq!(d.reap_period_ms.load(Ordering::Acquire), 42);
    }

    #[tokio::test]
    async fn refresh_service_peer_adds_peer_in_exit_mode() {
        let d = dispatcher("10.0.0.1:1");
        d.ring.set_hosts(sn("steve"), vec![hp("10.0.0.1:1")]);
        d.refresh_service_peer(&sn("steve"), &hp("10.0.0.9:1")).await;
        let peers = d.peers_for(&sn("steve"));
        assert!(peers.contains(&hp("10.0.0.9:1")));
    }

    #[tokio::test]
    async fn refresh_service_peer_noop_in_forward_mode() {
        let d = dispatcher("10.0.0.1:1");
        d.ring.set_hosts(sn("steve"), vec![hp("10.0.0.2:1")]); // self is not exit
        d.refresh_service_peer(&sn("steve"), &hp("10.0.0.9:1")).await;
        let peers = d.peers_for(&sn("steve"));
        assert!(!peers.contains(&hp("10.0.0.9:1")));
    }

    #[tokio::test]
    async fn remove_service_peer_drains_when_last_service() {
        let d = dispatcher("10.0.0.1:1");
        d.ring.set_hosts(sn("steve"), vec![hp("10.0.0.1:1")]);
        d.refresh_service_peer(&sn("steve"), &hp("10.0.0.9:1")).await;
        d.remove_service_peer(&sn("steve"), &hp("10.0.0.9:1")).await;
        assert!(!d.peers_for(&sn("steve")).contains(&hp("10.0.0.9:1")));
        assert!(d.transport.drained_calls().iter().any(|(h, _)| h == &hp("10.0.0.9:1")));
    }

    #[tokio::test]
    async fn dispatch_forwards_to_peer_and_records_success() {
        let d = dispatcher("10.0.0.1:1");
        d.ring.set_hosts(sn("steve"), vec![hp("10.0.0.1:1")]);
        d.circuits.set_enabled(true);
        d.refresh_service_peer(&sn("steve"), &hp("10.1.0.1:1")).await;

        let req = RequestContext::new(sn("steve"), EndpointName::new("ifyousayso").unwrap())
            .with_caller_name(CallerName::new("bob").unwrap());

        d.dispatch(&req).await.unwrap();
        assert_eq!(d.transport.forwarded_calls(), vec![hp("10.1.0.1:1")]);
    }

    #[tokio::test]
    async fn dispatch_with_no_peers_declines() {
        let d = dispatcher("10.0.0.1:1");
        d.ring.set_hosts(sn("steve"), vec![hp("10.0.0.1:1")]);

        let req = RequestContext::new(sn("steve"), EndpointName::new("ifyousayso").unwrap())
            .with_caller_name(CallerName::new("bob").unwrap());

        let result = d.dispatch(&req).await;
        assert!(matches!(result, Err(WireError::Declined(_))));
    }

    #[tokio::test]
    async fn record_dispatch_result_excludes_declined_from_circuit_errors() {
        let mut cfg = RouterConfig::default();
        cfg.circuit_period_ms = 5;
        cfg.circuit_min_requests = 0;
        cfg.circuit_max_error_rate = 0.5;

        let ring = Arc::new(StaticRing::new(10));
        let transport = Arc::new(MockTransport::new());
        let stats = Arc::new(LogStatsSink::default());
        let d = Dispatcher::new(hp("10.0.0.1:1"), cfg, ring, transport, stats);
        d.circuits.set_enabled(true);

        let req = RequestContext::new(sn("steve"), EndpointName::new("ifyousayso").unwrap())
            .with_caller_name(CallerName::new("bob").unwrap());

        // `Declined` is excluded from the circuit error budget, so a run of
        // nothing but declines must not trip the circuit.
        for _ in 0..20 {
            d.record_dispatch_result(&req, &Err(WireError::Declined("unhealthy".to_owned())));
        }
        tokio::time::delay_for(Duration::from_millis(10)).await;
        let circuit = d.circuit_for(&req).unwrap();
        assert_eq!(circuit.state(), crate::circuit::CircuitState::Healthy);

        // A `NetworkError` does count, and enough of them trip the circuit.
        for _ in 0..20 {
            d.record_dispatch_result(&req, &Err(WireError::NetworkError("boom".to_owned())));
        }
        tokio::time::delay_for(Duration::from_millis(10)).await;
        let result = d.circuit_for(&req);
        assert!(matches!(result, Err(WireError::Declined(_))));
    }
}
