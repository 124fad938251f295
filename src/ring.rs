//! The membership ring is an external collaborator (§1): this module only
//! defines the boundary trait the dispatcher consumes, plus an in-memory
//! test double. Modeled on `core-network`'s `traits.rs` seam traits
//! (`NetworkProtocol`, `MessageSender`) — a small `#[async_trait]`-free
//! interface plus a changed-event stream in the `PeerManagerEvent` idiom.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use parking_lot::RwLock;

use crate::identifiers::{HostPort, ServiceName};

/// Read-only projection of the consistent-hash ring (§4.1). Implementations
/// live outside this crate; production code wires this to the real gossip
/// layer. `changed()` yields a fresh receiver per call so every observer
/// (the dispatcher, tests) gets its own subscription.
pub trait RingView: Send + Sync {
    /// The K hosts currently responsible for `service`.
    fn exits_for(&self, service: &ServiceName) -> HashSet<HostPort>;

    /// Whether `self_host_port` is among the exits for `service`.
    fn is_exit_for(&self, service: &ServiceName, self_host_port: &HostPort) -> bool {
        self.exits_for(service).contains(self_host_port)
    }

    /// Subscribe to ring membership changes. Fired with no payload — the
    /// dispatcher's reaction is to recompute every known service's exits
    /// from scratch rather than diff incrementally.
    fn changed(&self) -> UnboundedReceiver<()>;

    /// Apply the router's K-value overrides (§6 remote-config surface):
    /// `default` is the replication factor for services with no specific
    /// override, `overrides` gives per-service ones. Implementations that
    /// derive K from elsewhere (a fixed gossip topology, say) may no-op.
    fn set_k_values(&self, default: usize, overrides: &HashMap<ServiceName, usize>);
}

/// Deterministic in-memory ring for tests. Not meant for production; the
/// K-value per service and the full host set are set directly rather than
/// derived from a gossiped topology.
pub struct StaticRing {
    inner: Arc<RwLock<StaticRingInner>>,
    change_txs: Arc<RwLock<Vec<UnboundedSender<()>>>>,
}

struct StaticRingInner {
    /// Sorted candidate hosts for each service, in ring order.
    hosts_by_service: std::collections::HashMap<ServiceName, Vec<HostPort>>,
    default_k: usize,
    k_overrides: std::collections::HashMap<ServiceName, usize>,
}

impl StaticRing {
    pub fn new(default_k: usize) -> Self {
        StaticRing {
            inner: Arc::new(RwLock::new(StaticRingInner {
                hosts_by_service: std::collections::HashMap::new(),
                default_k,
                k_overrides: std::collections::HashMap::new(),
            })),
            change_txs: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Replace the candidate host list for a service and notify observers.
    pub fn set_hosts(&self, service: ServiceName, mut hosts: Vec<HostPort>) {
        hosts.sort();
        self.inner.write().hosts_by_service.insert(service, hosts);
        self.notify();
    }

    fn notify(&self) {
        self.change_txs.write().retain(|tx| tx.unbounded_send(()).is_ok());
    }
}

impl RingView for StaticRing {
    fn exits_for(&self, service: &ServiceName) -> HashSet<HostPort> {
        let inner = self.inner.read();
        let k = inner
            .k_overrides
            .get(service)
            .copied()
            .unwrap_or(inner.default_k);
        inner
            .hosts_by_service
            .get(service)
            .map(|hosts| hosts.iter().take(k).cloned().collect())
            .unwrap_or_default()
    }

    fn changed(&self) -> UnboundedReceiver<()> {
        let (tx, rx) = unbounded();
        self.change_txs.write().push(tx);
        rx
    }

    fn set_k_values(&self, default: usize, overrides: &HashMap<ServiceName, usize>) {
        let mut inner = self.inner.write();
        inner.default_k = default;
        inner.k_overrides = overrides.clone();
        drop(inner);
        self.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hp(s: &str) -> HostPort {
        HostPort::new(s).unwrap()
    }

    fn sn(s: &str) -> ServiceName {
        ServiceName::new(s).unwrap()
    }

    #[test]
    fn exits_for_respects_k() {
        let ring = StaticRing::new(2);
        ring.set_hosts(
            sn("steve"),
            vec![hp("10.0.0.1:1"), hp("10.0.0.2:1"), hp("10.0.0.3:1")],
        );
        let exits = ring.exits_for(&sn("steve"));
        assert_eq!(exits.len(), 2);
    }

    #[test]
    fn is_exit_for_checks_membership() {
        let ring = StaticRing::new(1);
        ring.set_hosts(sn("steve"), vec![hp("10.0.0.1:1")]);
        assert!(ring.is_exit_for(&sn("steve"), &hp("10.0.0.1:1")));
        assert!(!ring.is_exit_for(&sn("steve"), &hp("10.0.0.2:1")));
    }

    #[test]
    fn changed_notifies_subscribers_on_set_hosts() {
        let ring = StaticRing::new(1);
        let mut rx = ring.changed();
        ring.set_hosts(sn("steve"), vec![hp("10.0.0.1:1")]);
        assert!(rx.try_next().unwrap().is_some());
    }

    #[test]
    fn set_k_values_applies_default_and_override() {
        let ring = StaticRing::new(1);
        ring.set_hosts(
            sn("steve"),
            vec![hp("10.0.0.1:1"), hp("10.0.0.2:1"), hp("10.0.0.3:1")],
        );
        ring.set_hosts(
            sn("bob"),
            vec![hp("10.0.0.1:1"), hp("10.0.0.2:1"), hp("10.0.0.3:1")],
        );

        let mut overrides = HashMap::new();
        overrides.insert(sn("steve"), 2);
        ring.set_k_values(1, &overrides);

        assert_eq!(ring.exits_for(&sn("steve")).len(), 2);
        assert_eq!(ring.exits_for(&sn("bob")).len(), 1);
    }
}
