//! Secondary peer indices (§3), grounded on `peer_manager/mod.rs`'s `Inner`
//! struct: a handful of `RwLock`-guarded maps/sets kept consistent by a
//! single owner (here, the `Dispatcher`) rather than by locking discipline
//! spread across callers.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::identifiers::{HostPort, ServiceName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneReason {
    FellOutOfAffinity,
    NoServicesLeft,
}

#[derive(Default)]
pub struct PeerIndex {
    /// service -> peers currently held open for it (the affine subset, in
    /// partial-affinity mode; the full peer set otherwise).
    connected_service_peers: RwLock<HashMap<ServiceName, HashSet<HostPort>>>,
    /// Inverse of the above: peer -> services it's held open for.
    connected_peer_services: RwLock<HashMap<HostPort, HashSet<ServiceName>>>,
    /// known_peers[hp][sn] = last_refresh_ms, reset every reap tick.
    known_peers: RwLock<HashMap<HostPort, HashMap<ServiceName, u64>>>,
    /// Swapped in from known_peers at the start of each reap tick.
    peers_to_reap: RwLock<HashMap<HostPort, HashMap<ServiceName, u64>>>,
    /// hp -> (last_refresh_ms, reason), peers awaiting an outbound prune.
    peers_to_prune: RwLock<HashMap<HostPort, (u64, PruneReason)>>,
}

impl PeerIndex {
    pub fn new() -> Self {
        PeerIndex::default()
    }

    // --- connected_service_peers / connected_peer_services ---------------

    pub fn connect(&self, sn: &ServiceName, hp: &HostPort) {
        self.connected_service_peers
            .write()
            .entry(sn.clone())
            .or_default()
            .insert(hp.clone());
        self.connected_peer_services
            .write()
            .entry(hp.clone())
            .or_default()
            .insert(sn.clone());
    }

    pub fn disconnect(&self, sn: &ServiceName, hp: &HostPort) {
        let mut csp = self.connected_service_peers.write();
        if let Some(peers) = csp.get_mut(sn) {
            peers.remove(hp);
            if peers.is_empty() {
                csp.remove(sn);
            }
        }
        drop(csp);

        let mut cps = self.connected_peer_services.write();
        if let Some(services) = cps.get_mut(hp) {
            services.remove(sn);
            if services.is_empty() {
                cps.remove(hp);
            }
        }
    }

    pub fn connected_peers_for_service(&self, sn: &ServiceName) -> HashSet<HostPort> {
        self.connected_service_peers
            .read()
            .get(sn)
            .cloned()
            .unwrap_or_default()
    }

    pub fn services_for_peer(&self, hp: &HostPort) -> HashSet<ServiceName> {
        self.connected_peer_services.read().get(hp).cloned().unwrap_or_default()
    }

    pub fn has_any_service(&self, hp: &HostPort) -> bool {
        self.connected_peer_services
            .read()
            .get(hp)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    // --- known_peers / reap -----------------------------------------------

    pub fn mark_known(&self, hp: &HostPort, sn: &ServiceName, now_ms: u64) {
        self.known_peers
            .write()
            .entry(hp.clone())
            .or_default()
            .insert(sn.clone(), now_ms);
        // Re-advertising cancels any pending reap for this (hp, sn).
        let mut reap = self.peers_to_reap.write();
        if let Some(services) = reap.get_mut(hp) {
            services.remove(sn);
            if services.is_empty() {
                reap.remove(hp);
            }
        }
    }

    pub fn forget(&self, hp: &HostPort, sn: &ServiceName) {
        let mut known = self.known_peers.write();
        if let Some(services) = known.get_mut(hp) {
            services.remove(sn);
            if services.is_empty() {
                known.remove(hp);
            }
        }
    }

    /// Swap `known_peers` into `peers_to_reap` and clear `known_peers`,
    /// returning the peers that were *already* in `peers_to_reap` (i.e.
    /// silent for two consecutive reap windows) so the caller can delete
    /// them.
    pub fn rotate_reap(&self) -> HashMap<HostPort, HashMap<ServiceName, u64>> {
        let dead = std::mem::take(&mut *self.peers_to_reap.write());
        let mut known = self.known_peers.write();
        *self.peers_to_reap.write() = std::mem::take(&mut *known);
        dead
    }

    pub fn known_peer_count(&self) -> usize {
        self.known_peers.read().len()
    }

    /// Non-destructive peek at the currently known peer host-ports, for the
    /// reap scanner's `run_begin({keys})` event.
    pub fn known_host_ports(&self) -> Vec<String> {
        self.known_peers.read().keys().map(|hp| hp.to_string()).collect()
    }

    // --- peers_to_prune -----------------------------------------------

    pub fn schedule_prune(&self, hp: &HostPort, reason: PruneReason, now_ms: u64) {
        self.peers_to_prune.write().insert(hp.clone(), (now_ms, reason));
    }

    pub fn cancel_prune(&self, hp: &HostPort) {
        self.peers_to_prune.write().remove(hp);
    }

    pub fn is_pending_prune(&self, hp: &HostPort) -> bool {
        self.peers_to_prune.read().contains_key(hp)
    }

    /// Non-destructive peek at peers currently scheduled for pruning, for
    /// the prune scanner's `run_begin({keys})` event.
    pub fn pending_prune_host_ports(&self) -> Vec<String> {
        self.peers_to_prune.read().keys().map(|hp| hp.to_string()).collect()
    }

    /// Drain and return all peers currently scheduled for pruning.
    pub fn drain_prune_list(&self) -> HashMap<HostPort, (u64, PruneReason)> {
        std::mem::take(&mut *self.peers_to_prune.write())
    }
}
