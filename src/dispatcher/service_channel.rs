//! A single service's routing state (§3, §4.2), grounded on
//! `core-network`'s `service.rs` `NetworkConnectionService`/channel wiring —
//! here trimmed to the two-mode (Exit/Forward) peer-set the dispatch core
//! needs rather than a full gossip connection service.

use std::collections::HashSet;

use crate::common::{is_expired, now_ms};
use crate::identifiers::{HostPort, ServiceName};
use crate::partial_range::PartialRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// This router is authoritative for the service; `peers` holds worker
    /// host-ports.
    Exit,
    /// This router forwards to the authoritative exits; `peers` holds
    /// exit host-ports.
    Forward,
}

pub struct ServiceChannel {
    pub service_name: ServiceName,
    pub mode: ChannelMode,
    /// Worker peers (Exit mode) or exit peers (Forward mode) this router
    /// will select from when relaying a request.
    pub peers: HashSet<HostPort>,
    /// Last refresh timestamp per advertising worker, in Exit mode.
    pub last_advertised_ms: std::collections::HashMap<HostPort, u64>,
    pub partial_range: Option<PartialRange>,
}

impl ServiceChannel {
    pub fn new_exit(service_name: ServiceName) -> Self {
        ServiceChannel {
            service_name,
            mode: ChannelMode::Exit,
            peers: HashSet::new(),
            last_advertised_ms: std::collections::HashMap::new(),
            partial_range: None,
        }
    }

    pub fn new_forward(service_name: ServiceName, exits: HashSet<HostPort>) -> Self {
        ServiceChannel {
            service_name,
            mode: ChannelMode::Forward,
            peers: exits,
            last_advertised_ms: std::collections::HashMap::new(),
            partial_range: None,
        }
    }

    pub fn change_to_exit(&mut self) {
        self.mode = ChannelMode::Exit;
        self.peers.clear();
        self.last_advertised_ms.clear();
        self.partial_range = None;
    }

    pub fn change_to_forward(&mut self, exits: HashSet<HostPort>) {
        self.mode = ChannelMode::Forward;
        self.peers = exits;
        self.last_advertised_ms.clear();
        self.partial_range = None;
    }

    pub fn add_worker(&mut self, hp: HostPort) {
        self.last_advertised_ms.insert(hp.clone(), now_ms());
        self.peers.insert(hp);
    }

    pub fn remove_worker(&mut self, hp: &HostPort) {
        self.peers.remove(hp);
        self.last_advertised_ms.remove(hp);
    }

    pub fn workers_sorted(&self) -> Vec<HostPort> {
        let mut v: Vec<HostPort> = self.peers.iter().cloned().collect();
        v.sort();
        v
    }

    /// Whether this service channel hasn't been advertised to in longer
    /// than `ttl_ms`, and thus should be purged (§3 "advertisement
    /// record"). Forward-mode channels are never purged this way — only
    /// their owning exits carry advertisement state.
    pub fn is_expired(&self, now_ms_: u64, ttl_ms: u64) -> bool {
        if self.mode != ChannelMode::Exit {
            return false;
        }
        if self.last_advertised_ms.is_empty() {
            return true;
        }
        let ttl = std::time::Duration::from_millis(ttl_ms);
        self.last_advertised_ms
            .values()
            .all(|&t| is_expired(t, now_ms_, ttl))
    }
}
