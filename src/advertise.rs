//! Inbound advertise/discover protocol handlers (§4.7), grounded on
//! `core-network`'s `outbound.rs` (the `select!`-against-a-timer retry
//! idiom around a `futures_timer::Delay`) and `peer_manager/retry.rs`'s
//! bounded-attempt backoff.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::common::{ipv4_to_be_u32, now_ms};
use crate::config::RouterConfig;
use crate::dispatcher::service_channel::ChannelMode;
use crate::dispatcher::Dispatcher;
use crate::identifiers::{CallerName, HostPort, ServiceName};
use crate::ring::RingView;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvertisedService {
    pub service_name: String,
    #[serde(default)]
    pub cost: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdRequest {
    pub services: Vec<AdvertisedService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdResponse {
    pub connection_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAdvertisedService {
    pub service_name: String,
    pub host_port: String,
    #[serde(default)]
    pub cost: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAdRequest {
    pub services: Vec<RelayAdvertisedService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverQuery {
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub ip: IpField,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpField {
    pub ipv4: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub peers: Vec<DiscoveredPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverError {
    InvalidServiceName,
    NoPeersAvailable,
}

/// Handles the advertise/discover wire protocol against a [`Dispatcher`],
/// fanning out `relay-ad`/`relay-unad` to each affected exit with bounded
/// retries (§4.7 `send_relay`).
pub struct AdvertiseHandler<R, T> {
    config: RouterConfig,
    ring: Arc<R>,
    transport: Arc<T>,
    dispatcher: Arc<Dispatcher<R, T>>,
}

impl<R, T> AdvertiseHandler<R, T>
where
    R: RingView,
    T: Transport,
{
    pub fn new(config: RouterConfig, ring: Arc<R>, transport: Arc<T>, dispatcher: Arc<Dispatcher<R, T>>) -> Self {
        AdvertiseHandler {
            config,
            ring,
            transport,
            dispatcher,
        }
    }

    /// `ad`: group the advertised services by their exit host-ports and
    /// fan out a `relay-ad` per exit. Returns immediately; fan-out runs in
    /// the background and failures are logged, not surfaced to the caller
    /// (§4.7, "soft best-effort").
    pub async fn ad(&self, remote_host_port: HostPort, req: AdRequest) -> AdResponse {
        let buckets = self.bucket_by_exit(&req.services, &remote_host_port);
        let exit_count = buckets.len();

        for (exit_hp, services) in buckets {
            let transport = self.transport.clone();
            let cfg = self.config.clone();
            self.fan_out(&transport, &cfg, exit_hp, services, "relay-ad", &cfg.caller_name)
                .await;
        }

        AdResponse {
            connection_count: exit_count,
        }
    }

    pub async fn unad(&self, remote_host_port: HostPort, req: AdRequest) {
        let buckets = self.bucket_by_exit(&req.services, &remote_host_port);
        for (exit_hp, services) in buckets {
            let transport = self.transport.clone();
            let cfg = self.config.clone();
            self.fan_out(&transport, &cfg, exit_hp, services, "relay-unad", &cfg.caller_name)
                .await;
        }
    }

    fn bucket_by_exit(
        &self,
        services: &[AdvertisedService],
        remote_host_port: &HostPort,
    ) -> HashMap<HostPort, Vec<RelayAdvertisedService>> {
        let mut buckets: HashMap<HostPort, Vec<RelayAdvertisedService>> = HashMap::new();
        for svc in services {
            let sn = match ServiceName::new(svc.service_name.clone()) {
                Ok(sn) => sn,
                Err(_) => continue,
            };
            for exit_hp in self.ring.exits_for(&sn) {
                buckets.entry(exit_hp).or_default().push(RelayAdvertisedService {
                    service_name: svc.service_name.clone(),
                    host_port: remote_host_port.to_string(),
                    cost: svc.cost,
                });
            }
        }
        buckets
    }

    /// Send one relay fan-out request with bounded retries on
    /// network/timeout errors, per §4.7's `send_relay`.
    async fn fan_out(
        &self,
        transport: &Arc<T>,
        cfg: &RouterConfig,
        exit_hp: HostPort,
        services: Vec<RelayAdvertisedService>,
        endpoint: &'static str,
        cn: &str,
    ) {
        let body = serde_json::to_value(&RelayAdRequest { services }).expect("serializable");
        let mut attempts = 0u32;

        loop {
            let result = transport
                .send_relay(&exit_hp, endpoint, cn, body.clone(), cfg.relay_ad_timeout())
                .await;

            match result {
                Ok(_) => return,
                Err(TransportError::Network(_)) | Err(TransportError::Timeout(_)) => {
                    attempts += 1;
                    if attempts > cfg.max_relay_ad_attempts {
                        log::warn!(
                            "{} to {} failed after {} attempts, giving up",
                            endpoint,
                            exit_hp,
                            attempts
                        );
                        return;
                    }
                    futures_timer::Delay::new(cfg.relay_ad_retry_time()).await;
                }
                Err(e) => {
                    log::error!("{} to {} failed fatally: {}", endpoint, exit_hp, e);
                    return;
                }
            }
        }
    }

    /// `relay-ad`/`relay-unad`: apply each (service, host_port) pair
    /// directly to the local dispatcher's peer table.
    pub async fn relay_ad(&self, req: RelayAdRequest) {
        for svc in req.services {
            let sn = match ServiceName::new(svc.service_name) {
                Ok(sn) => sn,
                Err(_) => continue,
            };
            let hp = match HostPort::new(svc.host_port) {
                Ok(hp) => hp,
                Err(_) => continue,
            };
            self.dispatcher.refresh_service_peer(&sn, &hp).await;
        }
    }

    pub async fn relay_unad(&self, req: RelayAdRequest) {
        for svc in req.services {
            let sn = match ServiceName::new(svc.service_name) {
                Ok(sn) => sn,
                Err(_) => continue,
            };
            let hp = match HostPort::new(svc.host_port) {
                Ok(hp) => hp,
                Err(_) => continue,
            };
            self.dispatcher.remove_service_peer(&sn, &hp).await;
        }
    }

    /// `discover`: resolve locally if this router is the/an exit for the
    /// service, else forward to one exit. `cn` is the caller-name header
    /// carried on this inbound call; a call already carrying `cn =
    /// "hyperbahn"` was itself a forwarded discover, so it is resolved
    /// locally rather than forwarded again (§4.7, §6).
    pub async fn discover(&self, query: DiscoverQuery, cn: Option<&CallerName>) -> Result<DiscoverResponse, DiscoverError> {
        let sn = ServiceName::new(query.service_name).map_err(|_| DiscoverError::InvalidServiceName)?;

        let (mode, peers) = self.dispatcher.peers_for_discovery(&sn);

        let already_forwarded = cn.map(|cn| cn == &hyperbahn_caller_name()).unwrap_or(false);
        if mode == ChannelMode::Forward && !already_forwarded {
            return self.discover_affine(&sn).await;
        }

        if peers.is_empty() {
            return Err(DiscoverError::NoPeersAvailable);
        }

        Ok(DiscoverResponse {
            peers: peers.iter().map(|hp| encode_peer(hp)).collect(),
        })
    }

    async fn discover_affine(&self, sn: &ServiceName) -> Result<DiscoverResponse, DiscoverError> {
        let exits = self.ring.exits_for(sn);
        let exit_hp = exits.into_iter().next().ok_or(DiscoverError::NoPeersAvailable)?;

        let body = serde_json::to_value(&DiscoverQuery {
            service_name: sn.to_string(),
        })
        .expect("serializable");

        match self
            .transport
            .send_relay(
                &exit_hp,
                "discover_affine",
                hyperbahn_caller_name().as_str(),
                body,
                self.config.discover_forward_timeout(),
            )
            .await
        {
            Ok(value) => {
                let resp: DiscoverResponse = serde_json::from_value(value).map_err(|_| DiscoverError::NoPeersAvailable)?;
                if resp.peers.is_empty() {
                    Err(DiscoverError::NoPeersAvailable)
                } else {
                    Ok(resp)
                }
            }
            Err(_) => Err(DiscoverError::NoPeersAvailable),
        }
    }
}

fn encode_peer(hp: &HostPort) -> DiscoveredPeer {
    let addr = hp.socket_addr();
    let ipv4 = match addr.ip() {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    DiscoveredPeer {
        ip: IpField {
            ipv4: ipv4_to_be_u32(ipv4),
        },
        port: addr.port(),
    }
}

/// The forwarded form of `cn`, applied to outbound fan-out and forwarded
/// discover requests so a receiving router knows not to forward again.
pub fn hyperbahn_caller_name() -> CallerName {
    CallerName::new("hyperbahn").unwrap()
}
