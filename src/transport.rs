//! The framed RPC transport is an external collaborator (§1). This module
//! defines the boundary traits the dispatch core drives (open/close/send/
//! drain a peer connection) plus an in-memory mock used by tests, in the
//! style of `core-network`'s `outbound.rs` `BytesBroadcaster`/
//! `CallbackChannel` mock traits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use derive_more::Display;
use parking_lot::Mutex;

use crate::identifiers::HostPort;

#[derive(Debug, Clone, Display, PartialEq, Eq)]
pub enum TransportError {
    #[display(fmt = "not identified: {}", _0)]
    NotIdentified(String),
    #[display(fmt = "network error: {}", _0)]
    Network(String),
    #[display(fmt = "timed out after {:?}", _0)]
    Timeout(Duration),
}

impl std::error::Error for TransportError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    In,
    Out,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainGoal {
    ClosePeer,
    CloseDrained,
}

/// Everything the dispatcher needs from the underlying peer-connection
/// layer. A single implementation is shared by every service channel; the
/// dispatch core never owns sockets directly (mirrors `MessageSender` in
/// `core-network`'s `traits.rs`).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open an outbound connection to `hp`, or no-op if one is already
    /// open. Idempotent.
    async fn ensure_connected(&self, hp: &HostPort) -> Result<(), TransportError>;

    /// Close connections to `hp` in the given direction without forgetting
    /// the peer (used by the pruner).
    async fn disconnect(&self, hp: &HostPort, direction: ConnectionDirection);

    /// Drain and then fully forget `hp`. `goal` only affects the resulting
    /// stats/log classification, not behavior.
    async fn drain(&self, hp: &HostPort, goal: DrainGoal, timeout: Duration);

    /// Send a relay advertise/unadvertise/discover-forward request to `hp`
    /// and await its response, bounded by `timeout`. `cn` is the caller-name
    /// header attached to the outgoing call (§6): the router's own
    /// configured caller name for fan-out, or `"hyperbahn"` for a forwarded
    /// discover, so the receiving router knows not to forward again. Used
    /// by the advertise handler's fan-out; retries are the caller's
    /// responsibility.
    async fn send_relay(
        &self,
        hp: &HostPort,
        endpoint: &str,
        cn: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError>;

    /// Forward an admitted request to the peer selected for it, bounded by
    /// `timeout`. Distinct from `send_relay`: this carries no endpoint body
    /// of its own, since the request's payload framing is out of scope
    /// (§1) — only whether the forward itself succeeded matters to the
    /// caller's circuit breaker.
    async fn forward(&self, hp: &HostPort, timeout: Duration) -> Result<(), TransportError>;

    /// Currently connected peers, used by stats emission and tests.
    fn connected_peers(&self) -> HashSet<HostPort>;
}

/// In-memory mock transport for tests: records calls, never actually opens
/// a socket, and lets tests script responses to `send_relay`.
#[derive(Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    connected: HashSet<HostPort>,
    drained: Vec<(HostPort, DrainGoal)>,
    sent: Vec<(HostPort, String, String)>,
    forwarded: Vec<HostPort>,
    scripted_responses: std::collections::HashMap<(HostPort, String), Result<serde_json::Value, TransportError>>,
    scripted_forwards: std::collections::HashMap<HostPort, Result<(), TransportError>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport::default()
    }

    pub fn script_response(
        &self,
        hp: HostPort,
        endpoint: &str,
        response: Result<serde_json::Value, TransportError>,
    ) {
        self.state
            .lock()
            .scripted_responses
            .insert((hp, endpoint.to_owned()), response);
    }

    pub fn script_forward_response(&self, hp: HostPort, response: Result<(), TransportError>) {
        self.state.lock().scripted_forwards.insert(hp, response);
    }

    /// `(peer, endpoint, cn)` for every `send_relay` call, in order.
    pub fn sent_calls(&self) -> Vec<(HostPort, String, String)> {
        self.state.lock().sent.clone()
    }

    pub fn drained_calls(&self) -> Vec<(HostPort, DrainGoal)> {
        self.state.lock().drained.clone()
    }

    pub fn forwarded_calls(&self) -> Vec<HostPort> {
        self.state.lock().forwarded.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn ensure_connected(&self, hp: &HostPort) -> Result<(), TransportError> {
        self.state.lock().connected.insert(hp.clone());
        Ok(())
    }

    async fn disconnect(&self, hp: &HostPort, direction: ConnectionDirection) {
        if direction == ConnectionDirection::Both {
            self.state.lock().connected.remove(hp);
        }
    }

    async fn drain(&self, hp: &HostPort, goal: DrainGoal, _timeout: Duration) {
        let mut state = self.state.lock();
        state.connected.remove(hp);
        state.drained.push((hp.clone(), goal));
    }

    async fn send_relay(
        &self,
        hp: &HostPort,
        endpoint: &str,
        cn: &str,
        _body: serde_json::Value,
        _timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        self.state
            .lock()
            .sent
            .push((hp.clone(), endpoint.to_owned(), cn.to_owned()));
        self.state
            .lock()
            .scripted_responses
            .remove(&(hp.clone(), endpoint.to_owned()))
            .unwrap_or_else(|| Ok(serde_json::json!({})))
    }

    async fn forward(&self, hp: &HostPort, _timeout: Duration) -> Result<(), TransportError> {
        self.state.lock().forwarded.push(hp.clone());
        self.state
            .lock()
            .scripted_forwards
            .remove(hp)
            .unwrap_or(Ok(()))
    }

    fn connected_peers(&self) -> HashSet<HostPort> {
        self.state.lock().connected.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_connected_is_idempotent() {
        let t = MockTransport::new();
        let hp = HostPort::new("10.0.0.1:1").unwrap();
        t.ensure_connected(&hp).await.unwrap();
        t.ensure_connected(&hp).await.unwrap();
        assert_eq!(t.connected_peers().len(), 1);
    }

    #[tokio::test]
    async fn drain_removes_peer_and_records_goal() {
        let t = MockTransport::new();
        let hp = HostPort::new("10.0.0.1:1").unwrap();
        t.ensure_connected(&hp).await.unwrap();
        t.drain(&hp, DrainGoal::ClosePeer, Duration::from_secs(1)).await;
        assert!(t.connected_peers().is_empty());
        assert_eq!(t.drained_calls(), vec![(hp, DrainGoal::ClosePeer)]);
    }

    #[tokio::test]
    async fn send_relay_returns_scripted_error() {
        let t = MockTransport::new();
        let hp = HostPort::new("10.0.0.1:1").unwrap();
        t.script_response(hp.clone(), "relay-ad", Err(TransportError::Timeout(Duration::from_millis(5))));
        let res = t
            .send_relay(&hp, "relay-ad", "autobahn", serde_json::json!({}), Duration::from_millis(5))
            .await;
        assert!(matches!(res, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn forward_returns_scripted_error_and_records_call() {
        let t = MockTransport::new();
        let hp = HostPort::new("10.0.0.1:1").unwrap();
        t.script_forward_response(hp.clone(), Err(TransportError::Network("down".to_owned())));
        let res = t.forward(&hp, Duration::from_millis(5)).await;
        assert!(matches!(res, Err(TransportError::Network(_))));
        assert_eq!(t.forwarded_calls(), vec![hp]);
    }
}
