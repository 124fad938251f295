//! `hyperbahn-core`: the service-dispatch core of a cluster-wide RPC
//! router. Owns the service-to-peer routing table, the advertise/discover
//! protocol, peer lifecycle, partial-affinity peer selection, and
//! per-request admission (blocking, rate limiting, circuit breakers).
//!
//! The underlying framed transport, the consistent-hash membership ring,
//! and the stats sink are external collaborators, modeled here as trait
//! boundaries ([`ring::RingView`], [`transport::Transport`],
//! [`stats::StatsSink`]) rather than concrete dependencies.

pub mod advertise;
pub mod blocking;
pub mod circuit;
pub mod common;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod identifiers;
pub mod interval_scanner;
pub mod partial_range;
pub mod peer_index;
pub mod rate_limiter;
pub mod ring;
pub mod stats;
pub mod transport;

pub use config::{RemoteConfig, RouterConfig};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result, WireError};
