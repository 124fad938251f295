//! Newtype identifiers for the dispatch core, following the validation and
//! `FromStr`/`Display` idiom of `core-network`'s `endpoint.rs`.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};

use crate::error::Error;

macro_rules! opaque_name {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Result<Self, Error> {
                let raw = raw.into();
                if raw.is_empty() {
                    return Err(Error::InvalidIdentifier(
                        stringify!($name).to_owned(),
                        "must not be empty".to_owned(),
                    ));
                }
                Ok($name(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Error> {
                $name::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_name!(ServiceName);
opaque_name!(CallerName);
opaque_name!(EndpointName);

/// Sentinel caller name used when a request carries no `cn` header but the
/// admission path still needs a circuit key, per the advertise/dispatch
/// spec's "no-cn" default.
pub fn unnamed_caller() -> CallerName {
    CallerName("no-cn".to_owned())
}

/// A validated `host:port` pair, the unit of peer addressing throughout
/// the core (peer index, partial range, ring view).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostPort(String);

impl HostPort {
    pub fn new(raw: impl Into<String>) -> Result<Self, Error> {
        let raw = raw.into();
        let _: SocketAddr = raw
            .parse()
            .map_err(|e: std::net::AddrParseError| Error::InvalidHostPort(raw.clone(), e.to_string()))?;
        Ok(HostPort(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0.parse().expect("validated at construction")
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HostPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        HostPort::new(s)
    }
}

/// Composite key used by the blocking table and rate-limiter edge counters:
/// `"<caller>~~<service>"`, with `*` as a wildcard on either side.
pub fn edge_key(cn: &str, sn: &str) -> String {
    format!("{}~~{}", cn, sn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_service_name() {
        assert!(ServiceName::new("").is_err());
    }

    #[test]
    fn accepts_nonempty_service_name() {
        let sn = ServiceName::new("steve").unwrap();
        assert_eq!(sn.as_str(), "steve");
        assert_eq!(sn.to_string(), "steve");
    }

    #[test]
    fn host_port_requires_valid_socket_addr() {
        assert!(HostPort::new("10.0.0.1:8080").is_ok());
        assert!(HostPort::new("not-a-host-port").is_err());
    }

    #[test]
    fn edge_key_format() {
        assert_eq!(edge_key("alice", "steve"), "alice~~steve");
        assert_eq!(edge_key("*", "steve"), "*~~steve");
    }
}
