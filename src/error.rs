use derive_more::{Display, From};

/// Errors surfaced by the dispatch core itself, as opposed to wire-level
/// rejections (see [`WireError`]) which are a normal, expected outcome of
/// admission control.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "invalid host:port {:?}: {}", _0, _1)]
    InvalidHostPort(String, String),

    #[display(fmt = "invalid identifier {:?}: {}", _0, _1)]
    InvalidIdentifier(String, String),

    #[display(fmt = "transport error: {}", _0)]
    #[from]
    Transport(crate::transport::TransportError),

    #[display(fmt = "peer {} is not known", _0)]
    UnknownPeer(String),

    #[display(fmt = "service {} has no channel", _0)]
    UnknownService(String),

    #[display(fmt = "partial range invalid: relay {} not among relays", _0)]
    RelayNotInRing(String),
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds that can appear on the wire in response to a request, per
/// the advertise/dispatch protocol's admission pipeline. Distinct from
/// [`Error`]: these are expected, addressable outcomes, not bugs.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum WireError {
    #[display(fmt = "bad request: {}", _0)]
    BadRequest(String),

    #[display(fmt = "declined: {}", _0)]
    Declined(String),

    #[display(fmt = "busy: {}", _0)]
    Busy(String),

    #[display(fmt = "unhealthy: {}", _0)]
    Unhealthy(String),

    #[display(fmt = "network error: {}", _0)]
    NetworkError(String),

    #[display(fmt = "timeout: {}", _0)]
    Timeout(String),
}

impl std::error::Error for WireError {}

impl WireError {
    /// Whether a completed request carrying this error should count
    /// against a circuit's error budget. Declines and busy responses are
    /// admission-control artifacts, not evidence the backend is unhealthy,
    /// so they are excluded to avoid a self-reinforcing trip.
    pub fn counts_toward_circuit_errors(&self) -> bool {
        !matches!(self, WireError::Declined(_) | WireError::Unhealthy(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, WireError::NetworkError(_) | WireError::Timeout(_))
    }
}
