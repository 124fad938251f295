//! Small free-standing helpers, in the spirit of `core-network`'s
//! `common.rs` (a handful of conversion functions plus a `#[cfg(test)]`
//! module, rather than a grab-bag utility module).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the epoch. The dispatch core stamps advertisement
/// and peer-liveness timestamps with this rather than `Instant`, since
/// they are compared against externally-configured periods and logged.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

pub fn elapsed_ms(since: u64, now: u64) -> u64 {
    now.saturating_sub(since)
}

pub fn is_expired(since: u64, now: u64, ttl: Duration) -> bool {
    elapsed_ms(since, now) >= ttl.as_millis() as u64
}

/// Encode an IPv4 `std::net::Ipv4Addr` the way `discover` responses do:
/// big-endian u32, per the discovery wire format (§6).
pub fn ipv4_to_be_u32(addr: std::net::Ipv4Addr) -> u32 {
    u32::from_be_bytes(addr.octets())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn elapsed_ms_saturates() {
        assert_eq!(elapsed_ms(100, 50), 0);
        assert_eq!(elapsed_ms(50, 100), 50);
    }

    #[test]
    fn is_expired_boundary() {
        assert!(is_expired(0, 1_000, Duration::from_millis(1_000)));
        assert!(!is_expired(0, 999, Duration::from_millis(1_000)));
    }

    #[test]
    fn ipv4_encoding_is_big_endian() {
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(ipv4_to_be_u32(addr), 0x0A00_0001);
    }
}
