//! Listen-address normalization.
//!
//! Peers are identified by the `host:port` they listen on, and the table is
//! seated by that port. Two spellings of the same address must collapse to one
//! key before they reach the peer map or the seating list.

use std::net::SocketAddr;

/// Canonical `host:port` form, or `None` when there is no numeric port.
pub fn normalize(addr: &str) -> Option<String> {
    let addr = addr.trim();
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Some(socket.to_string());
    }

    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some(format!("{}:{}", host.to_ascii_lowercase(), port))
}

/// Numeric port of an address, used as the seating key.
pub fn port_of(addr: &str) -> Option<u16> {
    let (_, port) = addr.trim().rsplit_once(':')?;
    port.parse().ok()
}

/// Seating order: ascending port, ties broken by the address string so every
/// node sorts identically.
pub fn seat_key(addr: &str) -> (u16, &str) {
    (port_of(addr).unwrap_or(u16::MAX), addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(" 127.0.0.1:3000 ").as_deref(), Some("127.0.0.1:3000"));
        assert_eq!(normalize("LocalHost:4000").as_deref(), Some("localhost:4000"));
        assert_eq!(normalize("[::1]:5000").as_deref(), Some("[::1]:5000"));
        assert_eq!(normalize("127.0.0.1"), None);
        assert_eq!(normalize("host:notaport"), None);
        assert_eq!(normalize(":3000"), None);
    }

    #[test]
    fn test_port_of() {
        assert_eq!(port_of("127.0.0.1:3000"), Some(3000));
        assert_eq!(port_of("[::1]:5000"), Some(5000));
        assert_eq!(port_of("nothing"), None);
    }
}
