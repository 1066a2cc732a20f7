//! Dual-stack address translation.
//!
//! A dual-stack socket speaks IPv6 on the wire and reaches IPv4 peers
//! through v4-mapped addresses (`::ffff:a.b.c.d`). These helpers are the
//! only place that translation happens; everything above the socket layer
//! sees plain `SocketAddr` values with IPv4 peers as `SocketAddr::V4`.

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

/// Converts an IPv4 address into its v4-mapped IPv6 equivalent.
///
/// IPv6 addresses are returned unchanged.
pub fn to_mapped(address: SocketAddr) -> SocketAddr {
    match address {
        SocketAddr::V4(v4) => {
            SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
        }
        SocketAddr::V6(_) => address,
    }
}

/// Converts a v4-mapped IPv6 address back into plain IPv4.
///
/// Native IPv6 and IPv4 addresses are returned unchanged.
pub fn normalize(address: SocketAddr) -> SocketAddr {
    match address {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, v6.port())),
            None => address,
        },
        SocketAddr::V4(_) => address,
    }
}

/// Returns true if the address is a v4-mapped IPv6 address.
pub fn is_mapped(address: &SocketAddr) -> bool {
    match address {
        SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().is_some(),
        SocketAddr::V4(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_v4_maps_into_v6() {
        let address: SocketAddr = "192.168.1.20:6881".parse().unwrap();
        let mapped = to_mapped(address);

        assert_eq!(mapped, "[::ffff:192.168.1.20]:6881".parse().unwrap());
        assert!(is_mapped(&mapped));
    }

    #[test]
    fn test_native_v6_is_untouched() {
        let address: SocketAddr = "[2001:db8::1]:51413".parse().unwrap();

        assert_eq!(to_mapped(address), address);
        assert_eq!(normalize(address), address);
        assert!(!is_mapped(&address));
    }

    #[test]
    fn test_normalize_strips_mapping() {
        let mapped: SocketAddr = "[::ffff:10.0.0.7]:80".parse().unwrap();
        assert_eq!(normalize(mapped), "10.0.0.7:80".parse().unwrap());
    }

    #[test]
    fn test_loopback_v6_is_not_mapped() {
        let address = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 1);
        assert_eq!(normalize(address), address);
    }

    proptest! {
        #[test]
        fn test_mapping_is_reversible_for_v4(octets in any::<[u8; 4]>(), port in any::<u16>()) {
            let address = SocketAddr::new(Ipv4Addr::from(octets).into(), port);
            let mapped = to_mapped(address);

            prop_assert!(mapped.is_ipv6());
            prop_assert_eq!(normalize(mapped), address);
        }
    }
}
