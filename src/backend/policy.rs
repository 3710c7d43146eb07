//! Which destination addresses the backend may connect to.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::model::Endpoint;

/// `true` if `addr` is an ordinary public unicast address, or if non-unicast
/// destinations are allowed anyway.
///
/// IPv4-mapped IPv6 addresses are judged as the IPv4 address they carry.
pub fn is_allowed_address(addr: IpAddr, allow_non_unicast: bool) -> bool {
    if allow_non_unicast {
        return true;
    }
    match addr {
        IpAddr::V4(ip) => is_unicast_v4(ip),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(ip) => is_unicast_v4(ip),
            None => is_unicast_v6(ip),
        },
    }
}

/// Domain names are always allowed here; they are judged once resolved.
pub fn is_allowed_endpoint(endpoint: &Endpoint, allow_non_unicast: bool) -> bool {
    match endpoint.ip() {
        Some(ip) => is_allowed_address(ip, allow_non_unicast),
        None => true,
    }
}

fn in_v4(ip: Ipv4Addr, net: [u8; 4], prefix: u32) -> bool {
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    u32::from(ip) & mask == u32::from(Ipv4Addr::from(net)) & mask
}

fn in_v6(ip: Ipv6Addr, net: [u16; 8], prefix: u32) -> bool {
    let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
    u128::from(ip) & mask == u128::from(Ipv6Addr::from(net)) & mask
}

const SPECIAL_V4: &[([u8; 4], u32)] = &[
    // unspecified
    ([0, 0, 0, 0], 8),
    // private
    ([10, 0, 0, 0], 8),
    ([172, 16, 0, 0], 12),
    ([192, 168, 0, 0], 16),
    // carrier grade nat
    ([100, 64, 0, 0], 10),
    // loopback
    ([127, 0, 0, 0], 8),
    // link local
    ([169, 254, 0, 0], 16),
    // multicast
    ([224, 0, 0, 0], 4),
    // reserved, including documentation and benchmarking ranges
    ([192, 0, 0, 0], 24),
    ([192, 0, 2, 0], 24),
    ([192, 88, 99, 0], 24),
    ([198, 18, 0, 0], 15),
    ([198, 51, 100, 0], 24),
    ([203, 0, 113, 0], 24),
    ([240, 0, 0, 0], 4),
];

const SPECIAL_V6: &[([u16; 8], u32)] = &[
    // unspecified and loopback
    ([0, 0, 0, 0, 0, 0, 0, 0], 128),
    ([0, 0, 0, 0, 0, 0, 0, 1], 128),
    // link local
    ([0xfe80, 0, 0, 0, 0, 0, 0, 0], 10),
    // multicast
    ([0xff00, 0, 0, 0, 0, 0, 0, 0], 8),
    // unique local
    ([0xfc00, 0, 0, 0, 0, 0, 0, 0], 7),
    // ipv4 translated
    ([0, 0, 0, 0, 0xffff, 0, 0, 0], 96),
    ([0x64, 0xff9b, 0, 0, 0, 0, 0, 0], 96),
    // 6to4
    ([0x2002, 0, 0, 0, 0, 0, 0, 0], 16),
    // teredo
    ([0x2001, 0, 0, 0, 0, 0, 0, 0], 32),
    // documentation
    ([0x2001, 0xdb8, 0, 0, 0, 0, 0, 0], 32),
];

fn is_unicast_v4(ip: Ipv4Addr) -> bool {
    !ip.is_broadcast()
        && !SPECIAL_V4
            .iter()
            .any(|(net, prefix)| in_v4(ip, *net, *prefix))
}

fn is_unicast_v6(ip: Ipv6Addr) -> bool {
    !SPECIAL_V6
        .iter()
        .any(|(net, prefix)| in_v6(ip, *net, *prefix))
}
