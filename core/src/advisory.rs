//! Advisory check for destinations behind a CDN that rejects tunnel traffic.
//!
//! The provider's proxy edge refuses connections originating from the
//! tunnel's exit addresses. A match only produces a warning; the connection
//! attempt always goes ahead.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::warn;

const REJECTING_RANGES: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(104, 16, 0, 0), 12),
    (Ipv4Addr::new(172, 64, 0, 0), 13),
    (Ipv4Addr::new(162, 158, 0, 0), 15),
    (Ipv4Addr::new(198, 41, 128, 0), 17),
];

/// Whether `ip` falls inside one of the known rejecting ranges.
pub fn is_known_rejecting(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => REJECTING_RANGES
            .iter()
            .any(|&(network, prefix)| in_range(v4, network, prefix)),
        IpAddr::V6(_) => false,
    }
}

/// Logs a warning when `addr` is likely to be refused through the tunnel.
pub fn warn_if_rejecting(addr: SocketAddr) -> bool {
    let rejecting = is_known_rejecting(addr.ip());
    if rejecting {
        warn!(
            "Server {} appears to be behind a CDN proxy that blocks tunnel traffic; \
             the connection may fail",
            addr.ip()
        );
    }
    rejecting
}

fn in_range(addr: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    let mask = u32::MAX
        .checked_shl(32 - u32::from(prefix))
        .unwrap_or(0);
    u32::from(addr) & mask == u32::from(network) & mask
}
