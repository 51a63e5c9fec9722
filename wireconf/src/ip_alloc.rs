// IP address allocation

//! Per-client tunnel address allocation
//!
//! Every client owns one octet (2-254) and appears at `<network prefix>.<octet>`
//! in each network it belongs to. The octet replaces the final byte of the
//! network address, so the same octet identifies the peer everywhere.

use crate::config::parse_cidr;
use crate::error::{Error, Result};
use crate::types::{Client, DomainSnapshot, Network};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Lowest octet handed to clients (`.1` is the server side)
pub const FIRST_CLIENT_OCTET: u8 = 2;
/// Highest octet handed to clients
pub const LAST_CLIENT_OCTET: u8 = 254;

/// Octet allocator over the set of currently assigned octets
#[derive(Debug, Clone, Default)]
pub struct IpAllocator {
    used: BTreeSet<u8>,
}

impl IpAllocator {
    /// Create an allocator from the octets already assigned
    pub fn new(used: impl IntoIterator<Item = u8>) -> Self {
        Self {
            used: used.into_iter().collect(),
        }
    }

    /// Create an allocator from every client in the snapshot
    pub fn from_snapshot(snapshot: &DomainSnapshot) -> Self {
        Self::new(snapshot.clients.iter().map(|c| c.octet))
    }

    /// Smallest octet in 2..=254 that is neither assigned nor excluded
    pub fn find_next_available_octet(&self, exclude: &BTreeSet<u8>) -> Result<u8> {
        (FIRST_CLIENT_OCTET..=LAST_CLIENT_OCTET)
            .find(|o| !self.used.contains(o) && !exclude.contains(o))
            .ok_or(Error::OctetPoolExhausted)
    }
}

/// Substitute `octet` into the final byte of the network address.
/// Returns the candidate together with the network and its mask.
fn substitute(cidr: &str, octet: u8) -> Option<(u32, u32, u32)> {
    let (network, mask) = parse_cidr(cidr).ok()?;
    let candidate = (network & !0xFF) | u32::from(octet);
    Some((candidate, network, mask))
}

fn is_strict_host(candidate: u32, network: u32, mask: u32) -> bool {
    let broadcast = network | !mask;
    candidate & mask == network && candidate != network && candidate != broadcast
}

/// True iff the substituted address lies strictly between the network and
/// broadcast addresses of `cidr`
pub fn validate_octet_for_network(cidr: &str, octet: u8) -> bool {
    substitute(cidr, octet)
        .map(|(candidate, network, mask)| is_strict_host(candidate, network, mask))
        .unwrap_or(false)
}

/// Tunnel identity of `client` inside `network`, as a `/32`
pub fn compute_client_address(network: &Network, client: &Client) -> Result<String> {
    match substitute(&network.cidr, client.octet) {
        Some((candidate, net, mask)) if is_strict_host(candidate, net, mask) => {
            Ok(format!("{}/32", Ipv4Addr::from(candidate)))
        }
        _ => Err(Error::InvalidOctetForNetwork {
            cidr: network.cidr.clone(),
            octet: client.octet,
        }),
    }
}

/// Tunnel identities of `client` across all of its networks, in membership order
pub fn client_addresses(snapshot: &DomainSnapshot, client: &Client) -> Result<Vec<String>> {
    snapshot
        .client_networks(client)
        .map(|net| compute_client_address(net, client))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DnsMode;

    fn network(cidr: &str) -> Network {
        Network {
            id: 1,
            name: "net".to_string(),
            cidr: cidr.to_string(),
            interface_address: String::new(),
        }
    }

    fn client(octet: u8) -> Client {
        Client {
            id: 1,
            name: "c".to_string(),
            public_key: String::new(),
            private_key: String::new(),
            preshared_key: None,
            octet,
            enabled: true,
            keepalive: None,
            dns_mode: DnsMode::Default,
            dns_servers: None,
            network_ids: vec![1],
        }
    }

    #[test]
    fn test_next_octet_is_minimum_free() {
        let alloc = IpAllocator::new([2, 3, 5]);
        assert_eq!(alloc.find_next_available_octet(&BTreeSet::new()).unwrap(), 4);

        let exclude: BTreeSet<u8> = [4].into_iter().collect();
        assert_eq!(alloc.find_next_available_octet(&exclude).unwrap(), 6);
    }

    #[test]
    fn test_next_octet_never_returns_used_or_excluded() {
        let used: Vec<u8> = (2..=254).step_by(2).collect();
        let exclude: BTreeSet<u8> = (3..=101).step_by(2).collect();
        let alloc = IpAllocator::new(used.clone());

        let octet = alloc.find_next_available_octet(&exclude).unwrap();
        assert_eq!(octet, 103);
        assert!(!used.contains(&octet));
        assert!(!exclude.contains(&octet));
    }

    #[test]
    fn test_next_octet_ignores_out_of_range_values() {
        let alloc = IpAllocator::new([0, 1, 255]);
        assert_eq!(alloc.find_next_available_octet(&BTreeSet::new()).unwrap(), 2);
    }

    #[test]
    fn test_pool_exhausted() {
        let alloc = IpAllocator::new(2..=200);
        let exclude: BTreeSet<u8> = (201..=254).collect();
        assert!(matches!(
            alloc.find_next_available_octet(&exclude),
            Err(Error::OctetPoolExhausted)
        ));
    }

    #[test]
    fn test_validate_octet_slash24() {
        assert!(validate_octet_for_network("10.0.1.0/24", 5));
        assert!(validate_octet_for_network("10.0.1.0/24", 254));
        assert!(!validate_octet_for_network("10.0.1.0/24", 0));
        assert!(!validate_octet_for_network("10.0.1.0/24", 255));
    }

    #[test]
    fn test_validate_octet_small_network() {
        // 10.0.0.128/25 spans .128-.255
        assert!(!validate_octet_for_network("10.0.0.128/25", 5));
        assert!(!validate_octet_for_network("10.0.0.128/25", 128));
        assert!(validate_octet_for_network("10.0.0.128/25", 200));
        assert!(!validate_octet_for_network("10.0.0.128/25", 255));
    }

    #[test]
    fn test_validate_octet_wide_network() {
        // Only the final byte is replaced, so 10.1.255.255 is never produced
        assert!(!validate_octet_for_network("10.1.0.0/16", 0));
        assert!(validate_octet_for_network("10.1.0.0/16", 255));
        assert!(validate_octet_for_network("10.1.0.0/16", 7));
    }

    #[test]
    fn test_validate_octet_matches_exhaustive_definition() {
        for cidr in ["10.0.1.0/24", "192.168.7.64/26", "172.16.0.0/12", "10.9.9.9/31", "10.9.9.9/32"] {
            let (network, mask) = parse_cidr(cidr).unwrap();
            let broadcast = network | !mask;
            for octet in 0..=255u8 {
                let candidate = (network & !0xFF) | u32::from(octet);
                let expected = candidate > network && candidate < broadcast;
                assert_eq!(validate_octet_for_network(cidr, octet), expected, "{} .{}", cidr, octet);
            }
        }
    }

    #[test]
    fn test_validate_octet_invalid_cidr() {
        assert!(!validate_octet_for_network("not-a-cidr", 5));
        assert!(!validate_octet_for_network("fd00::/64", 5));
    }

    #[test]
    fn test_compute_client_address() {
        assert_eq!(
            compute_client_address(&network("10.0.1.0/24"), &client(5)).unwrap(),
            "10.0.1.5/32"
        );
        assert_eq!(
            compute_client_address(&network("10.0.1.77/24"), &client(9)).unwrap(),
            "10.0.1.9/32"
        );
    }

    #[test]
    fn test_compute_client_address_rejects_invalid() {
        let err = compute_client_address(&network("10.0.0.128/25"), &client(5)).unwrap_err();
        assert!(matches!(err, Error::InvalidOctetForNetwork { octet: 5, .. }));
    }
}
