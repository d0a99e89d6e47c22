//! Address helpers shared by the control plane and the fast-path tables.
//!
//! The fast path stores IPv4 addresses as `u32` in network byte order, exactly
//! as they appear on the wire. [`ip_to_raw`] and [`raw_to_ip`] convert between
//! that in-memory layout and [`Ipv4Addr`].

use crate::error::{Result, RouterError};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Convert an address to the fast-path representation (network byte order in memory).
pub fn ip_to_raw(ip: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(ip.octets())
}

/// Convert a fast-path address back to an [`Ipv4Addr`].
pub fn raw_to_ip(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_ne_bytes())
}

/// Prefix length of a dotted netmask, or `None` if the mask is not contiguous.
pub fn netmask_to_prefix(netmask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(netmask);
    let len = bits.leading_ones();
    let expected = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    (bits == expected).then_some(len as u8)
}

/// Build an interface address from its dotted ip and netmask strings.
pub fn parse_interface_address(ip: &str, netmask: &str) -> Result<Ipv4Net> {
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| RouterError::InvalidArgument(format!("invalid ip address '{}'", ip)))?;
    let mask: Ipv4Addr = netmask
        .parse()
        .map_err(|_| RouterError::InvalidArgument(format!("invalid netmask '{}'", netmask)))?;
    let prefix = netmask_to_prefix(mask).ok_or_else(|| {
        RouterError::InvalidArgument(format!("Netmask {} is in invalid format", netmask))
    })?;
    Ipv4Net::new(ip, prefix).map_err(|e| RouterError::InvalidArgument(e.to_string()))
}

/// Build a network from its dotted address and netmask, truncating host bits.
pub fn parse_network(network: &str, netmask: &str) -> Result<Ipv4Net> {
    Ok(parse_interface_address(network, netmask)?.trunc())
}

/// Parse MAC address from string to bytes
pub fn parse_mac(mac_str: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = mac_str.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return None;
        }
        mac[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(mac)
}

/// Format MAC address bytes as string
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Generate a random locally administered, unicast MAC address.
pub fn random_mac() -> [u8; 6] {
    let mut mac: [u8; 6] = rand::random();
    mac[0] = (mac[0] & 0xfe) | 0x02;
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_conversion_keeps_wire_order() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let raw = ip_to_raw(ip);
        assert_eq!(raw.to_ne_bytes(), [10, 0, 0, 1]);
        assert_eq!(raw_to_ip(raw), ip);
    }

    #[test]
    fn test_netmask_to_prefix() {
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 0)), Some(24));
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 255)), Some(32));
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(0, 0, 0, 0)), Some(0));
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 0, 255, 0)), None);
    }

    #[test]
    fn test_parse_network_truncates_host_bits() {
        let net = parse_network("10.0.0.7", "255.255.255.0").unwrap();
        assert_eq!(net, "10.0.0.0/24".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn test_parse_interface_address_rejects_bad_mask() {
        assert!(parse_interface_address("10.0.0.1", "255.0.255.0").is_err());
        assert!(parse_interface_address("10.0.0.300", "255.255.255.0").is_err());
    }

    #[test]
    fn test_mac_roundtrip() {
        let mac = parse_mac("52:54:00:12:34:56").unwrap();
        assert_eq!(mac, [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        assert_eq!(format_mac(&mac), "52:54:00:12:34:56");
        assert!(parse_mac("52:54:00:12:34").is_none());
    }

    #[test]
    fn test_random_mac_is_local_unicast() {
        for _ in 0..16 {
            let mac = random_mac();
            assert_eq!(mac[0] & 0x01, 0);
            assert_eq!(mac[0] & 0x02, 0x02);
        }
    }
}
