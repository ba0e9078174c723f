//! Address arithmetic for managed networks.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::error::{Result, VirtdError};
use crate::xml::NetworkAddressing;

/// Parse a CIDR block. Host bits are dropped, so "10.0.0.7/24" is
/// "10.0.0.0/24".
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = cidr
        .trim()
        .parse()
        .map_err(|e| VirtdError::InvalidConfig(format!("invalid CIDR block '{}': {}", cidr, e)))?;
    Ok(net.trunc())
}

/// Gateway, netmask and DHCP range of `net`.
///
/// The gateway is the first host address; the DHCP range runs from the
/// second host address to the last address before broadcast.
pub fn addressing(net: &Ipv4Net) -> Result<NetworkAddressing> {
    if net.prefix_len() > 30 {
        return Err(VirtdError::InvalidConfig(format!(
            "network {} is too small for a gateway and a DHCP range",
            net
        )));
    }

    let base = u32::from(net.network());
    let broadcast = u32::from(net.broadcast());

    Ok(NetworkAddressing {
        gateway: Ipv4Addr::from(base + 1),
        netmask: net.netmask(),
        dhcp_start: Ipv4Addr::from(base + 2),
        dhcp_end: Ipv4Addr::from(broadcast - 1),
    })
}

/// Whether `address` is an IPv4 address inside `net`.
pub fn contains(net: &Ipv4Net, address: &str) -> bool {
    address
        .trim()
        .parse::<Ipv4Addr>()
        .map(|ip| net.contains(&ip))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slash_24() {
        let net = parse_cidr("10.0.0.0/24").unwrap();
        let a = addressing(&net).unwrap();
        assert_eq!(a.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(a.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(a.dhcp_start, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(a.dhcp_end, Ipv4Addr::new(10, 0, 0, 254));
    }

    #[test]
    fn test_host_bits_are_dropped() {
        let net = parse_cidr("192.168.56.77/22").unwrap();
        assert_eq!(net.to_string(), "192.168.56.0/22");
        let a = addressing(&net).unwrap();
        assert_eq!(a.gateway, Ipv4Addr::new(192, 168, 56, 1));
        assert_eq!(a.dhcp_end, Ipv4Addr::new(192, 168, 59, 254));
    }

    #[test]
    fn test_smallest_and_too_small() {
        let a = addressing(&parse_cidr("10.9.9.8/30").unwrap()).unwrap();
        assert_eq!(a.dhcp_start, Ipv4Addr::new(10, 9, 9, 10));
        assert_eq!(a.dhcp_end, Ipv4Addr::new(10, 9, 9, 10));

        assert!(addressing(&parse_cidr("10.9.9.8/31").unwrap()).is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("lab").is_err());
    }

    #[test]
    fn test_contains() {
        let net = parse_cidr("10.0.0.0/24").unwrap();
        assert!(contains(&net, "10.0.0.200"));
        assert!(!contains(&net, "10.0.1.5"));
        assert!(!contains(&net, "web"));
    }
}
