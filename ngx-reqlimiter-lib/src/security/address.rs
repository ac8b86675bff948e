use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::firewall::Family;

/// Outcome of classifying a textual source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    /// Not an address at all; the record is skipped, never enforced.
    Invalid,
}

impl AddressClass {
    /// Firewall family the address is enforced through, `None` when invalid.
    pub fn family(&self) -> Option<Family> {
        match self {
            AddressClass::V4(_) => Some(Family::Ipv4),
            AddressClass::V6(_) => Some(Family::Ipv6),
            AddressClass::Invalid => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            AddressClass::V4(ip) => Some(IpAddr::V4(*ip)),
            AddressClass::V6(ip) => Some(IpAddr::V6(*ip)),
            AddressClass::Invalid => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, AddressClass::Invalid)
    }
}

/// Classify a textual address as IPv4, IPv6 or invalid.
///
/// Accepts dotted-quad IPv4, every compressed/expanded IPv6 form including
/// IPv4-mapped addresses, and IPv6 zone-id suffixes (`fe80::1%eth0`). The
/// zone is dropped: packet filters match on the address alone.
pub fn classify(addr: &str) -> AddressClass {
    let addr = addr.trim();

    if let Ok(v4) = addr.parse::<Ipv4Addr>() {
        return AddressClass::V4(v4);
    }

    let host = match addr.split_once('%') {
        Some((host, zone)) if !host.is_empty() && !zone.is_empty() => host,
        Some(_) => return AddressClass::Invalid,
        None => addr,
    };

    match host.parse::<Ipv6Addr>() {
        Ok(v6) => AddressClass::V6(v6),
        Err(_) => AddressClass::Invalid,
    }
}
