use ipnet::IpNet;
use std::net::IpAddr;

/// Check whether an address belongs to one of the allowlisted networks.
///
/// Allowlisted addresses bypass the rate ledger and are never banned.
/// An empty allowlist matches nothing.
pub fn is_allowlisted(ip: IpAddr, allowlist: &[IpNet]) -> bool {
    allowlist.iter().any(|net| net.contains(&ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

    fn parse_networks(addrs: &[&str]) -> Result<Vec<IpNet>, ipnet::AddrParseError> {
        addrs.iter().map(|s| s.parse()).collect()
    }

    #[test]
    fn test_empty_allowlist_matches_nothing() -> TestResult {
        let ip: IpAddr = "127.0.0.1".parse()?;
        assert!(!is_allowlisted(ip, &[]));
        Ok(())
    }

    #[test]
    fn test_allowlist_cidr() -> TestResult {
        let allowlist = parse_networks(&["127.0.0.0/8", "192.168.1.0/24"])?;

        assert!(is_allowlisted("127.0.0.53".parse()?, &allowlist));
        assert!(is_allowlisted("192.168.1.254".parse()?, &allowlist));
        assert!(!is_allowlisted("192.168.2.1".parse()?, &allowlist));
        Ok(())
    }

    #[test]
    fn test_ipv6_allowlist() -> TestResult {
        let allowlist = parse_networks(&["::1/128", "2001:db8::/32"])?;

        assert!(is_allowlisted("::1".parse()?, &allowlist));
        assert!(!is_allowlisted("2001:db9::1".parse()?, &allowlist));
        Ok(())
    }

    #[test]
    fn test_v4_network_does_not_match_v6_address() -> TestResult {
        let allowlist = parse_networks(&["0.0.0.0/0"])?;
        assert!(!is_allowlisted("::ffff:10.0.0.1".parse()?, &allowlist));
        Ok(())
    }
}
