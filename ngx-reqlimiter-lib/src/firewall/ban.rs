use std::net::IpAddr;

use super::{Family, RuleSpec};

/// Drop rules generated when an address exhausts its budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEvent {
    pub address: IpAddr,
    /// Destination ports in multiport form, e.g. `80,443`
    pub ports: String,
}

impl BanEvent {
    pub fn new(address: IpAddr, ports: impl Into<String>) -> Self {
        Self { address, ports: ports.into() }
    }

    pub fn family(&self) -> Family {
        match self.address {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        }
    }

    pub fn tcp_rule(&self) -> RuleSpec {
        self.drop_rule("tcp")
    }

    pub fn udp_rule(&self) -> RuleSpec {
        self.drop_rule("udp")
    }

    /// Both rules, TCP first.
    pub fn rules(&self) -> [RuleSpec; 2] {
        [self.tcp_rule(), self.udp_rule()]
    }

    fn drop_rule(&self, protocol: &str) -> RuleSpec {
        let address = self.address.to_string();
        let args: [&str; 10] = [
            "-s",
            &address,
            "-p",
            protocol,
            "-m",
            "multiport",
            "--dports",
            &self.ports,
            "-j",
            "DROP",
        ];
        args.iter().map(|arg| (*arg).to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_ipv4_rules() {
        let event = BanEvent::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), "80,443");
        assert_eq!(event.family(), Family::Ipv4);
        assert_eq!(
            event.tcp_rule().join(" "),
            "-s 10.0.0.5 -p tcp -m multiport --dports 80,443 -j DROP"
        );
        assert_eq!(
            event.udp_rule().join(" "),
            "-s 10.0.0.5 -p udp -m multiport --dports 80,443 -j DROP"
        );
    }

    #[test]
    fn test_ipv6_rules() {
        let event = BanEvent::new(IpAddr::V6(Ipv6Addr::LOCALHOST), "443");
        assert_eq!(event.family(), Family::Ipv6);
        let [tcp, udp] = event.rules();
        assert_eq!(tcp.get(1).map(String::as_str), Some("::1"));
        assert_eq!(udp.get(3).map(String::as_str), Some("udp"));
    }
}
