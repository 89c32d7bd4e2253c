//! Parsing of `route -n` output

use std::net::Ipv4Addr;

use serde::Serialize;

/// One row of the kernel IPv4 routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub destination: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub genmask: Ipv4Addr,
    pub flags: String,
    pub iface: String,
}

impl RouteEntry {
    pub fn is_default_route(&self) -> bool {
        self.destination.is_unspecified() && self.genmask.is_unspecified()
    }
}

/// Parse the table printed by `route -n`. Header and malformed lines are
/// skipped.
pub fn parse_route_table(output: &str) -> Vec<RouteEntry> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            Some(RouteEntry {
                destination: fields[0].parse().ok()?,
                gateway: fields[1].parse().ok()?,
                genmask: fields[2].parse().ok()?,
                flags: fields[3].to_string(),
                iface: fields[fields.len() - 1].to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE_OUTPUT: &str = "\
Kernel IP routing table
Destination     Gateway         Genmask         Flags Metric Ref    Use Iface
0.0.0.0         10.0.2.1        0.0.0.0         UG    0      0        0 eth0
10.0.2.0        0.0.0.0         255.255.255.0   U     0      0        0 eth0
169.254.169.254 10.0.2.1        255.255.255.255 UGH   0      0        0 eth0
";

    #[test]
    fn test_parse_route_table() {
        let routes = parse_route_table(ROUTE_OUTPUT);
        assert_eq!(routes.len(), 3);
        assert!(routes[0].is_default_route());
        assert_eq!(routes[0].gateway, Ipv4Addr::new(10, 0, 2, 1));
        assert_eq!(routes[0].iface, "eth0");
        assert!(!routes[1].is_default_route());
        assert_eq!(routes[2].flags, "UGH");
    }

    #[test]
    fn test_no_default_route() {
        let routes = parse_route_table(
            "10.0.2.0        0.0.0.0         255.255.255.0   U     0      0        0 eth0\n",
        );
        assert!(!routes.iter().any(RouteEntry::is_default_route));
    }
}
