//! Topology provisioning
//!
//! [`TopologyBuilder`] turns a [`TopologySpec`](crate::config::TopologySpec)
//! into live resources and hands back one [`ProvisionedEndpoint`] per server.
//! Everything it creates is recorded in a [`ProvisionSession`].

pub mod builder;
pub mod session;

use serde::Serialize;
use thiserror::Error;

use crate::cloud::{CloudError, FloatingIp, Keypair, Server};
use crate::tunnel::Hop;

pub use builder::{check_references, TopologyBuilder};
pub use session::{CleanupAction, ProvisionSession, TeardownSummary};

/// Errors that abort provisioning. The caller tears the session down.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Failed to create {resource}: {source}")]
    Cloud {
        resource: String,
        #[source]
        source: CloudError,
    },

    #[error("Unknown {kind} '{name}'")]
    UnknownReference { kind: &'static str, name: String },

    #[error("Subnet '{name}' requested {requested} but got {actual}")]
    CidrMismatch {
        name: String,
        requested: String,
        actual: String,
    },

    #[error("No free /{mask_bits} left in {range}")]
    NoSubnetRange { range: String, mask_bits: u8 },

    #[error("Invalid tenant network range: {0}")]
    InvalidRange(String),

    #[error("Server {server} has no port on network {network}")]
    MissingPort { server: String, network: String },
}

impl ProvisionError {
    pub(crate) fn cloud(resource: impl Into<String>) -> impl FnOnce(CloudError) -> Self {
        let resource = resource.into();
        move |source| ProvisionError::Cloud { resource, source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Member,
    Gateway,
}

/// One NIC of a provisioned server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interface {
    /// Network name from the topology
    pub network: String,
    pub network_id: String,
    pub subnet_id: String,
    pub address: String,
    pub port_id: String,
}

/// A server created by the builder together with its access material
#[derive(Debug, Clone)]
pub struct ProvisionedEndpoint {
    pub server: Server,
    pub keypair: Keypair,
    pub floating_ip: Option<FloatingIp>,
    /// NICs in topology order; the first is the primary interface
    pub interfaces: Vec<Interface>,
    pub role: EndpointRole,
}

impl ProvisionedEndpoint {
    pub fn name(&self) -> &str {
        &self.server.name
    }

    pub fn is_gateway(&self) -> bool {
        self.role == EndpointRole::Gateway
    }

    pub fn primary_address(&self) -> Option<&str> {
        self.interfaces.first().map(|i| i.address.as_str())
    }

    pub fn public_address(&self) -> Option<&str> {
        self.floating_ip
            .as_ref()
            .map(|f| f.floating_ip_address.as_str())
    }

    pub fn address_on(&self, network_id: &str) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|i| i.network_id == network_id)
            .map(|i| i.address.as_str())
    }

    /// This endpoint's address on the first network it shares with `other`
    pub fn address_shared_with(&self, other: &ProvisionedEndpoint) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|i| other.address_on(&i.network_id).is_some())
            .map(|i| i.address.as_str())
    }

    pub fn hop<'a>(&'a self, address: &'a str) -> Hop<'a> {
        Hop::new(address, &self.keypair.private_key)
    }

    pub fn public_hop(&self) -> Option<Hop<'_>> {
        self.public_address().map(|address| self.hop(address))
    }
}

/// The gateway endpoint of a build, which is always the last one
pub fn find_gateway(endpoints: &[ProvisionedEndpoint]) -> Option<&ProvisionedEndpoint> {
    endpoints.last().filter(|e| e.is_gateway())
}

/// Hops that reach `target` from outside the cloud: through the gateway
/// when there is one, otherwise straight to the target's floating IP.
pub fn route_to<'a>(
    target: &'a ProvisionedEndpoint,
    gateway: Option<&'a ProvisionedEndpoint>,
) -> Option<Vec<Hop<'a>>> {
    match gateway {
        Some(gw) if !std::ptr::eq(gw, target) => {
            let entry = gw.public_hop()?;
            let inner = target.address_shared_with(gw)?;
            Some(vec![entry, target.hop(inner)])
        }
        _ => target.public_hop().map(|hop| vec![hop]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Port;

    fn endpoint(
        name: &str,
        nets: &[(&str, &str)],
        fip: Option<&str>,
        role: EndpointRole,
    ) -> ProvisionedEndpoint {
        ProvisionedEndpoint {
            server: Server {
                id: format!("{}-id", name),
                name: name.to_string(),
                status: "ACTIVE".to_string(),
                instance_name: None,
                ports: Vec::<Port>::new(),
            },
            keypair: Keypair {
                name: format!("{}-key", name),
                private_key: format!("{}-secret", name),
            },
            floating_ip: fip.map(|address| FloatingIp {
                id: "fip".to_string(),
                floating_ip_address: address.to_string(),
                port_id: None,
            }),
            interfaces: nets
                .iter()
                .map(|(net, address)| Interface {
                    network: net.to_string(),
                    network_id: format!("{}-id", net),
                    subnet_id: format!("{}-subnet", net),
                    address: address.to_string(),
                    port_id: format!("{}-port", address),
                })
                .collect(),
            role,
        }
    }

    #[test]
    fn test_route_through_gateway() {
        let backend = endpoint("backend", &[("a", "10.0.0.3")], None, EndpointRole::Member);
        let gateway = endpoint(
            "gw",
            &[("gw", "10.1.0.3"), ("a", "10.0.0.4")],
            Some("172.24.4.100"),
            EndpointRole::Gateway,
        );
        let hops = route_to(&backend, Some(&gateway)).unwrap();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0], Hop::new("172.24.4.100", "gw-secret"));
        assert_eq!(hops[1], Hop::new("10.0.0.3", "backend-secret"));
    }

    #[test]
    fn test_route_direct_by_floating_ip() {
        let backend = endpoint(
            "backend",
            &[("a", "10.0.0.3")],
            Some("172.24.4.101"),
            EndpointRole::Member,
        );
        let hops = route_to(&backend, None).unwrap();
        assert_eq!(hops, vec![Hop::new("172.24.4.101", "backend-secret")]);
    }

    #[test]
    fn test_no_route_without_floating_ip_or_gateway() {
        let backend = endpoint("backend", &[("a", "10.0.0.3")], None, EndpointRole::Member);
        assert!(route_to(&backend, None).is_none());
    }

    #[test]
    fn test_find_gateway_only_when_last() {
        let gateway = endpoint(
            "gw",
            &[("gw", "10.1.0.3")],
            Some("172.24.4.100"),
            EndpointRole::Gateway,
        );
        let member = endpoint("m", &[("a", "10.0.0.3")], None, EndpointRole::Member);
        let endpoints = vec![member.clone(), gateway];
        assert_eq!(find_gateway(&endpoints).map(|g| g.name()), Some("gw"));
        assert!(find_gateway(&[member]).is_none());
    }
}
