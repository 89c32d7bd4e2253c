use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during topology parsing and validation
#[derive(Error, Debug, PartialEq)]
pub enum TopologyError {
    #[error("Topology parse error: {0}")]
    ParseError(String),

    #[error("Duplicate {0} name: '{1}'")]
    DuplicateName(&'static str, String),

    #[error("Router '{0}' referenced by subnet '{1}' is not defined")]
    UndefinedRouter(String, String),

    #[error("Network '{0}' referenced by server group '{1}' is not defined")]
    UndefinedNetwork(String, String),

    #[error("Security group '{0}' referenced by server group '{1}' is not defined")]
    UndefinedSecurityGroup(String, String),

    #[error("Scenario '{0}' referenced by tenant '{1}' is not defined")]
    UndefinedScenario(String, String),

    #[error("Server group '{0}' must request at least one network")]
    NoNetworks(String),
}

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

/// A router declaration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouterDef {
    pub name: String,
    /// Resolve the tenant's public router instead of creating one
    #[serde(default)]
    pub public: bool,
}

/// A static route pushed to instances through DHCP
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HostRoute {
    pub destination: String,
    pub nexthop: String,
}

/// A subnet declaration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SubnetDef {
    pub name: String,
    /// Explicit CIDR; an unused range is allocated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(default)]
    pub dns_nameservers: Vec<String>,
    #[serde(default)]
    pub host_routes: Vec<HostRoute>,
    /// Names of routers this subnet is attached to
    #[serde(default)]
    pub routers: Vec<String>,
}

/// A network declaration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NetworkDef {
    pub name: String,
    #[serde(default)]
    pub subnets: Vec<SubnetDef>,
}

/// A security group rule template. Each template yields an ingress and an
/// egress rule.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RuleTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_min: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_max: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip_prefix: Option<String>,
    #[serde(default = "default_ethertype")]
    pub ethertype: String,
}

fn default_ethertype() -> String {
    "IPv4".to_string()
}

/// A security group declaration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SecurityGroupDef {
    pub name: String,
    #[serde(default)]
    pub security_group_rules: Vec<RuleTemplate>,
}

/// A reference to a named resource, written either as a bare string or as
/// `{name: ...}`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NameRef {
    Plain(String),
    Named { name: String },
}

impl NameRef {
    pub fn name(&self) -> &str {
        match self {
            NameRef::Plain(name) => name,
            NameRef::Named { name } => name,
        }
    }
}

/// A group of identical servers
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerGroupDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    /// Networks in NIC order; the first one is the primary interface
    #[serde(default)]
    pub networks: Vec<NameRef>,
    #[serde(default)]
    pub security_groups: Vec<NameRef>,
    #[serde(default)]
    pub floating_ip: bool,
}

fn default_quantity() -> u32 {
    1
}

/// Name prefix used for server groups that do not declare one
pub const DEFAULT_SERVER_NAME: &str = "server-smoke";

impl ServerGroupDef {
    /// Name prefix for servers of this group
    pub fn name_prefix(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_SERVER_NAME)
    }

    pub fn network_names(&self) -> impl Iterator<Item = &str> {
        self.networks.iter().map(NameRef::name)
    }

    pub fn security_group_names(&self) -> impl Iterator<Item = &str> {
        self.security_groups.iter().map(NameRef::name)
    }
}

/// The declarative topology of one tenant
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TopologySpec {
    #[serde(default)]
    pub routers: Vec<RouterDef>,
    #[serde(default)]
    pub networks: Vec<NetworkDef>,
    #[serde(default)]
    pub security_groups: Vec<SecurityGroupDef>,
    #[serde(default)]
    pub servers: Vec<ServerGroupDef>,
    /// Append an access point server reachable from outside
    #[serde(default)]
    pub gateway: bool,
}

/// A tenant entry of a multi-tenant document
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TenantDef {
    pub name: String,
    /// Name of the entry in `scenarios` provisioned for this tenant
    pub scenario: String,
}

/// A named topology inside a multi-tenant document
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NamedTopology {
    pub name: String,
    #[serde(flatten)]
    pub topology: TopologySpec,
}

/// A topology file: either a single topology for the configured tenant, or
/// one topology per freshly created tenant
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TopologyDocument {
    MultiTenant {
        tenants: Vec<TenantDef>,
        scenarios: Vec<NamedTopology>,
    },
    Single(TopologySpec),
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

/// Parse a YAML (or JSON, which is a YAML subset) topology document.
pub fn parse_topology(content: &str) -> Result<TopologyDocument, TopologyError> {
    serde_yaml::from_str(content).map_err(|e| TopologyError::ParseError(e.to_string()))
}

fn check_unique<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), TopologyError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(TopologyError::DuplicateName(kind, name.to_string()));
        }
    }
    Ok(())
}

/// Validate one tenant's topology for consistency.
/// This is a pure function - no I/O.
pub fn validate_topology(spec: &TopologySpec) -> Result<(), TopologyError> {
    check_unique("router", spec.routers.iter().map(|r| r.name.as_str()))?;
    check_unique("network", spec.networks.iter().map(|n| n.name.as_str()))?;
    check_unique(
        "subnet",
        spec.networks
            .iter()
            .flat_map(|n| n.subnets.iter().map(|s| s.name.as_str())),
    )?;
    check_unique(
        "security group",
        spec.security_groups.iter().map(|g| g.name.as_str()),
    )?;
    check_unique(
        "server group",
        spec.servers.iter().filter_map(|s| s.name.as_deref()),
    )?;

    for network in &spec.networks {
        for subnet in &network.subnets {
            for router in &subnet.routers {
                if spec.router(router).is_none() {
                    return Err(TopologyError::UndefinedRouter(
                        router.clone(),
                        subnet.name.clone(),
                    ));
                }
            }
        }
    }

    for group in &spec.servers {
        if group.networks.is_empty() {
            return Err(TopologyError::NoNetworks(group.name_prefix().to_string()));
        }
        for network in group.network_names() {
            if spec.network(network).is_none() {
                return Err(TopologyError::UndefinedNetwork(
                    network.to_string(),
                    group.name_prefix().to_string(),
                ));
            }
        }
        for secgroup in group.security_group_names() {
            if spec.security_group(secgroup).is_none() {
                return Err(TopologyError::UndefinedSecurityGroup(
                    secgroup.to_string(),
                    group.name_prefix().to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// Validate a whole document, including tenant to scenario references.
pub fn validate_document(document: &TopologyDocument) -> Result<(), TopologyError> {
    match document {
        TopologyDocument::Single(spec) => validate_topology(spec),
        TopologyDocument::MultiTenant { tenants, scenarios } => {
            check_unique("tenant", tenants.iter().map(|t| t.name.as_str()))?;
            check_unique("scenario", scenarios.iter().map(|s| s.name.as_str()))?;
            for tenant in tenants {
                if !scenarios.iter().any(|s| s.name == tenant.scenario) {
                    return Err(TopologyError::UndefinedScenario(
                        tenant.scenario.clone(),
                        tenant.name.clone(),
                    ));
                }
            }
            scenarios
                .iter()
                .try_for_each(|s| validate_topology(&s.topology))
        }
    }
}

impl TopologyDocument {
    /// Parse and validate from a YAML string.
    /// Pure function - no I/O.
    pub fn from_str(content: &str) -> Result<Self, TopologyError> {
        let document = parse_topology(content)?;
        validate_document(&document)?;
        Ok(document)
    }

    /// Tenant name (None for the configured tenant) paired with its topology
    pub fn tenant_topologies(&self) -> Vec<(Option<&str>, &TopologySpec)> {
        match self {
            TopologyDocument::Single(spec) => vec![(None, spec)],
            TopologyDocument::MultiTenant { tenants, scenarios } => tenants
                .iter()
                .filter_map(|tenant| {
                    scenarios
                        .iter()
                        .find(|s| s.name == tenant.scenario)
                        .map(|s| (Some(tenant.name.as_str()), &s.topology))
                })
                .collect(),
        }
    }
}

impl TopologySpec {
    pub fn router(&self, name: &str) -> Option<&RouterDef> {
        self.routers.iter().find(|r| r.name == name)
    }

    pub fn network(&self, name: &str) -> Option<&NetworkDef> {
        self.networks.iter().find(|n| n.name == name)
    }

    pub fn security_group(&self, name: &str) -> Option<&SecurityGroupDef> {
        self.security_groups.iter().find(|g| g.name == name)
    }

    /// Number of servers the topology creates, gateway included
    pub fn server_count(&self) -> u32 {
        self.servers.iter().map(|s| s.quantity).sum::<u32>() + u32::from(self.gateway)
    }
}
