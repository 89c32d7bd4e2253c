//! Dependency ordered creation of a tenant topology

use std::collections::HashMap;
use std::str::FromStr;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use super::session::{CleanupAction, ProvisionSession};
use super::{EndpointRole, Interface, ProvisionError, ProvisionedEndpoint};
use crate::cloud::{
    rand_name, CloudApi, Direction, Network, RuleRequest, SecurityGroup, ServerRequest, Subnet,
    SubnetRequest, TenantContext,
};
use crate::config::{
    HostRoute, RuleTemplate, SecurityGroupDef, ServerGroupDef, SubnetDef, TopologySpec,
};
use crate::settings::Settings;
use crate::tunnel::{Hop, Transport, TunnelChain, TunnelError};

const GATEWAY_NETWORK_PREFIX: &str = "gateway-net";
const GATEWAY_SUBNET_PREFIX: &str = "subnet-access-point";
const GATEWAY_SECURITY_GROUP_PREFIX: &str = "gateway";
const GATEWAY_SERVER_PREFIX: &str = "access_point";
const PUBLIC_ROUTER_PREFIX: &str = "router-public";

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Check every name a topology refers to before anything is created
pub fn check_references(spec: &TopologySpec) -> Result<(), ProvisionError> {
    for network in &spec.networks {
        for subnet in &network.subnets {
            if let Some(router) = subnet.routers.iter().find(|r| spec.router(r).is_none()) {
                return Err(ProvisionError::UnknownReference {
                    kind: "router",
                    name: router.clone(),
                });
            }
        }
    }
    for group in &spec.servers {
        if let Some(network) = group.network_names().find(|n| spec.network(n).is_none()) {
            return Err(ProvisionError::UnknownReference {
                kind: "network",
                name: network.to_string(),
            });
        }
        if let Some(secgroup) = group
            .security_group_names()
            .find(|g| spec.security_group(g).is_none())
        {
            return Err(ProvisionError::UnknownReference {
                kind: "security group",
                name: secgroup.to_string(),
            });
        }
    }
    Ok(())
}

fn same_cidr(requested: &str, actual: &str) -> bool {
    match (Ipv4Net::from_str(requested), Ipv4Net::from_str(actual)) {
        (Ok(a), Ok(b)) => a.trunc() == b.trunc(),
        _ => requested == actual,
    }
}

/// Exact name match first, then a group whose name starts with `name`
fn find_existing_group<'a>(existing: &'a [SecurityGroup], name: &str) -> Option<&'a SecurityGroup> {
    existing
        .iter()
        .find(|g| g.name == name)
        .or_else(|| existing.iter().find(|g| g.name.starts_with(name)))
}

fn rule_requests(
    group_id: &str,
    template: &RuleTemplate,
    directions: &[Direction],
) -> Vec<RuleRequest> {
    directions
        .iter()
        .map(|direction| RuleRequest {
            security_group_id: group_id.to_string(),
            direction: *direction,
            ethertype: template.ethertype.clone(),
            protocol: template.protocol.clone(),
            port_range_min: template.port_range_min,
            port_range_max: template.port_range_max,
            remote_ip_prefix: template.remote_ip_prefix.clone(),
        })
        .collect()
}

fn gateway_rules() -> Vec<RuleTemplate> {
    vec![
        RuleTemplate {
            protocol: Some("tcp".to_string()),
            port_range_min: Some(22),
            port_range_max: Some(22),
            remote_ip_prefix: None,
            ethertype: "IPv4".to_string(),
        },
        RuleTemplate {
            protocol: Some("icmp".to_string()),
            port_range_min: None,
            port_range_max: None,
            remote_ip_prefix: None,
            ethertype: "IPv4".to_string(),
        },
    ]
}

// ============================================================================
// Builder
// ============================================================================

/// Names from the topology mapped to what was created for them
#[derive(Default)]
struct Registry {
    routers: HashMap<String, String>,
    networks: HashMap<String, Network>,
    security_groups: HashMap<String, SecurityGroup>,
    public_router: Option<String>,
}

impl Registry {
    fn router(&self, name: &str) -> Result<&str, ProvisionError> {
        self.routers
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ProvisionError::UnknownReference {
                kind: "router",
                name: name.to_string(),
            })
    }

    fn network(&self, name: &str) -> Result<&Network, ProvisionError> {
        self.networks
            .get(name)
            .ok_or_else(|| ProvisionError::UnknownReference {
                kind: "network",
                name: name.to_string(),
            })
    }

    fn security_group(&self, name: &str) -> Result<&SecurityGroup, ProvisionError> {
        self.security_groups
            .get(name)
            .ok_or_else(|| ProvisionError::UnknownReference {
                kind: "security group",
                name: name.to_string(),
            })
    }
}

pub struct TopologyBuilder<'a, T: Transport> {
    cloud: &'a dyn CloudApi,
    transport: &'a T,
    settings: &'a Settings,
}

impl<'a, T: Transport> TopologyBuilder<'a, T> {
    pub fn new(cloud: &'a dyn CloudApi, transport: &'a T, settings: &'a Settings) -> Self {
        Self {
            cloud,
            transport,
            settings,
        }
    }

    /// Create every resource of `spec` in `tenant`. Endpoints come back in
    /// topology order with the gateway, if any, last.
    pub async fn build(
        &self,
        spec: &TopologySpec,
        tenant: &TenantContext,
        session: &mut ProvisionSession,
    ) -> Result<Vec<ProvisionedEndpoint>, ProvisionError> {
        check_references(spec)?;
        info!(
            "Provisioning {} networks and {} servers for tenant {}",
            spec.networks.len(),
            spec.server_count(),
            tenant.name
        );

        let mut registry = Registry::default();
        for router in &spec.routers {
            let id = if router.public {
                self.public_router(tenant, &mut registry, session).await?
            } else {
                let created = self
                    .cloud
                    .create_router(tenant, &rand_name(&router.name), None)
                    .await
                    .map_err(ProvisionError::cloud(format!("router {}", router.name)))?;
                session.push(CleanupAction::DeleteRouter(created.id.clone()));
                created.id
            };
            registry.routers.insert(router.name.clone(), id);
        }

        for def in &spec.networks {
            let mut network = self
                .cloud
                .create_network(tenant, &rand_name(&def.name))
                .await
                .map_err(ProvisionError::cloud(format!("network {}", def.name)))?;
            session.push(CleanupAction::DeleteNetwork(network.id.clone()));

            for subnet_def in &def.subnets {
                let subnet = self
                    .create_subnet(tenant, &network.id, subnet_def, session)
                    .await?;
                for router_name in &subnet_def.routers {
                    let router_id = registry.router(router_name)?.to_string();
                    self.attach(&router_id, &subnet.id, session).await?;
                }
                network.subnet_ids.push(subnet.id);
            }
            registry.networks.insert(def.name.clone(), network);
        }

        if !spec.security_groups.is_empty() {
            let existing = self
                .cloud
                .list_security_groups(tenant)
                .await
                .map_err(ProvisionError::cloud("security group listing"))?;
            for def in &spec.security_groups {
                let group = self
                    .security_group(tenant, def, &existing, session)
                    .await?;
                registry.security_groups.insert(def.name.clone(), group);
            }
        }

        let mut endpoints = Vec::with_capacity(spec.server_count() as usize);
        let mut pending_fixups = Vec::new();
        for group in &spec.servers {
            for _ in 0..group.quantity {
                let endpoint = self
                    .create_member(tenant, group, &registry, session)
                    .await?;
                if endpoint.interfaces.len() > 1 {
                    match endpoint.public_hop() {
                        Some(hop) => self.activate_interfaces(&endpoint, &[hop]).await,
                        None => pending_fixups.push(endpoints.len()),
                    }
                }
                endpoints.push(endpoint);
            }
        }

        if spec.gateway {
            let gateway = self
                .create_gateway(tenant, spec, &mut registry, session)
                .await?;
            for index in pending_fixups.drain(..) {
                let endpoint = &endpoints[index];
                match super::route_to(endpoint, Some(&gateway)) {
                    Some(hops) => self.activate_interfaces(endpoint, &hops).await,
                    None => warn!("No route to {} for interface activation", endpoint.name()),
                }
            }
            endpoints.push(gateway);
        }
        for index in pending_fixups {
            warn!(
                "{} has several interfaces but no floating IP or gateway; skipping activation",
                endpoints[index].name()
            );
        }

        info!("Provisioned {} endpoints for tenant {}", endpoints.len(), tenant.name);
        Ok(endpoints)
    }

    async fn public_router(
        &self,
        tenant: &TenantContext,
        registry: &mut Registry,
        session: &mut ProvisionSession,
    ) -> Result<String, ProvisionError> {
        if let Some(id) = &registry.public_router {
            return Ok(id.clone());
        }
        let id = match &self.settings.cloud.public_router_id {
            Some(id) => {
                let router = self
                    .cloud
                    .get_router(id)
                    .await
                    .map_err(ProvisionError::cloud("public router"))?;
                debug!("Using public router {}", router.id);
                router.id
            }
            None => {
                let router = self
                    .cloud
                    .create_router(
                        tenant,
                        &rand_name(PUBLIC_ROUTER_PREFIX),
                        Some(&self.settings.cloud.public_network_id),
                    )
                    .await
                    .map_err(ProvisionError::cloud("public router"))?;
                session.push(CleanupAction::DeleteRouter(router.id.clone()));
                router.id
            }
        };
        registry.public_router = Some(id.clone());
        Ok(id)
    }

    async fn attach(
        &self,
        router_id: &str,
        subnet_id: &str,
        session: &mut ProvisionSession,
    ) -> Result<(), ProvisionError> {
        self.cloud
            .add_router_interface(router_id, subnet_id)
            .await
            .map_err(ProvisionError::cloud(format!("router interface for {}", subnet_id)))?;
        session.push(CleanupAction::RemoveRouterInterface {
            router_id: router_id.to_string(),
            subnet_id: subnet_id.to_string(),
        });
        Ok(())
    }

    async fn create_subnet(
        &self,
        tenant: &TenantContext,
        network_id: &str,
        def: &SubnetDef,
        session: &mut ProvisionSession,
    ) -> Result<Subnet, ProvisionError> {
        let Some(cidr) = &def.cidr else {
            return self
                .allocate_subnet(
                    tenant,
                    network_id,
                    &def.name,
                    &def.dns_nameservers,
                    &def.host_routes,
                    session,
                )
                .await;
        };

        let request = SubnetRequest {
            network_id: network_id.to_string(),
            name: def.name.clone(),
            cidr: cidr.clone(),
            ip_version: 4,
            dns_nameservers: def.dns_nameservers.clone(),
            host_routes: def.host_routes.clone(),
        };
        let subnet = self
            .cloud
            .create_subnet(tenant, &request)
            .await
            .map_err(ProvisionError::cloud(format!("subnet {}", def.name)))?;
        session.push(CleanupAction::DeleteSubnet(subnet.id.clone()));
        if !same_cidr(cidr, &subnet.cidr) {
            return Err(ProvisionError::CidrMismatch {
                name: def.name.clone(),
                requested: cidr.clone(),
                actual: subnet.cidr,
            });
        }
        Ok(subnet)
    }

    /// Walk the tenant range until the cloud accepts a non-overlapping CIDR
    async fn allocate_subnet(
        &self,
        tenant: &TenantContext,
        network_id: &str,
        name: &str,
        dns_nameservers: &[String],
        host_routes: &[HostRoute],
        session: &mut ProvisionSession,
    ) -> Result<Subnet, ProvisionError> {
        let range_text = &self.settings.cloud.tenant_network_cidr;
        let mask_bits = self.settings.cloud.tenant_network_mask_bits;
        let range = Ipv4Net::from_str(range_text)
            .map_err(|e| ProvisionError::InvalidRange(format!("{}: {}", range_text, e)))?;
        let candidates = range
            .subnets(mask_bits)
            .map_err(|e| {
                ProvisionError::InvalidRange(format!("/{} in {}: {}", mask_bits, range, e))
            })?;

        for candidate in candidates {
            let request = SubnetRequest {
                network_id: network_id.to_string(),
                name: name.to_string(),
                cidr: candidate.to_string(),
                ip_version: 4,
                dns_nameservers: dns_nameservers.to_vec(),
                host_routes: host_routes.to_vec(),
            };
            match self.cloud.create_subnet(tenant, &request).await {
                Ok(subnet) => {
                    debug!("Subnet {} allocated {}", name, subnet.cidr);
                    session.push(CleanupAction::DeleteSubnet(subnet.id.clone()));
                    return Ok(subnet);
                }
                Err(e) if e.is_overlap() => {
                    debug!("{} is taken, trying the next range", candidate);
                }
                Err(e) => return Err(ProvisionError::cloud(format!("subnet {}", name))(e)),
            }
        }
        Err(ProvisionError::NoSubnetRange {
            range: range.to_string(),
            mask_bits,
        })
    }

    async fn security_group(
        &self,
        tenant: &TenantContext,
        def: &SecurityGroupDef,
        existing: &[SecurityGroup],
        session: &mut ProvisionSession,
    ) -> Result<SecurityGroup, ProvisionError> {
        if let Some(group) = find_existing_group(existing, &def.name) {
            debug!("Reusing security group {} for {}", group.name, def.name);
            return Ok(group.clone());
        }
        self.create_security_group(
            tenant,
            &def.name,
            &def.security_group_rules,
            &Direction::BOTH,
            session,
        )
        .await
    }

    async fn create_security_group(
        &self,
        tenant: &TenantContext,
        prefix: &str,
        rules: &[RuleTemplate],
        directions: &[Direction],
        session: &mut ProvisionSession,
    ) -> Result<SecurityGroup, ProvisionError> {
        let group = self
            .cloud
            .create_security_group(tenant, &rand_name(prefix))
            .await
            .map_err(ProvisionError::cloud(format!("security group {}", prefix)))?;
        session.push(CleanupAction::DeleteSecurityGroup(group.id.clone()));

        for template in rules {
            for request in rule_requests(&group.id, template, directions) {
                match self.cloud.create_security_group_rule(tenant, &request).await {
                    Ok(rule) => session.push(CleanupAction::DeleteSecurityGroupRule(rule.id)),
                    Err(e) if e.is_already_exists() => {
                        debug!("Rule already present in {}: {}", group.name, e);
                    }
                    Err(e) => {
                        return Err(ProvisionError::cloud(format!(
                            "{} rule in {}",
                            request.direction, group.name
                        ))(e))
                    }
                }
            }
        }
        Ok(group)
    }

    /// Create one server with its own keypair
    #[allow(clippy::too_many_arguments)]
    async fn create_server(
        &self,
        tenant: &TenantContext,
        prefix: &str,
        networks: &[(&str, &Network)],
        security_groups: Vec<String>,
        floating_ip: bool,
        role: EndpointRole,
        session: &mut ProvisionSession,
    ) -> Result<ProvisionedEndpoint, ProvisionError> {
        let keypair = self
            .cloud
            .create_keypair(&rand_name("keypair"))
            .await
            .map_err(ProvisionError::cloud("keypair"))?;
        session.push(CleanupAction::DeleteKeypair(keypair.name.clone()));

        let request = ServerRequest {
            name: rand_name(prefix),
            image_ref: self.settings.cloud.image_ref.clone(),
            flavor_ref: self.settings.cloud.flavor_ref.clone(),
            key_name: keypair.name.clone(),
            network_ids: networks.iter().map(|(_, n)| n.id.clone()).collect(),
            security_groups,
        };
        let server = self
            .cloud
            .create_server(tenant, &request)
            .await
            .map_err(ProvisionError::cloud(format!("server {}", request.name)))?;
        session.push(CleanupAction::DeleteServer(server.id.clone()));

        let mut interfaces = Vec::with_capacity(networks.len());
        for (name, network) in networks {
            let port = server
                .port_on(&network.id)
                .ok_or_else(|| ProvisionError::MissingPort {
                    server: server.name.clone(),
                    network: name.to_string(),
                })?;
            let fixed = port.primary_ip().ok_or_else(|| ProvisionError::MissingPort {
                server: server.name.clone(),
                network: name.to_string(),
            })?;
            interfaces.push(Interface {
                network: name.to_string(),
                network_id: network.id.clone(),
                subnet_id: fixed.subnet_id.clone(),
                address: fixed.ip_address.clone(),
                port_id: port.id.clone(),
            });
        }

        let floating_ip = match (floating_ip, interfaces.first()) {
            (true, Some(primary)) => {
                let fip = self
                    .cloud
                    .create_floating_ip(
                        tenant,
                        &self.settings.cloud.public_network_id,
                        &primary.port_id,
                    )
                    .await
                    .map_err(ProvisionError::cloud(format!("floating ip for {}", server.name)))?;
                session.push(CleanupAction::DeleteFloatingIp(fip.id.clone()));
                Some(fip)
            }
            _ => None,
        };

        info!(
            "Server {} is up at {}",
            server.name,
            interfaces
                .iter()
                .map(|i| i.address.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(ProvisionedEndpoint {
            server,
            keypair,
            floating_ip,
            interfaces,
            role,
        })
    }

    async fn create_member(
        &self,
        tenant: &TenantContext,
        group: &ServerGroupDef,
        registry: &Registry,
        session: &mut ProvisionSession,
    ) -> Result<ProvisionedEndpoint, ProvisionError> {
        let networks = group
            .network_names()
            .map(|name| registry.network(name).map(|n| (name, n)))
            .collect::<Result<Vec<_>, _>>()?;
        let security_groups = group
            .security_group_names()
            .map(|name| registry.security_group(name).map(|g| g.name.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        self.create_server(
            tenant,
            group.name_prefix(),
            &networks,
            security_groups,
            group.floating_ip,
            EndpointRole::Member,
            session,
        )
        .await
    }

    /// The access point: its own network first, then every tenant network,
    /// every tenant security group plus one admitting SSH and ICMP
    async fn create_gateway(
        &self,
        tenant: &TenantContext,
        spec: &TopologySpec,
        registry: &mut Registry,
        session: &mut ProvisionSession,
    ) -> Result<ProvisionedEndpoint, ProvisionError> {
        let router_id = self.public_router(tenant, registry, session).await?;

        let mut network = self
            .cloud
            .create_network(tenant, &rand_name(GATEWAY_NETWORK_PREFIX))
            .await
            .map_err(ProvisionError::cloud("gateway network"))?;
        session.push(CleanupAction::DeleteNetwork(network.id.clone()));
        let subnet = self
            .allocate_subnet(tenant, &network.id, GATEWAY_SUBNET_PREFIX, &[], &[], session)
            .await?;
        self.attach(&router_id, &subnet.id, session).await?;
        network.subnet_ids.push(subnet.id);

        let access = self
            .create_security_group(
                tenant,
                GATEWAY_SECURITY_GROUP_PREFIX,
                &gateway_rules(),
                &[Direction::Ingress],
                session,
            )
            .await?;

        let mut networks = vec![(GATEWAY_NETWORK_PREFIX, &network)];
        for def in &spec.networks {
            networks.push((def.name.as_str(), registry.network(&def.name)?));
        }
        let mut security_groups = vec![access.name.clone()];
        for def in &spec.security_groups {
            security_groups.push(registry.security_group(&def.name)?.name.clone());
        }

        let gateway = self
            .create_server(
                tenant,
                GATEWAY_SERVER_PREFIX,
                &networks,
                security_groups,
                true,
                EndpointRole::Gateway,
                session,
            )
            .await?;
        if gateway.interfaces.len() > 1 {
            if let Some(hop) = gateway.public_hop() {
                self.activate_interfaces(&gateway, &[hop]).await;
            }
        }
        Ok(gateway)
    }

    /// Bring up the secondary NICs of a guest whose image only configures
    /// the first one. Failures are logged, never fatal.
    async fn activate_interfaces(&self, endpoint: &ProvisionedEndpoint, hops: &[Hop<'_>]) {
        let patience = self.settings.guest.fixup_timeout();
        match tokio::time::timeout(patience, self.run_activation(endpoint, hops)).await {
            Ok(Ok(activated)) => {
                debug!("Activated {} interfaces on {}", activated, endpoint.name())
            }
            Ok(Err(e)) => warn!("Interface activation on {} failed: {}", endpoint.name(), e),
            Err(_) => warn!(
                "Interface activation on {} timed out after {:?}",
                endpoint.name(),
                patience
            ),
        }
    }

    async fn run_activation(
        &self,
        endpoint: &ProvisionedEndpoint,
        hops: &[Hop<'_>],
    ) -> Result<usize, TunnelError> {
        let guest = &self.settings.guest;
        let timeout = self.settings.ssh.command_timeout();
        let mut chain = TunnelChain::connect_with_retry(
            self.transport,
            hops,
            true,
            guest.fixup_timeout(),
            self.settings.probe.ping_interval(),
        )
        .await?;

        let mut activated = 0;
        let mut result = Ok(());
        for index in 1..endpoint.interfaces.len() {
            let iface = guest.interface_name(index);
            let state = match chain.exec(&guest.state_command(&iface), timeout).await {
                Ok(state) => state,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            if state.trim() == "up" {
                continue;
            }
            if let Err(e) = chain.exec(&guest.up_command(&iface), timeout).await {
                result = Err(e);
                break;
            }
            activated += 1;
        }
        chain.close().await;
        result.map(|_| activated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudError;
    use crate::config::TopologyDocument;
    use crate::simulate::{SimulatedCloud, SimulatedTransport};
    use std::sync::Arc;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.cloud.public_network_id = crate::simulate::PUBLIC_NETWORK_ID.to_string();
        settings.cloud.public_router_id = None;
        settings.guest.fixup_timeout_secs = 2;
        settings.probe.ping_interval_ms = 10;
        settings
    }

    fn spec(yaml: &str) -> TopologySpec {
        match TopologyDocument::from_str(yaml).unwrap() {
            TopologyDocument::Single(spec) => spec,
            _ => panic!("Expected single topology"),
        }
    }

    const ICMP_GROUP: &str = r#"
security_groups:
  - name: sg-web
    security_group_rules:
      - protocol: icmp
"#;

    const SSH_AND_ICMP_GROUP: &str = r#"
security_groups:
  - name: sg-web
    security_group_rules:
      - protocol: tcp
        port_range_min: 22
        port_range_max: 22
      - protocol: icmp
"#;

    const DUPLICATE_ICMP_GROUP: &str = r#"
security_groups:
  - name: sg-web
    security_group_rules:
      - protocol: icmp
      - protocol: icmp
"#;

    const FIXED_CIDR_NETWORK: &str = r#"
networks:
  - name: net
    subnets:
      - name: sub
        cidr: 10.100.0.0/28
"#;

    const TWO_TIER: &str = r#"
routers:
  - name: router-public
    public: true
networks:
  - name: net-a
    subnets:
      - name: subnet-a
        routers: [router-public]
  - name: net-b
    subnets:
      - name: subnet-b
        cidr: 10.200.0.0/28
        routers: [router-public]
security_groups:
  - name: sg-web
    security_group_rules:
      - protocol: tcp
        port_range_min: 8080
        port_range_max: 8080
servers:
  - name: client
    networks: [net-a, net-b]
    security_groups: [sg-web]
  - name: backend
    quantity: 2
    networks: [net-b]
    security_groups: [sg-web]
gateway: true
"#;

    #[tokio::test]
    async fn test_build_two_tier_with_gateway() {
        let cloud = Arc::new(SimulatedCloud::new());
        let transport = SimulatedTransport::new(cloud.clone());
        let settings = settings();
        let tenant = cloud.current_tenant().await.unwrap();
        let builder = TopologyBuilder::new(cloud.as_ref(), &transport, &settings);
        let mut session = ProvisionSession::new();

        let endpoints = builder
            .build(&spec(TWO_TIER), &tenant, &mut session)
            .await
            .unwrap();

        assert_eq!(endpoints.len(), 4);
        let gateway = endpoints.last().unwrap();
        assert!(gateway.is_gateway());
        assert!(gateway.name().starts_with("access_point-"));
        assert_eq!(gateway.interfaces.len(), 3);
        assert!(gateway.floating_ip.is_some());
        assert!(endpoints[0].name().starts_with("client-"));
        assert_eq!(endpoints[0].interfaces[1].network, "net-b");
        assert!(endpoints[0].interfaces[1].address.starts_with("10.200.0."));

        // The client has two NICs and got its second one activated through the gateway
        let log = transport.executions();
        assert!(log.iter().any(|(host, cmd)| {
            host == endpoints[0].name() && cmd.contains("cirros-dhcpc up eth1")
        }));

        let summary = session.teardown(cloud.as_ref()).await;
        assert!(summary.is_clean());
        assert_eq!(cloud.live_resources(), 0);
    }

    #[tokio::test]
    async fn test_unknown_router_creates_nothing() {
        let cloud = Arc::new(SimulatedCloud::new());
        let transport = SimulatedTransport::new(cloud.clone());
        let settings = settings();
        let tenant = cloud.current_tenant().await.unwrap();
        let builder = TopologyBuilder::new(cloud.as_ref(), &transport, &settings);
        let mut session = ProvisionSession::new();

        let mut topology = spec(TWO_TIER);
        topology.networks[0].subnets[0].routers = vec!["router-missing".to_string()];
        let result = builder.build(&topology, &tenant, &mut session).await;

        assert!(matches!(
            result,
            Err(ProvisionError::UnknownReference { kind: "router", ref name })
                if name == "router-missing"
        ));
        assert_eq!(cloud.router_count(), 0);
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_allocation_skips_overlapping_ranges() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_existing_subnet("10.100.0.0/28");
        cloud.add_existing_subnet("10.100.0.16/28");
        let transport = SimulatedTransport::new(cloud.clone());
        let settings = settings();
        let tenant = cloud.current_tenant().await.unwrap();
        let builder = TopologyBuilder::new(cloud.as_ref(), &transport, &settings);
        let mut session = ProvisionSession::new();

        let topology = spec("networks:\n  - name: net\n    subnets:\n      - name: sub\n");
        builder.build(&topology, &tenant, &mut session).await.unwrap();

        assert_eq!(cloud.call_count("create_subnet"), 3);
        session.teardown(cloud.as_ref()).await;
    }

    #[tokio::test]
    async fn test_security_group_reused_by_prefix() {
        let cloud = Arc::new(SimulatedCloud::new());
        let existing = cloud.add_existing_security_group("sg-web-1234");
        let transport = SimulatedTransport::new(cloud.clone());
        let settings = settings();
        let tenant = cloud.current_tenant().await.unwrap();
        let builder = TopologyBuilder::new(cloud.as_ref(), &transport, &settings);
        let mut session = ProvisionSession::new();

        let topology = spec(ICMP_GROUP);
        builder.build(&topology, &tenant, &mut session).await.unwrap();

        assert_eq!(cloud.call_count("create_security_group"), 0);
        assert_eq!(cloud.rule_count(&existing), 0);
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_new_security_group_gets_rule_pairs() {
        let cloud = Arc::new(SimulatedCloud::new());
        let transport = SimulatedTransport::new(cloud.clone());
        let settings = settings();
        let tenant = cloud.current_tenant().await.unwrap();
        let builder = TopologyBuilder::new(cloud.as_ref(), &transport, &settings);
        let mut session = ProvisionSession::new();

        let topology = spec(SSH_AND_ICMP_GROUP);
        builder.build(&topology, &tenant, &mut session).await.unwrap();
        assert_eq!(cloud.call_count("create_security_group_rule"), 4);
        // group + four rules
        assert_eq!(session.len(), 5);
    }

    #[tokio::test]
    async fn test_duplicate_rule_is_not_an_error() {
        let cloud = Arc::new(SimulatedCloud::new());
        let transport = SimulatedTransport::new(cloud.clone());
        let settings = settings();
        let tenant = cloud.current_tenant().await.unwrap();
        let builder = TopologyBuilder::new(cloud.as_ref(), &transport, &settings);
        let mut session = ProvisionSession::new();

        let topology = spec(DUPLICATE_ICMP_GROUP);
        builder.build(&topology, &tenant, &mut session).await.unwrap();

        // The second template hits the two rules the first one created
        assert_eq!(cloud.call_count("create_security_group_rule"), 4);
        assert_eq!(session.len(), 3);
        assert!(session.teardown(cloud.as_ref()).await.is_clean());
        assert_eq!(cloud.live_resources(), 0);
    }

    #[tokio::test]
    async fn test_other_rule_conflict_is_fatal() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.fail_on(
            "create_security_group_rule",
            CloudError::Conflict("in use".to_string()),
        );
        let transport = SimulatedTransport::new(cloud.clone());
        let settings = settings();
        let tenant = cloud.current_tenant().await.unwrap();
        let builder = TopologyBuilder::new(cloud.as_ref(), &transport, &settings);
        let mut session = ProvisionSession::new();

        let topology = spec(ICMP_GROUP);
        let result = builder.build(&topology, &tenant, &mut session).await;

        match result {
            Err(ProvisionError::Cloud { resource, source }) => {
                assert!(resource.contains("rule in sg-web-"));
                assert_eq!(source, CloudError::Conflict("in use".to_string()));
            }
            _ => panic!("Expected a fatal rule conflict"),
        }
        // Only the group itself is left to clean up
        assert_eq!(session.len(), 1);
        assert!(session.teardown(cloud.as_ref()).await.is_clean());
        assert_eq!(cloud.live_resources(), 0);
    }

    #[tokio::test]
    async fn test_explicit_cidr_overlap_is_fatal() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_existing_subnet("10.100.0.0/28");
        let transport = SimulatedTransport::new(cloud.clone());
        let settings = settings();
        let tenant = cloud.current_tenant().await.unwrap();
        let builder = TopologyBuilder::new(cloud.as_ref(), &transport, &settings);
        let mut session = ProvisionSession::new();

        let topology = spec(FIXED_CIDR_NETWORK);
        let result = builder.build(&topology, &tenant, &mut session).await;
        assert!(matches!(result, Err(ProvisionError::Cloud { .. })));

        // Only the network was created and it can be torn down
        assert_eq!(session.len(), 1);
        assert!(session.teardown(cloud.as_ref()).await.is_clean());
    }

    #[test]
    fn test_find_existing_group_prefers_exact() {
        let groups = vec![
            SecurityGroup {
                id: "1".to_string(),
                name: "web-extra".to_string(),
            },
            SecurityGroup {
                id: "2".to_string(),
                name: "web".to_string(),
            },
        ];
        assert_eq!(find_existing_group(&groups, "web").unwrap().id, "2");
        assert_eq!(find_existing_group(&groups, "web-").unwrap().id, "1");
        assert!(find_existing_group(&groups, "db").is_none());
    }

    #[test]
    fn test_same_cidr_normalizes() {
        assert!(same_cidr("10.0.0.1/24", "10.0.0.0/24"));
        assert!(!same_cidr("10.0.0.0/24", "10.0.1.0/24"));
    }
}
