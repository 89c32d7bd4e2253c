//! Load balancer scenarios
//!
//! Every backend runs a responder that answers with its hostname. The VIP is
//! probed from the client server when the topology has one (through the
//! gateway), otherwise from this host over the public network.

use tracing::{info, warn};

use super::{ScenarioContext, ScenarioError, ScenarioKind, ScenarioReport};
use crate::cloud::{LbMethod, Persistence, TenantContext};
use crate::lb::{LoadBalancerMonitor, Pool, PoolMember, ResponderSet};
use crate::topology::{find_gateway, route_to, ProvisionSession, ProvisionedEndpoint};
use crate::tunnel::{CommandChannel, Transport, TunnelChain};

/// Backends of the pool: non-gateway endpoints matching the member filter
pub fn pool_members<'e>(
    endpoints: &'e [ProvisionedEndpoint],
    filter: &str,
) -> Vec<&'e ProvisionedEndpoint> {
    endpoints
        .iter()
        .filter(|e| !e.is_gateway() && e.name().contains(filter))
        .collect()
}

/// The server probing the VIP, if the topology has one
pub fn find_client<'e>(
    endpoints: &'e [ProvisionedEndpoint],
    filter: &str,
) -> Option<&'e ProvisionedEndpoint> {
    endpoints
        .iter()
        .find(|e| !e.is_gateway() && e.name().contains(filter))
}

pub async fn run<T: Transport>(
    ctx: &ScenarioContext<'_, T>,
    kind: ScenarioKind,
    tenant: &TenantContext,
    endpoints: &[ProvisionedEndpoint],
    session: &mut ProvisionSession,
    report: &mut ScenarioReport,
) -> Result<(), ScenarioError> {
    let lb = &ctx.settings.lb;
    let gateway = find_gateway(endpoints);
    let backends = pool_members(endpoints, &lb.member_name_filter);
    let Some(first) = backends.first() else {
        return Err(ScenarioError::MissingEndpoint(format!(
            "servers named like '{}'",
            lb.member_name_filter
        )));
    };
    let client = find_client(endpoints, &lb.client_name_filter);

    let vip_subnet_id = match client.and_then(|c| c.interfaces.first()) {
        Some(interface) => interface.subnet_id.clone(),
        None => {
            let public = ctx
                .cloud
                .get_network(&ctx.settings.cloud.public_network_id)
                .await?;
            public
                .subnet_ids
                .first()
                .cloned()
                .ok_or_else(|| ScenarioError::MissingEndpoint("public subnet".to_string()))?
        }
    };
    let member_subnet_id = first
        .interfaces
        .first()
        .map(|i| i.subnet_id.clone())
        .ok_or_else(|| ScenarioError::MissingEndpoint(format!("interface on {}", first.name())))?;

    let members = backends
        .iter()
        .map(|b| {
            let address = b.primary_address().ok_or_else(|| {
                ScenarioError::MissingEndpoint(format!("address on {}", b.name()))
            })?;
            Ok(PoolMember {
                address: address.to_string(),
                hostname: b.name().to_string(),
                server_id: b.server.id.clone(),
            })
        })
        .collect::<Result<Vec<_>, ScenarioError>>()?;
    let mut pool = Pool::new(member_subnet_id, vip_subnet_id, members);

    let mut responders = ResponderSet::new(ctx.settings.ssh.command_timeout());
    let result = async {
        for backend in &backends {
            let hops = route_to(backend, gateway).ok_or_else(|| {
                ScenarioError::MissingEndpoint(format!("route to {}", backend.name()))
            })?;
            responders
                .start(ctx.transport, hops, backend.name(), lb.protocol_port)
                .await?;
        }
        report.record_check(format!("{} responders started", responders.len()));

        let mut chain = match client {
            Some(c) => {
                let hops = route_to(c, gateway).ok_or_else(|| {
                    ScenarioError::MissingEndpoint(format!("route to {}", c.name()))
                })?;
                info!("Probing the VIP from {}", c.name());
                Some(TunnelChain::connect(ctx.transport, &hops, true).await?)
            }
            None => None,
        };
        let mut local = (ctx.local_shell)();
        let channel: &mut dyn CommandChannel = match chain.as_mut() {
            Some(chain) => chain,
            None => local.as_mut(),
        };

        let outcome = exercise(ctx, kind, tenant, &mut pool, channel, session, report).await;
        if let Some(chain) = chain.as_mut() {
            chain.close().await;
        }
        outcome
    }
    .await;

    let stopped = responders.stop_all(ctx.transport).await;
    if stopped < backends.len() {
        warn!(
            "Stopped {} of {} responders in {}",
            stopped,
            backends.len(),
            tenant.name
        );
    }
    result
}

async fn exercise<T: Transport>(
    ctx: &ScenarioContext<'_, T>,
    kind: ScenarioKind,
    tenant: &TenantContext,
    pool: &mut Pool,
    channel: &mut dyn CommandChannel,
    session: &mut ProvisionSession,
    report: &mut ScenarioReport,
) -> Result<(), ScenarioError> {
    let lb = &ctx.settings.lb;
    let mut monitor = LoadBalancerMonitor::new(ctx.cloud, tenant, lb);
    let with_health_monitor = kind == ScenarioKind::LbaasHealth;

    monitor
        .create_pool(pool, LbMethod::RoundRobin, with_health_monitor, session)
        .await?;
    monitor.register_members(pool, session).await?;
    monitor.create_vip(pool, session).await?;
    let first = monitor
        .wait_reachable(channel, pool, lb.recovery_timeout())
        .await?;
    report.record_check(format!("VIP answered from {}", first));

    let counters = monitor.send_probe_batch(channel, pool, lb.num_requests).await?;
    report.record_batch("round-robin", &counters);
    monitor.verify(pool, &counters, false)?;

    match kind {
        ScenarioKind::LbaasPersistence => {
            monitor
                .set_session_persistence(pool, Some(Persistence::SourceIp))
                .await?;
            let counters = monitor.send_probe_batch(channel, pool, lb.num_requests).await?;
            report.record_batch("source-ip", &counters);
            monitor.verify(pool, &counters, true)?;

            monitor.set_session_persistence(pool, None).await?;
            let counters = monitor.send_probe_batch(channel, pool, lb.num_requests).await?;
            report.record_batch("persistence-removed", &counters);
            monitor.verify(pool, &counters, false)?;
        }
        ScenarioKind::LbaasHealth => {
            let port_id = monitor.health_fault(pool, 0, session).await?;
            let counters = monitor.send_probe_batch(channel, pool, lb.num_requests).await?;
            report.record_batch("health-fault", &counters);
            monitor.verify_failover(pool, &counters, 0)?;

            monitor
                .recover(&port_id, channel, pool, 0, lb.recovery_timeout())
                .await?;
            let counters = monitor.send_probe_batch(channel, pool, lb.num_requests).await?;
            report.record_batch("recovered", &counters);
            monitor.verify(pool, &counters, false)?;
        }
        _ => {}
    }
    report.record_check(format!("load balancer {}", monitor.state()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{FloatingIp, Keypair, Server};
    use crate::topology::{EndpointRole, Interface};

    fn endpoint(name: &str, role: EndpointRole) -> ProvisionedEndpoint {
        ProvisionedEndpoint {
            server: Server {
                id: format!("{}-id", name),
                name: name.to_string(),
                status: "ACTIVE".to_string(),
                instance_name: None,
                ports: vec![],
            },
            keypair: Keypair {
                name: "key".to_string(),
                private_key: "secret".to_string(),
            },
            floating_ip: None::<FloatingIp>,
            interfaces: vec![Interface {
                network: "net".to_string(),
                network_id: "net-id".to_string(),
                subnet_id: "subnet-id".to_string(),
                address: "10.0.0.3".to_string(),
                port_id: "port".to_string(),
            }],
            role,
        }
    }

    #[test]
    fn test_member_and_client_selection() {
        let endpoints = vec![
            endpoint("client-1a2b", EndpointRole::Member),
            endpoint("backend-1", EndpointRole::Member),
            endpoint("backend-2", EndpointRole::Member),
            endpoint("backend-gateway", EndpointRole::Gateway),
        ];
        let members: Vec<&str> = pool_members(&endpoints, "backend")
            .into_iter()
            .map(|e| e.name())
            .collect();
        assert_eq!(members, vec!["backend-1", "backend-2"]);
        assert_eq!(find_client(&endpoints, "client").map(|e| e.name()), Some("client-1a2b"));
        assert!(find_client(&endpoints, "nobody").is_none());
    }
}
