//! Tenant connectivity checks
//!
//! From the gateway, every server sharing a network with it must answer
//! ping, accept a login, report the address it was reached on, have a
//! default route and see its own instance id in the metadata service.

use tracing::{info, warn};

use super::{ScenarioContext, ScenarioError, ScenarioReport};
use crate::probe::{instance_ids_match, ConnectivityProbe};
use crate::topology::{find_gateway, ProvisionedEndpoint};
use crate::tunnel::{Transport, TunnelChain};

fn failed(endpoint: &ProvisionedEndpoint, reason: impl Into<String>) -> ScenarioError {
    ScenarioError::CheckFailed {
        endpoint: endpoint.name().to_string(),
        reason: reason.into(),
    }
}

pub async fn run<T: Transport>(
    ctx: &ScenarioContext<'_, T>,
    endpoints: &[ProvisionedEndpoint],
    report: &mut ScenarioReport,
) -> Result<(), ScenarioError> {
    let gateway = find_gateway(endpoints)
        .ok_or_else(|| ScenarioError::MissingEndpoint("gateway".to_string()))?;
    let entry = gateway
        .public_hop()
        .ok_or_else(|| failed(gateway, "no floating IP"))?;
    let probe = ConnectivityProbe::new(ctx.settings.probe.clone());

    let mut from_gateway = TunnelChain::connect(ctx.transport, &[entry], true).await?;
    let result = async {
        for endpoint in endpoints.iter().filter(|e| !e.is_gateway()) {
            let Some(address) = endpoint.address_shared_with(gateway) else {
                info!("{} shares no network with the gateway, skipped", endpoint.name());
                continue;
            };
            if !probe
                .ping_until(&mut from_gateway, address, true, probe.settings().ping_timeout())
                .await
            {
                return Err(failed(endpoint, format!("{} does not answer ping", address)));
            }

            let hops = [entry, endpoint.hop(address)];
            let mut chain = TunnelChain::connect(ctx.transport, &hops, true).await?;
            let checked = check_endpoint(&probe, &mut chain, endpoint, address).await;
            chain.close().await;
            report.record_check(checked?);
        }
        Ok::<(), ScenarioError>(())
    }
    .await;
    from_gateway.close().await;
    result
}

async fn check_endpoint<T: Transport>(
    probe: &ConnectivityProbe,
    chain: &mut TunnelChain<'_, T>,
    endpoint: &ProvisionedEndpoint,
    address: &str,
) -> Result<String, ScenarioError> {
    let addresses = probe.ip_addresses(chain).await?;
    if !addresses.iter().any(|a| a == address) {
        return Err(failed(
            endpoint,
            format!("{} not among configured addresses {:?}", address, addresses),
        ));
    }

    let routes = probe.routes(chain).await?;
    if !routes.iter().any(|r| r.is_default_route()) {
        return Err(failed(endpoint, "no default route"));
    }

    match endpoint.server.instance_name.as_deref() {
        Some(instance_name) => {
            let id = probe.metadata_instance_id(chain).await?;
            if !instance_ids_match(&id, instance_name) {
                return Err(failed(
                    endpoint,
                    format!("metadata reports {} but the server is {}", id, instance_name),
                ));
            }
        }
        None => warn!(
            "Instance name of {} is not visible, metadata check skipped",
            endpoint.name()
        ),
    }
    Ok(format!("{} reachable at {}", endpoint.name(), address))
}
