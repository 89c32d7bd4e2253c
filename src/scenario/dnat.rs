//! Outbound reachability through the tenant router
//!
//! This host serves a greeting over HTTP and answers one UDP datagram. A
//! guest must reach both, and ping this host, through its router's external
//! gateway.

use std::time::Duration;

use tracing::info;

use super::{ScenarioContext, ScenarioError, ScenarioReport};
use crate::oracle::{HttpOracle, UdpOracle, GREETING, UDP_REPLY};
use crate::probe::ConnectivityProbe;
use crate::topology::{find_gateway, route_to, ProvisionedEndpoint};
use crate::tunnel::{Transport, TunnelChain};

const UDP_PAYLOAD: &str = "ping";

pub async fn run<T: Transport>(
    ctx: &ScenarioContext<'_, T>,
    endpoints: &[ProvisionedEndpoint],
    report: &mut ScenarioReport,
) -> Result<(), ScenarioError> {
    let oracle_settings = &ctx.settings.oracle;
    let gateway = find_gateway(endpoints);
    let target = endpoints
        .iter()
        .find(|e| !e.is_gateway())
        .or(gateway)
        .ok_or_else(|| ScenarioError::MissingEndpoint("servers".to_string()))?;
    let hops = route_to(target, gateway)
        .ok_or_else(|| ScenarioError::MissingEndpoint(format!("route to {}", target.name())))?;

    let fail = |reason: String| ScenarioError::CheckFailed {
        endpoint: target.name().to_string(),
        reason,
    };
    let probe = ConnectivityProbe::new(ctx.settings.probe.clone());
    let advertised = oracle_settings.advertised();
    let timeout = oracle_settings.timeout();

    let http = HttpOracle::start(&oracle_settings.bind_address, oracle_settings.http_port).await?;
    let mut chain = TunnelChain::connect(ctx.transport, &hops, true).await?;
    let result = async {
        let url = format!("http://{}:{}/", advertised, http.local_addr().port());
        let body = probe.http_get(&mut chain, &url, timeout).await?;
        if !body.contains(GREETING) {
            return Err(fail(format!("{} answered '{}'", url, body)));
        }
        report.record_check(format!("{} fetched {}", target.name(), url));

        if !probe
            .ping_until(&mut chain, advertised, true, probe.settings().ping_timeout())
            .await
        {
            return Err(fail(format!("{} does not answer ping", advertised)));
        }
        report.record_check(format!("{} pinged {}", target.name(), advertised));

        let udp = UdpOracle::start(&oracle_settings.bind_address, oracle_settings.udp_port).await?;
        let port = udp.local_addr().port();
        let reply = probe
            .udp_echo(&mut chain, advertised, port, UDP_PAYLOAD, timeout)
            .await?;
        let received = udp.received(Duration::from_secs(1)).await?;
        if received != UDP_PAYLOAD || !reply.contains(UDP_REPLY) {
            return Err(fail(format!(
                "UDP exchange sent '{}', got '{}'",
                received, reply
            )));
        }
        report.record_check(format!("{} exchanged UDP with port {}", target.name(), port));
        info!("{} reached {} over HTTP, ICMP and UDP", target.name(), advertised);
        Ok::<(), ScenarioError>(())
    }
    .await;

    chain.close().await;
    http.stop().await;
    result
}
