//! Live migration under an open ssh session
//!
//! Every server with a floating IP is moved to another hypervisor while a
//! kept-alive chain to it stays open. The same chain must still answer
//! afterwards, from the same guest.

use tracing::info;

use super::{ScenarioContext, ScenarioError, ScenarioReport};
use crate::topology::ProvisionedEndpoint;
use crate::tunnel::{Transport, TunnelChain};

/// Below this there is nowhere to migrate to
const MIN_COMPUTE_HOSTS: usize = 2;

/// Hypervisor to move to: the first one the server is not running on
pub fn pick_target<'h>(hosts: &'h [String], current: &str) -> Option<&'h str> {
    hosts.iter().map(String::as_str).find(|h| *h != current)
}

pub async fn run<T: Transport>(
    ctx: &ScenarioContext<'_, T>,
    endpoints: &[ProvisionedEndpoint],
    report: &mut ScenarioReport,
) -> Result<(), ScenarioError> {
    let hosts = ctx.cloud.list_compute_hosts().await?;
    if hosts.len() < MIN_COMPUTE_HOSTS {
        return Err(ScenarioError::Skipped(format!(
            "{} compute host(s), live migration needs {}",
            hosts.len(),
            MIN_COMPUTE_HOSTS
        )));
    }

    let mut migrated = 0;
    for endpoint in endpoints {
        let Some(hop) = endpoint.public_hop() else {
            continue;
        };
        let mut chain = TunnelChain::connect(ctx.transport, &[hop], true).await?;
        let result = migrate_under_session(ctx, endpoint, &hosts, &mut chain, report).await;
        chain.close().await;
        result?;
        migrated += 1;
    }
    if migrated == 0 {
        return Err(ScenarioError::MissingEndpoint(
            "server with a floating IP".to_string(),
        ));
    }
    Ok(())
}

async fn migrate_under_session<T: Transport>(
    ctx: &ScenarioContext<'_, T>,
    endpoint: &ProvisionedEndpoint,
    hosts: &[String],
    chain: &mut TunnelChain<'_, T>,
    report: &mut ScenarioReport,
) -> Result<(), ScenarioError> {
    let timeout = ctx.settings.ssh.command_timeout();
    let server_id = &endpoint.server.id;
    let fail = |reason: String| ScenarioError::CheckFailed {
        endpoint: endpoint.name().to_string(),
        reason,
    };

    let before = chain.exec("hostname", timeout).await?.trim().to_string();
    let current = ctx.cloud.server_host(server_id).await?;
    let target = pick_target(hosts, &current)
        .ok_or_else(|| fail(format!("no hypervisor other than {}", current)))?;

    info!("Migrating {} from {} to {}", endpoint.name(), current, target);
    ctx.cloud.live_migrate_server(server_id, target, true).await?;
    let landed = ctx.cloud.server_host(server_id).await?;
    if landed != target {
        return Err(fail(format!("expected on {}, found on {}", target, landed)));
    }

    let after = chain.exec("hostname", timeout).await?.trim().to_string();
    if after != before {
        return Err(fail(format!(
            "session answered as '{}' before migrating and '{}' after",
            before, after
        )));
    }
    report.record_check(format!(
        "{} moved from {} to {} with its ssh session open",
        endpoint.name(),
        current,
        target
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_target_skips_current_host() {
        let hosts = vec!["cmp-1".to_string(), "cmp-2".to_string(), "cmp-3".to_string()];
        assert_eq!(pick_target(&hosts, "cmp-1"), Some("cmp-2"));
        assert_eq!(pick_target(&hosts, "cmp-2"), Some("cmp-1"));
        assert_eq!(pick_target(&hosts[..1], "cmp-1"), None);
    }
}
