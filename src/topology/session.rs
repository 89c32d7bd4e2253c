//! Cleanup bookkeeping for one provisioning run
//!
//! Every resource the builder or the load balancer monitor creates pushes a
//! [`CleanupAction`]. Teardown replays the stack in reverse, so dependants go
//! before the resources they depend on.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cloud::{CloudApi, CloudError};

/// One undo step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    DeleteTenant(String),
    DeleteRouter(String),
    RemoveRouterInterface { router_id: String, subnet_id: String },
    DeleteNetwork(String),
    DeleteSubnet(String),
    DeleteSecurityGroup(String),
    DeleteSecurityGroupRule(String),
    DeleteKeypair(String),
    DeleteServer(String),
    DeleteFloatingIp(String),
    DeletePool(String),
    DeleteMember(String),
    DeleteVip(String),
    DeleteHealthMonitor(String),
    DisassociateHealthMonitor { health_monitor_id: String, pool_id: String },
    /// Re-enable a port disabled to simulate a backend failure
    EnablePort(String),
}

impl CleanupAction {
    pub async fn execute(&self, cloud: &dyn CloudApi) -> Result<(), CloudError> {
        match self {
            CleanupAction::DeleteTenant(id) => cloud.delete_tenant(id).await,
            CleanupAction::DeleteRouter(id) => cloud.delete_router(id).await,
            CleanupAction::RemoveRouterInterface {
                router_id,
                subnet_id,
            } => cloud.remove_router_interface(router_id, subnet_id).await,
            CleanupAction::DeleteNetwork(id) => cloud.delete_network(id).await,
            CleanupAction::DeleteSubnet(id) => cloud.delete_subnet(id).await,
            CleanupAction::DeleteSecurityGroup(id) => cloud.delete_security_group(id).await,
            CleanupAction::DeleteSecurityGroupRule(id) => {
                cloud.delete_security_group_rule(id).await
            }
            CleanupAction::DeleteKeypair(name) => cloud.delete_keypair(name).await,
            CleanupAction::DeleteServer(id) => cloud.delete_server(id).await,
            CleanupAction::DeleteFloatingIp(id) => cloud.delete_floating_ip(id).await,
            CleanupAction::DeletePool(id) => cloud.delete_pool(id).await,
            CleanupAction::DeleteMember(id) => cloud.delete_member(id).await,
            CleanupAction::DeleteVip(id) => cloud.delete_vip(id).await,
            CleanupAction::DeleteHealthMonitor(id) => cloud.delete_health_monitor(id).await,
            CleanupAction::DisassociateHealthMonitor {
                health_monitor_id,
                pool_id,
            } => {
                cloud
                    .disassociate_health_monitor(health_monitor_id, pool_id)
                    .await
            }
            CleanupAction::EnablePort(id) => cloud.set_port_admin_state(id, true).await.map(|_| ()),
        }
    }
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupAction::DeleteTenant(id) => write!(f, "delete tenant {}", id),
            CleanupAction::DeleteRouter(id) => write!(f, "delete router {}", id),
            CleanupAction::RemoveRouterInterface {
                router_id,
                subnet_id,
            } => write!(f, "detach subnet {} from router {}", subnet_id, router_id),
            CleanupAction::DeleteNetwork(id) => write!(f, "delete network {}", id),
            CleanupAction::DeleteSubnet(id) => write!(f, "delete subnet {}", id),
            CleanupAction::DeleteSecurityGroup(id) => write!(f, "delete security group {}", id),
            CleanupAction::DeleteSecurityGroupRule(id) => {
                write!(f, "delete security group rule {}", id)
            }
            CleanupAction::DeleteKeypair(name) => write!(f, "delete keypair {}", name),
            CleanupAction::DeleteServer(id) => write!(f, "delete server {}", id),
            CleanupAction::DeleteFloatingIp(id) => write!(f, "delete floating ip {}", id),
            CleanupAction::DeletePool(id) => write!(f, "delete pool {}", id),
            CleanupAction::DeleteMember(id) => write!(f, "delete member {}", id),
            CleanupAction::DeleteVip(id) => write!(f, "delete vip {}", id),
            CleanupAction::DeleteHealthMonitor(id) => write!(f, "delete health monitor {}", id),
            CleanupAction::DisassociateHealthMonitor {
                health_monitor_id,
                pool_id,
            } => write!(
                f,
                "disassociate health monitor {} from pool {}",
                health_monitor_id, pool_id
            ),
            CleanupAction::EnablePort(id) => write!(f, "enable port {}", id),
        }
    }
}

/// Outcome of one teardown pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownSummary {
    pub executed: usize,
    pub already_absent: usize,
    pub failed: usize,
}

impl TeardownSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// The cleanup stack of one provisioning run
#[derive(Debug, Default)]
pub struct ProvisionSession {
    actions: Vec<CleanupAction>,
}

impl ProvisionSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: CleanupAction) {
        debug!("Recorded cleanup: {}", action);
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Pending actions in creation order
    pub fn actions(&self) -> &[CleanupAction] {
        &self.actions
    }

    /// Execute every pending action, newest first. Resources that are
    /// already gone count as cleaned; other failures are logged and skipped.
    /// The stack is empty afterwards, so a second call does nothing.
    pub async fn teardown(&mut self, cloud: &dyn CloudApi) -> TeardownSummary {
        let mut summary = TeardownSummary::default();
        if self.actions.is_empty() {
            return summary;
        }
        info!("Tearing down {} resources", self.actions.len());

        while let Some(action) = self.actions.pop() {
            match action.execute(cloud).await {
                Ok(()) => summary.executed += 1,
                Err(e) if e.is_not_found() => {
                    debug!("Already absent: {}", action);
                    summary.already_absent += 1;
                }
                Err(e) => {
                    warn!("Cleanup step '{}' failed: {}", action, e);
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::TenantContext;
    use crate::simulate::SimulatedCloud;

    fn tenant() -> TenantContext {
        TenantContext {
            id: "tenant-demo".to_string(),
            name: "demo".to_string(),
        }
    }

    #[tokio::test]
    async fn test_teardown_runs_in_reverse() {
        let cloud = SimulatedCloud::new();
        let mut session = ProvisionSession::new();

        let router = cloud.create_router(&tenant(), "r", None).await.unwrap();
        session.push(CleanupAction::DeleteRouter(router.id.clone()));
        let network = cloud.create_network(&tenant(), "n").await.unwrap();
        session.push(CleanupAction::DeleteNetwork(network.id.clone()));
        let subnet = cloud
            .create_subnet(
                &tenant(),
                &crate::cloud::SubnetRequest {
                    network_id: network.id.clone(),
                    name: "s".to_string(),
                    cidr: "10.0.0.0/24".to_string(),
                    ip_version: 4,
                    dns_nameservers: vec![],
                    host_routes: vec![],
                },
            )
            .await
            .unwrap();
        session.push(CleanupAction::DeleteSubnet(subnet.id.clone()));
        cloud.add_router_interface(&router.id, &subnet.id).await.unwrap();
        session.push(CleanupAction::RemoveRouterInterface {
            router_id: router.id.clone(),
            subnet_id: subnet.id.clone(),
        });

        let summary = session.teardown(&cloud).await;
        assert_eq!(
            summary,
            TeardownSummary {
                executed: 4,
                already_absent: 0,
                failed: 0
            }
        );
        assert_eq!(cloud.live_resources(), 0);
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_tolerates_absent_and_is_repeatable() {
        let cloud = SimulatedCloud::new();
        let mut session = ProvisionSession::new();
        session.push(CleanupAction::DeleteServer("gone".to_string()));
        session.push(CleanupAction::DeleteKeypair("gone".to_string()));

        let first = session.teardown(&cloud).await;
        assert_eq!(first.already_absent, 2);
        assert!(first.is_clean());

        let second = session.teardown(&cloud).await;
        assert_eq!(second, TeardownSummary::default());
    }

    #[tokio::test]
    async fn test_teardown_continues_past_failures() {
        let cloud = SimulatedCloud::new();
        let mut session = ProvisionSession::new();
        let network = cloud.create_network(&tenant(), "n").await.unwrap();
        session.push(CleanupAction::DeleteNetwork(network.id));
        session.push(CleanupAction::DeleteVip("vip".to_string()));
        cloud.fail_on(
            "delete_vip",
            CloudError::Api {
                status: 500,
                message: "internal".to_string(),
            },
        );

        let summary = session.teardown(&cloud).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.executed, 1);
        assert!(!summary.is_clean());
    }

    #[test]
    fn test_action_display() {
        let action = CleanupAction::RemoveRouterInterface {
            router_id: "r1".to_string(),
            subnet_id: "s1".to_string(),
        };
        assert_eq!(action.to_string(), "detach subnet s1 from router r1");
    }
}
