//! End-to-end scenarios
//!
//! A scenario provisions a topology for every tenant of a document, runs its
//! checks, stops whatever it started on the guests and tears the tenant down
//! again, whatever the outcome. Tenants run concurrently.

pub mod connectivity;
pub mod dnat;
pub mod lbaas;
pub mod live_migrate;
pub mod report;

use std::fmt;

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::cloud::{rand_name, CloudApi, CloudError, TenantContext};
use crate::config::{TopologyDocument, TopologySpec};
use crate::lb::LbError;
use crate::oracle::OracleError;
use crate::probe::ProbeError;
use crate::settings::Settings;
use crate::topology::{
    CleanupAction, ProvisionError, ProvisionSession, ProvisionedEndpoint, TopologyBuilder,
};
use crate::tunnel::{CommandChannel, Transport, TunnelError};

pub use report::{BatchRecord, Outcome, ScenarioReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    LbaasRoundRobin,
    LbaasPersistence,
    LbaasHealth,
    Connectivity,
    Dnat,
    LiveMigrate,
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScenarioKind::LbaasRoundRobin => "lbaas-round-robin",
            ScenarioKind::LbaasPersistence => "lbaas-persistence",
            ScenarioKind::LbaasHealth => "lbaas-health",
            ScenarioKind::Connectivity => "connectivity",
            ScenarioKind::Dnat => "dnat",
            ScenarioKind::LiveMigrate => "live-migrate",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Lb(#[from] LbError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("Topology has no {0}")]
    MissingEndpoint(String),

    #[error("Check failed on {endpoint}: {reason}")]
    CheckFailed { endpoint: String, reason: String },

    /// The cloud cannot run this scenario; not a failure
    #[error("Skipped: {0}")]
    Skipped(String),
}

/// Opens a shell on the host running the scenarios
pub type LocalShellFactory = dyn Fn() -> Box<dyn CommandChannel> + Send + Sync;

/// Collaborators and settings shared by every scenario
pub struct ScenarioContext<'a, T: Transport> {
    pub cloud: &'a dyn CloudApi,
    pub transport: &'a T,
    pub settings: &'a Settings,
    pub local_shell: &'a LocalShellFactory,
}

impl<'a, T: Transport> ScenarioContext<'a, T> {
    pub fn new(
        cloud: &'a dyn CloudApi,
        transport: &'a T,
        settings: &'a Settings,
        local_shell: &'a LocalShellFactory,
    ) -> Self {
        Self {
            cloud,
            transport,
            settings,
            local_shell,
        }
    }

    /// The configured tenant, or a fresh one whose deletion is recorded first
    pub async fn resolve_tenant(
        &self,
        name: Option<&str>,
        session: &mut ProvisionSession,
    ) -> Result<TenantContext, CloudError> {
        match name {
            None => self.cloud.current_tenant().await,
            Some(name) => {
                let tenant = self.cloud.create_tenant(&rand_name(name)).await?;
                session.push(CleanupAction::DeleteTenant(tenant.id.clone()));
                info!("Created tenant {} for {}", tenant.name, name);
                Ok(tenant)
            }
        }
    }

    /// Run `kind` for every tenant of the document
    pub async fn run_document(
        &self,
        kind: ScenarioKind,
        document: &TopologyDocument,
    ) -> Vec<ScenarioReport> {
        let runs = document
            .tenant_topologies()
            .into_iter()
            .map(|(tenant, spec)| self.run_tenant(kind, tenant, spec));
        join_all(runs).await
    }

    async fn run_tenant(
        &self,
        kind: ScenarioKind,
        tenant_name: Option<&str>,
        spec: &TopologySpec,
    ) -> ScenarioReport {
        let mut session = ProvisionSession::new();
        let mut report = ScenarioReport::new(kind, tenant_name.unwrap_or("default"));

        let result = match self.resolve_tenant(tenant_name, &mut session).await {
            Ok(tenant) => {
                report.tenant = tenant.name.clone();
                self.provision_and_run(kind, &tenant, spec, &mut session, &mut report)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        let summary = session.teardown(self.cloud).await;
        if !summary.is_clean() {
            warn!(
                "Teardown of {} left {} resources behind",
                report.tenant, summary.failed
            );
        }
        report.teardown = Some(summary);

        match result {
            Ok(()) => {
                info!("{} passed for {}", kind, report.tenant);
                report.finish(Ok(()));
            }
            Err(ScenarioError::Skipped(reason)) => {
                warn!("{} skipped for {}: {}", kind, report.tenant, reason);
                report.skip(reason);
            }
            Err(e) => {
                error!("{} failed for {}: {}", kind, report.tenant, e);
                report.finish(Err(e.to_string()));
            }
        }
        report
    }

    async fn provision_and_run(
        &self,
        kind: ScenarioKind,
        tenant: &TenantContext,
        spec: &TopologySpec,
        session: &mut ProvisionSession,
        report: &mut ScenarioReport,
    ) -> Result<(), ScenarioError> {
        let builder = TopologyBuilder::new(self.cloud, self.transport, self.settings);
        let endpoints = builder.build(spec, tenant, session).await?;
        self.exercise(kind, tenant, &endpoints, session, report).await
    }

    /// Run the checks of one scenario against provisioned endpoints
    pub async fn exercise(
        &self,
        kind: ScenarioKind,
        tenant: &TenantContext,
        endpoints: &[ProvisionedEndpoint],
        session: &mut ProvisionSession,
        report: &mut ScenarioReport,
    ) -> Result<(), ScenarioError> {
        match kind {
            ScenarioKind::LbaasRoundRobin
            | ScenarioKind::LbaasPersistence
            | ScenarioKind::LbaasHealth => {
                lbaas::run(self, kind, tenant, endpoints, session, report).await
            }
            ScenarioKind::Connectivity => connectivity::run(self, endpoints, report).await,
            ScenarioKind::Dnat => dnat::run(self, endpoints, report).await,
            ScenarioKind::LiveMigrate => live_migrate::run(self, endpoints, report).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn test_kind_names_match_cli_values() {
        for kind in ScenarioKind::value_variants() {
            let value = kind.to_possible_value().unwrap();
            assert_eq!(value.get_name(), kind.to_string());
        }
    }
}
