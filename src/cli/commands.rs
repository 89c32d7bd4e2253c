//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{error, info};

use crate::cloud::CloudError;
use crate::config::{load_topology_file, ConfigError, TopologyDocument};
use crate::scenario::{ScenarioContext, ScenarioKind, ScenarioReport};
use crate::settings::SettingsError;
use crate::topology::{ProvisionSession, ProvisionedEndpoint, TeardownSummary, TopologyBuilder};
use crate::tunnel::{Hop, Transport, TunnelChain, TunnelError};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid hop '{0}', expected ADDRESS=KEY_FILE")]
    InvalidHop(String),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Validate
// ============================================================================

/// Per-tenant counts of a validated topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationSummary {
    pub tenant: String,
    pub routers: usize,
    pub networks: usize,
    pub security_groups: usize,
    pub servers: u32,
    pub gateway: bool,
}

/// Summarize an already validated document
pub fn summarize_document(document: &TopologyDocument) -> Vec<ValidationSummary> {
    document
        .tenant_topologies()
        .into_iter()
        .map(|(tenant, spec)| ValidationSummary {
            tenant: tenant.unwrap_or("(configured)").to_string(),
            routers: spec.routers.len(),
            networks: spec.networks.len(),
            security_groups: spec.security_groups.len(),
            servers: spec.server_count(),
            gateway: spec.gateway,
        })
        .collect()
}

/// Load, validate and summarize a topology file
pub fn validate_file(path: &Path) -> CommandResult<Vec<ValidationSummary>> {
    let document = load_topology_file(path)?;
    Ok(summarize_document(&document))
}

// ============================================================================
// Provision
// ============================================================================

/// Result of provisioning one tenant of a document
pub struct ProvisionedTenant {
    pub tenant: String,
    pub endpoints: Vec<ProvisionedEndpoint>,
    pub session: ProvisionSession,
    pub error: Option<String>,
}

/// Provision every tenant of the document concurrently. Failed tenants keep
/// their partial session so [`release`] can clean them up.
pub async fn provision<T: Transport>(
    ctx: &ScenarioContext<'_, T>,
    document: &TopologyDocument,
) -> Vec<ProvisionedTenant> {
    let builds = document
        .tenant_topologies()
        .into_iter()
        .map(|(name, spec)| async move {
            let mut session = ProvisionSession::new();
            let label = name.unwrap_or("(configured)").to_string();
            let tenant = match ctx.resolve_tenant(name, &mut session).await {
                Ok(tenant) => tenant,
                Err(e) => {
                    return ProvisionedTenant {
                        tenant: label,
                        endpoints: Vec::new(),
                        session,
                        error: Some(e.to_string()),
                    }
                }
            };
            let builder = TopologyBuilder::new(ctx.cloud, ctx.transport, ctx.settings);
            match builder.build(spec, &tenant, &mut session).await {
                Ok(endpoints) => ProvisionedTenant {
                    tenant: tenant.name,
                    endpoints,
                    session,
                    error: None,
                },
                Err(e) => {
                    error!("Provisioning {} failed: {}", tenant.name, e);
                    ProvisionedTenant {
                        tenant: tenant.name,
                        endpoints: Vec::new(),
                        session,
                        error: Some(e.to_string()),
                    }
                }
            }
        });
    join_all(builds).await
}

/// Tear every tenant down, in parallel
pub async fn release<T: Transport>(
    ctx: &ScenarioContext<'_, T>,
    tenants: Vec<ProvisionedTenant>,
) -> Vec<(String, TeardownSummary)> {
    let teardowns = tenants.into_iter().map(|mut t| async move {
        let summary = t.session.teardown(ctx.cloud).await;
        info!("Released {}: {} resources deleted", t.tenant, summary.executed);
        (t.tenant, summary)
    });
    join_all(teardowns).await
}

// ============================================================================
// Run
// ============================================================================

pub async fn run_scenario<T: Transport>(
    ctx: &ScenarioContext<'_, T>,
    kind: ScenarioKind,
    path: &Path,
) -> CommandResult<Vec<ScenarioReport>> {
    let document = load_topology_file(path)?;
    Ok(ctx.run_document(kind, &document).await)
}

/// True when nothing failed. Skipped runs do not count against the result.
pub fn all_passed(reports: &[ScenarioReport]) -> bool {
    !reports.is_empty() && reports.iter().all(|r| r.passed() || r.skipped())
}

// ============================================================================
// Exec
// ============================================================================

/// Split `ADDRESS=KEY_FILE`
pub fn parse_hop_arg(arg: &str) -> CommandResult<(String, PathBuf)> {
    match arg.split_once('=') {
        Some((address, key)) if !address.is_empty() && !key.is_empty() => {
            let key = shellexpand::tilde(key);
            Ok((address.to_string(), PathBuf::from(key.as_ref())))
        }
        _ => Err(CommandError::InvalidHop(arg.to_string())),
    }
}

/// Read the key files of every hop
pub fn load_hops(args: &[String]) -> CommandResult<Vec<(String, String)>> {
    args.iter()
        .map(|arg| {
            let (address, key_file) = parse_hop_arg(arg)?;
            let key = std::fs::read_to_string(&key_file)?;
            Ok((address, key))
        })
        .collect()
}

/// Run one command on the last hop and return its output
pub async fn exec<T: Transport>(
    transport: &T,
    hops: &[(String, String)],
    command: &str,
    timeout: Duration,
) -> CommandResult<String> {
    let hops: Vec<Hop<'_>> = hops
        .iter()
        .map(|(address, key)| Hop::new(address, key))
        .collect();
    let mut chain = TunnelChain::connect(transport, &hops, true).await?;
    let output = chain.exec(command, timeout).await;
    chain.close().await;
    Ok(output?)
}
