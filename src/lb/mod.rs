//! Load balancer verification
//!
//! [`LoadBalancerMonitor`] creates the pool, its members, the VIP and an
//! optional health monitor, sends batches of TCP probes to the VIP and judges
//! the spread of answers. Every backend answers with its own hostname, so a
//! batch boils down to [`Counters`].

pub mod responder;

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cloud::{
    rand_name, CloudApi, CloudError, HealthMonitorRequest, LbMethod, Persistence, PoolRequest,
    TenantContext, Vip, VipRequest,
};
use crate::settings::LbSettings;
use crate::topology::{CleanupAction, ProvisionSession};
use crate::tunnel::{CommandChannel, TunnelError};

pub use responder::{Responder, ResponderSet};

/// Counter key for probes no backend answered
pub const FAILURES_KEY: &str = "failures";

const LB_PROTOCOL: &str = "TCP";

#[derive(Error, Debug)]
pub enum LbError {
    #[error("Cloud error while trying to {operation}: {source}")]
    Cloud {
        operation: &'static str,
        #[source]
        source: CloudError,
    },

    #[error("Cannot {operation} while the load balancer is {actual}")]
    InvalidState {
        operation: &'static str,
        actual: LbState,
    },

    #[error("VIP {vip} did not answer with a backend within {timeout:?}")]
    ReachabilityTimeout { vip: String, timeout: Duration },

    #[error("Backend {backend} did not answer again within {timeout:?}")]
    HealthMonitorTimeout { backend: String, timeout: Duration },

    #[error("Balancing assertion failed: {reason} ({counters})")]
    BalancingAssertionFailed { reason: String, counters: Counters },

    #[error("The pool has no members")]
    NoMembers,

    #[error("No pool member with index {0}")]
    UnknownMember(usize),

    #[error("Responder on {host} did not report a pid: '{output}'")]
    ResponderStart { host: String, output: String },

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

fn cloud_error(operation: &'static str) -> impl FnOnce(CloudError) -> LbError {
    move |source| LbError::Cloud { operation, source }
}

/// Lifecycle of the load balancer under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LbState {
    Unprovisioned,
    Created,
    MembersRegistered,
    Active,
    HealthFault,
    Recovered,
    Verified,
}

impl fmt::Display for LbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LbState::Unprovisioned => "unprovisioned",
            LbState::Created => "created",
            LbState::MembersRegistered => "members registered",
            LbState::Active => "active",
            LbState::HealthFault => "in health fault",
            LbState::Recovered => "recovered",
            LbState::Verified => "verified",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// SBIO: Pure data structures and functions (no I/O)
// ============================================================================

/// Hits per backend hostname plus the reserved `failures` key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Counters(BTreeMap<String, u32>);

impl Counters {
    /// Zeroed counters for the given backends
    pub fn new<'a>(hostnames: impl IntoIterator<Item = &'a str>) -> Self {
        let mut map: BTreeMap<String, u32> = hostnames
            .into_iter()
            .map(|h| (h.to_string(), 0))
            .collect();
        map.insert(FAILURES_KEY.to_string(), 0);
        Self(map)
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, u32)>) -> Self {
        let mut counters = Self::default();
        counters.0.insert(FAILURES_KEY.to_string(), 0);
        for (key, value) in pairs {
            counters.0.insert(key.to_string(), value);
        }
        counters
    }

    pub fn record(&mut self, hostname: &str) {
        *self.0.entry(hostname.to_string()).or_insert(0) += 1;
    }

    pub fn record_failure(&mut self) {
        self.record(FAILURES_KEY);
    }

    pub fn hits(&self, hostname: &str) -> u32 {
        self.0.get(hostname).copied().unwrap_or(0)
    }

    pub fn failures(&self) -> u32 {
        self.hits(FAILURES_KEY)
    }

    /// Probes counted, failures included
    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    /// Backends with at least one hit
    pub fn backends_hit(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, v)| k.as_str() != FAILURES_KEY && **v > 0)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn as_map(&self) -> &BTreeMap<String, u32> {
        &self.0
    }
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// The member a probe answer came from: the longest hostname it contains
pub fn classify_response<'a>(output: &str, hostnames: &[&'a str]) -> Option<&'a str> {
    hostnames
        .iter()
        .filter(|h| !h.is_empty() && output.contains(**h))
        .max_by_key(|h| h.len())
        .copied()
}

/// Judge one probe batch.
///
/// Round robin needs a hit on every backend, session persistence needs hits
/// on exactly one. Either way fewer than `max_failures` probes may go
/// unanswered.
pub fn verify_distribution(
    counters: &Counters,
    hostnames: &[&str],
    sticky: bool,
    max_failures: u32,
) -> Result<(), LbError> {
    let fail = |reason: String| LbError::BalancingAssertionFailed {
        reason,
        counters: counters.clone(),
    };
    if counters.failures() >= max_failures {
        return Err(fail(format!(
            "{} probes failed, at most {} allowed",
            counters.failures(),
            max_failures.saturating_sub(1)
        )));
    }
    let hit: Vec<&str> = hostnames
        .iter()
        .copied()
        .filter(|h| counters.hits(h) > 0)
        .collect();
    if sticky {
        if hit.len() != 1 {
            return Err(fail(format!(
                "expected exactly one backend with hits, got {}",
                hit.len()
            )));
        }
    } else if let Some(missed) = hostnames.iter().find(|h| counters.hits(h) == 0) {
        return Err(fail(format!("backend {} received no traffic", missed)));
    }
    Ok(())
}

/// Judge a batch sent while one backend is down: the faulted backend gets
/// nothing and the rest keep rotating
pub fn verify_failover(
    counters: &Counters,
    faulted: &str,
    healthy: &[&str],
    max_failures: u32,
) -> Result<(), LbError> {
    let hits = counters.hits(faulted);
    if hits > 0 {
        return Err(LbError::BalancingAssertionFailed {
            reason: format!("backend {} is down but answered {} probes", faulted, hits),
            counters: counters.clone(),
        });
    }
    // A single-member pool has nobody left to answer
    if healthy.is_empty() {
        return Ok(());
    }
    verify_distribution(counters, healthy, false, max_failures)
}

/// Command opening one TCP connection to the VIP and printing the answer
pub fn probe_command(address: &str, port: u16, timeout: Duration) -> String {
    format!("nc -w {} {} {}", timeout.as_secs().max(1), address, port)
}

// ============================================================================
// Pool description
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolMember {
    pub address: String,
    pub hostname: String,
    pub server_id: String,
}

/// What the pool is built from, and what was created for it
#[derive(Debug, Clone, Default, Serialize)]
pub struct Pool {
    pub subnet_id: String,
    pub vip_subnet_id: String,
    pub members: Vec<PoolMember>,
    pub pool_id: Option<String>,
    pub member_ids: Vec<String>,
    pub vip: Option<Vip>,
    pub health_monitor_id: Option<String>,
}

impl Pool {
    pub fn new(
        subnet_id: impl Into<String>,
        vip_subnet_id: impl Into<String>,
        members: Vec<PoolMember>,
    ) -> Self {
        Self {
            subnet_id: subnet_id.into(),
            vip_subnet_id: vip_subnet_id.into(),
            members,
            ..Self::default()
        }
    }

    pub fn hostnames(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.hostname.as_str()).collect()
    }

    pub fn vip_address(&self) -> Option<&str> {
        self.vip.as_ref().map(|v| v.address.as_str())
    }
}

// ============================================================================
// Monitor
// ============================================================================

pub struct LoadBalancerMonitor<'a> {
    cloud: &'a dyn CloudApi,
    tenant: &'a TenantContext,
    settings: &'a LbSettings,
    state: LbState,
}

impl<'a> LoadBalancerMonitor<'a> {
    pub fn new(
        cloud: &'a dyn CloudApi,
        tenant: &'a TenantContext,
        settings: &'a LbSettings,
    ) -> Self {
        Self {
            cloud,
            tenant,
            settings,
            state: LbState::Unprovisioned,
        }
    }

    pub fn state(&self) -> LbState {
        self.state
    }

    fn require(&self, operation: &'static str, allowed: &[LbState]) -> Result<(), LbError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LbError::InvalidState {
                operation,
                actual: self.state,
            })
        }
    }

    fn vip_of<'p>(&self, operation: &'static str, pool: &'p Pool) -> Result<&'p Vip, LbError> {
        pool.vip.as_ref().ok_or(LbError::InvalidState {
            operation,
            actual: self.state,
        })
    }

    /// Create a TCP pool, with a TCP health monitor when asked for
    pub async fn create_pool(
        &mut self,
        pool: &mut Pool,
        method: LbMethod,
        wants_health_monitor: bool,
        session: &mut ProvisionSession,
    ) -> Result<(), LbError> {
        self.require("create a pool", &[LbState::Unprovisioned])?;
        let request = PoolRequest {
            name: rand_name("pool"),
            subnet_id: pool.subnet_id.clone(),
            lb_method: method,
            protocol: LB_PROTOCOL.to_string(),
        };
        let created = self
            .cloud
            .create_pool(self.tenant, &request)
            .await
            .map_err(cloud_error("create a pool"))?;
        session.push(CleanupAction::DeletePool(created.id.clone()));
        info!("Created pool {} ({:?})", created.name, method);

        if wants_health_monitor {
            let monitor = self
                .cloud
                .create_health_monitor(self.tenant, &HealthMonitorRequest::tcp_default())
                .await
                .map_err(cloud_error("create a health monitor"))?;
            session.push(CleanupAction::DeleteHealthMonitor(monitor.id.clone()));
            self.cloud
                .associate_health_monitor(&monitor.id, &created.id)
                .await
                .map_err(cloud_error("associate the health monitor"))?;
            session.push(CleanupAction::DisassociateHealthMonitor {
                health_monitor_id: monitor.id.clone(),
                pool_id: created.id.clone(),
            });
            pool.health_monitor_id = Some(monitor.id);
        }

        pool.pool_id = Some(created.id);
        self.state = LbState::Created;
        Ok(())
    }

    /// Register every backend on the shared protocol port
    pub async fn register_members(
        &mut self,
        pool: &mut Pool,
        session: &mut ProvisionSession,
    ) -> Result<(), LbError> {
        self.require("register members", &[LbState::Created])?;
        if pool.members.is_empty() {
            return Err(LbError::NoMembers);
        }
        let pool_id = pool.pool_id.clone().ok_or(LbError::InvalidState {
            operation: "register members",
            actual: self.state,
        })?;
        for member in &pool.members {
            let created = self
                .cloud
                .create_member(self.tenant, &pool_id, &member.address, self.settings.protocol_port)
                .await
                .map_err(cloud_error("register a member"))?;
            session.push(CleanupAction::DeleteMember(created.id.clone()));
            debug!("Registered {} ({})", member.hostname, member.address);
            pool.member_ids.push(created.id);
        }
        self.state = LbState::MembersRegistered;
        Ok(())
    }

    pub async fn create_vip(
        &mut self,
        pool: &mut Pool,
        session: &mut ProvisionSession,
    ) -> Result<Vip, LbError> {
        self.require("create the VIP", &[LbState::MembersRegistered])?;
        let pool_id = pool.pool_id.clone().ok_or(LbError::InvalidState {
            operation: "create the VIP",
            actual: self.state,
        })?;
        let request = VipRequest {
            name: rand_name("vip"),
            subnet_id: pool.vip_subnet_id.clone(),
            pool_id,
            protocol: LB_PROTOCOL.to_string(),
            protocol_port: self.settings.protocol_port,
        };
        let vip = self
            .cloud
            .create_vip(self.tenant, &request)
            .await
            .map_err(cloud_error("create the VIP"))?;
        session.push(CleanupAction::DeleteVip(vip.id.clone()));
        info!("VIP is {}:{}", vip.address, vip.protocol_port);
        pool.vip = Some(vip.clone());
        self.state = LbState::Active;
        Ok(vip)
    }

    pub async fn set_session_persistence(
        &mut self,
        pool: &mut Pool,
        persistence: Option<Persistence>,
    ) -> Result<(), LbError> {
        self.require(
            "change session persistence",
            &[LbState::Active, LbState::Recovered, LbState::Verified],
        )?;
        let vip_id = self.vip_of("change session persistence", pool)?.id.clone();
        let updated = self
            .cloud
            .update_vip_persistence(&vip_id, persistence)
            .await
            .map_err(cloud_error("change session persistence"))?;
        info!("Session persistence on {} is now {:?}", updated.address, persistence);
        pool.vip = Some(updated);
        Ok(())
    }

    /// Probe the VIP once per probe delay until some backend answers
    pub async fn wait_reachable(
        &self,
        channel: &mut dyn CommandChannel,
        pool: &Pool,
        timeout: Duration,
    ) -> Result<String, LbError> {
        let vip = self.vip_of("wait for the VIP", pool)?;
        let hostnames = pool.hostnames();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(backend) = self.probe_once(channel, vip, &hostnames).await? {
                info!("VIP {} answered from {}", vip.address, backend);
                return Ok(backend);
            }
            if Instant::now() + self.settings.probe_delay() > deadline {
                return Err(LbError::ReachabilityTimeout {
                    vip: vip.address.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(self.settings.probe_delay()).await;
        }
    }

    /// Send one probe. None when nothing recognizable came back.
    async fn probe_once(
        &self,
        channel: &mut dyn CommandChannel,
        vip: &Vip,
        hostnames: &[&str],
    ) -> Result<Option<String>, LbError> {
        let command = probe_command(&vip.address, vip.protocol_port, self.settings.probe_timeout());
        match channel
            .exec(&command, self.settings.probe_timeout() + Duration::from_secs(1))
            .await
        {
            Ok(output) => Ok(classify_response(&output, hostnames).map(str::to_string)),
            Err(TunnelError::NonZeroExit { .. }) | Err(TunnelError::CommandTimeout { .. }) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send `count` sequential probes and count who answered
    pub async fn send_probe_batch(
        &self,
        channel: &mut dyn CommandChannel,
        pool: &Pool,
        count: u32,
    ) -> Result<Counters, LbError> {
        self.require(
            "send probes",
            &[
                LbState::Active,
                LbState::HealthFault,
                LbState::Recovered,
                LbState::Verified,
            ],
        )?;
        let vip = self.vip_of("send probes", pool)?;
        let hostnames = pool.hostnames();
        let mut counters = Counters::new(hostnames.iter().copied());

        for index in 0..count {
            match self.probe_once(channel, vip, &hostnames).await? {
                Some(backend) => counters.record(&backend),
                None => counters.record_failure(),
            }
            if index + 1 < count {
                tokio::time::sleep(self.settings.probe_delay()).await;
            }
        }
        info!("Probe batch against {}: {}", vip.address, counters);
        Ok(counters)
    }

    /// Check a batch against the expected policy
    pub fn verify(
        &mut self,
        pool: &Pool,
        counters: &Counters,
        sticky: bool,
    ) -> Result<(), LbError> {
        self.require(
            "verify the distribution",
            &[LbState::Active, LbState::Recovered, LbState::Verified, LbState::HealthFault],
        )?;
        verify_distribution(counters, &pool.hostnames(), sticky, self.settings.max_failures)?;
        if self.state != LbState::HealthFault {
            self.state = LbState::Verified;
        }
        Ok(())
    }

    /// Check a batch sent after [`health_fault`](Self::health_fault) took
    /// member `faulted_index` down
    pub fn verify_failover(
        &self,
        pool: &Pool,
        counters: &Counters,
        faulted_index: usize,
    ) -> Result<(), LbError> {
        self.require("verify the failover", &[LbState::HealthFault])?;
        let faulted = pool
            .members
            .get(faulted_index)
            .ok_or(LbError::UnknownMember(faulted_index))?;
        let healthy: Vec<&str> = pool
            .members
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != faulted_index)
            .map(|(_, m)| m.hostname.as_str())
            .collect();
        verify_failover(counters, &faulted.hostname, &healthy, self.settings.max_failures)
    }

    /// Take one backend down by disabling its port, then give the health
    /// monitor time to notice. Returns the disabled port id.
    pub async fn health_fault(
        &mut self,
        pool: &Pool,
        member_index: usize,
        session: &mut ProvisionSession,
    ) -> Result<String, LbError> {
        self.require("inject a fault", &[LbState::Active, LbState::Verified])?;
        let member = pool
            .members
            .get(member_index)
            .ok_or(LbError::UnknownMember(member_index))?;
        let ports = self
            .cloud
            .list_ports(&member.server_id)
            .await
            .map_err(cloud_error("list backend ports"))?;
        let port = ports
            .iter()
            .find(|p| p.fixed_ips.iter().any(|ip| ip.ip_address == member.address))
            .or_else(|| ports.first())
            .ok_or(LbError::UnknownMember(member_index))?;

        self.cloud
            .set_port_admin_state(&port.id, false)
            .await
            .map_err(cloud_error("disable a backend port"))?;
        session.push(CleanupAction::EnablePort(port.id.clone()));
        warn!("Disabled port {} of {}", port.id, member.hostname);
        self.state = LbState::HealthFault;

        tokio::time::sleep(self.settings.health_detection()).await;
        Ok(port.id.clone())
    }

    /// Re-enable the faulted port and wait until its backend answers again
    pub async fn recover(
        &mut self,
        port_id: &str,
        channel: &mut dyn CommandChannel,
        pool: &Pool,
        member_index: usize,
        timeout: Duration,
    ) -> Result<(), LbError> {
        self.require("recover", &[LbState::HealthFault])?;
        let backend = pool
            .members
            .get(member_index)
            .map(|m| m.hostname.clone())
            .ok_or(LbError::UnknownMember(member_index))?;
        let vip = self.vip_of("recover", pool)?;
        self.cloud
            .set_port_admin_state(port_id, true)
            .await
            .map_err(cloud_error("enable a backend port"))?;

        let hostnames = pool.hostnames();
        let deadline = Instant::now() + timeout;
        loop {
            let answer = self.probe_once(channel, vip, &hostnames).await?;
            if answer.as_deref() == Some(backend.as_str()) {
                info!("{} is answering again", backend);
                self.state = LbState::Recovered;
                return Ok(());
            }
            if Instant::now() + self.settings.probe_delay() > deadline {
                return Err(LbError::HealthMonitorTimeout { backend, timeout });
            }
            tokio::time::sleep(self.settings.probe_delay()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::ScriptedChannel;
    use crate::simulate::SimulatedCloud;

    fn fast_settings() -> LbSettings {
        LbSettings {
            probe_delay_ms: 1,
            health_detection_secs: 0,
            ..LbSettings::default()
        }
    }

    #[test]
    fn test_round_robin_passes_with_both_backends() {
        let counters = Counters::from_pairs([("a", 12), ("b", 11), (FAILURES_KEY, 2)]);
        assert_eq!(counters.total(), 25);
        assert!(verify_distribution(&counters, &["a", "b"], false, 4).is_ok());
    }

    #[test]
    fn test_round_robin_fails_on_starved_backend() {
        let counters = Counters::from_pairs([("a", 25), ("b", 0)]);
        let err = verify_distribution(&counters, &["a", "b"], false, 4).unwrap_err();
        match err {
            LbError::BalancingAssertionFailed { counters: seen, .. } => assert_eq!(seen, counters),
            other => panic!("Unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_sticky_requires_exactly_one() {
        let one = Counters::from_pairs([("a", 25), ("b", 0)]);
        assert!(verify_distribution(&one, &["a", "b"], true, 4).is_ok());
        let two = Counters::from_pairs([("a", 20), ("b", 5)]);
        assert!(verify_distribution(&two, &["a", "b"], true, 4).is_err());
    }

    #[test]
    fn test_too_many_failures() {
        let counters = Counters::from_pairs([("a", 11), ("b", 10), (FAILURES_KEY, 4)]);
        assert!(verify_distribution(&counters, &["a", "b"], false, 4).is_err());
    }

    #[test]
    fn test_failover_keeps_rotating_over_survivors() {
        let counters = Counters::from_pairs([("a", 0), ("b", 12), ("c", 13)]);
        assert!(verify_failover(&counters, "a", &["b", "c"], 4).is_ok());

        let starved = Counters::from_pairs([("a", 0), ("b", 25), ("c", 0)]);
        assert!(verify_failover(&starved, "a", &["b", "c"], 4).is_err());

        let leaked = Counters::from_pairs([("a", 1), ("b", 12), ("c", 12)]);
        let err = verify_failover(&leaked, "a", &["b", "c"], 4).unwrap_err();
        assert!(err.to_string().contains("backend a is down"));
    }

    #[test]
    fn test_failover_with_single_survivor() {
        let counters = Counters::from_pairs([("a", 0), ("b", 23), (FAILURES_KEY, 2)]);
        assert!(verify_failover(&counters, "a", &["b"], 4).is_ok());
    }

    #[test]
    fn test_classify_prefers_longest_hostname() {
        let hostnames = ["backend-1", "backend-10"];
        assert_eq!(classify_response("backend-10\n", &hostnames), Some("backend-10"));
        assert_eq!(classify_response("backend-1", &hostnames), Some("backend-1"));
        assert_eq!(classify_response("Connection refused", &hostnames), None);
    }

    #[test]
    fn test_counters_display() {
        let mut counters = Counters::new(["a", "b"]);
        counters.record("a");
        counters.record_failure();
        assert_eq!(counters.to_string(), "{a: 1, b: 0, failures: 1}");
        assert_eq!(counters.backends_hit(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_out_of_order_calls_rejected() {
        let cloud = SimulatedCloud::new();
        let tenant = cloud.current_tenant().await.unwrap();
        let settings = fast_settings();
        let mut monitor = LoadBalancerMonitor::new(&cloud, &tenant, &settings);
        let mut session = ProvisionSession::new();
        let mut pool = Pool::new("subnet", "subnet", vec![]);

        let result = monitor.create_vip(&mut pool, &mut session).await;
        assert!(matches!(
            result,
            Err(LbError::InvalidState {
                actual: LbState::Unprovisioned,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_probe_batch_counts_scripted_answers() {
        let cloud = SimulatedCloud::new();
        let tenant = cloud.current_tenant().await.unwrap();
        let settings = fast_settings();
        let mut monitor = LoadBalancerMonitor::new(&cloud, &tenant, &settings);
        let mut session = ProvisionSession::new();
        let members = vec![
            PoolMember {
                address: "10.0.0.3".to_string(),
                hostname: "backend-a".to_string(),
                server_id: "s1".to_string(),
            },
            PoolMember {
                address: "10.0.0.4".to_string(),
                hostname: "backend-b".to_string(),
                server_id: "s2".to_string(),
            },
        ];
        let mut pool = Pool::new(
            crate::simulate::PUBLIC_SUBNET_ID,
            crate::simulate::PUBLIC_SUBNET_ID,
            members,
        );
        monitor
            .create_pool(&mut pool, LbMethod::RoundRobin, false, &mut session)
            .await
            .unwrap();
        monitor.register_members(&mut pool, &mut session).await.unwrap();
        monitor.create_vip(&mut pool, &mut session).await.unwrap();
        assert_eq!(monitor.state(), LbState::Active);

        let mut channel = ScriptedChannel::new(vec![
            Ok("backend-a".to_string()),
            Ok("backend-b".to_string()),
            Err(TunnelError::NonZeroExit {
                status: 1,
                output: String::new(),
            }),
            Ok("backend-a".to_string()),
        ]);
        let counters = monitor.send_probe_batch(&mut channel, &pool, 4).await.unwrap();
        assert_eq!(counters.hits("backend-a"), 2);
        assert_eq!(counters.hits("backend-b"), 1);
        assert_eq!(counters.failures(), 1);
        assert_eq!(counters.total(), 4);
        assert!(channel.commands[0].starts_with("nc -w 5 "));

        monitor.verify(&pool, &counters, false).unwrap();
        assert_eq!(monitor.state(), LbState::Verified);
        assert_eq!(session.len(), 4);
    }
}
