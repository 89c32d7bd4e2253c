//! Reachability checks run over a [`CommandChannel`]
//!
//! The probe only composes shell commands and interprets their output; where
//! the commands run (a tunnel to a guest, or the local shell) is decided by
//! the channel handed in.

pub mod routes;

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use crate::settings::ProbeSettings;
use crate::tunnel::{CommandChannel, TunnelError};

pub use routes::{parse_route_table, RouteEntry};

const METADATA_INSTANCE_ID_URL: &str = "http://169.254.169.254/latest/meta-data/instance-id";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Unexpected output from '{0}': {1}")]
    UnexpectedOutput(String, String),
}

fn ipv4_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"inet (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").expect("valid ipv4 pattern")
    })
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Extract IPv4 addresses from `ip addr` output, loopback excluded
pub fn parse_ipv4_addresses(output: &str) -> Vec<String> {
    ipv4_pattern()
        .captures_iter(output)
        .map(|c| c[1].to_string())
        .filter(|ip| !ip.starts_with("127."))
        .collect()
}

/// Compare the metadata instance id (`i-0000000a`) with the hypervisor
/// instance name (`instance-0000000a`) by their hexadecimal suffix
pub fn instance_ids_match(metadata_id: &str, instance_name: &str) -> bool {
    match (metadata_id.trim().rsplit_once('-'), instance_name.rsplit_once('-')) {
        (Some((_, a)), Some((_, b))) => !a.is_empty() && a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

/// Shell command echoing `payload` to a UDP port and printing the reply
pub fn udp_echo_command(host: &str, port: u16, payload: &str, timeout: Duration) -> String {
    format!(
        "echo \"{}\" | nc -u -w {} {} {}",
        payload,
        timeout.as_secs().max(1),
        host,
        port
    )
}

// ============================================================================
// Probe
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    settings: ProbeSettings,
}

impl ConnectivityProbe {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    async fn ping_once(&self, channel: &mut dyn CommandChannel, destination: &str) -> bool {
        let command = format!("ping -c1 -w1 {}", destination);
        match channel.exec(&command, self.settings.command_timeout()).await {
            Ok(_) => true,
            Err(TunnelError::NonZeroExit { .. }) => false,
            Err(e) => {
                debug!("Ping from {} failed: {}", channel.target(), e);
                false
            }
        }
    }

    /// Ping once per interval until the observation matches `expect_success`.
    /// Returns false when the timeout elapses first.
    pub async fn ping_until(
        &self,
        channel: &mut dyn CommandChannel,
        destination: &str,
        expect_success: bool,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let interval = self.settings.ping_interval();
        loop {
            if self.ping_once(channel, destination).await == expect_success {
                info!(
                    "{} -> {}: {} as expected",
                    channel.target(),
                    destination,
                    if expect_success { "reachable" } else { "unreachable" }
                );
                return true;
            }
            if Instant::now() + interval > deadline {
                return false;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Fetch a URL from the far end of the channel
    pub async fn http_get(
        &self,
        channel: &mut dyn CommandChannel,
        url: &str,
        timeout: Duration,
    ) -> Result<String, ProbeError> {
        let command = format!("curl -s -m {} {}", timeout.as_secs().max(1), url);
        Ok(channel.exec(&command, timeout + Duration::from_secs(1)).await?)
    }

    /// Send one UDP datagram and return the reply
    pub async fn udp_echo(
        &self,
        channel: &mut dyn CommandChannel,
        host: &str,
        port: u16,
        payload: &str,
        timeout: Duration,
    ) -> Result<String, ProbeError> {
        let command = udp_echo_command(host, port, payload, timeout);
        Ok(channel.exec(&command, timeout + Duration::from_secs(1)).await?)
    }

    /// IPv4 addresses configured on the far host
    pub async fn ip_addresses(
        &self,
        channel: &mut dyn CommandChannel,
    ) -> Result<Vec<String>, ProbeError> {
        let output = channel
            .exec("ip -4 addr show", self.settings.command_timeout())
            .await?;
        Ok(parse_ipv4_addresses(&output))
    }

    /// Routing table of the far host
    pub async fn routes(
        &self,
        channel: &mut dyn CommandChannel,
    ) -> Result<Vec<RouteEntry>, ProbeError> {
        let command = "sudo /sbin/route -n";
        let output = channel.exec(command, self.settings.command_timeout()).await?;
        let table = parse_route_table(&output);
        if table.is_empty() {
            return Err(ProbeError::UnexpectedOutput(command.to_string(), output));
        }
        Ok(table)
    }

    /// Instance id served by the metadata service to the far host
    pub async fn metadata_instance_id(
        &self,
        channel: &mut dyn CommandChannel,
    ) -> Result<String, ProbeError> {
        let output = self
            .http_get(channel, METADATA_INSTANCE_ID_URL, self.settings.command_timeout())
            .await?;
        let id = output.trim().to_string();
        if id.is_empty() {
            return Err(ProbeError::UnexpectedOutput(
                METADATA_INSTANCE_ID_URL.to_string(),
                output,
            ));
        }
        Ok(id)
    }
}
