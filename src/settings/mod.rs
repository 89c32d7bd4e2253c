//! Runtime settings for netscenario
//!
//! Settings are an explicit value loaded once (default: `~/.netscenario/config`)
//! and handed to the builder, probes, monitor and transports. Every field has a
//! default so an empty or missing file yields a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default settings file location: ~/.netscenario/config
pub fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".netscenario")
        .join("config")
}

/// Errors that can occur while loading settings
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to parse settings: {0}")]
    ParseError(String),

    #[error("Failed to write settings: {0}")]
    WriteError(String),

    #[error("Invalid setting {0}: {1}")]
    Invalid(&'static str, String),

    #[error("Environment variable {0} is not set")]
    MissingSecret(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// The complete settings file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub cloud: CloudSettings,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub lb: LbSettings,
    #[serde(default)]
    pub guest: GuestSettings,
    #[serde(default)]
    pub oracle: OracleSettings,
}

/// Cloud control plane and provisioning defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    /// Keystone v3 endpoint, e.g. http://controller:5000/v3
    pub auth_url: String,
    pub username: String,
    /// Name of the environment variable holding the password
    pub password_env: String,
    /// Project (tenant) the scenarios run in unless a document creates tenants
    pub project: String,
    pub user_domain: String,
    pub project_domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// External network floating IPs are allocated from
    pub public_network_id: String,
    /// Existing router with an external gateway; created per tenant when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_router_id: Option<String>,
    pub image_ref: String,
    pub flavor_ref: String,
    /// Range tenant subnets without an explicit CIDR are carved from
    pub tenant_network_cidr: String,
    pub tenant_network_mask_bits: u8,
    /// How long to wait for a server to become ACTIVE
    pub build_timeout_secs: u64,
    pub build_interval_secs: u64,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            auth_url: "http://127.0.0.1:5000/v3".to_string(),
            username: "admin".to_string(),
            password_env: "OS_PASSWORD".to_string(),
            project: "admin".to_string(),
            user_domain: "Default".to_string(),
            project_domain: "Default".to_string(),
            region: None,
            public_network_id: String::new(),
            public_router_id: None,
            image_ref: String::new(),
            flavor_ref: "1".to_string(),
            tenant_network_cidr: "10.100.0.0/16".to_string(),
            tenant_network_mask_bits: 28,
            build_timeout_secs: 300,
            build_interval_secs: 1,
        }
    }
}

impl CloudSettings {
    /// Resolve the password from the configured environment variable
    pub fn password(&self) -> Result<String, SettingsError> {
        std::env::var(&self.password_env)
            .map_err(|_| SettingsError::MissingSecret(self.password_env.clone()))
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

/// Remote execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Login user on guest images
    pub user: String,
    pub connect_timeout_secs: u64,
    /// Default timeout for a single remote command
    pub command_timeout_secs: u64,
    /// ssh client binary
    pub binary: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "cirros".to_string(),
            connect_timeout_secs: 10,
            command_timeout_secs: 60,
            binary: "ssh".to_string(),
        }
    }
}

impl SshSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Connectivity probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Delay between two pings of a polling loop
    pub ping_interval_ms: u64,
    /// How long a polling ping loop may run
    pub ping_timeout_secs: u64,
    /// Timeout for single-shot probe commands
    pub command_timeout_secs: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1000,
            ping_timeout_secs: 120,
            command_timeout_secs: 30,
        }
    }
}

impl ProbeSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Load balancer verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LbSettings {
    /// Port backends listen on and the VIP forwards to
    pub protocol_port: u16,
    /// Probes per batch
    pub num_requests: u32,
    /// A batch fails once this many probes went unanswered
    pub max_failures: u32,
    /// Delay after every probe so the backend responder can respawn
    pub probe_delay_ms: u64,
    /// Timeout of a single probe connection
    pub probe_timeout_secs: u64,
    /// Time given to the health monitor to withdraw a disabled member
    pub health_detection_secs: u64,
    /// Time given to a re-enabled member to rejoin rotation
    pub recovery_timeout_secs: u64,
    /// Servers whose name contains this string become pool members
    pub member_name_filter: String,
    /// A server whose name contains this string sends the probes
    pub client_name_filter: String,
}

impl Default for LbSettings {
    fn default() -> Self {
        Self {
            protocol_port: 8080,
            num_requests: 25,
            max_failures: 4,
            probe_delay_ms: 1000,
            probe_timeout_secs: 5,
            health_detection_secs: 10,
            recovery_timeout_secs: 60,
            member_name_filter: "backend".to_string(),
            client_name_filter: "client".to_string(),
        }
    }
}

impl LbSettings {
    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn health_detection(&self) -> Duration {
        Duration::from_secs(self.health_detection_secs)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Guest image quirks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestSettings {
    /// Prints the operational state of interface `{iface}`
    pub interface_state_command: String,
    /// Brings interface `{iface}` up through DHCP
    pub interface_up_command: String,
    /// Interface names are `{prefix}{index}`
    pub interface_prefix: String,
    pub fixup_timeout_secs: u64,
}

impl Default for GuestSettings {
    fn default() -> Self {
        Self {
            interface_state_command: "cat /sys/class/net/{iface}/operstate".to_string(),
            interface_up_command: "sudo /sbin/cirros-dhcpc up {iface}".to_string(),
            interface_prefix: "eth".to_string(),
            fixup_timeout_secs: 300,
        }
    }
}

impl GuestSettings {
    pub fn interface_name(&self, index: usize) -> String {
        format!("{}{}", self.interface_prefix, index)
    }

    pub fn state_command(&self, iface: &str) -> String {
        self.interface_state_command.replace("{iface}", iface)
    }

    pub fn up_command(&self, iface: &str) -> String {
        self.interface_up_command.replace("{iface}", iface)
    }

    pub fn fixup_timeout(&self) -> Duration {
        Duration::from_secs(self.fixup_timeout_secs)
    }
}

/// Local services the DNAT scenario reaches from inside the cloud
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    pub bind_address: String,
    /// Address guests use to reach this host; the bind address when unset
    pub advertise_address: Option<String>,
    /// 0 picks a free port
    pub http_port: u16,
    pub udp_port: u16,
    pub timeout_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            advertise_address: None,
            http_port: 8000,
            udp_port: 9999,
            timeout_secs: 5,
        }
    }
}

impl OracleSettings {
    pub fn advertised(&self) -> &str {
        self.advertise_address
            .as_deref()
            .unwrap_or(&self.bind_address)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse settings from a YAML string
pub fn parse_settings(content: &str) -> Result<Settings, SettingsError> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    let settings: Settings =
        serde_yaml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Serialize settings to a YAML string
pub fn serialize_settings(settings: &Settings) -> Result<String, SettingsError> {
    serde_yaml::to_string(settings).map_err(|e| SettingsError::WriteError(e.to_string()))
}

/// Reject values no scenario can run with
pub fn validate_settings(settings: &Settings) -> Result<(), SettingsError> {
    let range: ipnet::IpNet = settings
        .cloud
        .tenant_network_cidr
        .parse()
        .map_err(|e: ipnet::AddrParseError| {
            SettingsError::Invalid("cloud.tenant_network_cidr", e.to_string())
        })?;
    if settings.cloud.tenant_network_mask_bits < range.prefix_len()
        || settings.cloud.tenant_network_mask_bits > range.max_prefix_len()
    {
        return Err(SettingsError::Invalid(
            "cloud.tenant_network_mask_bits",
            format!(
                "{} does not fit inside {}",
                settings.cloud.tenant_network_mask_bits, range
            ),
        ));
    }
    if settings.lb.num_requests == 0 {
        return Err(SettingsError::Invalid(
            "lb.num_requests",
            "at least one probe is required".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load settings from an explicit path, or the default location.
/// A missing file yields the defaults.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, SettingsError> {
    let path = match path {
        Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
        None => default_settings_path(),
    };
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(&path)?;
    parse_settings(&content)
}

/// Save settings to a specific path
pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_settings(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}
