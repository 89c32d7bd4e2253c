//! [`Transport`] over the system `ssh` client
//!
//! Every session owns a generated ssh_config holding one `Host` block per hop
//! up to itself. Hop N is reached with `ProxyCommand ssh -F <config> -W %h:%p
//! hop<N-1>`, so a command on the last hop tunnels through every predecessor.
//!
//! Each hop keeps a persistent master connection whose control socket lives
//! in a directory shared by the whole chain. The master is started when the
//! session opens and every command is multiplexed over it, so a chain kept
//! alive really is one TCP connection per hop. Private keys are written to
//! owner-only temp files that disappear with the last session referencing
//! them.

use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{NamedTempFile, TempDir};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecOutput, Hop, Session, Transport, TransportError};
use crate::settings::SshSettings;

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Control operations talk to a local socket
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct HostBlock {
    alias: String,
    address: String,
    identity: Arc<NamedTempFile>,
}

/// Render the ssh_config for a chain of hosts. Pure function.
pub fn render_ssh_config(
    hosts: &[(String, String, String)],
    config_path: &str,
    control_dir: &str,
    settings: &SshSettings,
) -> String {
    let mut config = String::new();
    let mut previous: Option<&str> = None;
    for (alias, address, identity) in hosts {
        config.push_str(&format!("Host {}\n", alias));
        config.push_str(&format!("  HostName {}\n", address));
        config.push_str(&format!("  User {}\n", settings.user));
        config.push_str(&format!("  IdentityFile {}\n", identity));
        config.push_str("  IdentitiesOnly yes\n");
        config.push_str("  StrictHostKeyChecking no\n");
        config.push_str("  UserKnownHostsFile /dev/null\n");
        config.push_str("  BatchMode yes\n");
        config.push_str("  LogLevel ERROR\n");
        config.push_str(&format!("  ConnectTimeout {}\n", settings.connect_timeout_secs));
        config.push_str("  ControlMaster auto\n");
        config.push_str(&format!("  ControlPath {}/%C\n", control_dir));
        config.push_str("  ControlPersist yes\n");
        if let Some(prev) = previous {
            config.push_str(&format!(
                "  ProxyCommand {} -F {} -W %h:%p {}\n",
                settings.binary, config_path, prev
            ));
        }
        previous = Some(alias);
    }
    config
}

pub struct OpenSshTransport {
    settings: SshSettings,
}

impl OpenSshTransport {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

pub struct OpenSshSession {
    address: String,
    alias: String,
    hosts: Vec<HostBlock>,
    control_dir: Arc<TempDir>,
    config: Option<NamedTempFile>,
    settings: SshSettings,
}

impl OpenSshSession {
    fn base_command(&self) -> Result<Command, TransportError> {
        let config = self.config.as_ref().ok_or(TransportError::Closed)?;
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("-F").arg(config.path()).kill_on_drop(true);
        Ok(cmd)
    }

    /// Run `ssh -O <operation>` against this hop's master
    async fn control(&self, operation: &str) -> Result<(), TransportError> {
        let mut cmd = self.base_command()?;
        cmd.arg("-O")
            .arg(operation)
            .arg(&self.alias)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = tokio::time::timeout(CONTROL_TIMEOUT, cmd.status())
            .await
            .map_err(|_| TransportError::Timeout(CONTROL_TIMEOUT))?
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if !status.success() {
            return Err(TransportError::Connect(
                self.address.clone(),
                format!("control {} exited with {}", operation, status.code().unwrap_or(-1)),
            ));
        }
        Ok(())
    }

    /// Bring up the persistent master in the background
    async fn start_master(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut cmd = self.base_command()?;
        // Stdio must be null or the backgrounded master keeps our pipes open
        cmd.args(["-o", "ControlMaster=yes", "-f", "-N"])
            .arg(&self.alias)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = tokio::time::timeout(timeout, cmd.status())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if !status.success() {
            return Err(TransportError::Connect(
                self.address.clone(),
                format!("master exited with status {}", status.code().unwrap_or(-1)),
            ));
        }
        debug!(
            "ssh master for {} listening in {}",
            self.address,
            self.control_dir.path().display()
        );
        Ok(())
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        let Some(config) = self.config.as_ref() else {
            return;
        };
        let result = std::process::Command::new(&self.settings.binary)
            .arg("-F")
            .arg(config.path())
            .args(["-O", "exit"])
            .arg(&self.alias)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            warn!("Could not stop ssh master for {}: {}", self.address, e);
        }
    }
}

fn write_temp(content: &str) -> Result<NamedTempFile, TransportError> {
    let mut file = NamedTempFile::new().map_err(|e| TransportError::Io(e.to_string()))?;
    file.write_all(content.as_bytes())
        .map_err(|e| TransportError::Io(e.to_string()))?;
    file.flush().map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(file)
}

#[async_trait]
impl Session for OpenSshSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        if self.config.is_none() {
            return Err(TransportError::Closed);
        }
        // A dead master means the connection dropped; never reconnect silently
        self.control("check").await.map_err(|_| {
            TransportError::Connect(self.address.clone(), "control connection lost".to_string())
        })?;

        let mut cmd = self.base_command()?;
        cmd.args(["-o", "ControlMaster=no"])
            .arg(&self.alias)
            .arg(command)
            .stdin(Stdio::null());
        debug!("ssh {}: {}", self.address, command);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let status = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if status == SSH_CONNECTION_FAILURE {
            return Err(TransportError::Connect(
                self.address.clone(),
                stderr.trim().to_string(),
            ));
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            status,
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.config.is_none() {
            return Ok(());
        }
        if let Err(e) = self.control("exit").await {
            debug!("ssh master for {} already gone: {}", self.address, e);
        }
        if let Some(config) = self.config.take() {
            config.close().map_err(|e| TransportError::Io(e.to_string()))?;
        }
        self.hosts.clear();
        Ok(())
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    type Session = OpenSshSession;

    async fn open(
        &self,
        hop: &Hop<'_>,
        via: Option<&OpenSshSession>,
    ) -> Result<OpenSshSession, TransportError> {
        let mut hosts = via.map(|s| s.hosts.clone()).unwrap_or_default();
        let control_dir = match via {
            Some(s) => s.control_dir.clone(),
            None => Arc::new(TempDir::new().map_err(|e| TransportError::Io(e.to_string()))?),
        };
        let mut key = hop.private_key.to_string();
        if !key.ends_with('\n') {
            key.push('\n');
        }
        hosts.push(HostBlock {
            alias: format!("hop{}", hosts.len()),
            address: hop.address.to_string(),
            identity: Arc::new(write_temp(&key)?),
        });

        let config_file = NamedTempFile::new().map_err(|e| TransportError::Io(e.to_string()))?;
        let config_path = config_file.path().to_string_lossy().to_string();
        let rendered: Vec<(String, String, String)> = hosts
            .iter()
            .map(|h| {
                (
                    h.alias.clone(),
                    h.address.clone(),
                    h.identity.path().to_string_lossy().to_string(),
                )
            })
            .collect();
        let content = render_ssh_config(
            &rendered,
            &config_path,
            &control_dir.path().to_string_lossy(),
            &self.settings,
        );
        std::fs::write(config_file.path(), content)
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let alias = hosts
            .last()
            .map(|h| h.alias.clone())
            .unwrap_or_default();
        let mut session = OpenSshSession {
            address: hop.address.to_string(),
            alias,
            hosts,
            control_dir,
            config: Some(config_file),
            settings: self.settings.clone(),
        };

        let connect_timeout = Duration::from_secs(self.settings.connect_timeout_secs.max(1) * 2);
        if let Err(e) = session.start_master(connect_timeout).await {
            // Nothing to tear down
            session.config = None;
            return Err(TransportError::Connect(hop.address.to_string(), e.to_string()));
        }
        let check = session
            .exec("true", connect_timeout)
            .await
            .map_err(|e| TransportError::Connect(hop.address.to_string(), e.to_string()));
        let check = match check {
            Ok(output) if output.status == 0 => Ok(()),
            Ok(output) => Err(TransportError::Connect(
                hop.address.to_string(),
                format!("exit status {}: {}", output.status, output.stderr.trim()),
            )),
            Err(e) => Err(e),
        };
        if let Err(e) = check {
            let _ = session.close().await;
            return Err(e);
        }

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn settings_with_binary(binary: &str) -> SshSettings {
        SshSettings {
            binary: binary.to_string(),
            ..SshSettings::default()
        }
    }

    /// A stand-in ssh client that appends its arguments to `log`
    fn recording_binary(dir: &TempDir, log: &std::path::Path) -> String {
        let script = dir.path().join("fake-ssh");
        std::fs::write(&script, format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display()))
            .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().to_string()
    }

    #[test]
    fn test_render_chained_config() {
        let hosts = vec![
            ("hop0".to_string(), "172.24.4.10".to_string(), "/tmp/k0".to_string()),
            ("hop1".to_string(), "10.0.2.5".to_string(), "/tmp/k1".to_string()),
        ];
        let config = render_ssh_config(&hosts, "/tmp/cfg", "/tmp/ctl", &SshSettings::default());

        assert!(config.contains("Host hop0\n  HostName 172.24.4.10\n  User cirros\n"));
        assert!(config.contains("IdentityFile /tmp/k1"));
        assert!(config.contains("ProxyCommand ssh -F /tmp/cfg -W %h:%p hop0"));
        assert_eq!(config.matches("ProxyCommand").count(), 1);
        assert_eq!(config.matches("  ControlMaster auto\n").count(), 2);
        assert_eq!(config.matches("  ControlPath /tmp/ctl/%C\n").count(), 2);
        assert_eq!(config.matches("  ControlPersist yes\n").count(), 2);
    }

    #[tokio::test]
    async fn test_open_fails_when_probe_fails() {
        let transport = OpenSshTransport::new(settings_with_binary("false"));
        let hop = Hop::new("10.0.0.1", "key");
        let result = transport.open(&hop, None).await;
        assert!(matches!(result, Err(TransportError::Connect(addr, _)) if addr == "10.0.0.1"));
    }

    #[tokio::test]
    async fn test_exec_passes_alias_and_command() {
        let transport = OpenSshTransport::new(settings_with_binary("echo"));
        let first = transport.open(&Hop::new("10.0.0.1", "k0"), None).await.unwrap();
        let second = transport
            .open(&Hop::new("10.0.0.2", "k1"), Some(&first))
            .await
            .unwrap();

        let output = second.exec("hostname", Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.status, 0);
        assert!(output.stdout.trim_end().ends_with("ControlMaster=no hop1 hostname"));
        assert_eq!(second.hosts.len(), 2);
        assert_eq!(first.control_dir.path(), second.control_dir.path());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_commands() {
        let transport = OpenSshTransport::new(settings_with_binary("echo"));
        let mut session = transport.open(&Hop::new("10.0.0.1", "k0"), None).await.unwrap();
        session.close().await.unwrap();
        let result = session.exec("true", Duration::from_secs(1)).await;
        assert_eq!(result, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_master_lifecycle() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("calls");
        let transport = OpenSshTransport::new(settings_with_binary(&recording_binary(&dir, &log)));

        let mut session = transport.open(&Hop::new("10.0.0.1", "k0"), None).await.unwrap();
        session.exec("hostname", Duration::from_secs(5)).await.unwrap();
        session.close().await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert!(calls[0].ends_with("-o ControlMaster=yes -f -N hop0"));
        assert!(calls.iter().any(|c| c.ends_with("-O check hop0")));
        assert!(calls.iter().any(|c| c.ends_with("-o ControlMaster=no hop0 hostname")));
        assert!(calls.last().unwrap().ends_with("-O exit hop0"));
        assert_eq!(calls.iter().filter(|c| c.ends_with("-O exit hop0")).count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_session_stops_master() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("calls");
        let transport = OpenSshTransport::new(settings_with_binary(&recording_binary(&dir, &log)));

        let session = transport.open(&Hop::new("10.0.0.1", "k0"), None).await.unwrap();
        drop(session);

        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.lines().last().unwrap().ends_with("-O exit hop0"));
    }
}
