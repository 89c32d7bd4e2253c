//! Local shell channel, used when the probing client is this machine

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CommandChannel, TunnelError};

/// Runs commands through `sh -c` on the local host
#[derive(Debug, Clone)]
pub struct LocalShell {
    label: String,
}

impl LocalShell {
    pub fn new() -> Self {
        Self {
            label: "localhost".to_string(),
        }
    }
}

impl Default for LocalShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandChannel for LocalShell {
    fn target(&self) -> &str {
        &self.label
    }

    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<String, TunnelError> {
        debug!("Running locally: {}", command);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| TunnelError::CommandTimeout {
                command: command.to_string(),
                timeout,
            })?
            .map_err(|e| TunnelError::Unreachable {
                hop: 0,
                address: self.label.clone(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TunnelError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                output: format!("{}{}", stdout, stderr).trim_end().to_string(),
            });
        }
        Ok(stdout.trim_end().to_string())
    }
}
