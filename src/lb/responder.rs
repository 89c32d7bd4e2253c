//! Backend responders
//!
//! Each pool member runs a background `nc -l` loop that answers every TCP
//! connection with the member's hostname.

use std::time::Duration;

use tracing::{error, info, warn};

use super::LbError;
use crate::tunnel::{CommandChannel, Hop, Transport, TunnelChain, TunnelError};

pub fn start_command(port: u16, text: &str) -> String {
    format!(
        "nohup sh -c 'while true; do nc -l -p {} -e echo {}; done' >/dev/null 2>&1 & echo $!",
        port, text
    )
}

pub fn kill_listener_command(port: u16) -> String {
    format!("pkill -9 -f 'nc -l -p {}'; true", port)
}

pub fn stop_command(pid: u32, port: u16) -> String {
    format!("kill -9 {}; pkill -9 -f 'nc -l -p {}'; true", pid, port)
}

/// A responder loop running on one backend
#[derive(Debug)]
pub struct Responder {
    hostname: String,
    port: u16,
    pid: Option<u32>,
}

impl Responder {
    /// Launch the loop and remember its pid
    pub async fn start(
        channel: &mut dyn CommandChannel,
        hostname: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, LbError> {
        let output = channel.exec(&start_command(port, hostname), timeout).await?;
        let pid = output
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<u32>().ok());
        let Some(pid) = pid else {
            // The loop may have started anyway
            if let Err(e) = channel.exec(&kill_listener_command(port), timeout).await {
                warn!("Could not clear listeners on port {}: {}", port, e);
            }
            return Err(LbError::ResponderStart {
                host: channel.target().to_string(),
                output,
            });
        };
        info!("Responder for {} listening on port {} (pid {})", hostname, port, pid);
        Ok(Self {
            hostname: hostname.to_string(),
            port,
            pid: Some(pid),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    pub async fn stop(
        &mut self,
        channel: &mut dyn CommandChannel,
        timeout: Duration,
    ) -> Result<(), TunnelError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        channel.exec(&stop_command(pid, self.port), timeout).await?;
        self.pid = None;
        Ok(())
    }

    /// Forget the process without stopping it
    fn abandon(&mut self) {
        self.pid = None;
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            error!(
                "Responder for {} (pid {}) dropped while still running",
                self.hostname, pid
            );
        }
    }
}

/// Responders started during one scenario, with the hops to reach them
pub struct ResponderSet<'a> {
    entries: Vec<(Vec<Hop<'a>>, Responder)>,
    timeout: Duration,
}

impl<'a> ResponderSet<'a> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Vec::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn responders(&self) -> impl Iterator<Item = &Responder> {
        self.entries.iter().map(|(_, r)| r)
    }

    /// Reach the backend over `hops` and start its responder
    pub async fn start<T: Transport>(
        &mut self,
        transport: &T,
        hops: Vec<Hop<'a>>,
        hostname: &str,
        port: u16,
    ) -> Result<(), LbError> {
        let mut chain = TunnelChain::connect(transport, &hops, true).await?;
        let started = Responder::start(&mut chain, hostname, port, self.timeout).await;
        chain.close().await;
        self.entries.push((hops, started?));
        Ok(())
    }

    /// Stop every responder. Failures are logged; the set is empty afterwards.
    pub async fn stop_all<T: Transport>(&mut self, transport: &T) -> usize {
        let mut stopped = 0;
        for (hops, mut responder) in self.entries.drain(..) {
            let result = match TunnelChain::connect(transport, &hops, true).await {
                Ok(mut chain) => {
                    let result = responder.stop(&mut chain, self.timeout).await;
                    chain.close().await;
                    result
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => stopped += 1,
                Err(e) => {
                    warn!("Could not stop responder for {}: {}", responder.hostname(), e);
                    responder.abandon();
                }
            }
        }
        stopped
    }
}
