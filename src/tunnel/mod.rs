//! Multi-hop remote execution
//!
//! A [`TunnelChain`] folds an ordered list of hops into one remote-execution
//! capability on the last hop: the first hop is opened directly and every
//! further hop is opened through the session of its predecessor.

pub mod local;
pub mod openssh;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

pub use local::LocalShell;
pub use openssh::{OpenSshSession, OpenSshTransport};

/// One intermediate or final host of a chain. Borrowed from the endpoint
/// that owns the key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop<'a> {
    pub address: &'a str,
    pub private_key: &'a str,
}

impl<'a> Hop<'a> {
    pub fn new(address: &'a str, private_key: &'a str) -> Self {
        Self {
            address,
            private_key,
        }
    }
}

/// Raw result of one remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

/// Errors reported by a transport implementation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection to {0} failed: {1}")]
    Connect(String, String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Session is closed")]
    Closed,
}

/// Errors surfaced to chain users
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TunnelError {
    #[error("Hop {hop} ({address}) is unreachable: {reason}")]
    Unreachable {
        hop: usize,
        address: String,
        reason: String,
    },

    #[error("Command '{command}' timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("Command exited with status {status}: {output}")]
    NonZeroExit { status: i32, output: String },

    #[error("A tunnel needs at least one hop")]
    EmptyChain,

    #[error("Tunnel has been closed")]
    Closed,
}

// ============================================================================
// SBIO: Traits for abstraction (allows simulation in tests)
// ============================================================================

/// A live connection to one hop
#[async_trait]
pub trait Session: Send + Sync {
    fn address(&self) -> &str;

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens sessions, optionally through the session of a previous hop
#[async_trait]
pub trait Transport: Send + Sync {
    type Session: Session;

    async fn open(
        &self,
        hop: &Hop<'_>,
        via: Option<&Self::Session>,
    ) -> Result<Self::Session, TransportError>;
}

/// Anything a probe can run shell commands through
#[async_trait]
pub trait CommandChannel: Send {
    /// Human readable name of the host commands run on
    fn target(&self) -> &str;

    /// Run a command, returning stdout with trailing whitespace trimmed
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<String, TunnelError>;
}

// ============================================================================
// Chain
// ============================================================================

pub struct TunnelChain<'a, T: Transport> {
    transport: &'a T,
    hops: Vec<Hop<'a>>,
    keep_alive: bool,
    sessions: Vec<T::Session>,
    closed: bool,
}

impl<'a, T: Transport> TunnelChain<'a, T> {
    /// Open every hop in order. An empty hop list is rejected.
    pub async fn connect(
        transport: &'a T,
        hops: &[Hop<'a>],
        keep_alive: bool,
    ) -> Result<Self, TunnelError> {
        if hops.is_empty() {
            return Err(TunnelError::EmptyChain);
        }
        let mut chain = Self {
            transport,
            hops: hops.to_vec(),
            keep_alive,
            sessions: Vec::with_capacity(hops.len()),
            closed: false,
        };
        chain.open_all().await?;
        Ok(chain)
    }

    /// Like [`TunnelChain::connect`], but keeps retrying unreachable hops
    /// every `interval` until `patience` has elapsed
    pub async fn connect_with_retry(
        transport: &'a T,
        hops: &[Hop<'a>],
        keep_alive: bool,
        patience: Duration,
        interval: Duration,
    ) -> Result<Self, TunnelError> {
        let started = Instant::now();
        loop {
            match Self::connect(transport, hops, keep_alive).await {
                Err(TunnelError::Unreachable { hop, address, reason })
                    if started.elapsed() + interval < patience =>
                {
                    debug!("Hop {} ({}) not ready yet: {}", hop, address, reason);
                    tokio::time::sleep(interval).await;
                }
                other => return other,
            }
        }
    }

    pub fn hops(&self) -> &[Hop<'a>] {
        &self.hops
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// True while sessions to every hop are open
    pub fn is_connected(&self) -> bool {
        self.sessions.len() == self.hops.len()
    }

    async fn open_all(&mut self) -> Result<(), TunnelError> {
        let mut sessions: Vec<T::Session> = Vec::with_capacity(self.hops.len());
        for (index, hop) in self.hops.iter().enumerate() {
            debug!("Opening hop {} ({})", index, hop.address);
            match self.transport.open(hop, sessions.last()).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    close_in_reverse(&mut sessions).await;
                    return Err(TunnelError::Unreachable {
                        hop: index,
                        address: hop.address.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        self.sessions = sessions;
        Ok(())
    }

    /// Run a command on the last hop
    pub async fn exec(&mut self, command: &str, timeout: Duration) -> Result<String, TunnelError> {
        if self.closed {
            return Err(TunnelError::Closed);
        }
        if !self.is_connected() {
            self.open_all().await?;
        }

        let last = self.hops.len() - 1;
        let result = match self.sessions.last() {
            Some(session) => session.exec(command, timeout).await,
            None => Err(TransportError::Closed),
        };
        if !self.keep_alive {
            close_in_reverse(&mut self.sessions).await;
        }

        let output = result.map_err(|e| match e {
            TransportError::Timeout(_) => TunnelError::CommandTimeout {
                command: command.to_string(),
                timeout,
            },
            other => TunnelError::Unreachable {
                hop: last,
                address: self.hops[last].address.to_string(),
                reason: other.to_string(),
            },
        })?;

        if output.status != 0 {
            let combined = format!("{}{}", output.stdout, output.stderr);
            return Err(TunnelError::NonZeroExit {
                status: output.status,
                output: combined.trim_end().to_string(),
            });
        }
        Ok(output.stdout.trim_end().to_string())
    }

    /// Close every session, last hop first. Later calls to `exec` fail.
    pub async fn close(&mut self) {
        close_in_reverse(&mut self.sessions).await;
        self.closed = true;
    }
}

async fn close_in_reverse<S: Session>(sessions: &mut Vec<S>) {
    while let Some(mut session) = sessions.pop() {
        if let Err(e) = session.close().await {
            warn!("Failed to close session to {}: {}", session.address(), e);
        }
    }
}

#[async_trait]
impl<'a, T: Transport> CommandChannel for TunnelChain<'a, T> {
    fn target(&self) -> &str {
        self.hops.last().map(|h| h.address).unwrap_or("")
    }

    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<String, TunnelError> {
        TunnelChain::exec(self, command, timeout).await
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Records (address, opened through) for every open, and answers every
    /// command with `ran <command> on <address>`
    #[derive(Default)]
    pub struct MockTransport {
        pub opens: Arc<Mutex<Vec<(String, Option<String>)>>>,
        pub closes: Arc<Mutex<Vec<String>>>,
        pub unreachable: HashSet<String>,
        pub failing_commands: HashSet<String>,
    }

    pub struct MockSession {
        address: String,
        closes: Arc<Mutex<Vec<String>>>,
        failing_commands: HashSet<String>,
    }

    #[async_trait]
    impl Session for MockSession {
        fn address(&self) -> &str {
            &self.address
        }

        async fn exec(
            &self,
            command: &str,
            timeout: Duration,
        ) -> Result<ExecOutput, TransportError> {
            if command == "sleep" {
                return Err(TransportError::Timeout(timeout));
            }
            let status = i32::from(self.failing_commands.contains(command));
            Ok(ExecOutput {
                stdout: format!("ran {} on {}\n", command, self.address),
                stderr: String::new(),
                status,
            })
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closes.lock().unwrap().push(self.address.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        type Session = MockSession;

        async fn open(
            &self,
            hop: &Hop<'_>,
            via: Option<&MockSession>,
        ) -> Result<MockSession, TransportError> {
            if self.unreachable.contains(hop.address) {
                return Err(TransportError::Connect(
                    hop.address.to_string(),
                    "no route to host".to_string(),
                ));
            }
            self.opens.lock().unwrap().push((
                hop.address.to_string(),
                via.map(|s| s.address.clone()),
            ));
            Ok(MockSession {
                address: hop.address.to_string(),
                closes: self.closes.clone(),
                failing_commands: self.failing_commands.clone(),
            })
        }
    }
}
