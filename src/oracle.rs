//! Fixed-answer services on the local host
//!
//! Guests behind the tenant router prove outbound reachability by fetching
//! the HTTP greeting and by exchanging one UDP datagram with these services.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{routing::get, Router};
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

pub const GREETING: &str = "Hello world!";
pub const UDP_REPLY: &str = "pong";

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Failed to bind {0}: {1}")]
    Bind(String, std::io::Error),

    #[error("No datagram arrived within {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

async fn greeting() -> &'static str {
    GREETING
}

/// Router answering every GET on `/` with the greeting
pub fn create_router() -> Router {
    Router::new()
        .route("/", get(greeting))
        .layer(TraceLayer::new_for_http())
}

/// The HTTP greeting served in the background until stopped
pub struct HttpOracle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HttpOracle {
    pub async fn start(bind_address: &str, port: u16) -> Result<Self, OracleError> {
        let addr = format!("{}:{}", bind_address, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| OracleError::Bind(addr.clone(), e))?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, create_router()).with_graceful_shutdown(async {
                rx.await.ok();
            });
            if let Err(e) = server.await {
                error!("HTTP oracle failed: {}", e);
            }
        });
        info!("HTTP oracle listening on {}", addr);
        Ok(Self {
            addr,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        debug!("HTTP oracle on {} stopped", self.addr);
    }
}

impl Drop for HttpOracle {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Answers exactly one datagram with `pong`
pub struct UdpOracle {
    addr: SocketAddr,
    handle: Option<JoinHandle<Result<String, std::io::Error>>>,
}

impl UdpOracle {
    pub async fn start(bind_address: &str, port: u16) -> Result<Self, OracleError> {
        let addr = format!("{}:{}", bind_address, port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|e| OracleError::Bind(addr.clone(), e))?;
        let addr = socket.local_addr()?;

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (n, peer) = socket.recv_from(&mut buf).await?;
            let payload = String::from_utf8_lossy(&buf[..n]).trim().to_string();
            debug!("UDP oracle got '{}' from {}", payload, peer);
            socket.send_to(UDP_REPLY.as_bytes(), peer).await?;
            Ok(payload)
        });
        info!("UDP oracle listening on {}", addr);
        Ok(Self {
            addr,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the datagram and return its payload
    pub async fn received(mut self, timeout: Duration) -> Result<String, OracleError> {
        let Some(mut handle) = self.handle.take() else {
            return Err(OracleError::Timeout(timeout));
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join)) => Err(OracleError::Io(std::io::Error::other(join.to_string()))),
            Err(_) => {
                handle.abort();
                Err(OracleError::Timeout(timeout))
            }
        }
    }
}

impl Drop for UdpOracle {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}
