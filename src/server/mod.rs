//! WebSocket accept loop using Tokio.
//!
//! Accepts TCP connections, performs the WebSocket upgrade handshake and runs
//! one keepalive [`Supervisor`] per connection.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::HeartbeatConfig;
use crate::session::Supervisor;
use crate::transport::WebSocketConnection;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum time a client may take to complete the upgrade handshake.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// The keepalive WebSocket server.
///
/// # Examples
///
/// ```rust,no_run
/// use pulse::config::HeartbeatConfig;
/// use pulse::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080", HeartbeatConfig::default()).await?;
///     server.run().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: HeartbeatConfig,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>, config: HeartbeatConfig) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the process is terminated.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(CancellationToken::new()).await
    }

    /// Accepts connections until `shutdown` is cancelled, then waits for
    /// every open session to end.
    ///
    /// Each session's token is a child of `shutdown`, so cancelling it also
    /// ends the sessions; they report
    /// [`SessionError::Cancelled`](crate::session::SessionError::Cancelled).
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "pulse listening");
        let mut sessions = JoinSet::new();

        loop {
            let event = next_event(&self.listener, &mut sessions, &shutdown).await;
            let (stream, peer_addr) = match event {
                Event::Shutdown => break,
                Event::Reaped => continue,
                Event::Accepted(Ok(pair)) => pair,
                Event::Accepted(Err(e)) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let span = info_span!("session", peer = %peer_addr);
            sessions.spawn(
                handle_connection(stream, self.config.clone(), shutdown.clone()).instrument(span),
            );
        }

        info!(open = sessions.len(), "shutting down, draining sessions");
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}

/// What woke the accept loop.
enum Event {
    Shutdown,
    /// A finished session was removed from the set.
    Reaped,
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
}

/// Waits for shutdown, a finished session or a new connection, in that order
/// of priority.
async fn next_event(
    listener: &TcpListener,
    sessions: &mut JoinSet<()>,
    shutdown: &CancellationToken,
) -> Event {
    tokio::select! {
        biased;
        () = shutdown.cancelled() => Event::Shutdown,
        Some(_) = sessions.join_next() => Event::Reaped,
        accepted = listener.accept() => Event::Accepted(accepted),
    }
}

/// Upgrades one TCP connection and supervises it until the session ends.
async fn handle_connection(stream: TcpStream, config: HeartbeatConfig, shutdown: CancellationToken) {
    let ws = match timeout(UPGRADE_TIMEOUT, tokio_tungstenite::accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!(error = %e, "WebSocket upgrade failed");
            return;
        }
        Err(_) => {
            warn!("WebSocket upgrade timed out");
            return;
        }
    };

    let supervisor = Supervisor::with_parent(WebSocketConnection::new(ws), config, &shutdown);
    // the supervisor logs its own outcome
    let _ = supervisor.run().await;
}
