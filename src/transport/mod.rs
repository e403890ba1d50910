//! Framed duplex transport boundary.
//!
//! The supervisor never touches sockets directly. It talks to a
//! [`Connection`]: something that can send and receive discrete [`Frame`]s
//! under a deadline and can be closed. [`WebSocketConnection`] implements it
//! on top of `tokio-tungstenite`.

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;

pub mod websocket;

pub use websocket::WebSocketConnection;

/// One discrete message unit delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 application data.
    Text(String),
    /// Binary application data.
    Binary(Bytes),
    /// Liveness probe control signal.
    Ping(Bytes),
    /// Answer to a [`Frame::Ping`].
    Pong(Bytes),
    /// The peer is closing the connection.
    Close,
}

impl Frame {
    /// Short frame-kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "text({} bytes)", text.len()),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => {
                write!(f, "{}({} bytes)", self.kind(), data.len())
            }
            Self::Close => f.write_str("close"),
        }
    }
}

/// Errors reported by a [`Connection`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("deadline exceeded")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[source] tungstenite::Error),

    #[error("failed to encode heartbeat payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            other => Self::WebSocket(other),
        }
    }
}

/// An open, already-upgraded duplex connection.
///
/// Sends and receives may run concurrently from different tasks; an
/// implementation must allow one writer and one reader at a time. Every I/O
/// call carries an absolute deadline and fails with [`TransportError::Timeout`]
/// once it elapses.
pub trait Connection: Send + Sync + 'static {
    /// Sends one frame, giving up at `deadline`.
    fn send_frame(
        &self,
        frame: Frame,
        deadline: Instant,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits for the next inbound frame, giving up at `deadline`.
    fn receive_frame(
        &self,
        deadline: Instant,
    ) -> impl Future<Output = Result<Frame, TransportError>> + Send;

    /// Closes the connection. Called exactly once, after all I/O has stopped.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
