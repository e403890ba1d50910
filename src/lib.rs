//! # pulse
//!
//! Keeps a single WebSocket connection honest: heartbeats go out on a fixed
//! interval, every read and write runs under a deadline, and a peer that goes
//! silent for longer than the read timeout is disconnected.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use pulse::config::HeartbeatConfig;
//! use pulse::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HeartbeatConfig::from_ping_interval(Duration::from_secs(5))?;
//!     let server = Server::bind("127.0.0.1:8080", config).await?;
//!     println!("Listening on ws://127.0.0.1:8080");
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

// ── Keepalive core ────────────────────────────────────────────────────────────
pub mod config;
pub mod heartbeat;
mod reader;
pub mod session;
pub mod watchdog;

// ── Transport and accept loop ─────────────────────────────────────────────────
pub mod server;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ConfigError, HeartbeatConfig, HeartbeatMode, LivenessPolicy};
pub use server::{Server, ServerError};
pub use session::{SessionError, SessionHandle, SessionReport, Supervisor, TaskKind};
pub use transport::{Connection, Frame, TransportError};
