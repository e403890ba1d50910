//! Keepalive WebSocket server.
//!
//! Listens on `$PORT` (default 8080). Heartbeat settings are read from the
//! JSON file named by `$PULSE_CONFIG` when set, otherwise the defaults apply.
//!
//! ```text
//! PORT=8080 RUST_LOG=pulse=debug cargo run --example keepalive_server
//! ```

use pulse::config::HeartbeatConfig;
use pulse::server::Server;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var("PULSE_CONFIG") {
        Ok(path) => HeartbeatConfig::from_json(&std::fs::read_to_string(path)?)?,
        Err(_) => HeartbeatConfig::default(),
    };
    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_owned());

    let server = Server::bind(format!("0.0.0.0:{port}"), config).await?;
    println!("Listening on ws://{}", server.local_addr());

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    server.run_until(shutdown).await?;
    Ok(())
}
