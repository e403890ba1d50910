//! Heartbeat Sender task: one liveness signal per ping interval.

use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::debug;

use crate::session::{Session, SessionError, TaskResult};
use crate::transport::{Connection, Frame, TransportError};

use super::{announcement_frame, ping_frame};

/// Sends heartbeats until the session is cancelled or a send fails.
///
/// When the configuration asks for it, the read-timeout announcement goes out
/// immediately; pings follow every `ping_interval`, the first one interval
/// after start. Each send gets its own `now + write_timeout` deadline.
pub(crate) async fn run_sender<C: Connection>(session: Arc<Session<C>>) -> TaskResult {
    let config = &session.config;
    let token = session.shutdown.token();

    if config.announces_read_timeout() {
        let frame = announcement_frame(config.read_timeout()).map_err(|e| SessionError::Send {
            seq: None,
            source: TransportError::Encode(e),
        })?;
        if !send(&session, frame, None).await? {
            return Ok(());
        }
        debug!(read_timeout = ?config.read_timeout(), "announced read timeout");
    }

    let period = config.ping_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let seq = session.counters.next_sequence();
        let frame = ping_frame(config.mode(), seq).map_err(|e| SessionError::Send {
            seq: Some(seq),
            source: TransportError::Encode(e),
        })?;
        if !send(&session, frame, Some(seq)).await? {
            return Ok(());
        }
        debug!(seq, "sent ping");
    }
}

// Returns `Ok(false)` when the session was cancelled mid-send.
async fn send<C: Connection>(
    session: &Session<C>,
    frame: Frame,
    seq: Option<u64>,
) -> Result<bool, SessionError> {
    let token = session.shutdown.token();
    let deadline = Instant::now() + session.config.write_timeout();
    tokio::select! {
        biased;
        () = token.cancelled() => Ok(false),
        result = session.connection.send_frame(frame, deadline) => {
            result.map_err(|source| SessionError::Send { seq, source })?;
            Ok(true)
        }
    }
}
