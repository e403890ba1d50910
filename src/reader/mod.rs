//! Inbound Reader task: consumes frames and feeds liveness evidence to the
//! watchdog.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::LivenessPolicy;
use crate::heartbeat::{Inbound, classify};
use crate::session::{Session, SessionError, TaskResult};
use crate::transport::{Connection, TransportError};
use crate::watchdog::WatchdogHandle;

/// Reads frames until the session is cancelled or the transport fails.
///
/// Every read is bounded by `now + read_timeout`. A read deadline that
/// elapses together with the watchdog deadline is the watchdog's to report:
/// the reader then waits for the resulting cancellation instead of raising a
/// receive error.
pub(crate) async fn run_reader<C: Connection>(
    session: Arc<Session<C>>,
    watchdog: WatchdogHandle,
) -> TaskResult {
    let config = &session.config;
    let token = session.shutdown.token();

    loop {
        let deadline = Instant::now() + config.read_timeout();
        let received = tokio::select! {
            biased;
            () = token.cancelled() => return Ok(()),
            received = session.connection.receive_frame(deadline) => received,
        };

        let frame = match received {
            Ok(frame) => frame,
            Err(TransportError::Timeout) if watchdog.is_due() => {
                debug!("read deadline elapsed with the watchdog due");
                token.cancelled().await;
                return Ok(());
            }
            Err(source) => return Err(SessionError::Receive { source }),
        };
        session.counters.frame_received();

        let evidence = match classify(config.mode(), &frame) {
            Inbound::Acknowledgement(seq) => {
                session.counters.acknowledged();
                debug!(?seq, "received acknowledgement");
                true
            }
            Inbound::Data => {
                debug!(frame = %frame, "received frame");
                config.liveness() == LivenessPolicy::AnyFrame
            }
            Inbound::Unexpected(reason) => {
                warn!(frame = %frame, reason, "ignoring unexpected frame");
                config.liveness() == LivenessPolicy::AnyFrame
            }
            Inbound::Closed => {
                debug!("peer sent close frame");
                return Err(SessionError::Receive {
                    source: TransportError::Closed,
                });
            }
        };

        if evidence {
            watchdog.reset();
        }
    }
}
