//! Connection Keepalive Supervisor.
//!
//! A [`Supervisor`] owns one connection for its whole session. It spawns
//! three tasks under a shared [`CancellationToken`]:
//!
//! - the heartbeat sender, writing one signal per ping interval;
//! - the inbound reader, resetting the watchdog on liveness evidence;
//! - the deadline watchdog, firing after `read_timeout` of silence.
//!
//! The first failure of any task is recorded and cancels the token; the
//! others then stop without error and any later failure is discarded. Once
//! every task has finished the supervisor closes the connection, exactly once,
//! and returns the recorded outcome.
//!
//! # Examples
//!
//! ```rust,no_run
//! use pulse::config::HeartbeatConfig;
//! use pulse::session::Supervisor;
//! use pulse::transport::WebSocketConnection;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = TcpListener::bind("127.0.0.1:9001").await?;
//!     let (stream, _) = listener.accept().await?;
//!     let ws = tokio_tungstenite::accept_async(stream).await?;
//!
//!     let supervisor = Supervisor::new(WebSocketConnection::new(ws), HeartbeatConfig::default());
//!     let (outcome, report) = supervisor.run().await;
//!     println!("session ended: {outcome:?} after {} pings", report.pings_sent);
//!     Ok(())
//! }
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::HeartbeatConfig;
use crate::heartbeat::sender::run_sender;
use crate::reader::run_reader;
use crate::transport::Connection;
use crate::watchdog::{Watchdog, WatchdogState};

pub mod error;

pub use error::{SessionError, TaskKind, TaskResult};

/// State shared by the tasks of one session.
pub(crate) struct Session<C> {
    pub(crate) connection: C,
    pub(crate) config: HeartbeatConfig,
    pub(crate) counters: Counters,
    pub(crate) shutdown: Arc<Shutdown>,
}

/// Diagnostic counters. The sequence number only labels pings in logs.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    sequence: AtomicU64,
    frames_received: AtomicU64,
    acknowledgements: AtomicU64,
}

impl Counters {
    /// Returns the next ping sequence number, starting at zero.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn acknowledged(&self) {
        self.acknowledgements.fetch_add(1, Ordering::Relaxed);
    }
}

/// One-shot cancellation plus the first-cause slot.
pub(crate) struct Shutdown {
    token: CancellationToken,
    first_failure: Mutex<Option<SessionError>>,
    stopped: AtomicBool,
}

impl Shutdown {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            first_failure: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Records `error` and cancels the session, unless the session is already
    /// shutting down. Returns `true` if `error` became the session's outcome.
    pub(crate) fn fail(&self, error: SessionError) -> bool {
        let mut slot = self
            .first_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.token.is_cancelled() {
            debug!(error = %error, "discarding failure after shutdown began");
            return false;
        }
        warn!(task = ?error.task(), error = %error, "task failed, shutting down session");
        *slot = Some(error);
        self.token.cancel();
        true
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    fn take_failure(&self) -> Option<SessionError> {
        self.first_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Ends a running session deliberately. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    shutdown: Arc<Shutdown>,
}

impl SessionHandle {
    /// Stops the session. The supervisor reports success unless a task had
    /// already failed. Calling it more than once has no further effect.
    pub fn stop(&self) {
        self.shutdown.stop();
    }

    /// Returns `true` once the session is shutting down for any reason.
    pub fn is_stopped(&self) -> bool {
        self.shutdown.token.is_cancelled()
    }
}

/// Counters collected over one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    /// Heartbeats attempted (not counting the read-timeout announcement).
    pub pings_sent: u64,
    pub frames_received: u64,
    /// Inbound frames recognized as heartbeat acknowledgments.
    pub acknowledgements: u64,
    pub duration: Duration,
}

/// Runs the keepalive tasks for one connection. See the [module docs](self).
pub struct Supervisor<C> {
    session: Arc<Session<C>>,
    parent: Option<CancellationToken>,
}

impl<C: Connection> Supervisor<C> {
    /// Creates a supervisor whose session ends only on failure or through a
    /// [`SessionHandle`].
    pub fn new(connection: C, config: HeartbeatConfig) -> Self {
        Self::build(connection, config, CancellationToken::new(), None)
    }

    /// Creates a supervisor whose session also ends when `parent` is
    /// cancelled; that outcome is reported as [`SessionError::Cancelled`].
    pub fn with_parent(connection: C, config: HeartbeatConfig, parent: &CancellationToken) -> Self {
        Self::build(connection, config, parent.child_token(), Some(parent.clone()))
    }

    fn build(
        connection: C,
        config: HeartbeatConfig,
        token: CancellationToken,
        parent: Option<CancellationToken>,
    ) -> Self {
        Self {
            session: Arc::new(Session {
                connection,
                config,
                counters: Counters::default(),
                shutdown: Arc::new(Shutdown::new(token)),
            }),
            parent,
        }
    }

    /// Returns a handle that can stop the session from elsewhere.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shutdown: Arc::clone(&self.session.shutdown),
        }
    }

    /// Runs the session to completion.
    ///
    /// Returns the first failure (or `Ok(())` for a deliberate stop) together
    /// with the session's counters. The connection has been closed by the time
    /// this returns.
    pub async fn run(self) -> (Result<(), SessionError>, SessionReport) {
        let Self { session, parent } = self;
        let started = Instant::now();
        let config = session.config.clone();
        info!(
            mode = ?config.mode(),
            ping_interval = ?config.ping_interval(),
            read_timeout = ?config.read_timeout(),
            "session started"
        );

        let (watchdog, watchdog_handle) =
            Watchdog::new(config.read_timeout(), session.shutdown.token().clone());

        let mut tasks = JoinSet::new();
        tasks.spawn(
            supervise(
                TaskKind::Sender,
                run_sender(Arc::clone(&session)),
                Arc::clone(&session.shutdown),
            )
            .in_current_span(),
        );
        tasks.spawn(
            supervise(
                TaskKind::Reader,
                run_reader(Arc::clone(&session), watchdog_handle),
                Arc::clone(&session.shutdown),
            )
            .in_current_span(),
        );
        let read_timeout = config.read_timeout();
        tasks.spawn(
            supervise(
                TaskKind::Watchdog,
                async move {
                    match watchdog.run().await {
                        WatchdogState::Fired => Err(SessionError::Timeout {
                            after: read_timeout,
                        }),
                        WatchdogState::Cancelled => Ok(()),
                    }
                },
                Arc::clone(&session.shutdown),
            )
            .in_current_span(),
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "supervised task aborted");
                session.shutdown.token().cancel();
            }
        }

        match timeout(config.write_timeout(), session.connection.close()).await {
            Ok(Ok(())) => debug!("connection closed"),
            Ok(Err(e)) => warn!(error = %e, "error while closing connection"),
            Err(_) => warn!("timed out closing connection"),
        }

        let shutdown = &session.shutdown;
        let outcome = match shutdown.take_failure() {
            Some(error) => Err(error),
            None if !shutdown.stopped.load(Ordering::SeqCst)
                && parent.as_ref().is_some_and(CancellationToken::is_cancelled) =>
            {
                Err(SessionError::Cancelled)
            }
            None => Ok(()),
        };

        let report = SessionReport {
            pings_sent: session.counters.sequence.load(Ordering::Relaxed),
            frames_received: session.counters.frames_received.load(Ordering::Relaxed),
            acknowledgements: session.counters.acknowledgements.load(Ordering::Relaxed),
            duration: started.elapsed(),
        };

        match &outcome {
            Ok(()) => info!(
                pings = report.pings_sent,
                duration = ?report.duration,
                "session ended"
            ),
            Err(e) => warn!(
                task = ?e.task(),
                error = %e,
                pings = report.pings_sent,
                duration = ?report.duration,
                "session failed"
            ),
        }

        (outcome, report)
    }
}

// Routes a task's failure (or panic) into the shared first-cause slot.
async fn supervise<F>(kind: TaskKind, task: F, shutdown: Arc<Shutdown>)
where
    F: Future<Output = TaskResult>,
{
    match AssertUnwindSafe(task).catch_unwind().await {
        Ok(Ok(())) => debug!(task = %kind, "task stopped"),
        Ok(Err(error)) => {
            shutdown.fail(error);
        }
        Err(_) => {
            error!(task = %kind, "task panicked");
            shutdown.fail(SessionError::Panicked { task: kind });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::time::sleep;

    use crate::config::{HeartbeatMode, LivenessPolicy, MAX_DURATION};
    use crate::testing::{MockPeer, mock_connection};
    use crate::transport::{Frame, TransportError};

    const PING: Duration = Duration::from_secs(2);
    const READ_TIMEOUT: Duration = Duration::from_secs(4);

    // ping 2s, read 4s, write 2s
    fn config(mode: HeartbeatMode) -> HeartbeatConfig {
        HeartbeatConfig::from_ping_interval(PING).unwrap().with_mode(mode)
    }

    fn assert_near(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual <= expected + Duration::from_millis(2),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    // Pushes `frame` into the connection every `every`, starting after `offset`.
    fn feed(peer: &MockPeer, frame: Frame, offset: Duration, every: Duration) {
        let inbound = peer.inbound.clone();
        tokio::spawn(async move {
            sleep(offset).await;
            while inbound.send(Ok(frame.clone())).is_ok() {
                sleep(every).await;
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn evidence_every_two_seconds_keeps_session_alive() {
        let (conn, mut peer) = mock_connection();
        let start = Instant::now();
        feed(&peer, Frame::Pong(Bytes::new()), Duration::from_secs(1), PING);

        let supervisor = Supervisor::new(conn, config(HeartbeatMode::TransportControlSignal));
        let handle = supervisor.handle();
        let run = tokio::spawn(supervisor.run());

        tokio::time::sleep_until(start + Duration::from_secs(20)).await;
        assert!(!run.is_finished());
        assert!(!handle.is_stopped());

        handle.stop();
        let (outcome, report) = run.await.unwrap();
        assert!(outcome.is_ok());
        assert!(report.acknowledgements >= 9);
        assert!(report.pings_sent >= 9);
        assert_eq!(peer.state.close_count(), 1);

        while let Ok(frame) = peer.outbound.try_recv() {
            assert!(matches!(frame, Frame::Ping(_)), "unexpected {frame:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_after_read_timeout() {
        let (conn, mut peer) = mock_connection();
        let start = Instant::now();

        let (outcome, _report) = Supervisor::new(conn, config(HeartbeatMode::ApplicationEcho))
            .run()
            .await;

        match outcome {
            Err(SessionError::Timeout { after }) => assert_eq!(after, READ_TIMEOUT),
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_near(start.elapsed(), READ_TIMEOUT);
        assert_eq!(peer.state.close_count(), 1);
        assert!(!peer.state.io_after_close());

        let Ok(Frame::Text(first)) = peer.outbound.try_recv() else {
            panic!("expected the announcement first");
        };
        let announcement: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(announcement["read_timeout"], 4.0);
        assert_eq!(
            peer.outbound.try_recv().unwrap(),
            Frame::Text(r#"{"ping":0}"#.into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_failure_is_success() {
        let (conn, peer) = mock_connection();
        let supervisor = Supervisor::new(conn, config(HeartbeatMode::ApplicationEcho));
        let handle = supervisor.handle();
        let run = tokio::spawn(supervisor.run());

        sleep(Duration::from_secs(1)).await;
        handle.stop();
        handle.stop();

        let (outcome, report) = run.await.unwrap();
        assert!(outcome.is_ok());
        assert_eq!(report.pings_sent, 0);
        assert_eq!(peer.state.close_count(), 1);
        assert!(!peer.state.io_after_close());
    }

    #[tokio::test(start_paused = true)]
    async fn longest_accepted_timeouts_run_and_close() {
        let second = Duration::from_secs(1);
        let config = HeartbeatConfig::new(second, MAX_DURATION, MAX_DURATION).unwrap();
        let (conn, peer) = mock_connection();
        let supervisor = Supervisor::new(conn, config);
        let handle = supervisor.handle();
        let run = tokio::spawn(supervisor.run());

        sleep(Duration::from_millis(3500)).await;
        handle.stop();

        let (outcome, report) = run.await.unwrap();
        assert!(outcome.is_ok());
        assert_eq!(report.pings_sent, 3);
        assert_eq!(peer.state.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_is_reported() {
        let (conn, peer) = mock_connection();
        let parent = CancellationToken::new();
        let supervisor =
            Supervisor::with_parent(conn, config(HeartbeatMode::ApplicationEcho), &parent);
        let run = tokio::spawn(supervisor.run());

        sleep(Duration::from_secs(1)).await;
        parent.cancel();

        let (outcome, _) = run.await.unwrap();
        assert!(matches!(outcome, Err(SessionError::Cancelled)));
        assert_eq!(peer.state.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_ends_session() {
        let (conn, peer) = mock_connection();
        let start = Instant::now();
        peer.state.fail_sends();
        feed(&peer, Frame::Text("chatter".into()), Duration::ZERO, Duration::from_secs(1));

        let (outcome, _) = Supervisor::new(conn, config(HeartbeatMode::TransportControlSignal))
            .run()
            .await;

        match outcome {
            Err(SessionError::Send { seq, source }) => {
                assert_eq!(seq, Some(0));
                assert!(matches!(source, TransportError::Closed));
            }
            other => panic!("expected a send failure, got {other:?}"),
        }
        assert_near(start.elapsed(), PING);
        assert_eq!(peer.state.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_send_hits_write_deadline() {
        let (conn, peer) = mock_connection();
        let start = Instant::now();
        peer.state.stall_sends();
        feed(&peer, Frame::Text("chatter".into()), Duration::ZERO, Duration::from_secs(1));

        let (outcome, _) = Supervisor::new(conn, config(HeartbeatMode::TransportControlSignal))
            .run()
            .await;

        assert!(matches!(
            outcome,
            Err(SessionError::Send {
                seq: Some(0),
                source: TransportError::Timeout
            })
        ));
        // first tick at 2s plus a 2s write timeout
        assert_near(start.elapsed(), PING * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_is_receive_failure() {
        let (conn, peer) = mock_connection();
        feed(&peer, Frame::Close, Duration::from_secs(1), Duration::from_secs(60));

        let (outcome, report) = Supervisor::new(conn, config(HeartbeatMode::ApplicationEcho))
            .run()
            .await;

        assert!(matches!(
            outcome,
            Err(SessionError::Receive {
                source: TransportError::Closed
            })
        ));
        assert_eq!(report.frames_received, 1);
        assert_eq!(peer.state.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_failures_yield_one_outcome() {
        let (conn, peer) = mock_connection();
        peer.state.fail_sends();
        // reader fails at t=0 while the sender's announcement fails at t=0
        peer.inbound.send(Err(TransportError::Closed)).unwrap();

        let (outcome, _) = Supervisor::new(conn, config(HeartbeatMode::ApplicationEcho))
            .run()
            .await;

        let error = outcome.unwrap_err();
        assert!(matches!(
            error.task(),
            Some(TaskKind::Sender | TaskKind::Reader)
        ));
        assert_eq!(peer.state.close_count(), 1);
    }

    #[tokio::test]
    async fn first_failure_wins_under_contention() {
        let shutdown = Arc::new(Shutdown::new(CancellationToken::new()));
        let mut racers = JoinSet::new();
        for i in 0..16 {
            let shutdown = Arc::clone(&shutdown);
            racers.spawn(async move {
                shutdown.fail(SessionError::Send {
                    seq: Some(i),
                    source: TransportError::Closed,
                })
            });
        }

        let mut recorded = 0;
        while let Some(won) = racers.join_next().await {
            if won.unwrap() {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);
        assert!(shutdown.token().is_cancelled());
        assert!(shutdown.take_failure().is_some());
        assert!(shutdown.take_failure().is_none());
    }

    #[tokio::test]
    async fn failure_after_stop_is_discarded() {
        let shutdown = Shutdown::new(CancellationToken::new());
        shutdown.stop();
        assert!(!shutdown.fail(SessionError::Timeout { after: READ_TIMEOUT }));
        assert!(shutdown.take_failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledgement_only_ignores_application_data() {
        let (conn, peer) = mock_connection();
        let start = Instant::now();
        feed(
            &peer,
            Frame::Text(r#"{"chat":"hello"}"#.into()),
            Duration::ZERO,
            Duration::from_secs(1),
        );

        let config = config(HeartbeatMode::ApplicationEcho)
            .with_liveness(LivenessPolicy::AcknowledgementOnly);
        let (outcome, report) = Supervisor::new(conn, config).run().await;

        assert!(matches!(outcome, Err(SessionError::Timeout { .. })));
        assert_near(start.elapsed(), READ_TIMEOUT);
        assert_eq!(report.acknowledgements, 0);
        assert!(report.frames_received >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn echoing_peer_satisfies_acknowledgement_only() {
        let (conn, peer) = mock_connection();
        let MockPeer {
            inbound,
            mut outbound,
            state,
        } = peer;
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let is_ping = matches!(&frame, Frame::Text(text) if text.contains("\"ping\""));
                if is_ping {
                    let _ = inbound.send(Ok(frame));
                }
            }
        });

        let config = config(HeartbeatMode::ApplicationEcho)
            .with_liveness(LivenessPolicy::AcknowledgementOnly);
        let supervisor = Supervisor::new(conn, config);
        let handle = supervisor.handle();
        let run = tokio::spawn(supervisor.run());

        sleep(Duration::from_secs(30)).await;
        assert!(!run.is_finished());
        handle.stop();

        let (outcome, report) = run.await.unwrap();
        assert!(outcome.is_ok());
        assert!(report.acknowledgements >= 14);
        assert_eq!(state.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_frames_do_not_end_session() {
        let (conn, peer) = mock_connection();
        feed(
            &peer,
            Frame::Binary(Bytes::from_static(b"\xff\x00garbage")),
            Duration::from_millis(500),
            Duration::from_secs(1),
        );
        feed(&peer, Frame::Pong(Bytes::new()), Duration::from_secs(1), Duration::from_secs(3));

        let supervisor = Supervisor::new(conn, config(HeartbeatMode::ApplicationEcho));
        let handle = supervisor.handle();
        let run = tokio::spawn(supervisor.run());

        sleep(Duration::from_secs(10)).await;
        assert!(!run.is_finished());
        handle.stop();

        let (outcome, report) = run.await.unwrap();
        assert!(outcome.is_ok());
        assert!(report.frames_received >= 9);
        assert_eq!(report.acknowledgements, 0);
    }
}
