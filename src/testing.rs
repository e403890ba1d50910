//! In-memory [`Connection`] for driving sessions from tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, sleep_until, timeout_at};

use crate::transport::{Connection, Frame, TransportError};

/// Connection half handed to the supervisor.
pub(crate) struct MockConnection {
    inbound: Mutex<mpsc::UnboundedReceiver<Result<Frame, TransportError>>>,
    outbound: mpsc::UnboundedSender<Frame>,
    state: Arc<MockState>,
}

/// Test-side half: scripts inbound frames and observes what the session did.
pub(crate) struct MockPeer {
    pub(crate) inbound: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    pub(crate) outbound: mpsc::UnboundedReceiver<Frame>,
    pub(crate) state: Arc<MockState>,
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    closes: AtomicUsize,
    io_after_close: AtomicBool,
    fail_sends: AtomicBool,
    stall_sends: AtomicBool,
}

impl MockState {
    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// `true` if any send or receive started after `close()`.
    pub(crate) fn io_after_close(&self) -> bool {
        self.io_after_close.load(Ordering::SeqCst)
    }

    /// Every subsequent send fails immediately.
    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Every subsequent send blocks until its deadline.
    pub(crate) fn stall_sends(&self) {
        self.stall_sends.store(true, Ordering::SeqCst);
    }

    fn note_io(&self) {
        if self.close_count() > 0 {
            self.io_after_close.store(true, Ordering::SeqCst);
        }
    }
}

pub(crate) fn mock_connection() -> (MockConnection, MockPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let state = Arc::new(MockState::default());
    (
        MockConnection {
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
            state: Arc::clone(&state),
        },
        MockPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            state,
        },
    )
}

impl Connection for MockConnection {
    async fn send_frame(&self, frame: Frame, deadline: Instant) -> Result<(), TransportError> {
        self.state.note_io();
        if self.state.stall_sends.load(Ordering::SeqCst) {
            sleep_until(deadline).await;
            return Err(TransportError::Timeout);
        }
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let _ = self.outbound.send(frame);
        Ok(())
    }

    async fn receive_frame(&self, deadline: Instant) -> Result<Frame, TransportError> {
        self.state.note_io();
        let receive = async { self.inbound.lock().await.recv().await };
        match timeout_at(deadline, receive).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
