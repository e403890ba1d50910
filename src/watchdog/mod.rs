//! Deadline Watchdog: declares the peer unreachable after `read_timeout`
//! without liveness evidence.
//!
//! The watchdog is a single deferred timer. It starts armed for
//! `read_timeout` from creation; every [`WatchdogHandle::reset`] moves the
//! deadline to `now + read_timeout`. The reschedule is absolute, so a burst of
//! evidence never pushes the deadline further than one timeout ahead.
//!
//! ```text
//! Armed ──deadline elapses──▶ Fired       (terminal)
//!   │
//!   └──token cancelled──────▶ Cancelled   (terminal)
//! ```
//!
//! Whichever transition happens first wins; a fired watchdog is never
//! re-armed.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Terminal state of a [`Watchdog`]. The timer is armed for as long as
/// [`Watchdog::run`] is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// The deadline elapsed with no evidence.
    Fired,
    /// The shared token was cancelled before the deadline.
    Cancelled,
}

/// The timer half, driven by [`Watchdog::run`].
pub struct Watchdog {
    deadline: watch::Receiver<Instant>,
    token: CancellationToken,
}

/// The reset half, held by whoever observes liveness evidence.
#[derive(Debug)]
pub struct WatchdogHandle {
    read_timeout: Duration,
    deadline: watch::Sender<Instant>,
}

impl Watchdog {
    /// Creates a watchdog armed for `read_timeout` from now.
    ///
    /// `token` is the session's shared cancellation token: cancelling it
    /// disarms the watchdog. Firing does not cancel the token by itself; the
    /// caller reacts to [`WatchdogState::Fired`].
    pub fn new(read_timeout: Duration, token: CancellationToken) -> (Self, WatchdogHandle) {
        let (tx, rx) = watch::channel(Instant::now() + read_timeout);
        (
            Self {
                deadline: rx,
                token,
            },
            WatchdogHandle {
                read_timeout,
                deadline: tx,
            },
        )
    }

    /// Waits until the watchdog fires or is cancelled.
    pub async fn run(mut self) -> WatchdogState {
        let sleep = sleep_until(*self.deadline.borrow_and_update());
        tokio::pin!(sleep);
        let mut resets_open = true;

        loop {
            tokio::select! {
                biased;
                () = self.token.cancelled() => return WatchdogState::Cancelled,
                changed = self.deadline.changed(), if resets_open => match changed {
                    Ok(()) => sleep.as_mut().reset(*self.deadline.borrow_and_update()),
                    // handle dropped: the current deadline is final
                    Err(_) => resets_open = false,
                },
                () = &mut sleep => return WatchdogState::Fired,
            }
        }
    }
}

impl WatchdogHandle {
    /// Reschedules the deadline to `read_timeout` from now and returns it.
    pub fn reset(&self) -> Instant {
        let deadline = Instant::now() + self.read_timeout;
        let _ = self.deadline.send_replace(deadline);
        deadline
    }

    /// The instant at which the watchdog will fire unless reset again.
    pub fn deadline(&self) -> Instant {
        *self.deadline.borrow()
    }

    /// Returns `true` once the current deadline has passed.
    pub fn is_due(&self) -> bool {
        self.deadline() <= Instant::now()
    }
}
