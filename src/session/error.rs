//! Session failure taxonomy.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Identifies one of the three supervised tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Sender,
    Reader,
    Watchdog,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sender => "heartbeat sender",
            Self::Reader => "inbound reader",
            Self::Watchdog => "deadline watchdog",
        })
    }
}

/// Why a session ended, when it did not end deliberately.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A heartbeat write failed or exceeded the write timeout. `seq` is `None`
    /// for the read-timeout announcement.
    #[error("heartbeat send failed: {source}")]
    Send {
        seq: Option<u64>,
        #[source]
        source: TransportError,
    },

    /// A read failed, exceeded its deadline, or the peer closed the connection.
    #[error("receive failed: {source}")]
    Receive {
        #[source]
        source: TransportError,
    },

    /// No liveness evidence arrived within the read timeout.
    #[error("no liveness evidence within {after:?}")]
    Timeout { after: Duration },

    /// The caller's context ended before the session failed on its own.
    #[error("session cancelled by its parent")]
    Cancelled,

    /// A supervised task panicked.
    #[error("{task} panicked")]
    Panicked { task: TaskKind },
}

impl SessionError {
    /// The task that produced this failure, if it came from one.
    pub fn task(&self) -> Option<TaskKind> {
        match self {
            Self::Send { .. } => Some(TaskKind::Sender),
            Self::Receive { .. } => Some(TaskKind::Reader),
            Self::Timeout { .. } => Some(TaskKind::Watchdog),
            Self::Cancelled => None,
            Self::Panicked { task } => Some(*task),
        }
    }
}

/// Outcome of one supervised task.
pub type TaskResult = Result<(), SessionError>;
