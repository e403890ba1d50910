//! Heartbeat signals: what goes on the wire for each [`HeartbeatMode`].
//!
//! | Mode                     | Outbound signal            | Acknowledgment             |
//! |--------------------------|----------------------------|----------------------------|
//! | `TransportControlSignal` | ping frame, seq in payload | pong frame                 |
//! | `ApplicationEcho`        | text `{"ping": seq}`       | the same text echoed back  |
//!
//! Echo-mode sessions may open with a `{"read_timeout": secs}` announcement
//! so the peer can arm a matching watchdog of its own.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::HeartbeatMode;
use crate::transport::Frame;

pub(crate) mod sender;

/// First message of an echo-mode session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    /// Peer silence tolerated by the server, in seconds.
    pub read_timeout: f64,
}

/// Application-level ping, echoed back verbatim by a live peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EchoPing {
    pub ping: u64,
}

/// Builds the read-timeout announcement frame.
pub fn announcement_frame(read_timeout: Duration) -> Result<Frame, serde_json::Error> {
    let announcement = Announcement {
        read_timeout: read_timeout.as_secs_f64(),
    };
    Ok(Frame::Text(serde_json::to_string(&announcement)?))
}

/// Builds the heartbeat frame carrying sequence number `seq`.
pub fn ping_frame(mode: HeartbeatMode, seq: u64) -> Result<Frame, serde_json::Error> {
    match mode {
        HeartbeatMode::TransportControlSignal => {
            Ok(Frame::Ping(Bytes::copy_from_slice(&seq.to_be_bytes())))
        }
        HeartbeatMode::ApplicationEcho => {
            Ok(Frame::Text(serde_json::to_string(&EchoPing { ping: seq })?))
        }
    }
}

/// How the reader should treat one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// The peer answered a heartbeat. The sequence number is known when the
    /// payload carries one.
    Acknowledgement(Option<u64>),
    /// Ordinary application traffic, or a peer-initiated ping.
    Data,
    /// A frame this mode never expects; logged, never fatal on its own.
    Unexpected(&'static str),
    /// The peer started the closing handshake.
    Closed,
}

/// Classifies an inbound frame for `mode`.
pub fn classify(mode: HeartbeatMode, frame: &Frame) -> Inbound {
    match (mode, frame) {
        (_, Frame::Close) => Inbound::Closed,
        (_, Frame::Ping(_)) => Inbound::Data,
        (HeartbeatMode::TransportControlSignal, Frame::Pong(payload)) => {
            Inbound::Acknowledgement(control_sequence(payload))
        }
        (HeartbeatMode::TransportControlSignal, Frame::Text(_) | Frame::Binary(_)) => {
            Inbound::Data
        }
        (HeartbeatMode::ApplicationEcho, Frame::Text(text)) => {
            match serde_json::from_str::<EchoPing>(text) {
                Ok(echo) => Inbound::Acknowledgement(Some(echo.ping)),
                Err(_) => Inbound::Data,
            }
        }
        (HeartbeatMode::ApplicationEcho, Frame::Pong(_)) => Inbound::Unexpected("unsolicited pong"),
        (HeartbeatMode::ApplicationEcho, Frame::Binary(_)) => Inbound::Unexpected("binary frame"),
    }
}

fn control_sequence(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
