//! Heartbeat configuration: intervals, deadlines and liveness policy.
//!
//! A [`HeartbeatConfig`] is immutable once built and always satisfies
//! `read_timeout > ping_interval`: a peer answering on schedule must never be
//! declared dead. Configurations come either from code
//! ([`HeartbeatConfig::new`], [`HeartbeatConfig::from_ping_interval`]) or from
//! JSON ([`HeartbeatConfig::from_json`]); both paths go through the same
//! validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ping interval used by [`HeartbeatConfig::default`].
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on every configured duration. Deadlines are computed as
/// `now + duration` and must stay representable.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors produced while building a [`HeartbeatConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ping interval must be non-zero")]
    ZeroPingInterval,

    #[error("write timeout must be non-zero")]
    ZeroWriteTimeout,

    #[error("{name} {value:?} exceeds the maximum of {max:?}")]
    DurationTooLong {
        name: &'static str,
        value: Duration,
        max: Duration,
    },

    #[error("read timeout {read_timeout:?} must exceed ping interval {ping_interval:?}")]
    ReadTimeoutTooShort {
        read_timeout: Duration,
        ping_interval: Duration,
    },

    #[error("invalid heartbeat settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How liveness is signaled to the peer and acknowledged by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatMode {
    /// WebSocket ping control frames, acknowledged by pong frames.
    TransportControlSignal,
    /// Text frames carrying `{"ping": n}`, echoed back verbatim by the peer.
    #[default]
    ApplicationEcho,
}

/// Which inbound frames count as liveness evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessPolicy {
    /// Every successful read proves the peer is alive.
    #[default]
    AnyFrame,
    /// Only a recognized acknowledgment (pong or echoed ping) counts.
    AcknowledgementOnly,
}

/// Validated, immutable heartbeat configuration for one session.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use pulse::config::HeartbeatConfig;
///
/// let config = HeartbeatConfig::from_ping_interval(Duration::from_secs(2)).unwrap();
/// assert_eq!(config.read_timeout(), Duration::from_secs(4));
/// assert_eq!(config.write_timeout(), Duration::from_secs(2));
///
/// assert!(HeartbeatConfig::new(
///     Duration::from_secs(5),
///     Duration::from_secs(5),
///     Duration::from_secs(5),
/// )
/// .is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    ping_interval: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    mode: HeartbeatMode,
    liveness: LivenessPolicy,
    announce_read_timeout: bool,
}

impl HeartbeatConfig {
    /// Builds a configuration from explicit timings.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::ZeroPingInterval`] / [`ConfigError::ZeroWriteTimeout`] for zero durations.
    /// - [`ConfigError::DurationTooLong`] for any duration above [`MAX_DURATION`].
    /// - [`ConfigError::ReadTimeoutTooShort`] unless `read_timeout > ping_interval`.
    pub fn new(
        ping_interval: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if ping_interval.is_zero() {
            return Err(ConfigError::ZeroPingInterval);
        }
        if write_timeout.is_zero() {
            return Err(ConfigError::ZeroWriteTimeout);
        }
        for (name, value) in [
            ("ping interval", ping_interval),
            ("read timeout", read_timeout),
            ("write timeout", write_timeout),
        ] {
            if value > MAX_DURATION {
                return Err(ConfigError::DurationTooLong {
                    name,
                    value,
                    max: MAX_DURATION,
                });
            }
        }
        if read_timeout <= ping_interval {
            return Err(ConfigError::ReadTimeoutTooShort {
                read_timeout,
                ping_interval,
            });
        }
        Ok(Self {
            ping_interval,
            read_timeout,
            write_timeout,
            mode: HeartbeatMode::default(),
            liveness: LivenessPolicy::default(),
            announce_read_timeout: true,
        })
    }

    /// Builds the default policy for `ping_interval`: the peer may stay silent
    /// for two intervals, and a send may block for one.
    pub fn from_ping_interval(ping_interval: Duration) -> Result<Self, ConfigError> {
        Self::new(ping_interval, ping_interval.saturating_mul(2), ping_interval)
    }

    /// Parses and validates a JSON settings document.
    ///
    /// ```
    /// use std::time::Duration;
    /// use pulse::config::{HeartbeatConfig, HeartbeatMode};
    ///
    /// let config = HeartbeatConfig::from_json(
    ///     r#"{ "ping_interval_ms": 1000, "mode": "transport_control_signal" }"#,
    /// ).unwrap();
    /// assert_eq!(config.read_timeout(), Duration::from_secs(2));
    /// assert_eq!(config.mode(), HeartbeatMode::TransportControlSignal);
    /// ```
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: HeartbeatSettings = serde_json::from_str(json)?;
        settings.try_into()
    }

    /// Selects how heartbeats are signaled and acknowledged.
    pub fn with_mode(mut self, mode: HeartbeatMode) -> Self {
        self.mode = mode;
        self
    }

    /// Selects which inbound frames reset the watchdog.
    pub fn with_liveness(mut self, liveness: LivenessPolicy) -> Self {
        self.liveness = liveness;
        self
    }

    /// Whether echo-mode sessions open with a `{"read_timeout": secs}` message.
    /// Ignored in [`HeartbeatMode::TransportControlSignal`].
    pub fn with_announce_read_timeout(mut self, announce: bool) -> Self {
        self.announce_read_timeout = announce;
        self
    }

    /// Time between outbound heartbeat signals.
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Maximum peer silence tolerated before the session is declared dead.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Maximum time a single outbound send may block.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// How heartbeats are signaled and acknowledged.
    pub fn mode(&self) -> HeartbeatMode {
        self.mode
    }

    /// Which inbound frames count as liveness evidence.
    pub fn liveness(&self) -> LivenessPolicy {
        self.liveness
    }

    /// Returns `true` if the sender must announce the read timeout before the first ping.
    pub fn announces_read_timeout(&self) -> bool {
        self.announce_read_timeout && self.mode == HeartbeatMode::ApplicationEcho
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            read_timeout: DEFAULT_PING_INTERVAL * 2,
            write_timeout: DEFAULT_PING_INTERVAL,
            mode: HeartbeatMode::default(),
            liveness: LivenessPolicy::default(),
            announce_read_timeout: true,
        }
    }
}

/// Raw, unvalidated heartbeat settings as they appear in a JSON document.
///
/// Missing timeouts fall back to the default policy derived from the ping
/// interval. Convert with [`TryFrom`] to obtain a [`HeartbeatConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatSettings {
    pub ping_interval_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub mode: HeartbeatMode,
    pub liveness: LivenessPolicy,
    pub announce_read_timeout: bool,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: None,
            read_timeout_ms: None,
            write_timeout_ms: None,
            mode: HeartbeatMode::default(),
            liveness: LivenessPolicy::default(),
            announce_read_timeout: true,
        }
    }
}

impl TryFrom<HeartbeatSettings> for HeartbeatConfig {
    type Error = ConfigError;

    fn try_from(settings: HeartbeatSettings) -> Result<Self, Self::Error> {
        let ping_interval = settings
            .ping_interval_ms
            .map_or(DEFAULT_PING_INTERVAL, Duration::from_millis);
        let read_timeout = settings
            .read_timeout_ms
            .map_or(ping_interval.saturating_mul(2), Duration::from_millis);
        let write_timeout = settings
            .write_timeout_ms
            .map_or(ping_interval, Duration::from_millis);

        Ok(Self::new(ping_interval, read_timeout, write_timeout)?
            .with_mode(settings.mode)
            .with_liveness(settings.liveness)
            .with_announce_read_timeout(settings.announce_read_timeout))
    }
}
