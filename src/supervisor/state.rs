//! Pure supervisor state and retry decisions
//!
//! Nothing in this module performs I/O; the supervisor task feeds it the
//! current flags and timings and acts on the returned [`SupervisorAction`].

use crate::config::ReconnectSection;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Control flags shared between the supervisor handle and its task
#[derive(Debug, Clone, PartialEq)]
pub struct ControlFlags {
    /// Suspends connect attempts until cleared
    pub paused: bool,
    /// Terminal; the task exits once it observes this
    pub stopped: bool,
    /// Minimum spacing between connect attempts
    pub min_reconnect_delay: Duration,
}

impl ControlFlags {
    pub fn new(min_reconnect_delay: Duration) -> Self {
        Self {
            paused: false,
            stopped: false,
            min_reconnect_delay,
        }
    }
}

/// Lifecycle of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Task started, no attempt made yet
    Idle,
    /// A connect attempt is in flight
    Connecting,
    /// The session reported a successful connect
    Connected,
    /// The last attempt failed or the session ended
    Disconnected,
    /// `stop()` was called; terminal
    Stopped,
}

/// Polling intervals used by the supervisor task
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    /// Wait between connect attempts while disconnected
    pub connect_poll_interval: Duration,
    /// Wait between checks while connected, paused or attempting
    pub idle_poll_interval: Duration,
    pub min_reconnect_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            connect_poll_interval: Duration::from_secs(1),
            idle_poll_interval: Duration::from_millis(100),
            min_reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl From<&ReconnectSection> for SupervisorSettings {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            connect_poll_interval: section.connect_poll_interval(),
            idle_poll_interval: section.idle_poll_interval(),
            min_reconnect_delay: section.min_reconnect_delay(),
        }
    }
}

/// What the supervisor task should do next
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorAction {
    Exit,
    Connect,
    Wait(Duration),
}

/// Decide the supervisor's next step (pure function)
///
/// `since_last_attempt` is `None` when no attempt has been made yet.
pub fn decide_next_action(
    flags: &ControlFlags,
    connected: bool,
    attempt_in_flight: bool,
    since_last_attempt: Option<Duration>,
    settings: &SupervisorSettings,
) -> SupervisorAction {
    if flags.stopped {
        return SupervisorAction::Exit;
    }

    if flags.paused || connected || attempt_in_flight {
        return SupervisorAction::Wait(settings.idle_poll_interval);
    }

    let spacing = retry_spacing(flags, settings);
    match since_last_attempt {
        None => SupervisorAction::Connect,
        Some(elapsed) if elapsed >= spacing => SupervisorAction::Connect,
        Some(elapsed) => SupervisorAction::Wait(spacing - elapsed),
    }
}

/// Flat spacing between attempts; there is no backoff growth
pub fn retry_spacing(flags: &ControlFlags, settings: &SupervisorSettings) -> Duration {
    settings
        .connect_poll_interval
        .max(flags.min_reconnect_delay)
}

/// Connection counters kept by the supervisor
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupervisorStats {
    pub connect_attempts: u64,
    pub connections: u64,
    pub refusals: u64,
    pub disconnections: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl SupervisorStats {
    pub fn record_attempt(&mut self) {
        self.connect_attempts += 1;
    }

    pub fn record_connected(&mut self, at: DateTime<Utc>) {
        self.connections += 1;
        self.last_connected_at = Some(at);
    }

    pub fn record_refusal(&mut self) {
        self.refusals += 1;
    }

    pub fn record_disconnection(&mut self) {
        self.disconnections += 1;
    }
}
