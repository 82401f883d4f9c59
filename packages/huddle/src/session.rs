//! Transport session: connection lifecycle states and the reconnection policy.
//!
//! ```text
//! Disconnected ──Dial──▶ Connecting{None} ──Established──▶ Connected
//!      ▲                      │ DialFailed                    │ LinkLost
//!      │                      ▼                               ▼
//!      ├──────────────── Disconnected ──ScheduleRetry──▶ Reconnecting{n}
//!      │                                                      │ Retry{n}
//!      │ GiveUp                                               ▼
//!      └──────────────────────────────────────────────── Connecting{Some(n)}
//! ```
//!
//! A retry sequence is in flight exactly while the state is `Reconnecting` or
//! `Connecting { attempt: Some(_) }`. `Disconnect` is accepted from every state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ConfigError;
use crate::model::ChannelId;
use crate::transport::{Link, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Dialing. `attempt` is set when the dial belongs to a retry sequence.
    Connecting { attempt: Option<u32> },
    Connected,
    /// Waiting out the backoff before retry `attempt` (1-based).
    Reconnecting { attempt: u32 },
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A caller asked for a connection.
    Dial,
    /// The backoff for `attempt` elapsed; dial again.
    Retry { attempt: u32 },
    Established,
    DialFailed,
    /// An established link closed without being asked to.
    LinkLost,
    ScheduleRetry { attempt: u32 },
    /// The retry sequence ran out of attempts.
    GiveUp,
    Disconnect,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn retry_in_flight(&self) -> bool {
        matches!(
            self,
            ConnectionState::Reconnecting { .. } | ConnectionState::Connecting { attempt: Some(_) }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
        }
    }

    /// Next state for `event`, or `None` if the transition is not allowed.
    pub fn on(self, event: SessionEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use SessionEvent::*;

        let next = match (self, event) {
            (_, Disconnect) => Disconnected,
            (Disconnected | Reconnecting { .. }, Dial) => Connecting { attempt: None },
            (Reconnecting { attempt: waiting }, Retry { attempt }) if waiting == attempt => {
                Connecting {
                    attempt: Some(attempt),
                }
            }
            (Connecting { .. }, Established) => Connected,
            (Connecting { attempt: None }, DialFailed) => Disconnected,
            (Connecting { attempt: Some(n) }, DialFailed) => Reconnecting { attempt: n },
            (Connected, LinkLost) => Disconnected,
            (Disconnected | Reconnecting { .. }, ScheduleRetry { attempt }) => {
                Reconnecting { attempt }
            }
            (Reconnecting { .. } | Connecting { attempt: Some(_) }, GiveUp) => Disconnected,
            _ => return None,
        };
        Some(next)
    }
}

/// Exponential backoff between reconnection attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    2000
}
fn default_factor() -> f64 {
    1.5
}
fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry `attempt` (1-based): `base * factor^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.base_delay_ms as f64 * self.factor.powi(exponent);
        Duration::from_millis(millis.round() as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::ZeroBaseDelay);
        }
        if self.factor.is_nan() || self.factor <= 1.0 {
            return Err(ConfigError::InvalidFactor(self.factor));
        }
        Ok(())
    }

    /// Every delay of a full retry sequence, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|attempt| self.delay_for(attempt))
    }
}

/// Observable snapshot of the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub username: Option<String>,
    pub channel: ChannelId,
    /// Attempts made by the current or last retry sequence.
    pub reconnect_attempts: u32,
    /// The last retry sequence ran out of attempts; only a manual connect resumes.
    pub exhausted: bool,
    pub last_error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            username: None,
            channel: ChannelId::Public,
            reconnect_attempts: 0,
            exhausted: false,
            last_error: None,
        }
    }
}

/// The live link and what the session subscribed on it outside the channel registry.
pub(crate) struct ActiveLink {
    pub link: Box<dyn Link>,
    pub epoch: u64,
    pub history_queue: Option<SubscriptionId>,
}

/// The one session of a client.
#[derive(Default)]
pub(crate) struct Session {
    pub state: ConnectionState,
    pub username: Option<String>,
    pub channel: ChannelId,
    pub reconnect_attempts: u32,
    pub exhausted: bool,
    pub last_error: Option<String>,
    pub link: Option<ActiveLink>,
    /// Bumped for every established link; events from older epochs are stale.
    pub epoch: u64,
    /// Bumped for every dial; a finished dial holding an older ticket was superseded.
    pub dial: u64,
    pub retry: Option<CancellationToken>,
}

impl Session {
    /// Apply `event`. Illegal transitions are logged and leave the state untouched.
    pub fn apply(&mut self, event: SessionEvent) -> bool {
        match self.state.on(event) {
            Some(next) => {
                self.state = next;
                true
            }
            None => {
                warn!(state = ?self.state, event = ?event, "ignoring invalid session transition");
                false
            }
        }
    }

    /// The live link, if the session is connected.
    pub fn connected_link(&self) -> Option<&ActiveLink> {
        if self.state.is_connected() {
            self.link.as_ref()
        } else {
            None
        }
    }

    /// Cancel a running retry sequence, if any.
    pub fn cancel_retry(&mut self) {
        if let Some(token) = self.retry.take() {
            token.cancel();
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            username: self.username.clone(),
            channel: self.channel.clone(),
            reconnect_attempts: self.reconnect_attempts,
            exhausted: self.exhausted,
            last_error: self.last_error.clone(),
        }
    }
}
