//! Error taxonomy for the chat client.

use crate::model::ChannelId;

/// Failures surfaced by [`crate::ChatClient`] operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    /// No bearer token is available. Fatal for the current connect attempt.
    #[error("authentication token required")]
    CredentialMissing,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("not connected; message for {destination} was not sent")]
    SendWhileDisconnected { destination: String },

    #[error("not connected")]
    NotConnected,

    #[error("a connection attempt is already in progress")]
    ConnectInProgress,

    /// The session was disconnected while a connection attempt was in flight.
    #[error("connection attempt aborted")]
    Aborted,

    #[error("history for {channel} unavailable: {source}")]
    History {
        channel: ChannelId,
        #[source]
        source: HistoryError,
    },
}

/// Failures of the physical link to the broker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("broker rejected the connection: {0}")]
    Rejected(String),

    #[error("link is closed")]
    Closed,

    #[error("could not encode message body: {0}")]
    Encode(String),

    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
}

/// STOMP frame decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("malformed header line {0:?}")]
    MalformedHeader(String),

    #[error("invalid escape sequence in {0:?}")]
    InvalidEscape(String),

    #[error("frame is missing its NUL terminator")]
    Unterminated,

    #[error("frame body is not valid UTF-8")]
    InvalidUtf8,
}

/// Failures of either redundant history path or of the group directory.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HistoryError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("server responded with status {status}")]
    Status { status: u16 },

    #[error("malformed payload: {0}")]
    Decode(String),
}

impl HistoryError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
            }
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),

    #[error("reconnect.factor must be greater than 1.0, got {0}")]
    InvalidFactor(f64),

    #[error("reconnect.base_delay_ms must be positive")]
    ZeroBaseDelay,
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_missing_display() {
        assert_eq!(
            ChatError::CredentialMissing.to_string(),
            "authentication token required"
        );
    }

    #[test]
    fn transport_error_is_transparent() {
        let err: ChatError = TransportError::Connect("refused".into()).into();
        assert_eq!(err.to_string(), "connection failed: refused");
        assert!(matches!(err, ChatError::Transport(_)));
    }

    #[test]
    fn frame_error_converts_into_transport() {
        let err: TransportError = FrameError::Unterminated.into();
        assert_eq!(
            err.to_string(),
            "malformed frame: frame is missing its NUL terminator"
        );
    }
}
