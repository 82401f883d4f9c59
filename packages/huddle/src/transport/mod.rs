//! Transport layer: the seam between the session and a physical broker link.
//!
//! - `stomp`: STOMP 1.2 frame codec
//! - `websocket`: STOMP over WebSocket connector
//! - `memory`: in-process broker for tests and offline use

pub mod memory;
pub mod stomp;
pub mod websocket;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Broker-assigned handle for one push subscription on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

impl SubscriptionId {
    /// Parse the `sub-N` form used on the wire.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.strip_prefix("sub-")
            .unwrap_or(raw)
            .parse()
            .ok()
            .map(SubscriptionId)
    }
}

/// Handshake parameters for a new link.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub login: String,
    pub token: String,
}

impl ConnectRequest {
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Inbound traffic on a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message {
        subscription: SubscriptionId,
        destination: String,
        body: String,
    },
    /// The link is gone. Nothing follows this event.
    Closed { reason: Option<String> },
}

/// An established broker link. Operations are fire-and-forget.
pub trait Link: Send + Sync {
    fn send(&self, destination: &str, body: &str) -> Result<(), TransportError>;

    fn subscribe(&self, topic: &str) -> Result<SubscriptionId, TransportError>;

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;

    /// Graceful close. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// A freshly established link and its inbound event stream.
pub struct Established {
    pub link: Box<dyn Link>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("open", &self.link.is_open())
            .finish()
    }
}

/// Dials the broker. This is the only suspension point of connection setup.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Established, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_id_wire_form() {
        let id = SubscriptionId(7);
        assert_eq!(id.to_string(), "sub-7");
        assert_eq!(SubscriptionId::parse("sub-7"), Some(id));
        assert_eq!(SubscriptionId::parse("7"), Some(id));
        assert_eq!(SubscriptionId::parse("sub-x"), None);
    }

    #[test]
    fn bearer_header() {
        let req = ConnectRequest {
            login: "alice".into(),
            token: "t0k".into(),
        };
        assert_eq!(req.authorization(), "Bearer t0k");
    }
}
