//! Huddle - reconnecting chat client core
//!
//! One STOMP session to a chat broker, multiplexed across a public channel and
//! per-group channels. The client keeps at most one push subscription per
//! channel, reconnects with exponential backoff, and reconciles history pulled
//! over the socket and over REST with live pushes into a single message view.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use huddle::{ChatClient, ClientConfig, StaticCredentials, WsConnector};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig::default();
//!     let connector = WsConnector::new(&config.server.ws_url, config.server.connect_timeout());
//!     let credentials = StaticCredentials::new(Some("token".into()), "1");
//!     let client = ChatClient::new(config, Arc::new(connector), Arc::new(credentials));
//!
//!     client.connect("alice").await.unwrap();
//!     client.send_chat("hello").await.unwrap();
//!
//!     let mut messages = client.messages();
//!     while messages.changed().await.is_ok() {
//!         for m in messages.borrow().iter() {
//!             println!("{}: {}", m.sender, m.content);
//!         }
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod history;
pub mod model;
pub mod registry;
pub mod rest;
pub mod routes;
pub mod session;
pub mod stream;
pub mod transport;

pub use client::{ChatClient, ChatClientBuilder, SubscribeOutcome};
pub use config::{ClientConfig, HistoryConfig, ServerConfig};
pub use credentials::{CredentialSource, EnvCredentials, StaticCredentials};
pub use error::{ChatError, ConfigError, FrameError, HistoryError, TransportError};
pub use history::{GroupDirectory, HistoryFetcher, HistoryLoad, HistorySource};
pub use model::{ChannelId, ChatMessage, HistorySnapshot, MessageType, PUBLIC_CHANNEL, QueueAnswer};
pub use rest::RestApi;
pub use routes::Routes;
pub use session::{ConnectionState, ReconnectPolicy, SessionStatus};
pub use stream::SnapshotFate;
pub use transport::memory::MemoryBroker;
pub use transport::websocket::WsConnector;
pub use transport::{Connector, Link, LinkEvent};
