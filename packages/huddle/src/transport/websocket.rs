//! STOMP over a raw WebSocket.
//!
//! One writer task drains an unbounded queue into the socket; one reader task
//! decodes inbound frames into [`LinkEvent`]s. A socket close, a read or write
//! error, or a STOMP ERROR frame ends the link with a single `Closed` event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::error::TransportError;

use super::stomp::{Command, Frame, is_heartbeat};
use super::{ConnectRequest, Connector, Established, Link, LinkEvent, SubscriptionId};

/// Dials a STOMP broker at a `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    host: String,
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, handshake_timeout: Duration) -> Self {
        let url = url.into();
        let host = host_of(&url);
        Self {
            url,
            host,
            handshake_timeout,
        }
    }
}

/// `host[:port]` part of a URL, used as the STOMP virtual host.
fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    rest.split(['/', '?']).next().unwrap_or(rest).to_string()
}

enum Outbound {
    Frame(Frame),
    Close,
}

/// Ends a link once, from whichever task notices first.
struct Shutdown {
    open: Arc<AtomicBool>,
    fired: AtomicBool,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Shutdown {
    fn new(open: Arc<AtomicBool>, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            open,
            fired: AtomicBool::new(false),
            events,
        }
    }

    /// Mark the link closed and report `reason`. Returns `false` if already reported.
    fn fire(&self, reason: Option<String>) -> bool {
        self.open.store(false, Ordering::SeqCst);
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.events.send(LinkEvent::Closed { reason });
        true
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Established, TransportError> {
        info!(url = %self.url, login = %request.login, "connecting to broker");
        let (ws, _) = tokio::time::timeout(
            self.handshake_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| TransportError::Connect("websocket handshake timed out".to_string()))?
        .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (mut write, mut read) = ws.split();

        let connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", self.host.as_str())
            .header("login", request.login.as_str())
            .header("Authorization", request.authorization())
            .header("heart-beat", "0,0");
        write
            .send(Message::Text(connect.encode().into()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let connected = tokio::time::timeout(self.handshake_timeout, await_connected(&mut read))
            .await
            .map_err(|_| TransportError::Connect("STOMP handshake timed out".to_string()))??;
        info!(
            version = connected.get("version").unwrap_or("?"),
            server = connected.get("server").unwrap_or("?"),
            "broker session established"
        );

        let open = Arc::new(AtomicBool::new(true));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<LinkEvent>();

        let shutdown = Arc::new(Shutdown::new(open.clone(), event_tx));

        let reader_shutdown = shutdown.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                let text = match read.next().await {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.as_str().to_owned());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                };
                if is_heartbeat(&text) {
                    continue;
                }
                let frame = match Frame::decode(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable frame");
                        continue;
                    }
                };
                match frame.command {
                    Command::Message => {
                        let Some(subscription) =
                            frame.get("subscription").and_then(SubscriptionId::parse)
                        else {
                            warn!("MESSAGE frame without a usable subscription header");
                            continue;
                        };
                        let destination = frame.get("destination").unwrap_or_default().to_string();
                        let event = LinkEvent::Message {
                            subscription,
                            destination,
                            body: frame.body,
                        };
                        if reader_shutdown.events.send(event).is_err() {
                            break None;
                        }
                    }
                    Command::Error => {
                        break Some(
                            frame
                                .get("message")
                                .map(str::to_string)
                                .unwrap_or(frame.body),
                        );
                    }
                    Command::Receipt => debug!(receipt = ?frame.get("receipt-id"), "receipt"),
                    other => debug!(command = other.as_str(), "ignoring frame"),
                }
            };
            reader_shutdown.fire(reason);
        });

        let writer_open = open.clone();
        let reader_abort = reader.abort_handle();
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    Outbound::Frame(frame) => {
                        if let Err(e) = write.send(Message::Text(frame.encode().into())).await {
                            warn!(error = %e, "websocket write failed");
                            reader_abort.abort();
                            shutdown.fire(Some(format!("websocket write failed: {e}")));
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        Ok(Established {
            link: Box::new(WsLink {
                outbound: out_tx,
                next_subscription: AtomicU64::new(0),
                open,
            }),
            events: event_rx,
        })
    }
}

/// Read frames until the broker answers CONNECT.
async fn await_connected<S>(read: &mut S) -> Result<Frame, TransportError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let text = match read.next().await {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Connect(
                    "socket closed during STOMP handshake".to_string(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(TransportError::Connect(e.to_string())),
        };
        if is_heartbeat(&text) {
            continue;
        }
        let frame = Frame::decode(&text)?;
        match frame.command {
            Command::Connected => return Ok(frame),
            Command::Error => {
                let reason = frame
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| frame.body.clone());
                return Err(TransportError::Rejected(reason));
            }
            other => debug!(command = other.as_str(), "ignoring frame before CONNECTED"),
        }
    }
}

struct WsLink {
    outbound: mpsc::UnboundedSender<Outbound>,
    next_subscription: AtomicU64,
    open: Arc<AtomicBool>,
}

impl WsLink {
    fn enqueue(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }
}

impl Link for WsLink {
    fn send(&self, destination: &str, body: &str) -> Result<(), TransportError> {
        self.enqueue(
            Frame::new(Command::Send)
                .header("destination", destination)
                .header("content-type", "application/json")
                .body(body),
        )
    }

    fn subscribe(&self, topic: &str) -> Result<SubscriptionId, TransportError> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.enqueue(
            Frame::new(Command::Subscribe)
                .header("id", id.to_string())
                .header("destination", topic)
                .header("ack", "auto"),
        )?;
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        self.enqueue(Frame::new(Command::Unsubscribe).header("id", id.to_string()))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self
                .outbound
                .send(Outbound::Frame(Frame::new(Command::Disconnect)));
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
