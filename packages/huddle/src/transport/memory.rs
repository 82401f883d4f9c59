//! In-process broker for tests and offline use.
//!
//! Speaks the same destinations as the real server: CHAT sends fan out on the
//! channel topic and are kept as channel history, presence messages fan out on
//! the public topic, and history requests are answered on the requester's
//! history queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::TransportError;
use crate::model::{ChannelId, ChatMessage};
use crate::routes::Routes;

use super::{ConnectRequest, Connector, Established, Link, LinkEvent, SubscriptionId};

/// One frame a client sent, as recorded by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct SentFrame {
    pub login: String,
    pub destination: String,
    pub body: String,
}

#[derive(Default)]
struct BrokerState {
    routes: Routes,
    refuse_connections: bool,
    unanswered_history: HashSet<ChannelId>,
    connect_attempts: Vec<Instant>,
    links: HashMap<u64, LinkState>,
    backlog: HashMap<ChannelId, Vec<ChatMessage>>,
    sent: Vec<SentFrame>,
    next_link: u64,
    next_subscription: u64,
}

struct LinkState {
    login: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    subscriptions: HashMap<SubscriptionId, String>,
}

impl BrokerState {
    fn publish(&self, topic: &str, body: &str) -> usize {
        let mut delivered = 0;
        for link in self.links.values() {
            for (id, subscribed) in &link.subscriptions {
                if subscribed == topic {
                    let _ = link.events.send(LinkEvent::Message {
                        subscription: *id,
                        destination: topic.to_string(),
                        body: body.to_string(),
                    });
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn route(&mut self, link_id: u64, destination: &str, body: &str) {
        let Some(login) = self.links.get(&link_id).map(|l| l.login.clone()) else {
            return;
        };
        self.sent.push(SentFrame {
            login: login.clone(),
            destination: destination.to_string(),
            body: body.to_string(),
        });

        if let Some(channel) = self.routes.channel_for_chat_send(destination) {
            let topic = self.routes.topic(&channel);
            match serde_json::from_str::<ChatMessage>(body) {
                Ok(mut message) => {
                    message.channel = channel.clone();
                    self.backlog.entry(channel).or_default().push(message);
                }
                Err(e) => debug!(error = %e, "memory broker: chat body is not a ChatMessage"),
            }
            self.publish(&topic, body);
        } else if destination == self.routes.add_user {
            let topic = self.routes.public_topic.clone();
            self.publish(&topic, body);
        } else if let Some(channel) = self.routes.channel_for_history_request(destination) {
            if self.unanswered_history.contains(&channel) {
                debug!(channel = %channel, "memory broker: leaving history request unanswered");
            } else {
                self.answer_history(link_id, &login, channel);
            }
        } else {
            self.publish(destination, body);
        }
    }

    fn answer_history(&self, link_id: u64, login: &str, channel: ChannelId) {
        let queue = self.routes.history_queue(login);
        let messages = self.backlog.get(&channel).cloned().unwrap_or_default();
        let body = serde_json::json!({ "chatId": channel, "messages": messages }).to_string();
        if let Some(link) = self.links.get(&link_id) {
            for (id, topic) in &link.subscriptions {
                if *topic == queue {
                    let _ = link.events.send(LinkEvent::Message {
                        subscription: *id,
                        destination: queue.clone(),
                        body: body.clone(),
                    });
                }
            }
        }
    }
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new(routes: Routes) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                routes,
                ..Default::default()
            })),
        }
    }

    /// Refuse (or accept again) every subsequent connection attempt.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Record history requests for `channel` but never answer them.
    pub fn leave_history_unanswered(&self, channel: ChannelId) {
        self.state.lock().unanswered_history.insert(channel);
    }

    /// Drop every open link as if the network went away.
    pub fn drop_links(&self, reason: &str) -> usize {
        let mut state = self.state.lock();
        let dropped = state.links.len();
        for (_, link) in state.links.drain() {
            let _ = link.events.send(LinkEvent::Closed {
                reason: Some(reason.to_string()),
            });
        }
        dropped
    }

    /// Replace the stored history of a channel.
    pub fn seed_history(&self, channel: ChannelId, messages: Vec<ChatMessage>) {
        self.state.lock().backlog.insert(channel, messages);
    }

    /// Push a message on a topic as the server would. Returns the number of deliveries.
    pub fn publish(&self, topic: &str, message: &ChatMessage) -> usize {
        match serde_json::to_string(message) {
            Ok(body) => self.state.lock().publish(topic, &body),
            Err(_) => 0,
        }
    }

    /// Push a raw body on a topic.
    pub fn publish_raw(&self, topic: &str, body: &str) -> usize {
        self.state.lock().publish(topic, body)
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts.len()
    }

    /// When each connection attempt happened, in order.
    pub fn connect_attempt_times(&self) -> Vec<Instant> {
        self.state.lock().connect_attempts.clone()
    }

    pub fn open_links(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Topics currently subscribed across all links, one entry per subscription.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut topics: Vec<String> = state
            .links
            .values()
            .flat_map(|l| l.subscriptions.values().cloned())
            .collect();
        topics.sort();
        topics
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, request: ConnectRequest) -> Result<Established, TransportError> {
        let mut state = self.state.lock();
        state.connect_attempts.push(Instant::now());
        if state.refuse_connections {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        if request.token.is_empty() {
            return Err(TransportError::Rejected("missing Authorization header".to_string()));
        }

        state.next_link += 1;
        let id = state.next_link;
        let (tx, rx) = mpsc::unbounded_channel();
        state.links.insert(
            id,
            LinkState {
                login: request.login.clone(),
                events: tx,
                subscriptions: HashMap::new(),
            },
        );
        debug!(link = id, login = %request.login, "memory broker: link opened");

        Ok(Established {
            link: Box::new(MemoryLink {
                id,
                state: self.state.clone(),
            }),
            events: rx,
        })
    }
}

struct MemoryLink {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl Link for MemoryLink {
    fn send(&self, destination: &str, body: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.links.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        state.route(self.id, destination, body);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<SubscriptionId, TransportError> {
        let mut state = self.state.lock();
        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        let link = state.links.get_mut(&self.id).ok_or(TransportError::Closed)?;
        link.subscriptions.insert(id, topic.to_string());
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let link = state.links.get_mut(&self.id).ok_or(TransportError::Closed)?;
        link.subscriptions.remove(&id);
        Ok(())
    }

    fn close(&self) {
        if let Some(link) = self.state.lock().links.remove(&self.id) {
            let _ = link.events.send(LinkEvent::Closed { reason: None });
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().links.contains_key(&self.id)
    }
}
