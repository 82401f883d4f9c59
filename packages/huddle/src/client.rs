//! `ChatClient`: the session, the subscription registry and the message stream
//! behind one handle.
//!
//! All mutable state sits behind a single async mutex that is never held across
//! a network await. Connection establishment and the backoff timer run with
//! the lock released; everything they decide is re-checked against the dial
//! ticket and link epoch once the lock is taken again.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::credentials::CredentialSource;
use crate::error::{ChatError, TransportError};
use crate::history::{GroupDirectory, HistoryFetcher, HistoryLoad, HistorySource, SnapshotSink};
use crate::model::{ChannelId, ChatMessage, HistorySnapshot, MessageType, QueueAnswer};
use crate::registry::SubscriptionRegistry;
use crate::routes::Routes;
use crate::session::{ActiveLink, ConnectionState, Session, SessionEvent, SessionStatus};
use crate::stream::{MessageStream, SnapshotFate};
use crate::transport::{ConnectRequest, Connector, Established, Link, LinkEvent};

/// Result of a subscribe request.
#[derive(Debug)]
pub enum SubscribeOutcome {
    /// The subscription is live.
    Active,
    /// Not connected. The task waits for connectivity, retries once and
    /// resolves to whether the subscription went live.
    Queued(JoinHandle<bool>),
}

impl SubscribeOutcome {
    /// Resolve a queued subscribe. `Active` resolves to `true` immediately.
    pub async fn settled(self) -> bool {
        match self {
            SubscribeOutcome::Active => true,
            SubscribeOutcome::Queued(handle) => handle.await.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialKind {
    /// `connect`: failure starts the backoff loop.
    Manual,
    /// `ensure_connection`: one attempt, no loop.
    Probe,
    /// A step of the backoff loop.
    Retry(u32),
}

impl DialKind {
    fn attempt(self) -> Option<u32> {
        match self {
            DialKind::Retry(n) => Some(n),
            DialKind::Manual | DialKind::Probe => None,
        }
    }
}

/// Socket history requests awaiting their answer, oldest first.
#[derive(Debug, Default)]
struct SocketLoads(VecDeque<(ChannelId, u64)>);

impl SocketLoads {
    fn push(&mut self, channel: ChannelId, generation: u64) {
        self.0.push_back((channel, generation));
    }

    fn clear(&mut self) {
        self.0.clear();
    }

    /// The request an answer belongs to.
    ///
    /// An answer naming its channel takes the newest request for that channel
    /// and retires the older ones, so a request the broker never answered
    /// cannot shift later answers. An unnamed answer takes the oldest request.
    fn claim(&mut self, channel: Option<&ChannelId>) -> Option<(ChannelId, u64)> {
        let Some(channel) = channel else {
            return self.0.pop_front();
        };
        let generation = self
            .0
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, g)| *g)
            .max()?;
        self.0.retain(|(c, _)| c != channel);
        Some((channel.clone(), generation))
    }
}

/// Why a queued subscribe runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    /// `subscribe`: register the channel whether or not it is active.
    Subscribe,
    /// `switch_channel`: only while the channel is still the active one.
    Switch,
}

struct Core {
    session: Session,
    registry: SubscriptionRegistry,
    stream: MessageStream,
    socket_loads: SocketLoads,
}

struct Shared {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSource>,
    history: HistoryFetcher,
    core: Mutex<Core>,
    status_tx: watch::Sender<SessionStatus>,
    messages_rx: watch::Receiver<Vec<ChatMessage>>,
}

/// Handle to a chat session. Clones share the same session.
#[derive(Clone)]
pub struct ChatClient {
    shared: Arc<Shared>,
}

pub struct ChatClientBuilder {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSource>,
    rest: Option<Arc<dyn HistorySource>>,
    groups: Option<Arc<dyn GroupDirectory>>,
}

impl ChatClientBuilder {
    /// REST history path. Ignored when `history.rest` is off.
    pub fn history_source(mut self, source: Arc<dyn HistorySource>) -> Self {
        self.rest = Some(source);
        self
    }

    pub fn group_directory(mut self, groups: Arc<dyn GroupDirectory>) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn build(self) -> ChatClient {
        let history = HistoryFetcher::new(&self.config.history, self.rest, self.groups);
        let stream = MessageStream::new();
        let messages_rx = stream.subscribe();
        let (status_tx, _) = watch::channel(SessionStatus::default());
        let core = Core {
            session: Session::default(),
            registry: SubscriptionRegistry::new(self.config.routes.clone()),
            stream,
            socket_loads: SocketLoads::default(),
        };
        ChatClient {
            shared: Arc::new(Shared {
                config: self.config,
                connector: self.connector,
                credentials: self.credentials,
                history,
                core: Mutex::new(core),
                status_tx,
                messages_rx,
            }),
        }
    }
}

impl ChatClient {
    pub fn builder(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
    ) -> ChatClientBuilder {
        ChatClientBuilder {
            config,
            connector,
            credentials,
            rest: None,
            groups: None,
        }
    }

    /// Client with the socket history path only.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self::builder(config, connector, credentials).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Connect as `username`.
    ///
    /// Fails with `CredentialMissing` without touching the session when no token
    /// is available. A failed dial starts the backoff loop and is returned as
    /// `Transport`.
    pub async fn connect(&self, username: &str) -> Result<(), ChatError> {
        self.shared.connect(username).await
    }

    /// Announce LEAVE, release every subscription and close the link. Idempotent.
    pub async fn disconnect(&self) {
        self.shared.disconnect().await
    }

    pub async fn send_message(
        &self,
        sender: &str,
        content: &str,
        kind: MessageType,
        channel: ChannelId,
    ) -> Result<(), ChatError> {
        self.shared
            .send_message(ChatMessage::new(sender, content, kind, channel))
            .await
    }

    /// Send a CHAT message as the session user on the active channel.
    pub async fn send_chat(&self, content: &str) -> Result<(), ChatError> {
        let (sender, channel) = {
            let core = self.shared.core.lock().await;
            let Some(sender) = core.session.username.clone() else {
                return Err(ChatError::NotConnected);
            };
            (sender, core.session.channel.clone())
        };
        self.send_message(&sender, content, MessageType::Chat, channel)
            .await
    }

    /// Make `to` the active channel: release the previous channel's
    /// subscription, show cached messages, subscribe and load history.
    pub async fn switch_channel(&self, to: impl Into<ChannelId>) -> SubscribeOutcome {
        self.shared.switch_channel(to.into()).await
    }

    pub async fn subscribe(&self, channel: impl Into<ChannelId>) -> SubscribeOutcome {
        self.shared.subscribe(channel.into()).await
    }

    /// Release the subscription for `channel`, if any. Returns whether one existed.
    pub async fn unsubscribe(&self, channel: impl Into<ChannelId>) -> bool {
        let channel = channel.into();
        let mut guard = self.shared.core.lock().await;
        let core = &mut *guard;
        let link = core.session.connected_link().map(|a| a.link.as_ref());
        core.registry.unsubscribe(link, &channel)
    }

    /// `true` if connected; otherwise one dial attempt (no backoff) when the
    /// session is idle and knows its user.
    pub async fn ensure_connection(&self) -> bool {
        self.shared.ensure_connection().await
    }

    /// Start a fresh history load for the active channel.
    pub async fn reload_history(&self) -> HistoryLoad {
        self.shared.reload_history().await
    }

    /// Read a channel's stored history over REST, outside the message stream.
    pub async fn fetch_history(&self, channel: impl Into<ChannelId>) -> Result<Vec<ChatMessage>, ChatError> {
        self.shared.history.fetch(&channel.into()).await
    }

    pub async fn clear_messages(&self) {
        self.shared.core.lock().await.stream.clear();
    }

    /// Visible messages of the active channel.
    pub fn messages(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.shared.messages_rx.clone()
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub async fn active_channel(&self) -> ChannelId {
        self.shared.core.lock().await.session.channel.clone()
    }

    pub async fn active_subscriptions(&self) -> Vec<ChannelId> {
        self.shared.core.lock().await.registry.channels()
    }
}

impl Shared {
    fn routes(&self) -> &Routes {
        &self.config.routes
    }

    fn publish(&self, core: &Core) {
        self.status_tx.send_replace(core.session.status());
    }

    // ── connection lifecycle ────────────────────────────────────────────

    async fn connect(self: &Arc<Self>, username: &str) -> Result<(), ChatError> {
        let Some(credential) = self.credentials.token() else {
            warn!(username, "connect refused: no credential available");
            return Err(ChatError::CredentialMissing);
        };

        let ticket = {
            let mut core = self.core.lock().await;
            match core.session.state {
                ConnectionState::Connected => {
                    debug!(username, "already connected");
                    return Ok(());
                }
                ConnectionState::Connecting { .. } => return Err(ChatError::ConnectInProgress),
                ConnectionState::Disconnected | ConnectionState::Reconnecting { .. } => {}
            }
            core.session.cancel_retry();
            core.session.apply(SessionEvent::Dial);
            core.session.username = Some(username.to_string());
            core.session.reconnect_attempts = 0;
            core.session.exhausted = false;
            core.session.dial += 1;
            self.publish(&core);
            core.session.dial
        };

        self.dial(username.to_string(), credential, DialKind::Manual, ticket)
            .await
    }

    /// Dial with the lock released, then commit the outcome if the dial is still current.
    ///
    /// The caller has already moved the session to `Connecting` and issued `ticket`.
    async fn dial(
        self: &Arc<Self>,
        username: String,
        credential: String,
        kind: DialKind,
        ticket: u64,
    ) -> Result<(), ChatError> {
        let request = ConnectRequest {
            login: username.clone(),
            token: credential,
        };
        let result = self.connector.connect(request).await;

        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        let expected = ConnectionState::Connecting {
            attempt: kind.attempt(),
        };
        if core.session.dial != ticket || core.session.state != expected {
            debug!(username = %username, ?kind, "dial superseded; discarding result");
            if let Ok(established) = result {
                established.link.close();
            }
            return Err(ChatError::Aborted);
        }

        match result {
            Ok(established) => {
                let (channel, generation) = self.establish(core, &username, established);
                info!(username = %username, channel = %channel, "connected");
                drop(guard);
                self.history.spawn_remote(self.clone(), channel, generation);
                Ok(())
            }
            Err(e) => {
                warn!(username = %username, ?kind, error = %e, "dial failed");
                core.session.last_error = Some(e.to_string());
                core.session.apply(SessionEvent::DialFailed);
                if kind == DialKind::Manual {
                    self.start_reconnect(core);
                }
                self.publish(core);
                Err(e.into())
            }
        }
    }

    /// Commit a fresh link: subscriptions, socket history request, presence.
    /// Returns the channel and generation the remote history load is for.
    fn establish(
        self: &Arc<Self>,
        core: &mut Core,
        username: &str,
        established: Established,
    ) -> (ChannelId, u64) {
        let Established { link, events } = established;

        core.session.apply(SessionEvent::Established);
        core.session.epoch += 1;
        core.session.reconnect_attempts = 0;
        core.session.exhausted = false;
        core.session.last_error = None;
        core.session.retry = None;
        let epoch = core.session.epoch;

        core.registry.forget_all();
        core.socket_loads.clear();

        let queue = self.routes().history_queue(username);
        let history_queue = match link.subscribe(&queue) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(queue = %queue, error = %e, "history queue subscribe failed");
                None
            }
        };

        let channel = core.session.channel.clone();
        if let Err(e) = core.registry.subscribe(link.as_ref(), &channel) {
            warn!(channel = %channel, error = %e, "subscribe after connect failed");
        }
        let generation = core.stream.begin_reload();
        self.request_socket_history(
            link.as_ref(),
            username,
            &mut core.socket_loads,
            &channel,
            generation,
        );

        let join = ChatMessage::new(username, "", MessageType::Join, ChannelId::Public);
        if let Err(e) = self.send_on(link.as_ref(), &join) {
            warn!(username, error = %e, "presence announcement failed");
        }

        core.session.link = Some(ActiveLink {
            link,
            epoch,
            history_queue,
        });
        self.spawn_pump(epoch, events);
        self.publish(core);
        (channel, generation)
    }

    async fn disconnect(&self) {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        core.session.cancel_retry();

        if let Some(active) = core.session.link.take() {
            if active.link.is_open() {
                if let Some(username) = core.session.username.as_deref() {
                    let leave = ChatMessage::new(username, "", MessageType::Leave, ChannelId::Public);
                    if let Err(e) = self.send_on(active.link.as_ref(), &leave) {
                        debug!(error = %e, "leave announcement failed");
                    }
                }
                core.registry.release_all(active.link.as_ref());
                if let Some(queue) = active.history_queue {
                    let _ = active.link.unsubscribe(queue);
                }
                active.link.close();
            }
        }
        core.registry.forget_all();
        core.socket_loads.clear();

        let was = core.session.state;
        core.session.apply(SessionEvent::Disconnect);
        core.session.username = None;
        core.session.channel = ChannelId::Public;
        core.stream.activate(ChannelId::Public);
        self.publish(core);
        if was != ConnectionState::Disconnected {
            info!(from = was.label(), "disconnected");
        }
    }

    async fn ensure_connection(self: &Arc<Self>) -> bool {
        let Some(credential) = self.credentials.token() else {
            let core = self.core.lock().await;
            return core.session.state.is_connected();
        };
        let (username, ticket) = {
            let mut core = self.core.lock().await;
            match core.session.state {
                ConnectionState::Connected => return true,
                ConnectionState::Connecting { .. } | ConnectionState::Reconnecting { .. } => {
                    return false;
                }
                ConnectionState::Disconnected => {}
            }
            let Some(username) = core.session.username.clone() else {
                return false;
            };
            core.session.apply(SessionEvent::Dial);
            core.session.dial += 1;
            self.publish(&core);
            (username, core.session.dial)
        };

        self.dial(username, credential, DialKind::Probe, ticket)
            .await
            .is_ok()
    }

    /// `ensure_connection`, then wait out a dial or retry sequence already in flight.
    async fn await_connectivity(self: &Arc<Self>) -> bool {
        if self.ensure_connection().await {
            return true;
        }
        let mut status = self.status_tx.subscribe();
        loop {
            let state = status.borrow_and_update().state;
            match state {
                ConnectionState::Connected => return true,
                ConnectionState::Disconnected => return false,
                ConnectionState::Connecting { .. } | ConnectionState::Reconnecting { .. } => {}
            }
            if status.changed().await.is_err() {
                return false;
            }
        }
    }

    // ── reconnection ────────────────────────────────────────────────────

    /// Begin a retry sequence unless one is running or the session is not idle.
    fn start_reconnect(self: &Arc<Self>, core: &mut Core) -> bool {
        let session = &mut core.session;
        if session.state != ConnectionState::Disconnected || session.username.is_none() {
            return false;
        }
        if self.config.reconnect.max_attempts == 0 {
            session.exhausted = true;
            return false;
        }

        let token = CancellationToken::new();
        session.cancel_retry();
        session.retry = Some(token.clone());
        session.reconnect_attempts = 0;
        session.exhausted = false;
        session.apply(SessionEvent::ScheduleRetry { attempt: 1 });

        tokio::spawn(Arc::clone(self).run_reconnect(token));
        true
    }

    fn run_reconnect(self: Arc<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        async move {
            let policy = self.config.reconnect.clone();
            let mut attempt = 1;
            loop {
                let delay = policy.delay_for(attempt);
                info!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(attempt, "reconnect cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                let (username, credential, ticket) = {
                    let mut core = self.core.lock().await;
                    if cancel.is_cancelled() {
                        return;
                    }
                    let Some(username) = core.session.username.clone() else {
                        return;
                    };
                    let Some(credential) = self.credentials.token() else {
                        error!(username = %username, "giving up on reconnecting: no credential available");
                        core.session.apply(SessionEvent::GiveUp);
                        core.session.exhausted = true;
                        core.session.retry = None;
                        core.session.last_error = Some(ChatError::CredentialMissing.to_string());
                        self.publish(&core);
                        return;
                    };
                    if !core.session.apply(SessionEvent::Retry { attempt }) {
                        return;
                    }
                    core.session.reconnect_attempts = attempt;
                    core.session.dial += 1;
                    self.publish(&core);
                    (username, credential, core.session.dial)
                };

                match self
                    .dial(username, credential, DialKind::Retry(attempt), ticket)
                    .await
                {
                    Ok(()) => {
                        info!(attempt, "reconnected");
                        return;
                    }
                    Err(ChatError::Aborted) => return,
                    Err(_) => {}
                }

                let mut core = self.core.lock().await;
                if cancel.is_cancelled() {
                    return;
                }
                if attempt >= policy.max_attempts {
                    error!(attempts = attempt, "giving up on reconnecting");
                    core.session.apply(SessionEvent::GiveUp);
                    core.session.exhausted = true;
                    core.session.retry = None;
                    self.publish(&core);
                    return;
                }
                attempt += 1;
                core.session.apply(SessionEvent::ScheduleRetry { attempt });
                self.publish(&core);
            }
        }
        .boxed()
    }

    // ── inbound traffic ─────────────────────────────────────────────────

    fn spawn_pump(self: &Arc<Self>, epoch: u64, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        let weak: Weak<Shared> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if !shared.on_link_event(epoch, event).await {
                    break;
                }
            }
            trace!(epoch, "link pump finished");
        });
    }

    /// Returns `false` once the link is finished.
    async fn on_link_event(self: &Arc<Self>, epoch: u64, event: LinkEvent) -> bool {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        let Some(active) = core.session.link.as_ref().filter(|a| a.epoch == epoch) else {
            trace!(epoch, "event from a superseded link");
            return false;
        };

        match event {
            LinkEvent::Message {
                subscription,
                destination,
                body,
            } => {
                if active.history_queue == Some(subscription) {
                    match QueueAnswer::decode(&body) {
                        Ok(answer) => {
                            let (channel, generation) = core
                                .socket_loads
                                .claim(answer.channel.as_ref())
                                .unwrap_or_else(|| {
                                    let channel = answer
                                        .channel
                                        .clone()
                                        .unwrap_or_else(|| core.stream.active().clone());
                                    (channel, core.stream.generation())
                                });
                            let fate = core
                                .stream
                                .apply_snapshot(generation, answer.into_snapshot(channel.clone()));
                            debug!(channel = %channel, generation, ?fate, "socket history answer");
                        }
                        Err(e) => warn!(destination = %destination, error = %e, "undecodable history push"),
                    }
                } else if let Some(channel) = core.registry.channel_for(subscription).cloned() {
                    match serde_json::from_str::<ChatMessage>(&body) {
                        Ok(mut message) => {
                            message.channel = channel;
                            core.stream.push_live(message);
                        }
                        Err(e) => warn!(destination = %destination, error = %e, "undecodable push"),
                    }
                } else {
                    trace!(subscription = %subscription, destination = %destination, "push for a released subscription");
                }
                true
            }
            LinkEvent::Closed { reason } => {
                warn!(epoch, reason = reason.as_deref().unwrap_or("none"), "link lost");
                core.session.link = None;
                core.registry.forget_all();
                core.socket_loads.clear();
                core.session.last_error = reason;
                core.session.apply(SessionEvent::LinkLost);
                self.start_reconnect(core);
                self.publish(core);
                false
            }
        }
    }

    // ── outbound traffic ────────────────────────────────────────────────

    fn send_on(&self, link: &dyn Link, message: &ChatMessage) -> Result<(), TransportError> {
        let destination = self.routes().send_destination(message.kind, &message.channel);
        let body = serde_json::to_string(message).map_err(|e| TransportError::Encode(e.to_string()))?;
        trace!(destination = %destination, kind = %message.kind, "send");
        link.send(&destination, &body)
    }

    fn request_socket_history(
        &self,
        link: &dyn Link,
        username: &str,
        loads: &mut SocketLoads,
        channel: &ChannelId,
        generation: u64,
    ) {
        let Some(request) = self.history.history_request(username, channel) else {
            return;
        };
        match self.send_on(link, &request) {
            Ok(()) => loads.push(channel.clone(), generation),
            Err(e) => warn!(channel = %channel, error = %e, "socket history request failed"),
        }
    }

    async fn send_message(self: &Arc<Self>, message: ChatMessage) -> Result<(), ChatError> {
        let destination = self.routes().send_destination(message.kind, &message.channel);
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let Some(active) = core.session.connected_link() else {
            warn!(destination = %destination, state = core.session.state.label(), "send while disconnected");
            if !core.session.exhausted && self.start_reconnect(core) {
                self.publish(core);
            }
            return Err(ChatError::SendWhileDisconnected { destination });
        };
        self.send_on(active.link.as_ref(), &message)?;
        Ok(())
    }

    // ── channels ────────────────────────────────────────────────────────

    async fn subscribe(self: &Arc<Self>, channel: ChannelId) -> SubscribeOutcome {
        if self.try_subscribe(&channel, Intent::Subscribe).await {
            return SubscribeOutcome::Active;
        }
        info!(channel = %channel, "not connected; subscribe queued");
        let shared = Arc::clone(self);
        SubscribeOutcome::Queued(tokio::spawn(async move {
            if !shared.await_connectivity().await {
                warn!(channel = %channel, "queued subscribe dropped: connection not restored");
                return false;
            }
            shared.try_subscribe(&channel, Intent::Subscribe).await
        }))
    }

    /// Subscribe on the live link, loading history when `channel` is the active one.
    async fn try_subscribe(self: &Arc<Self>, channel: &ChannelId, intent: Intent) -> bool {
        let generation = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            let Some(active) = core.session.connected_link() else {
                return false;
            };
            if intent == Intent::Switch {
                if core.session.channel != *channel {
                    debug!(channel = %channel, "switched away before reconnecting");
                    return false;
                }
                if core.registry.contains(channel) {
                    return true;
                }
            }
            let link = active.link.as_ref();
            if let Err(e) = core.registry.subscribe(link, channel) {
                warn!(channel = %channel, error = %e, "subscribe failed");
                return false;
            }
            if channel != core.stream.active() {
                return true;
            }
            let generation = core.stream.begin_reload();
            if let Some(username) = core.session.username.as_deref() {
                self.request_socket_history(link, username, &mut core.socket_loads, channel, generation);
            }
            generation
        };
        self.history
            .spawn_remote(self.clone(), channel.clone(), generation);
        true
    }

    async fn switch_channel(self: &Arc<Self>, to: ChannelId) -> SubscribeOutcome {
        let (generation, connected) = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            let from = core.session.channel.clone();
            let link = core.session.connected_link().map(|a| a.link.as_ref());

            if from != to {
                core.registry.unsubscribe(link, &from);
            }
            let generation = core.stream.activate(to.clone());
            debug!(from = %from, to = %to, generation, "switching channel");

            let connected = match link {
                Some(link) => match core.registry.subscribe(link, &to) {
                    Ok(_) => {
                        if let Some(username) = core.session.username.as_deref() {
                            self.request_socket_history(link, username, &mut core.socket_loads, &to, generation);
                        }
                        true
                    }
                    Err(e) => {
                        warn!(channel = %to, error = %e, "subscribe failed");
                        false
                    }
                },
                None => false,
            };
            core.session.channel = to.clone();
            self.publish(core);
            (generation, connected)
        };

        self.history.spawn_remote(self.clone(), to.clone(), generation);
        if connected {
            return SubscribeOutcome::Active;
        }

        // The next link subscribes whatever channel is active by then.
        info!(channel = %to, "not connected; switch completes on reconnect");
        let shared = Arc::clone(self);
        SubscribeOutcome::Queued(tokio::spawn(async move {
            if !shared.await_connectivity().await {
                warn!(channel = %to, "switch not completed: connection not restored");
                return false;
            }
            shared.try_subscribe(&to, Intent::Switch).await
        }))
    }

    async fn reload_history(self: &Arc<Self>) -> HistoryLoad {
        let (channel, generation) = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            let channel = core.stream.active().clone();
            let generation = core.stream.begin_reload();
            if let Some(active) = core.session.connected_link() {
                if let Some(username) = core.session.username.as_deref() {
                    self.request_socket_history(
                        active.link.as_ref(),
                        username,
                        &mut core.socket_loads,
                        &channel,
                        generation,
                    );
                }
            }
            (channel, generation)
        };
        debug!(channel = %channel, generation, "reloading history");
        self.history.spawn_remote(self.clone(), channel, generation)
    }
}

#[async_trait]
impl SnapshotSink for Shared {
    async fn deliver_snapshot(&self, generation: u64, snapshot: HistorySnapshot) -> SnapshotFate {
        self.core.lock().await.stream.apply_snapshot(generation, snapshot)
    }
}
