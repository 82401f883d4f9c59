//! End-to-end behaviour of `ChatClient` against the in-process broker.
//!
//! Tests run on a paused clock, so backoff timers elapse instantly and the
//! recorded connection times are exact.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};

use huddle::{
    ChannelId, ChatClient, ChatError, ChatMessage, ClientConfig, ConnectionState, GroupDirectory,
    HistoryError, HistorySource, MemoryBroker, MessageType, Routes, SessionStatus,
    StaticCredentials, SubscribeOutcome,
};

// ── helpers ─────────────────────────────────────────────────────────────

fn config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.history.rest = false;
    config
}

fn token() -> Arc<StaticCredentials> {
    Arc::new(StaticCredentials::new(Some("t0k".into()), "1"))
}

fn client_with(broker: &MemoryBroker, config: ClientConfig) -> ChatClient {
    ChatClient::new(config, Arc::new(broker.clone()), token())
}

fn client(broker: &MemoryBroker) -> ChatClient {
    client_with(broker, config())
}

async fn wait_until<T: Clone>(rx: &mut watch::Receiver<T>, mut pred: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let value = rx.borrow_and_update().clone();
            if pred(&value) {
                return value;
            }
            rx.changed().await.expect("sender dropped");
        }
    })
    .await
    .expect("condition never held")
}

async fn messages_until(
    client: &ChatClient,
    pred: impl FnMut(&Vec<ChatMessage>) -> bool,
) -> Vec<ChatMessage> {
    wait_until(&mut client.messages(), pred).await
}

async fn status_until(client: &ChatClient, pred: impl FnMut(&SessionStatus) -> bool) -> SessionStatus {
    wait_until(&mut client.status(), pred).await
}

/// Let spawned tasks drain their queues.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn history(sender: &str, channel: &ChannelId, n: usize) -> Vec<ChatMessage> {
    (0..n)
        .map(|i| ChatMessage::chat(sender, format!("{sender}-{i}"), channel.clone()))
        .collect()
}

/// REST source that blocks until opened.
struct GatedSource {
    gate: Notify,
    messages: usize,
}

#[async_trait]
impl HistorySource for GatedSource {
    async fn fetch_history(&self, channel: &ChannelId) -> Result<Vec<ChatMessage>, HistoryError> {
        self.gate.notified().await;
        Ok(history("rest", channel, self.messages))
    }
}

struct FixedSource(usize);

#[async_trait]
impl HistorySource for FixedSource {
    async fn fetch_history(&self, channel: &ChannelId) -> Result<Vec<ChatMessage>, HistoryError> {
        Ok(history("rest", channel, self.0))
    }
}

#[derive(Default)]
struct RecordingGroups(Mutex<Vec<String>>);

#[async_trait]
impl GroupDirectory for RecordingGroups {
    async fn refresh_members(&self, group_id: &str) -> Result<Vec<String>, HistoryError> {
        self.0.lock().push(group_id.to_string());
        Ok(vec!["alice".into(), "bob".into()])
    }
}

// ── connect / disconnect ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn connect_subscribes_public_and_announces_join() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);

    client.connect("alice").await.unwrap();

    let status = client.status().borrow().clone();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.username.as_deref(), Some("alice"));
    assert_eq!(client.active_subscriptions().await, vec![ChannelId::Public]);
    assert_eq!(
        broker.subscribed_topics(),
        vec!["/topic/public".to_string(), "/user/queue/history".to_string()]
    );

    let messages = messages_until(&client, |m| !m.is_empty()).await;
    let last = messages.last().unwrap();
    assert_eq!(last.kind, MessageType::Join);
    assert_eq!(last.content, "alice joined!");
    assert_eq!(last.channel, ChannelId::Public);
}

#[tokio::test(start_paused = true)]
async fn connect_without_token_is_rejected_without_retry() {
    let broker = MemoryBroker::new(Routes::default());
    let client = ChatClient::new(
        config(),
        Arc::new(broker.clone()),
        Arc::new(StaticCredentials::anonymous()),
    );

    let err = client.connect("alice").await.unwrap_err();
    assert!(matches!(err, ChatError::CredentialMissing));

    tokio::time::sleep(Duration::from_secs(120)).await;
    let status = client.status().borrow().clone();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.username, None);
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_does_not_redial() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);
    client.connect("alice").await.unwrap();
    client.connect("alice").await.unwrap();
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.open_links(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent_and_announces_leave() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);
    client.connect("alice").await.unwrap();
    settle().await;

    client.disconnect().await;
    let first = client.status().borrow().clone();
    client.disconnect().await;
    let second = client.status().borrow().clone();

    assert_eq!(first, second);
    assert_eq!(second.state, ConnectionState::Disconnected);
    assert_eq!(second.username, None);
    assert!(client.active_subscriptions().await.is_empty());
    assert_eq!(broker.open_links(), 0);

    let leaves: Vec<_> = broker
        .sent()
        .into_iter()
        .filter(|f| f.body.contains("\"LEAVE\""))
        .collect();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].destination, "/app/chat.addUser");
    assert_eq!(leaves[0].login, "alice");

    // A manual disconnect never re-enters the retry loop.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(broker.connect_attempts(), 1);
}

// ── messages ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn chat_message_round_trips_into_the_stream() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);
    client.connect("alice").await.unwrap();

    client
        .send_message("alice", "hi", MessageType::Chat, ChannelId::Public)
        .await
        .unwrap();

    let messages = messages_until(&client, |m| m.last().is_some_and(|m| m.content == "hi")).await;
    let last = messages.last().unwrap();
    assert_eq!(last.kind, MessageType::Chat);
    assert_eq!(last.channel, ChannelId::Public);
    assert_eq!(last.sender, "alice");

    let sent = broker.sent();
    assert!(sent.iter().any(|f| f.destination == "/app/chat.sendMessage/public"));
}

#[tokio::test(start_paused = true)]
async fn send_while_disconnected_reports_destination() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);

    let err = client
        .send_message("alice", "hi", MessageType::Chat, ChannelId::new("g1"))
        .await
        .unwrap_err();
    match err {
        ChatError::SendWhileDisconnected { destination } => {
            assert_eq!(destination, "/app/chat.sendMessage/g1");
        }
        other => panic!("unexpected error {other:?}"),
    }
    // Never connected: nobody to reconnect as.
    settle().await;
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn send_after_link_loss_fails_and_session_heals() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);
    client.connect("alice").await.unwrap();

    broker.drop_links("network down");
    status_until(&client, |s| matches!(s.state, ConnectionState::Reconnecting { .. })).await;

    let err = client.send_chat("lost").await.unwrap_err();
    assert!(matches!(err, ChatError::SendWhileDisconnected { .. }));

    status_until(&client, |s| s.state.is_connected()).await;
    assert_eq!(broker.connect_attempts(), 2);
}

// ── reconnection ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn backoff_grows_and_gives_up_after_max_attempts() {
    let broker = MemoryBroker::new(Routes::default());
    broker.refuse_connections(true);
    let client = client(&broker);

    let err = client.connect("alice").await.unwrap_err();
    assert!(matches!(err, ChatError::Transport(_)));

    let status = status_until(&client, |s| s.exhausted).await;
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.reconnect_attempts, 5);
    assert!(status.last_error.is_some());

    // The initial dial plus five retries.
    let times = broker.connect_attempt_times();
    assert_eq!(times.len(), 6);
    let gaps: Vec<u64> = times
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect();
    assert!(gaps.windows(2).all(|w| w[0] < w[1]), "gaps {gaps:?}");
    for (gap, expected) in gaps.iter().zip([2000u64, 3000, 4500, 6750, 10125]) {
        assert!(gap.abs_diff(expected) <= 5, "gap {gap} vs {expected}");
    }

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(broker.connect_attempts(), 6);
}

#[tokio::test(start_paused = true)]
async fn link_loss_reconnects_and_resubscribes() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);
    client.connect("alice").await.unwrap();
    assert_eq!(broker.drop_links("network down"), 1);

    let status = status_until(&client, |s| !s.state.is_connected()).await;
    assert_eq!(status.last_error.as_deref(), Some("network down"));
    status_until(&client, |s| s.state.is_connected()).await;

    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(client.active_subscriptions().await, vec![ChannelId::Public]);
    let public: Vec<_> = broker
        .subscribed_topics()
        .into_iter()
        .filter(|t| t == "/topic/public")
        .collect();
    assert_eq!(public.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_connect_cancels_pending_retry() {
    let broker = MemoryBroker::new(Routes::default());
    broker.refuse_connections(true);
    let client = client(&broker);
    assert!(client.connect("alice").await.is_err());
    assert!(client.status().borrow().state.retry_in_flight());

    broker.refuse_connections(false);
    client.connect("alice").await.unwrap();
    assert_eq!(broker.connect_attempts(), 2);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(broker.connect_attempts(), 2);
    assert!(client.status().borrow().state.is_connected());
}

#[tokio::test(start_paused = true)]
async fn queued_subscribe_runs_after_connectivity_returns() {
    let broker = MemoryBroker::new(Routes::default());
    broker.refuse_connections(true);
    let mut config = config();
    config.reconnect.max_attempts = 2;
    let client = client_with(&broker, config);

    assert!(client.connect("alice").await.is_err());
    status_until(&client, |s| s.exhausted).await;
    assert!(!client.ensure_connection().await);

    broker.refuse_connections(false);
    let outcome = client.subscribe("g1").await;
    assert!(outcome.settled().await);

    assert!(client.status().borrow().state.is_connected());
    assert_eq!(
        client.active_subscriptions().await,
        vec![ChannelId::new("g1"), ChannelId::Public]
    );
}

#[tokio::test(start_paused = true)]
async fn switches_made_while_reconnecting_leave_only_the_last_channel() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);
    client.connect("alice").await.unwrap();

    broker.refuse_connections(true);
    broker.drop_links("network down");
    status_until(&client, |s| s.state.retry_in_flight()).await;

    let to_g1 = client.switch_channel("g1").await;
    let to_g2 = client.switch_channel("g2").await;
    assert!(matches!(to_g1, SubscribeOutcome::Queued(_)));
    assert!(matches!(to_g2, SubscribeOutcome::Queued(_)));

    broker.refuse_connections(false);
    assert!(to_g2.settled().await);
    assert!(!to_g1.settled().await);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(client.status().borrow().state.is_connected());
    assert_eq!(client.active_channel().await, ChannelId::new("g2"));
    assert_eq!(client.active_subscriptions().await, vec![ChannelId::new("g2")]);
    assert!(!broker.subscribed_topics().iter().any(|t| t == "/topic/group/g1"));
}

// ── subscriptions ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn repeated_subscribe_keeps_one_live_subscription() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);
    client.connect("alice").await.unwrap();

    for _ in 0..3 {
        assert!(client.subscribe(ChannelId::Public).await.settled().await);
    }
    let public = broker
        .subscribed_topics()
        .into_iter()
        .filter(|t| t == "/topic/public")
        .count();
    assert_eq!(public, 1);
    settle().await;

    broker.publish("/topic/public", &ChatMessage::chat("bob", "once", ChannelId::Public));
    settle().await;
    let seen = client
        .messages()
        .borrow()
        .iter()
        .filter(|m| m.content == "once")
        .count();
    assert_eq!(seen, 1);
}

#[tokio::test(start_paused = true)]
async fn push_for_abandoned_channel_never_reaches_the_new_one() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);
    client.connect("alice").await.unwrap();
    client.switch_channel("a").await;
    settle().await;

    broker.publish("/topic/group/a", &ChatMessage::chat("bob", "for a", ChannelId::new("a")));
    client.switch_channel("b").await;
    broker.publish("/topic/group/b", &ChatMessage::chat("bob", "for b", ChannelId::new("b")));

    let messages = messages_until(&client, |m| m.iter().any(|m| m.content == "for b")).await;
    assert!(messages.iter().all(|m| m.content != "for a"));
    assert!(messages.iter().all(|m| m.channel == ChannelId::new("b")));
    assert_eq!(client.active_subscriptions().await, vec![ChannelId::new("b")]);
    assert_eq!(broker.subscribed_topics(), vec!["/topic/group/b", "/user/queue/history"]);
}

#[tokio::test(start_paused = true)]
async fn switching_back_renders_cached_view() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);
    client.connect("alice").await.unwrap();
    messages_until(&client, |m| m.iter().any(|m| m.content == "alice joined!")).await;

    client.switch_channel("g1").await;
    client.switch_channel(ChannelId::Public).await;

    // Rendered from cache before any reload answers.
    let now = client.messages().borrow().clone();
    assert!(now.iter().any(|m| m.content == "alice joined!"));
    assert_eq!(client.active_channel().await, ChannelId::Public);
}

// ── history ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn later_larger_rest_snapshot_replaces_socket_snapshot() {
    let broker = MemoryBroker::new(Routes::default());
    broker.seed_history(ChannelId::Public, history("sock", &ChannelId::Public, 3));
    let source = Arc::new(GatedSource {
        gate: Notify::new(),
        messages: 10,
    });
    let mut config = config();
    config.history.rest = true;
    let client = ChatClient::builder(config, Arc::new(broker.clone()), token())
        .history_source(source.clone())
        .build();

    client.connect("alice").await.unwrap();
    // Socket snapshot of 3 plus the live JOIN.
    messages_until(&client, |m| m.len() == 4).await;

    source.gate.notify_one();
    let messages = messages_until(&client, |m| m.len() == 10).await;
    assert!(messages.iter().all(|m| m.sender == "rest"));

    settle().await;
    assert_eq!(client.messages().borrow().len(), 10);
}

#[tokio::test(start_paused = true)]
async fn smaller_rest_snapshot_never_shrinks_the_view() {
    let broker = MemoryBroker::new(Routes::default());
    let mut config = config();
    config.history.rest = true;
    let client = ChatClient::builder(config, Arc::new(broker.clone()), token())
        .history_source(Arc::new(FixedSource(3)))
        .build();
    client.connect("alice").await.unwrap();
    settle().await;

    broker.seed_history(ChannelId::Public, history("sock", &ChannelId::Public, 10));
    client.reload_history().await.finish().await;
    settle().await;

    let messages = client.messages().borrow().clone();
    assert_eq!(messages.len(), 10);
    assert!(messages.iter().all(|m| m.sender == "sock"));
}

#[tokio::test(start_paused = true)]
async fn group_switch_loads_history_and_refreshes_members() {
    let broker = MemoryBroker::new(Routes::default());
    let groups = Arc::new(RecordingGroups::default());
    let mut config = config();
    config.history.rest = true;
    let client = ChatClient::builder(config, Arc::new(broker.clone()), token())
        .history_source(Arc::new(FixedSource(2)))
        .group_directory(groups.clone())
        .build();
    client.connect("alice").await.unwrap();

    client.switch_channel("g7").await;
    let messages = messages_until(&client, |m| m.len() == 2).await;
    assert!(messages.iter().all(|m| m.channel == ChannelId::new("g7")));

    settle().await;
    assert_eq!(*groups.0.lock(), vec!["g7".to_string()]);
    assert!(
        broker
            .sent()
            .iter()
            .any(|f| f.destination == "/app/chat.history/g7")
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_history_request_does_not_misroute_later_answers() {
    let broker = MemoryBroker::new(Routes::default());
    broker.leave_history_unanswered(ChannelId::Public);
    broker.leave_history_unanswered(ChannelId::new("g1"));
    let client = client(&broker);
    client.connect("alice").await.unwrap();
    client.switch_channel("g1").await;
    settle().await;

    let g1 = ChannelId::new("g1");
    let answer = serde_json::json!({ "chatId": "g1", "messages": history("bob", &g1, 2) });
    let queue = Routes::default().history_queue("alice");
    assert_eq!(broker.publish_raw(&queue, &answer.to_string()), 1);

    let visible = messages_until(&client, |m| m.len() == 2).await;
    assert!(visible.iter().all(|m| m.channel == g1));
}

#[tokio::test(start_paused = true)]
async fn bare_group_answer_without_chat_id_lands_on_the_group() {
    let broker = MemoryBroker::new(Routes::default());
    broker.leave_history_unanswered(ChannelId::new("g1"));
    let client = client(&broker);
    client.connect("alice").await.unwrap();
    settle().await;
    client.switch_channel("g1").await;
    settle().await;

    let rows = r#"[{"sender":"bob","content":"one","type":"CHAT"},{"sender":"bob","content":"two","type":"CHAT"}]"#;
    let queue = Routes::default().history_queue("alice");
    broker.publish_raw(&queue, rows);

    let visible = messages_until(&client, |m| m.len() == 2).await;
    assert_eq!(visible[1].content, "two");
    assert!(visible.iter().all(|m| m.channel == ChannelId::new("g1")));
}

#[tokio::test(start_paused = true)]
async fn clear_messages_empties_the_view() {
    let broker = MemoryBroker::new(Routes::default());
    let client = client(&broker);
    client.connect("alice").await.unwrap();
    messages_until(&client, |m| !m.is_empty()).await;

    client.clear_messages().await;
    assert!(client.messages().borrow().is_empty());
}
