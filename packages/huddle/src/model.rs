//! Chat domain types shared by every layer of the client.
//!
//! JSON shapes follow the broker: `{ "sender", "content", "type", "chatId", "timestamp" }`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Identifier of the public channel.
pub const PUBLIC_CHANNEL: &str = "public";

/// A chat scope: the public channel or a group channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChannelId {
    #[default]
    Public,
    Group(String),
}

impl ChannelId {
    /// Build a channel id from a raw identifier. `"public"` maps to the public channel.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        if id == PUBLIC_CHANNEL {
            ChannelId::Public
        } else {
            ChannelId::Group(id)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChannelId::Public => PUBLIC_CHANNEL,
            ChannelId::Group(id) => id,
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, ChannelId::Public)
    }

    /// The group identifier, if this is a group channel.
    pub fn group_id(&self) -> Option<&str> {
        match self {
            ChannelId::Public => None,
            ChannelId::Group(id) => Some(id),
        }
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        ChannelId::new(id)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        ChannelId::new(id)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        match id {
            ChannelId::Public => PUBLIC_CHANNEL.to_string(),
            ChannelId::Group(id) => id,
        }
    }
}

impl FromStr for ChannelId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ChannelId::new(s))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a chat message. Everything but `Chat` is a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Chat,
    Join,
    Leave,
    History,
}

impl MessageType {
    pub fn is_control(&self) -> bool {
        !matches!(self, MessageType::Chat)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Chat => "CHAT",
            MessageType::Join => "JOIN",
            MessageType::Leave => "LEAVE",
            MessageType::History => "HISTORY",
        };
        f.write_str(s)
    }
}

/// A single chat message as carried by the broker and the REST history source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(rename = "chatId", default)]
    pub channel: ChannelId,
    #[serde(default = "Utc::now", deserialize_with = "flexible_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// New message stamped with the current time.
    pub fn new(
        sender: impl Into<String>,
        content: impl Into<String>,
        kind: MessageType,
        channel: ChannelId,
    ) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            kind,
            channel,
            timestamp: Utc::now(),
        }
    }

    pub fn chat(sender: impl Into<String>, content: impl Into<String>, channel: ChannelId) -> Self {
        Self::new(sender, content, MessageType::Chat, channel)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Copy of this message with the display text a reader sees.
    ///
    /// JOIN and LEAVE carry no text on the wire; the text is derived from the sender.
    pub fn presented(&self) -> ChatMessage {
        let content = match self.kind {
            MessageType::Join => format!("{} joined!", self.sender),
            MessageType::Leave => format!("{} left!", self.sender),
            MessageType::Chat | MessageType::History => return self.clone(),
        };
        ChatMessage {
            content,
            ..self.clone()
        }
    }
}

/// An authoritative, ordered message list for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySnapshot {
    pub channel: ChannelId,
    pub messages: Vec<ChatMessage>,
}

impl HistorySnapshot {
    pub fn new(channel: ChannelId, messages: Vec<ChatMessage>) -> Self {
        Self { channel, messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A history push from the per-user queue, before it is matched to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueAnswer {
    /// The channel the answer names, if it names one.
    pub channel: Option<ChannelId>,
    pub messages: Vec<ChatMessage>,
}

impl QueueAnswer {
    /// Decode either `{ "chatId": .., "messages": [..] }` or a bare array.
    ///
    /// A bare array names its channel only when its first row carries `chatId`.
    pub fn decode(body: &str) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Payload {
            Bare(Vec<serde_json::Value>),
            Envelope {
                #[serde(rename = "chatId")]
                channel: ChannelId,
                #[serde(default)]
                messages: Vec<ChatMessage>,
            },
        }

        match serde_json::from_str::<Payload>(body)? {
            Payload::Bare(rows) => {
                let channel = match rows.first().and_then(|row| row.get("chatId")) {
                    Some(serde_json::Value::String(id)) => Some(ChannelId::new(id.as_str())),
                    _ => None,
                };
                let messages = rows
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<ChatMessage>, _>>()?;
                Ok(Self { channel, messages })
            }
            Payload::Envelope { channel, messages } => Ok(Self {
                channel: Some(channel),
                messages,
            }),
        }
    }

    /// Snapshot for `channel`. Rows stored without `chatId` are stamped with it.
    pub fn into_snapshot(self, channel: ChannelId) -> HistorySnapshot {
        let messages = self
            .messages
            .into_iter()
            .map(|mut m| {
                m.channel = channel.clone();
                m
            })
            .collect();
        HistorySnapshot { channel, messages }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accepts RFC 3339, zone-less ISO local times (read as UTC), or epoch milliseconds.
fn flexible_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    let raw = Option::<Raw>::deserialize(deserializer)?;
    match raw {
        None => Ok(Utc::now()),
        Some(Raw::Millis(ms)) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}"))),
        Some(Raw::Text(text)) => parse_timestamp(&text).map_err(serde::de::Error::custom),
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp {text:?}: {e}"))
}
