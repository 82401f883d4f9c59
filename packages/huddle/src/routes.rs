//! Broker destinations for sends, channel topics and the per-user history queue.
//!
//! Templates use `{channel}` for the channel identifier and `{user}` for the
//! username. Defaults match a Spring STOMP broker with `/app` and `/topic` prefixes.

use serde::{Deserialize, Serialize};

use crate::model::{ChannelId, MessageType};

const CHANNEL: &str = "{channel}";
const USER: &str = "{user}";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routes {
    /// CHAT messages, one destination per channel.
    #[serde(default = "default_send_chat")]
    pub send_chat: String,
    /// JOIN / LEAVE presence announcements.
    #[serde(default = "default_add_user")]
    pub add_user: String,
    /// Ask the server to push a history snapshot for a channel.
    #[serde(default = "default_history_request")]
    pub history_request: String,
    #[serde(default = "default_public_topic")]
    pub public_topic: String,
    #[serde(default = "default_group_topic")]
    pub group_topic: String,
    /// Queue the server answers history requests on.
    #[serde(default = "default_history_queue")]
    pub history_queue: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            send_chat: default_send_chat(),
            add_user: default_add_user(),
            history_request: default_history_request(),
            public_topic: default_public_topic(),
            group_topic: default_group_topic(),
            history_queue: default_history_queue(),
        }
    }
}

fn default_send_chat() -> String {
    "/app/chat.sendMessage/{channel}".to_string()
}
fn default_add_user() -> String {
    "/app/chat.addUser".to_string()
}
fn default_history_request() -> String {
    "/app/chat.history/{channel}".to_string()
}
fn default_public_topic() -> String {
    "/topic/public".to_string()
}
fn default_group_topic() -> String {
    "/topic/group/{channel}".to_string()
}
fn default_history_queue() -> String {
    "/user/queue/history".to_string()
}

impl Routes {
    /// Where a message of `kind` for `channel` is sent.
    ///
    /// CHAT goes to the channel's own destination, HISTORY to the channel's
    /// history request, every other control type to the shared presence destination.
    pub fn send_destination(&self, kind: MessageType, channel: &ChannelId) -> String {
        match kind {
            MessageType::Chat => fill(&self.send_chat, CHANNEL, channel.as_str()),
            MessageType::History => fill(&self.history_request, CHANNEL, channel.as_str()),
            MessageType::Join | MessageType::Leave => self.add_user.clone(),
        }
    }

    /// Push topic backing a channel.
    pub fn topic(&self, channel: &ChannelId) -> String {
        match channel {
            ChannelId::Public => self.public_topic.clone(),
            ChannelId::Group(id) => fill(&self.group_topic, CHANNEL, id),
        }
    }

    pub fn history_queue(&self, username: &str) -> String {
        fill(&self.history_queue, USER, username)
    }

    /// Channel addressed by a CHAT send destination.
    pub fn channel_for_chat_send(&self, destination: &str) -> Option<ChannelId> {
        extract(&self.send_chat, destination).map(ChannelId::new)
    }

    /// Channel addressed by a history request destination.
    pub fn channel_for_history_request(&self, destination: &str) -> Option<ChannelId> {
        extract(&self.history_request, destination).map(ChannelId::new)
    }
}

fn fill(template: &str, placeholder: &str, value: &str) -> String {
    template.replace(placeholder, value)
}

/// Match `value` against a template with a single `{channel}` placeholder.
fn extract(template: &str, value: &str) -> Option<String> {
    let (prefix, suffix) = template.split_once(CHANNEL)?;
    let id = value.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_goes_to_channel_destination() {
        let routes = Routes::default();
        assert_eq!(
            routes.send_destination(MessageType::Chat, &ChannelId::new("g1")),
            "/app/chat.sendMessage/g1"
        );
        assert_eq!(
            routes.send_destination(MessageType::Chat, &ChannelId::Public),
            "/app/chat.sendMessage/public"
        );
    }

    #[test]
    fn control_types_share_presence_destination() {
        let routes = Routes::default();
        for kind in [MessageType::Join, MessageType::Leave] {
            assert_eq!(
                routes.send_destination(kind, &ChannelId::new("g1")),
                "/app/chat.addUser"
            );
        }
        assert_eq!(
            routes.send_destination(MessageType::History, &ChannelId::new("g1")),
            "/app/chat.history/g1"
        );
    }

    #[test]
    fn channels_map_to_topics() {
        let routes = Routes::default();
        assert_eq!(routes.topic(&ChannelId::Public), "/topic/public");
        assert_eq!(routes.topic(&ChannelId::new("g1")), "/topic/group/g1");
    }

    #[test]
    fn send_destinations_resolve_back_to_channels() {
        let routes = Routes::default();
        assert_eq!(
            routes.channel_for_chat_send("/app/chat.sendMessage/public"),
            Some(ChannelId::Public)
        );
        assert_eq!(
            routes.channel_for_history_request("/app/chat.history/g2"),
            Some(ChannelId::new("g2"))
        );
        assert_eq!(routes.channel_for_chat_send("/app/chat.addUser"), None);
    }

    #[test]
    fn history_queue_supports_user_placeholder() {
        let routes = Routes {
            history_queue: "/queue/history.{user}".to_string(),
            ..Routes::default()
        };
        assert_eq!(routes.history_queue("alice"), "/queue/history.alice");
        assert_eq!(Routes::default().history_queue("alice"), "/user/queue/history");
    }
}
