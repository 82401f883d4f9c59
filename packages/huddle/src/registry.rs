//! Channel → live subscription bookkeeping.
//!
//! At most one subscription exists per channel. Subscribing again releases the
//! previous handle first, so repeated subscribes never stack.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::model::ChannelId;
use crate::routes::Routes;
use crate::transport::{Link, SubscriptionId};

#[derive(Debug, Clone)]
struct Entry {
    id: SubscriptionId,
    topic: String,
}

pub struct SubscriptionRegistry {
    routes: Routes,
    entries: HashMap<ChannelId, Entry>,
}

impl SubscriptionRegistry {
    pub fn new(routes: Routes) -> Self {
        Self {
            routes,
            entries: HashMap::new(),
        }
    }

    /// Subscribe `channel` on `link`, replacing any subscription it already had.
    pub fn subscribe(
        &mut self,
        link: &dyn Link,
        channel: &ChannelId,
    ) -> Result<SubscriptionId, TransportError> {
        if let Some(old) = self.entries.remove(channel) {
            if let Err(e) = link.unsubscribe(old.id) {
                debug!(channel = %channel, error = %e, "releasing previous subscription failed");
            }
        }
        let topic = self.routes.topic(channel);
        let id = link.subscribe(&topic)?;
        debug!(channel = %channel, topic = %topic, subscription = %id, "subscribed");
        self.entries.insert(channel.clone(), Entry { id, topic });
        Ok(id)
    }

    /// Drop the subscription for `channel`. Returns whether one existed.
    ///
    /// With no link the entry is only forgotten. Unknown channels are a no-op.
    pub fn unsubscribe(&mut self, link: Option<&dyn Link>, channel: &ChannelId) -> bool {
        let Some(entry) = self.entries.remove(channel) else {
            return false;
        };
        if let Some(link) = link {
            if let Err(e) = link.unsubscribe(entry.id) {
                warn!(channel = %channel, topic = %entry.topic, error = %e, "unsubscribe failed");
            }
        }
        debug!(channel = %channel, subscription = %entry.id, "unsubscribed");
        true
    }

    /// Unsubscribe every channel on `link` and empty the registry.
    pub fn release_all(&mut self, link: &dyn Link) {
        for (channel, entry) in self.entries.drain() {
            if let Err(e) = link.unsubscribe(entry.id) {
                debug!(channel = %channel, error = %e, "unsubscribe during release failed");
            }
        }
    }

    /// Forget every handle without touching the link, for a link that is already gone.
    pub fn forget_all(&mut self) {
        self.entries.clear();
    }

    /// Channel a live subscription belongs to. `None` for released or unknown handles.
    pub fn channel_for(&self, id: SubscriptionId) -> Option<&ChannelId> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.id == id)
            .map(|(channel, _)| channel)
    }

    pub fn contains(&self, channel: &ChannelId) -> bool {
        self.entries.contains_key(channel)
    }

    /// Subscribed channels, sorted by identifier.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self.entries.keys().cloned().collect();
        channels.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        channels
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
