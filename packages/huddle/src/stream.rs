//! The visible message sequence for the active channel.
//!
//! Live messages append; history snapshots replace. Every change is mirrored
//! into a per-channel cache and published on a `watch` channel.
//!
//! Snapshots carry the load generation they were requested under. Activating a
//! channel or reloading starts a new generation. Within a generation a snapshot
//! lands only if it is at least as long as the one already applied, so the two
//! redundant history paths settle on the more complete result whatever order
//! they finish in.

use std::collections::HashMap;

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::model::{ChannelId, ChatMessage, HistorySnapshot};

/// What happened to a delivered snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFate {
    Applied,
    /// Requested under an older generation.
    Stale,
    /// Targets a channel that is no longer active.
    OtherChannel,
    /// Shorter than the snapshot already applied in this generation.
    Smaller,
}

pub struct MessageStream {
    active: ChannelId,
    visible: Vec<ChatMessage>,
    cache: HashMap<ChannelId, Vec<ChatMessage>>,
    generation: u64,
    /// Length of the snapshot applied in the current generation.
    applied: Option<usize>,
    tx: watch::Sender<Vec<ChatMessage>>,
}

impl Default for MessageStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStream {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            active: ChannelId::Public,
            visible: Vec::new(),
            cache: HashMap::new(),
            generation: 0,
            applied: None,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.tx.subscribe()
    }

    pub fn active(&self) -> &ChannelId {
        &self.active
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn visible(&self) -> &[ChatMessage] {
        &self.visible
    }

    pub fn cached(&self, channel: &ChannelId) -> Option<&[ChatMessage]> {
        self.cache.get(channel).map(Vec::as_slice)
    }

    /// Make `channel` the active one. Renders from cache when possible and
    /// returns the generation a fresh history load should be tagged with.
    pub fn activate(&mut self, channel: ChannelId) -> u64 {
        self.visible = self.cache.get(&channel).cloned().unwrap_or_default();
        debug!(channel = %channel, cached = self.visible.len(), "channel activated");
        self.active = channel;
        self.publish();
        self.begin_reload()
    }

    /// Start a new load generation for the active channel.
    pub fn begin_reload(&mut self) -> u64 {
        self.generation += 1;
        self.applied = None;
        self.generation
    }

    /// Append a pushed message. Messages for other channels are dropped.
    pub fn push_live(&mut self, message: ChatMessage) -> bool {
        if message.channel != self.active {
            trace!(channel = %message.channel, active = %self.active, "dropping push for inactive channel");
            return false;
        }
        self.visible.push(message.presented());
        self.store();
        true
    }

    /// Replace the view with `snapshot` if it is still wanted.
    pub fn apply_snapshot(&mut self, generation: u64, snapshot: HistorySnapshot) -> SnapshotFate {
        let fate = if generation != self.generation {
            SnapshotFate::Stale
        } else if snapshot.channel != self.active {
            SnapshotFate::OtherChannel
        } else if self.applied.is_some_and(|len| snapshot.len() < len) {
            SnapshotFate::Smaller
        } else {
            SnapshotFate::Applied
        };

        if fate == SnapshotFate::Applied {
            self.applied = Some(snapshot.len());
            self.visible = snapshot.messages;
            self.store();
        }
        debug!(
            channel = %snapshot.channel,
            generation,
            len = self.visible.len(),
            fate = ?fate,
            "history snapshot"
        );
        fate
    }

    /// Empty the view and forget the active channel's cache.
    pub fn clear(&mut self) {
        self.visible.clear();
        self.cache.remove(&self.active);
        self.publish();
    }

    fn store(&mut self) {
        self.cache.insert(self.active.clone(), self.visible.clone());
        self.publish();
    }

    fn publish(&self) {
        self.tx.send_replace(self.visible.clone());
    }
}
