//! Dual-path history loading.
//!
//! A load asks the broker to push a snapshot on the per-user history queue and,
//! independently, reads the same history over REST. Both results go to one
//! [`SnapshotSink`] tagged with the load generation; the sink decides which one
//! sticks. Group channels also refresh the group's member list.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HistoryConfig;
use crate::error::{ChatError, HistoryError};
use crate::model::{ChannelId, ChatMessage, HistorySnapshot, MessageType};
use crate::stream::SnapshotFate;

/// Reads stored history for a channel.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_history(&self, channel: &ChannelId) -> Result<Vec<ChatMessage>, HistoryError>;
}

/// Group membership lookups.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Current member identifiers of a group.
    async fn refresh_members(&self, group_id: &str) -> Result<Vec<String>, HistoryError>;
}

/// Receives snapshots produced by a load.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn deliver_snapshot(&self, generation: u64, snapshot: HistorySnapshot) -> SnapshotFate;
}

/// Background tasks of one remote load. Dropping it detaches the tasks.
#[derive(Debug, Default)]
pub struct HistoryLoad {
    pub rest: Option<JoinHandle<Option<SnapshotFate>>>,
    pub members: Option<JoinHandle<Option<Vec<String>>>>,
}

impl HistoryLoad {
    /// Wait for both tasks. Returns the REST snapshot fate and the member list, when they succeeded.
    pub async fn finish(self) -> (Option<SnapshotFate>, Option<Vec<String>>) {
        let rest = match self.rest {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        };
        let members = match self.members {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        };
        (rest, members)
    }
}

#[derive(Clone, Default)]
pub struct HistoryFetcher {
    socket: bool,
    rest: Option<Arc<dyn HistorySource>>,
    groups: Option<Arc<dyn GroupDirectory>>,
}

impl HistoryFetcher {
    pub fn new(
        config: &HistoryConfig,
        rest: Option<Arc<dyn HistorySource>>,
        groups: Option<Arc<dyn GroupDirectory>>,
    ) -> Self {
        Self {
            socket: config.socket,
            rest: rest.filter(|_| config.rest),
            groups,
        }
    }

    /// Control message asking the broker for a channel's history, if the socket path is on.
    pub fn history_request(&self, username: &str, channel: &ChannelId) -> Option<ChatMessage> {
        self.socket
            .then(|| ChatMessage::new(username, "", MessageType::History, channel.clone()))
    }

    /// Start the REST read and, for groups, the member refresh.
    ///
    /// The tasks are independent: a failure in one is logged and never cancels the other.
    pub fn spawn_remote(
        &self,
        sink: Arc<dyn SnapshotSink>,
        channel: ChannelId,
        generation: u64,
    ) -> HistoryLoad {
        let rest = self.rest.clone().map(|source| {
            let channel = channel.clone();
            tokio::spawn(async move {
                match source.fetch_history(&channel).await {
                    Ok(messages) => {
                        debug!(channel = %channel, count = messages.len(), "rest history loaded");
                        let snapshot = HistorySnapshot::new(channel, messages);
                        Some(sink.deliver_snapshot(generation, snapshot).await)
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "rest history fetch failed");
                        None
                    }
                }
            })
        });

        let members = match (channel.group_id(), self.groups.clone()) {
            (Some(group_id), Some(groups)) => {
                let group_id = group_id.to_string();
                Some(tokio::spawn(async move {
                    match groups.refresh_members(&group_id).await {
                        Ok(members) => {
                            info!(group = %group_id, members = members.len(), "group members refreshed");
                            Some(members)
                        }
                        Err(e) => {
                            warn!(group = %group_id, error = %e, "group member refresh failed");
                            None
                        }
                    }
                }))
            }
            _ => None,
        };

        HistoryLoad { rest, members }
    }

    /// One-shot REST read, outside any load generation.
    pub async fn fetch(&self, channel: &ChannelId) -> Result<Vec<ChatMessage>, ChatError> {
        let Some(source) = &self.rest else {
            return Ok(Vec::new());
        };
        source
            .fetch_history(channel)
            .await
            .map_err(|source| ChatError::History {
                channel: channel.clone(),
                source,
            })
    }
}
