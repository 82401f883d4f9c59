//! HTTP collaborator: stored history and group membership.
//!
//! Every request carries the current bearer token. Endpoints, relative to the
//! API base:
//!
//! - `GET /messages/public`
//! - `GET /groups/{id}/messages`
//! - `GET /groups/{id}` (members under `members` or `memberIds`)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::credentials::CredentialSource;
use crate::error::HistoryError;
use crate::history::{GroupDirectory, HistorySource};
use crate::model::{ChannelId, ChatMessage};

#[derive(Clone)]
pub struct RestApi {
    http: reqwest::Client,
    base: String,
    credentials: Arc<dyn CredentialSource>,
}

impl RestApi {
    pub fn new(
        base: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> Result<Self, HistoryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HistoryError::from_reqwest)?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn history_url(&self, channel: &ChannelId) -> String {
        match channel {
            ChannelId::Public => format!("{}/messages/public", self.base),
            ChannelId::Group(id) => format!("{}/groups/{}/messages", self.base, id),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, HistoryError> {
        debug!(url = %url, "GET");
        let mut request = self.http.get(url);
        if let Some(token) = self.credentials.token() {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await.map_err(HistoryError::from_reqwest)?;
        let resp = resp.error_for_status().map_err(HistoryError::from_reqwest)?;
        resp.json().await.map_err(HistoryError::from_reqwest)
    }
}

#[async_trait]
impl HistorySource for RestApi {
    async fn fetch_history(&self, channel: &ChannelId) -> Result<Vec<ChatMessage>, HistoryError> {
        let mut messages: Vec<ChatMessage> = self.get(&self.history_url(channel)).await?;
        // The server omits chatId on some stored rows.
        for message in &mut messages {
            message.channel = channel.clone();
        }
        Ok(messages)
    }
}

#[async_trait]
impl GroupDirectory for RestApi {
    async fn refresh_members(&self, group_id: &str) -> Result<Vec<String>, HistoryError> {
        let group: serde_json::Value = self
            .get(&format!("{}/groups/{}", self.base, group_id))
            .await?;
        members_of(&group)
    }
}

/// Member identifiers of a group payload.
///
/// Entries may be plain strings, numbers, or objects with `username` or `id`.
fn members_of(group: &serde_json::Value) -> Result<Vec<String>, HistoryError> {
    let list = group
        .get("members")
        .or_else(|| group.get("memberIds"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| HistoryError::Decode("group has no member list".to_string()))?;

    Ok(list
        .iter()
        .filter_map(|entry| match entry {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Object(obj) => obj
                .get("username")
                .or_else(|| obj.get("id"))
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            _ => None,
        })
        .collect())
}
