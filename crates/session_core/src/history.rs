use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header::COOKIE, Client};
use shared::{
    domain::{ChannelId, ChatMessage},
    protocol::HistoryRecord,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::HistoryError;

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Backlog for `channel_id`, ascending by server order.
    async fn fetch_history(&self, channel_id: ChannelId) -> Result<Vec<ChatMessage>, HistoryError>;
}

pub struct MissingHistorySource;

#[async_trait]
impl HistorySource for MissingHistorySource {
    async fn fetch_history(
        &self,
        _channel_id: ChannelId,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        Err(HistoryError::Missing)
    }
}

pub struct HttpHistorySource {
    http: Client,
    server_url: String,
    auth_token: Option<String>,
}

impl HttpHistorySource {
    pub fn new(
        server_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            auth_token,
        })
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch_history(&self, channel_id: ChannelId) -> Result<Vec<ChatMessage>, HistoryError> {
        let mut request = self
            .http
            .get(format!("{}/channels/{}/messages", self.server_url, channel_id.0));
        if let Some(token) = &self.auth_token {
            request = request.header(COOKIE, format!("token={token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HistoryError::Status(status));
        }
        let records: Vec<HistoryRecord> = response.json().await?;
        Ok(records_into_messages(channel_id, records))
    }
}

fn records_into_messages(channel_id: ChannelId, records: Vec<HistoryRecord>) -> Vec<ChatMessage> {
    records
        .into_iter()
        .filter_map(|record| {
            if record.channel_id != channel_id {
                warn!(
                    channel_id = channel_id.0,
                    record_channel_id = record.channel_id.0,
                    message_id = record.id.0,
                    "history: skipping record from another channel"
                );
                return None;
            }
            match ChatMessage::try_from(record) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(channel_id = channel_id.0, error = %err, "history: skipping record");
                    None
                }
            }
        })
        .collect()
}

/// One in-flight history fetch. Dropping it cancels the fetch; a cancelled
/// fetch never reaches its completion callback.
pub struct HistoryLoad {
    channel_id: ChannelId,
    task: JoinHandle<()>,
}

impl HistoryLoad {
    pub fn spawn<F, Fut>(source: Arc<dyn HistorySource>, channel_id: ChannelId, on_complete: F) -> Self
    where
        F: FnOnce(Result<Vec<ChatMessage>, HistoryError>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let result = source.fetch_history(channel_id).await;
            on_complete(result).await;
        });
        Self { channel_id, task }
    }
}

impl Drop for HistoryLoad {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            debug!(channel_id = self.channel_id.0, "history: cancelling in-flight fetch");
            self.task.abort();
        }
    }
}
