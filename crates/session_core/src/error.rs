use shared::error::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history request returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("history request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("no history source configured")]
    Missing,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("history unavailable for channel {channel_id}: {source}")]
    HistoryUnavailable {
        channel_id: i64,
        #[source]
        source: HistoryError,
    },
    #[error("connection error on channel {channel_id}: {reason}")]
    ConnectionError { channel_id: i64, reason: String },
    #[error(transparent)]
    MalformedFrame(#[from] ProtocolError),
    #[error("not connected to the active channel")]
    NotConnected,
    #[error("dropped event for inactive channel {0}")]
    StaleEventDropped(i64),
    #[error("message is empty")]
    EmptyMessage,
    #[error("activation cancelled before the connection was joined")]
    Cancelled,
}

impl SessionError {
    /// Whether the UI should surface this failure to the user.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::HistoryUnavailable { .. } | Self::ConnectionError { .. } | Self::NotConnected
        )
    }
}
