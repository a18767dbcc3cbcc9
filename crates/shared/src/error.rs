use thiserror::Error;

use crate::domain::MessageId;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("history record {0:?} has no author")]
    MissingAuthor(MessageId),
}
