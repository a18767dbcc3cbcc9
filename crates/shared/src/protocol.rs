use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Attachment, Author, ChannelId, ChatMessage, MessageId, Reaction, ReactionAction,
        ReactionEvent, UserId,
    },
    error::ProtocolError,
};

/// Frames written by the client over the live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    JoinChannel {
        channel_id: ChannelId,
    },
    Message {
        channel_id: ChannelId,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    Reaction {
        channel_id: ChannelId,
        message_id: MessageId,
        reaction: String,
        user_id: UserId,
    },
}

impl ClientFrame {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Self::JoinChannel { channel_id }
            | Self::Message { channel_id, .. }
            | Self::Reaction { channel_id, .. } => *channel_id,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Frames broadcast by the far end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    Message(LiveMessagePayload),
    Reaction(LiveReactionPayload),
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }

    /// Channel the frame is scoped to, when it names one.
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            Self::Message(payload) => Some(payload.channel_id),
            Self::Reaction(payload) => payload.channel_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveMessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub content: String,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl From<LiveMessagePayload> for ChatMessage {
    fn from(payload: LiveMessagePayload) -> Self {
        Self {
            id: payload.id,
            channel_id: payload.channel_id,
            author: Author {
                id: payload.sender,
                display_name: payload.sender_name,
            },
            body: non_empty(payload.content),
            attachments: payload.attachments,
            reactions: Vec::new(),
            created_at: payload.timestamp,
            pinned: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveReactionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    pub message_id: MessageId,
    pub reaction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub action: ReactionAction,
}

impl From<LiveReactionPayload> for ReactionEvent {
    fn from(payload: LiveReactionPayload) -> Self {
        Self {
            message_id: payload.message_id,
            reaction: Reaction {
                emoji: payload.reaction,
                user_id: payload.user_id,
            },
            action: payload.action,
        }
    }
}

/// One entry of `GET /channels/{id}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<HistoryUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<UserId>,
    #[serde(default)]
    pub reactions: Vec<HistoryReaction>,
    #[serde(default)]
    pub medias: Vec<HistoryMedia>,
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryUser {
    pub id: UserId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReaction {
    pub emoji: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMedia {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

impl TryFrom<HistoryRecord> for ChatMessage {
    type Error = ProtocolError;

    fn try_from(record: HistoryRecord) -> Result<Self, Self::Error> {
        let author = match (record.user, record.author_id) {
            (Some(user), _) => Author {
                id: user.id,
                display_name: user
                    .display_name
                    .filter(|name| !name.is_empty())
                    .or(user.name),
            },
            (None, Some(id)) => Author {
                id,
                display_name: None,
            },
            (None, None) => return Err(ProtocolError::MissingAuthor(record.id)),
        };

        Ok(Self {
            id: Some(record.id),
            channel_id: record.channel_id,
            author,
            body: record.content.and_then(non_empty),
            attachments: record
                .medias
                .into_iter()
                .map(|media| Attachment {
                    kind: media.kind,
                    locator: media.url,
                })
                .collect(),
            reactions: record
                .reactions
                .into_iter()
                .map(|r| Reaction {
                    emoji: r.emoji,
                    user_id: Some(r.user_id),
                })
                .collect(),
            created_at: record.created_at,
            pinned: record.pinned,
        })
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
