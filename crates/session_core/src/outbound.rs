use shared::{
    domain::{Attachment, ChannelId, MessageId, UserId},
    protocol::ClientFrame,
};

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    Text(String),
    Attachment {
        attachment: Attachment,
        caption: Option<String>,
    },
    Reaction {
        message_id: MessageId,
        emoji: String,
    },
}

impl OutboundAction {
    pub fn validate(&self) -> Result<(), SessionError> {
        let blank = match self {
            Self::Text(body) => body.trim().is_empty(),
            Self::Attachment { attachment, .. } => attachment.locator.trim().is_empty(),
            Self::Reaction { emoji, .. } => emoji.trim().is_empty(),
        };
        if blank {
            Err(SessionError::EmptyMessage)
        } else {
            Ok(())
        }
    }
}

/// Turns user actions into wire frames. The far end assigns message ids, so
/// nothing here is added to the local view.
#[derive(Debug, Clone)]
pub struct OutboundEncoder {
    user_id: UserId,
}

impl OutboundEncoder {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn encode(
        &self,
        channel_id: ChannelId,
        action: OutboundAction,
    ) -> Result<ClientFrame, SessionError> {
        action.validate()?;
        Ok(match action {
            OutboundAction::Text(content) => ClientFrame::Message {
                channel_id,
                content,
                attachments: Vec::new(),
            },
            OutboundAction::Attachment {
                attachment,
                caption,
            } => ClientFrame::Message {
                channel_id,
                content: caption.unwrap_or_default(),
                attachments: vec![attachment],
            },
            OutboundAction::Reaction { message_id, emoji } => ClientFrame::Reaction {
                channel_id,
                message_id,
                reaction: emoji,
                user_id: self.user_id,
            },
        })
    }
}
