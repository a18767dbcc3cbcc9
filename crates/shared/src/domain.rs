use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(MessageId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Reference to content stored elsewhere; the bytes never travel inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: String,
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Add,
    Remove,
    #[default]
    Toggle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionEvent {
    pub message_id: MessageId,
    pub reaction: Reaction,
    pub action: ReactionAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-assigned; absent when the far end echoes without one.
    pub id: Option<MessageId>,
    pub channel_id: ChannelId,
    pub author: Author,
    pub body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<Reaction>,
    pub created_at: DateTime<Utc>,
    pub pinned: bool,
}

impl ChatMessage {
    pub fn has_reaction(&self, emoji: &str, user_id: Option<UserId>) -> bool {
        self.reactions
            .iter()
            .any(|r| r.emoji == emoji && r.user_id == user_id)
    }

    /// Returns true when the reaction set changed.
    pub fn apply_reaction(&mut self, reaction: Reaction, action: ReactionAction) -> bool {
        let existing = self
            .reactions
            .iter()
            .position(|r| r.emoji == reaction.emoji && r.user_id == reaction.user_id);
        match (action, existing) {
            (ReactionAction::Add, Some(_)) | (ReactionAction::Remove, None) => false,
            (ReactionAction::Add | ReactionAction::Toggle, None) => {
                self.reactions.push(reaction);
                true
            }
            (ReactionAction::Remove | ReactionAction::Toggle, Some(idx)) => {
                self.reactions.remove(idx);
                true
            }
        }
    }
}
