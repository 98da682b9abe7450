use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ClientMessageId);
id_newtype!(CallId);

impl ClientMessageId {
    /// Fresh idempotency id for an outbound message.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl CallId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Audio,
    Image,
    Video,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Emoji → users who reacted with it.
pub type ReactionMap = BTreeMap<String, BTreeSet<UserId>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, alias = "text", alias = "content")]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<ClientMessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<serde_json::Value>,
    #[serde(default)]
    pub reactions: ReactionMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl ChatMessage {
    /// Locally composed message awaiting the hub echo.
    pub fn outgoing(sender_id: UserId, body: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(String::new()),
            sender_id,
            recipient_id: None,
            conversation_id: None,
            body: body.into(),
            attachment: None,
            reply_to: None,
            client_message_id: Some(ClientMessageId::generate()),
            custom_data: None,
            reactions: ReactionMap::new(),
            sent_at: Some(Utc::now()),
            delivered_at: None,
            read_at: None,
            edited: false,
            deleted: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.as_str().is_empty()
    }

    pub fn apply_edit(&mut self, body: impl Into<String>) {
        self.body = body.into();
        self.edited = true;
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.body.clear();
        self.attachment = None;
        self.reactions.clear();
    }

    /// Returns false when the reaction was already present.
    pub fn add_reaction(&mut self, emoji: &str, user_id: UserId) -> bool {
        self.reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(user_id)
    }

    pub fn remove_reaction(&mut self, emoji: &str, user_id: &UserId) -> bool {
        let Some(users) = self.reactions.get_mut(emoji) else {
            return false;
        };
        let removed = users.remove(user_id);
        if users.is_empty() {
            self.reactions.remove(emoji);
        }
        removed
    }

    pub fn replace_reactions(&mut self, reactions: ReactionMap) {
        self.reactions = reactions
            .into_iter()
            .filter(|(_, users)| !users.is_empty())
            .collect();
    }

    /// Returns true when the message was not yet read.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(at);
        true
    }
}
