use serde::{Deserialize, Serialize};

use crate::domain::{DestinationId, GroupId, MessageId, MessageRef, UserId};

/// Author of an inbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub name: String,
    /// Set when the author is an automated account (including ourselves).
    #[serde(default)]
    pub is_bot: bool,
}

impl std::fmt::Display for Author {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (ID:{})", self.name, self.id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: Option<String>,
    pub url: String,
}

/// Group summary (used for startup announcements and join notices).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
}

/// Inbound message event delivered by the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: MessageId,
    pub author: Author,
    /// `None` for direct conversations.
    #[serde(default)]
    pub group: Option<Group>,
    pub destination: DestinationId,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl IncomingMessage {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            destination: self.destination,
            message_id: self.message_id,
        }
    }
}

/// A text-capable destination inside a group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub id: DestinationId,
    pub name: String,
}

/// A resolved group member, required for actions that need membership (kick).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberHandle {
    pub group: GroupId,
    pub user: UserId,
}

/// Outgoing "chat action" (typing indicator).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatAction {
    Typing,
}

/// Capabilities / feature flags of a transport implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub supports_delete: bool,
    pub supports_sanctions: bool,
    pub supports_chat_actions: bool,
    pub max_message_len: usize,
}
