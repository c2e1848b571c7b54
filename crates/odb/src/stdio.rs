//! Line-delimited JSON transport.
//!
//! Inbound: one [`Inbound`] event per stdin line. Outbound: one [`Outbound`] action per
//! stdout line. Lets the relay run against a pipe, a test harness or a thin platform bridge.

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use odb_core::{
    domain::{DestinationId, GroupId, MessageId, MessageRef, UserId},
    errors::Error,
    messaging::{
        port::ChatPort,
        types::{ChatAction, Destination, Group, IncomingMessage, MemberHandle, MessagingCapabilities},
    },
    Result,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Message(IncomingMessage),
    GroupJoin { group: Group },
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Outbound {
    SendText {
        destination: DestinationId,
        message_id: MessageId,
        text: String,
    },
    DeleteMessage {
        destination: DestinationId,
        message_id: MessageId,
    },
    Typing {
        destination: DestinationId,
    },
    Kick {
        group: GroupId,
        user: UserId,
        reason: String,
    },
    Ban {
        group: GroupId,
        user: UserId,
        reason: String,
    },
}

pub fn parse_inbound(line: &str) -> anyhow::Result<Inbound> {
    Ok(serde_json::from_str(line)?)
}

pub struct StdioChatPort<W> {
    out: Mutex<W>,
    groups: HashMap<GroupId, Vec<Destination>>,
    members: std::sync::Mutex<HashSet<(GroupId, UserId)>>,
    next_id: AtomicU64,
}

impl<W: AsyncWrite + Unpin + Send> StdioChatPort<W> {
    pub fn new(out: W, destinations: &[(GroupId, Destination)]) -> Self {
        let mut groups: HashMap<GroupId, Vec<Destination>> = HashMap::new();
        for (g, d) in destinations {
            groups.entry(*g).or_default().push(d.clone());
        }
        Self {
            out: Mutex::new(out),
            groups,
            members: std::sync::Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Groups known from the destination table, for the startup announcement.
    pub fn groups(&self) -> Vec<Group> {
        let mut ids: Vec<GroupId> = self.groups.keys().copied().collect();
        ids.sort_by_key(|g| g.0);
        ids.into_iter()
            .map(|id| Group {
                id,
                name: format!("group {id}"),
            })
            .collect()
    }

    /// Seeing someone post in a group is the only membership signal this transport gets.
    pub fn observe(&self, msg: &IncomingMessage) {
        if let Some(g) = &msg.group {
            if let Ok(mut members) = self.members.lock() {
                members.insert((g.id, msg.author.id));
            }
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    async fn emit(&self, action: &Outbound) -> Result<()> {
        let mut line = serde_json::to_vec(action)?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    fn forget_member(&self, group: GroupId, user: UserId) {
        if let Ok(mut members) = self.members.lock() {
            members.remove(&(group, user));
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChatPort for StdioChatPort<W> {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_delete: true,
            supports_sanctions: true,
            supports_chat_actions: true,
            max_message_len: 2000,
        }
    }

    async fn send_text(&self, destination: DestinationId, text: &str) -> Result<MessageRef> {
        let message_id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.emit(&Outbound::SendText {
            destination,
            message_id,
            text: text.to_string(),
        })
        .await?;
        Ok(MessageRef {
            destination,
            message_id,
        })
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.emit(&Outbound::DeleteMessage {
            destination: msg.destination,
            message_id: msg.message_id,
        })
        .await
    }

    async fn send_chat_action(&self, destination: DestinationId, action: ChatAction) -> Result<()> {
        match action {
            ChatAction::Typing => self.emit(&Outbound::Typing { destination }).await,
        }
    }

    async fn resolve_member(&self, group: GroupId, user: UserId) -> Result<Option<MemberHandle>> {
        let known = self
            .members
            .lock()
            .map_err(|_| Error::External("member table poisoned".to_string()))?
            .contains(&(group, user));
        Ok(known.then_some(MemberHandle { group, user }))
    }

    async fn kick_member(&self, member: MemberHandle, reason: &str) -> Result<()> {
        self.emit(&Outbound::Kick {
            group: member.group,
            user: member.user,
            reason: reason.to_string(),
        })
        .await?;
        self.forget_member(member.group, member.user);
        Ok(())
    }

    async fn ban_user(&self, group: GroupId, user: UserId, reason: &str) -> Result<()> {
        self.emit(&Outbound::Ban {
            group,
            user,
            reason: reason.to_string(),
        })
        .await?;
        self.forget_member(group, user);
        Ok(())
    }

    async fn list_destinations(&self, group: GroupId) -> Result<Vec<Destination>> {
        self.groups
            .get(&group)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unknown group {group}")))
    }
}
