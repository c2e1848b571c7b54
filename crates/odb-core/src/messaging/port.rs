use async_trait::async_trait;

use crate::{
    domain::{DestinationId, GroupId, MessageRef, UserId},
    messaging::types::{ChatAction, Destination, IncomingMessage, MemberHandle, MessagingCapabilities},
    Result,
};

/// Cross-transport port.
///
/// Everything the relay does to the outside chat world goes through here. Implementations
/// report a missing right as `Error::PermissionDenied` and other HTTP/transport faults as
/// `Error::External`.
#[async_trait]
pub trait ChatPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_text(&self, destination: DestinationId, text: &str) -> Result<MessageRef>;
    async fn delete_message(&self, msg: MessageRef) -> Result<()>;

    async fn send_chat_action(&self, destination: DestinationId, action: ChatAction) -> Result<()>;

    /// Look up a member handle. `Ok(None)` means the user is not (or no longer) a member.
    async fn resolve_member(&self, group: GroupId, user: UserId) -> Result<Option<MemberHandle>>;
    async fn kick_member(&self, member: MemberHandle, reason: &str) -> Result<()>;
    /// Ban by raw identity; works for users who already left the group.
    async fn ban_user(&self, group: GroupId, user: UserId, reason: &str) -> Result<()>;

    /// Text-capable destinations of a group.
    async fn list_destinations(&self, group: GroupId) -> Result<Vec<Destination>>;

    /// Downstream command-processing hook owned by the transport.
    async fn process_commands(&self, _msg: &IncomingMessage) -> Result<()> {
        Ok(())
    }
}
