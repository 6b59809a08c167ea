//! Collaborators the dispatch core consumes but does not own.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ChatId, ChatKind, SeqId, UserId},
    protocol::MessagePayload,
};

use crate::event::{ChatMessage, SavedMessage};

/// Persists a socket-originated chat message and assigns its ids.
///
/// Membership of the sender is the saver's concern: an unauthorised send must
/// fail here so that nothing is fanned out.
#[async_trait]
pub trait MessageSaver: Send + Sync {
    async fn save_message(&self, message: &ChatMessage) -> Result<SavedMessage>;
}

/// Durable chat membership and user directory.
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool>;
    async fn chat_ids_for_user(&self, user_id: UserId) -> Result<Vec<ChatId>>;
    async fn chat_kind(&self, chat_id: ChatId) -> Result<Option<ChatKind>>;
    async fn member_ids(&self, chat_id: ChatId) -> Result<Vec<UserId>>;
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>>;
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Messages in `chat_ids` with `seq_id > last_seq_id`, ascending by seq id,
    /// at most `limit` of them.
    async fn fetch_messages_after(
        &self,
        chat_ids: &[ChatId],
        last_seq_id: SeqId,
        limit: u32,
    ) -> Result<Vec<MessagePayload>>;
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn push_notify(
        &self,
        user_id: UserId,
        title: &str,
        body: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Presence of a user on some other process of the deployment.
#[async_trait]
pub trait PresenceOracle: Send + Sync {
    async fn is_externally_present(&self, user_id: UserId) -> bool;
}
