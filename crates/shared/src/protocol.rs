use chrono::{DateTime, Utc};
use serde::{de::IgnoredAny, Deserialize, Deserializer, Serialize};

use crate::domain::{ChatId, ChatKind, MessageId, MessageKind, SeqId, UserId};

/// Discriminator of a socket frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    #[serde(rename = "message")]
    Message,
    #[serde(rename = "join_chat")]
    JoinChat,
    #[serde(rename = "leave_chat")]
    LeaveChat,
    #[serde(rename = "WS_TYPING")]
    Typing,
    #[serde(rename = "WS_MSG_READ")]
    MessageRead,
    #[serde(rename = "unknown", other)]
    Unknown,
}

/// One JSON object per socket frame, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_id: Option<SeqId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<MessageKind>,
    /// Informational only; an absent or unreadable value becomes the decode time.
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_ids: Vec<MessageId>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FrameTimestamp {
    Valid(DateTime<Utc>),
    Invalid(IgnoredAny),
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match FrameTimestamp::deserialize(deserializer)? {
        FrameTimestamp::Valid(timestamp) => timestamp,
        FrameTimestamp::Invalid(_) => Utc::now(),
    })
}

impl WsFrame {
    pub fn new(kind: FrameType, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            chat_id: None,
            sender_id: None,
            message_id: None,
            seq_id: None,
            content: None,
            media_url: None,
            msg_type: None,
            timestamp,
            message_ids: Vec::new(),
        }
    }
}

/// A persisted chat message as returned by send, list and sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub seq_id: SeqId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub msg_type: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<MessageId>,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub messages: Vec<MessagePayload>,
    pub seq_id: SeqId,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub name: String,
    pub kind: ChatKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatRequest {
    pub user_id: UserId,
    pub name: String,
    pub kind: ChatKind,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddChatMemberRequest {
    pub user_id: UserId,
    pub member_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: UserId,
    pub chat_id: ChatId,
    #[serde(default)]
    pub msg_type: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub reply_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessagesRequest {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessagesResponse {
    pub acknowledged: usize,
}
