use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, MessageId, MessageKind, SeqId, UserId},
    protocol::{FrameType, MessagePayload, WsFrame},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub seq_id: SeqId,
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub media_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Copies the ids and creation time assigned at persistence time.
    pub fn restamp(&mut self, saved: &SavedMessage) {
        self.message_id = saved.message_id;
        self.seq_id = saved.seq_id;
        self.timestamp = saved.created_at;
    }
}

impl From<&MessagePayload> for ChatMessage {
    fn from(message: &MessagePayload) -> Self {
        Self {
            seq_id: message.seq_id,
            message_id: message.message_id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            kind: message.msg_type,
            content: message.content.clone(),
            media_url: message.media_url.clone(),
            timestamp: message.created_at,
        }
    }
}

/// Ids handed back by the persistence collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedMessage {
    pub message_id: MessageId,
    pub seq_id: SeqId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub reader_id: UserId,
    pub timestamp: DateTime<Utc>,
}

/// Everything that flows through the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ChatMessage(ChatMessage),
    Join {
        chat_id: ChatId,
    },
    Leave {
        chat_id: ChatId,
    },
    Typing {
        chat_id: ChatId,
        sender_id: UserId,
        timestamp: DateTime<Utc>,
    },
    ReadReceipt(ReadReceipt),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0:?} frame is missing chat_id")]
    MissingChat(FrameType),
    #[error("message frame carries neither content nor media")]
    EmptyMessage,
    #[error("read receipt frame is missing message_id")]
    MissingMessageId,
    #[error("{0:?} frames are not accepted from clients")]
    Unsupported(FrameType),
}

impl Event {
    pub fn decode_client(text: &str, sender: UserId, now: DateTime<Utc>) -> Result<Self, FrameError> {
        let frame: WsFrame = serde_json::from_str(text)?;
        Self::from_client_frame(frame, sender, now)
    }

    /// Builds an event from a client frame. Sender and timestamp always come
    /// from the authenticated connection, never from the frame.
    pub fn from_client_frame(
        frame: WsFrame,
        sender: UserId,
        now: DateTime<Utc>,
    ) -> Result<Self, FrameError> {
        if frame.kind == FrameType::Unknown {
            return Err(FrameError::Unsupported(frame.kind));
        }
        let chat_id = frame.chat_id.ok_or(FrameError::MissingChat(frame.kind))?;

        match frame.kind {
            FrameType::JoinChat => Ok(Event::Join { chat_id }),
            FrameType::LeaveChat => Ok(Event::Leave { chat_id }),
            FrameType::Typing => Ok(Event::Typing {
                chat_id,
                sender_id: sender,
                timestamp: now,
            }),
            FrameType::MessageRead => {
                let message_id = frame
                    .message_id
                    .or_else(|| frame.message_ids.first().copied())
                    .ok_or(FrameError::MissingMessageId)?;
                Ok(Event::ReadReceipt(ReadReceipt {
                    message_id,
                    chat_id,
                    reader_id: sender,
                    timestamp: now,
                }))
            }
            FrameType::Message => {
                let content = frame.content.unwrap_or_default();
                let media_url = frame.media_url.filter(|url| !url.trim().is_empty());
                if content.trim().is_empty() && media_url.is_none() {
                    return Err(FrameError::EmptyMessage);
                }
                Ok(Event::ChatMessage(ChatMessage {
                    seq_id: SeqId::ZERO,
                    message_id: MessageId(0),
                    chat_id,
                    sender_id: sender,
                    kind: frame.msg_type.unwrap_or_default(),
                    content,
                    media_url,
                    timestamp: now,
                }))
            }
            FrameType::Unknown => Err(FrameError::Unsupported(frame.kind)),
        }
    }

    pub fn chat_id(&self) -> ChatId {
        match self {
            Event::ChatMessage(message) => message.chat_id,
            Event::Join { chat_id } | Event::Leave { chat_id } | Event::Typing { chat_id, .. } => {
                *chat_id
            }
            Event::ReadReceipt(receipt) => receipt.chat_id,
        }
    }

    pub fn to_frame(&self) -> WsFrame {
        match self {
            Event::ChatMessage(message) => {
                let mut frame = WsFrame::new(FrameType::Message, message.timestamp);
                frame.chat_id = Some(message.chat_id);
                frame.sender_id = Some(message.sender_id);
                frame.message_id = Some(message.message_id);
                frame.seq_id = Some(message.seq_id);
                frame.content = (!message.content.is_empty()).then(|| message.content.clone());
                frame.media_url = message.media_url.clone();
                frame.msg_type = Some(message.kind);
                frame
            }
            Event::Join { chat_id } => {
                let mut frame = WsFrame::new(FrameType::JoinChat, Utc::now());
                frame.chat_id = Some(*chat_id);
                frame
            }
            Event::Leave { chat_id } => {
                let mut frame = WsFrame::new(FrameType::LeaveChat, Utc::now());
                frame.chat_id = Some(*chat_id);
                frame
            }
            Event::Typing {
                chat_id,
                sender_id,
                timestamp,
            } => {
                let mut frame = WsFrame::new(FrameType::Typing, *timestamp);
                frame.chat_id = Some(*chat_id);
                frame.sender_id = Some(*sender_id);
                frame
            }
            Event::ReadReceipt(receipt) => {
                let mut frame = WsFrame::new(FrameType::MessageRead, receipt.timestamp);
                frame.chat_id = Some(receipt.chat_id);
                frame.message_id = Some(receipt.message_id);
                frame.sender_id = Some(receipt.reader_id);
                frame
            }
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_frame())
    }
}

#[cfg(test)]
#[path = "tests/event_tests.rs"]
mod tests;
