use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatId);
id_newtype!(MessageId);

/// Sync cursor stamped on every persisted message. Time-ordered and unique per
/// generating node; `SeqId(0)` means "from the beginning".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SeqId(pub i64);

impl SeqId {
    pub const ZERO: SeqId = SeqId(0);
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChatKind {
    Private,
    Group,
    Channel,
}

impl From<ChatKind> for u8 {
    fn from(kind: ChatKind) -> Self {
        match kind {
            ChatKind::Private => 1,
            ChatKind::Group => 2,
            ChatKind::Channel => 3,
        }
    }
}

impl TryFrom<u8> for ChatKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChatKind::Private),
            2 => Ok(ChatKind::Group),
            3 => Ok(ChatKind::Channel),
            other => Err(format!("unknown chat kind {other}")),
        }
    }
}

/// Message content type, carried as `msg_type` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Voice,
    Location,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Text => 1,
            MessageKind::Image => 2,
            MessageKind::File => 3,
            MessageKind::Voice => 4,
            MessageKind::Location => 5,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Text),
            2 => Ok(MessageKind::Image),
            3 => Ok(MessageKind::File),
            4 => Ok(MessageKind::Voice),
            5 => Ok(MessageKind::Location),
            other => Err(format!("unknown message type {other}")),
        }
    }
}
