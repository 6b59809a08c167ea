//! Cursor-based catch-up for clients that were offline.

use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::{SeqId, UserId},
    protocol::SyncResponse,
};
use tracing::debug;

use crate::ports::{ChatDirectory, MessageLog};

pub const DEFAULT_PAGE_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct SyncResolver {
    directory: Arc<dyn ChatDirectory>,
    log: Arc<dyn MessageLog>,
    page_limit: u32,
}

impl SyncResolver {
    pub fn new(directory: Arc<dyn ChatDirectory>, log: Arc<dyn MessageLog>, page_limit: u32) -> Self {
        Self {
            directory,
            log,
            page_limit: page_limit.max(1),
        }
    }

    /// One page of messages newer than `last_seq_id` across every chat the
    /// user belongs to. Read-only, so retrying with the same cursor is safe.
    pub async fn sync(&self, user_id: UserId, last_seq_id: SeqId) -> Result<SyncResponse> {
        self.sync_with_limit(user_id, last_seq_id, self.page_limit).await
    }

    pub async fn sync_with_limit(
        &self,
        user_id: UserId,
        last_seq_id: SeqId,
        limit: u32,
    ) -> Result<SyncResponse> {
        let limit = limit.clamp(1, self.page_limit);
        let chat_ids = self.directory.chat_ids_for_user(user_id).await?;
        if chat_ids.is_empty() {
            return Ok(SyncResponse {
                messages: Vec::new(),
                seq_id: last_seq_id,
                has_more: false,
            });
        }

        let messages = self
            .log
            .fetch_messages_after(&chat_ids, last_seq_id, limit)
            .await?;
        let seq_id = messages
            .iter()
            .map(|message| message.seq_id)
            .max()
            .unwrap_or(last_seq_id);
        let has_more = messages.len() == limit as usize;

        debug!(
            %user_id,
            chats = chat_ids.len(),
            returned = messages.len(),
            %seq_id,
            has_more,
            "sync page resolved"
        );
        Ok(SyncResponse {
            messages,
            seq_id,
            has_more,
        })
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
