use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use realtime::{ChatDirectory, MessageLog};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::sync::Mutex;

use shared::{
    domain::{ChatId, ChatKind, MessageId, MessageKind, SeqId, UserId},
    protocol::{ChatSummary, MessagePayload},
};

pub mod seq_id;

pub use seq_id::SeqIdGenerator;

const MESSAGE_COLUMNS: &str = "id, seq_id, chat_id, sender_user_id, msg_type, content, media_url, reply_id, is_read, read_at, created_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    seq_ids: Arc<SeqIdGenerator>,
    // Held from sequence id assignment until the insert commits, so ids
    // commit in increasing order on this node.
    insert_lock: Arc<Mutex<()>>,
}

/// A message about to be persisted; ids and timestamps are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub msg_type: MessageKind,
    pub content: String,
    pub media_url: Option<String>,
    pub reply_id: Option<MessageId>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::open(database_url, 0).await
    }

    /// Opens the database with sequence ids stamped for `node_id`.
    pub async fn open(database_url: &str, node_id: i64) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;
        let seq_ids = Arc::new(SeqIdGenerator::new(node_id)?);

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` is its own database.
        let pool_options = if sqlite_path(database_url).is_none() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            seq_ids,
            insert_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Returns the id for `username`, creating the user on first sight.
    pub async fn create_user(&self, username: &str, nickname: Option<&str>) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, nickname) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET nickname=COALESCE(excluded.nickname, users.nickname)
             RETURNING id",
        )
        .bind(username)
        .bind(nickname)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_exists(&self, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Nickname when set, otherwise the username.
    pub async fn display_name(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT COALESCE(NULLIF(nickname, ''), username) FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn create_chat(&self, name: &str, kind: ChatKind, owner: UserId) -> Result<ChatId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query("INSERT INTO chats (name, kind, owner_user_id) VALUES (?, ?, ?) RETURNING id")
            .bind(name)
            .bind(i64::from(u8::from(kind)))
            .bind(owner.0)
            .fetch_one(&mut *tx)
            .await?;
        let chat_id = ChatId(rec.get::<i64, _>(0));
        sqlx::query("INSERT INTO chat_members (chat_id, user_id) VALUES (?, ?)")
            .bind(chat_id.0)
            .bind(owner.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(chat_id)
    }

    pub async fn add_member(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_members (chat_id, user_id) VALUES (?, ?)
             ON CONFLICT(chat_id, user_id) DO NOTHING",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM chat_members WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn chat_kind(&self, chat_id: ChatId) -> Result<Option<ChatKind>> {
        let row = sqlx::query("SELECT kind FROM chats WHERE id = ?")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| chat_kind_from_db(r.get::<i64, _>(0))).transpose()
    }

    /// Members in join order.
    pub async fn member_ids(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM chat_members WHERE chat_id = ? ORDER BY joined_at ASC, user_id ASC",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    pub async fn chat_ids_for_user(&self, user_id: UserId) -> Result<Vec<ChatId>> {
        let rows = sqlx::query("SELECT chat_id FROM chat_members WHERE user_id = ? ORDER BY chat_id ASC")
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| ChatId(r.get::<i64, _>(0))).collect())
    }

    pub async fn list_chats_for_user(&self, user_id: UserId) -> Result<Vec<ChatSummary>> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.kind
             FROM chats c
             INNER JOIN chat_members m ON m.chat_id = c.id
             WHERE m.user_id = ?
             ORDER BY c.id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(ChatSummary {
                    chat_id: ChatId(r.get::<i64, _>(0)),
                    name: r.get::<String, _>(1),
                    kind: chat_kind_from_db(r.get::<i64, _>(2))?,
                })
            })
            .collect()
    }

    /// Persists a message stamped with the next sequence id of this node.
    pub async fn insert_message(&self, message: NewMessage) -> Result<MessagePayload> {
        let _ordered = self.insert_lock.lock().await;
        let seq_id = self.seq_ids.next_id();
        let created_at = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO messages (seq_id, chat_id, sender_user_id, msg_type, content, media_url, reply_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(seq_id.0)
        .bind(message.chat_id.0)
        .bind(message.sender_id.0)
        .bind(i64::from(u8::from(message.msg_type)))
        .bind(&message.content)
        .bind(message.media_url.as_deref())
        .bind(message.reply_id.map(|id| id.0))
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;
        message_from_row(&row)
    }

    pub async fn chat_for_message(&self, message_id: MessageId) -> Result<Option<ChatId>> {
        let row = sqlx::query("SELECT chat_id FROM messages WHERE id = ?")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ChatId(r.get::<i64, _>(0))))
    }

    /// Newest first.
    pub async fn list_chat_messages(
        &self,
        chat_id: ChatId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<MessagePayload>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE chat_id = ?
             ORDER BY seq_id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(chat_id.0)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Messages of `chat_ids` after the cursor, oldest first.
    pub async fn fetch_messages_after(
        &self,
        chat_ids: &[ChatId],
        last_seq_id: SeqId,
        limit: u32,
    ) -> Result<Vec<MessagePayload>> {
        if chat_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE seq_id > "));
        query.push_bind(last_seq_id.0).push(" AND chat_id IN (");
        let mut ids = query.separated(", ");
        for chat_id in chat_ids {
            ids.push_bind(chat_id.0);
        }
        query.push(") ORDER BY seq_id ASC LIMIT ").push_bind(limit);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Marks the listed messages of `chat_id` read on behalf of `reader`.
    /// Only unread messages sent by someone else change; those are returned.
    pub async fn ack_messages(
        &self,
        reader: UserId,
        chat_id: ChatId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessagePayload>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE messages SET is_read = 1, read_at = ");
        query
            .push_bind(Utc::now())
            .push(" WHERE is_read = 0 AND chat_id = ")
            .push_bind(chat_id.0)
            .push(" AND sender_user_id != ")
            .push_bind(reader.0)
            .push(" AND id IN (");
        let mut ids = query.separated(", ");
        for message_id in message_ids {
            ids.push_bind(message_id.0);
        }
        query.push(format!(") RETURNING {MESSAGE_COLUMNS}"));

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut acked = rows.iter().map(message_from_row).collect::<Result<Vec<_>>>()?;
        acked.sort_by_key(|message| message.seq_id);
        Ok(acked)
    }
}

fn chat_kind_from_db(raw: i64) -> Result<ChatKind> {
    u8::try_from(raw)
        .map_err(|_| anyhow!("invalid chat kind {raw}"))
        .and_then(|kind| ChatKind::try_from(kind).map_err(|err| anyhow!(err)))
}

fn message_from_row(r: &SqliteRow) -> Result<MessagePayload> {
    let raw_kind = r.get::<i64, _>(4);
    let msg_type = u8::try_from(raw_kind)
        .map_err(|_| anyhow!("invalid message type {raw_kind}"))
        .and_then(|kind| MessageKind::try_from(kind).map_err(|err| anyhow!(err)))?;
    Ok(MessagePayload {
        message_id: MessageId(r.get::<i64, _>(0)),
        seq_id: SeqId(r.get::<i64, _>(1)),
        chat_id: ChatId(r.get::<i64, _>(2)),
        sender_id: UserId(r.get::<i64, _>(3)),
        msg_type,
        content: r.get::<String, _>(5),
        media_url: r.get::<Option<String>, _>(6),
        reply_id: r.get::<Option<i64>, _>(7).map(MessageId),
        is_read: r.get::<bool, _>(8),
        read_at: r.get::<Option<DateTime<Utc>>, _>(9),
        created_at: r.get::<DateTime<Utc>, _>(10),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if !database_url.starts_with("sqlite:") || database_url.contains(":memory:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[async_trait]
impl ChatDirectory for Storage {
    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        Storage::is_member(self, chat_id, user_id).await
    }

    async fn chat_ids_for_user(&self, user_id: UserId) -> Result<Vec<ChatId>> {
        Storage::chat_ids_for_user(self, user_id).await
    }

    async fn chat_kind(&self, chat_id: ChatId) -> Result<Option<ChatKind>> {
        Storage::chat_kind(self, chat_id).await
    }

    async fn member_ids(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        Storage::member_ids(self, chat_id).await
    }

    async fn display_name(&self, user_id: UserId) -> Result<Option<String>> {
        Storage::display_name(self, user_id).await
    }
}

#[async_trait]
impl MessageLog for Storage {
    async fn fetch_messages_after(
        &self,
        chat_ids: &[ChatId],
        last_seq_id: SeqId,
        limit: u32,
    ) -> Result<Vec<MessagePayload>> {
        Storage::fetch_messages_after(self, chat_ids, last_seq_id, limit).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
