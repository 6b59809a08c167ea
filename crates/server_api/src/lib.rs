use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use realtime::{
    ChatMessage, Dispatcher, Event, MessageSaver, NotifierConfig, OfflineNotifier, PushNotifier,
    ReadReceipt, SavedMessage, SyncResolver,
};
use shared::{
    domain::{ChatId, ChatKind, MessageId, MessageKind, SeqId, UserId},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{
        AckMessagesRequest, AckMessagesResponse, AddChatMemberRequest, ChatSummary,
        CreateChatRequest, LoginRequest, LoginResponse, MessagePayload, SendMessageRequest,
        SyncResponse,
    },
};
use storage::{NewMessage, Storage};
use tracing::{debug, info};

pub const DEFAULT_MESSAGE_PAGE: u32 = 50;
pub const MAX_MESSAGE_PAGE: u32 = 100;
const MAX_USERNAME_CHARS: usize = 50;
const MAX_CHAT_NAME_CHARS: usize = 100;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub dispatcher: Dispatcher,
    pub notifier: OfflineNotifier,
    pub sync: SyncResolver,
}

impl ApiContext {
    pub fn new(
        storage: Storage,
        dispatcher: Dispatcher,
        pusher: Arc<dyn PushNotifier>,
        notifier_config: NotifierConfig,
        sync_page_limit: u32,
    ) -> Self {
        let directory = Arc::new(storage.clone());
        let notifier =
            OfflineNotifier::new(dispatcher.clone(), directory.clone(), pusher, notifier_config);
        let sync = SyncResolver::new(directory.clone(), directory, sync_page_limit);
        Self {
            storage,
            dispatcher,
            notifier,
            sync,
        }
    }
}

pub async fn login(ctx: &ApiContext, req: LoginRequest) -> Result<LoginResponse, ApiError> {
    let username = req.username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_CHARS {
        return Err(ApiError::validation(format!(
            "username must be 1-{MAX_USERNAME_CHARS} characters"
        )));
    }
    let nickname = req.nickname.as_deref().map(str::trim).filter(|n| !n.is_empty());
    let user_id = ctx
        .storage
        .create_user(username, nickname)
        .await
        .map_err(internal)?;
    info!(%user_id, username, "user logged in");
    Ok(LoginResponse { user_id })
}

pub async fn create_chat(ctx: &ApiContext, req: CreateChatRequest) -> Result<ChatSummary, ApiError> {
    ensure_user_exists(ctx, req.user_id).await?;
    let name = req.name.trim();
    if name.is_empty() || name.chars().count() > MAX_CHAT_NAME_CHARS {
        return Err(ApiError::validation(format!(
            "chat name must be 1-{MAX_CHAT_NAME_CHARS} characters"
        )));
    }

    let mut others: Vec<UserId> = req
        .member_ids
        .iter()
        .copied()
        .filter(|member| *member != req.user_id)
        .collect();
    others.sort();
    others.dedup();
    if req.kind == ChatKind::Private && others.len() != 1 {
        return Err(ApiError::validation(
            "a private chat needs exactly one other member",
        ));
    }
    for member in &others {
        if !ctx.storage.user_exists(*member).await.map_err(internal)? {
            return Err(ApiError::not_found(format!("user {member} not found")));
        }
    }

    let chat_id = ctx
        .storage
        .create_chat(name, req.kind, req.user_id)
        .await
        .map_err(internal)?;
    for member in others {
        ctx.storage
            .add_member(chat_id, member)
            .await
            .map_err(internal)?;
    }
    info!(%chat_id, owner = %req.user_id, kind = ?req.kind, "chat created");
    Ok(ChatSummary {
        chat_id,
        name: name.to_string(),
        kind: req.kind,
    })
}

pub async fn list_chats(ctx: &ApiContext, user_id: UserId) -> Result<Vec<ChatSummary>, ApiError> {
    ctx.storage
        .list_chats_for_user(user_id)
        .await
        .map_err(internal)
}

/// Only existing members may add someone; private chats stay at two.
pub async fn add_chat_member(
    ctx: &ApiContext,
    chat_id: ChatId,
    req: AddChatMemberRequest,
) -> Result<(), ApiError> {
    let kind = ensure_membership(ctx, chat_id, req.user_id).await?;
    if kind == ChatKind::Private {
        return Err(ApiError::validation("private chats cannot gain members"));
    }
    if !ctx
        .storage
        .user_exists(req.member_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::not_found(format!("user {} not found", req.member_id)));
    }
    ctx.storage
        .add_member(chat_id, req.member_id)
        .await
        .map_err(internal)?;
    info!(%chat_id, added_by = %req.user_id, member = %req.member_id, "chat member added");
    Ok(())
}

/// REST send: persists, fans out like a socket send, then wakes the
/// offline bridge.
pub async fn send_message(
    ctx: &ApiContext,
    req: SendMessageRequest,
) -> Result<MessagePayload, ApiError> {
    let payload = persist_message(
        ctx,
        NewMessage {
            chat_id: req.chat_id,
            sender_id: req.user_id,
            msg_type: req.msg_type,
            content: req.content,
            media_url: req.media_url,
            reply_id: req.reply_id,
        },
    )
    .await?;
    let message = ChatMessage::from(&payload);
    ctx.dispatcher
        .publish(Event::ChatMessage(message.clone()))
        .await;
    ctx.notifier.spawn_notify(message);
    Ok(payload)
}

/// Newest first; `limit` defaults to 50 and must stay within 1..=100.
pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
    offset: u32,
    limit: Option<u32>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let limit = limit.unwrap_or(DEFAULT_MESSAGE_PAGE);
    if !(1..=MAX_MESSAGE_PAGE).contains(&limit) {
        return Err(ApiError::validation(format!(
            "limit must be between 1 and {MAX_MESSAGE_PAGE}"
        )));
    }
    ensure_membership(ctx, chat_id, user_id).await?;
    ctx.storage
        .list_chat_messages(chat_id, offset, limit)
        .await
        .map_err(internal)
}

/// Marks messages read and tells each sender, wherever they are connected.
pub async fn ack_messages(
    ctx: &ApiContext,
    req: AckMessagesRequest,
) -> Result<AckMessagesResponse, ApiError> {
    ensure_membership(ctx, req.chat_id, req.user_id).await?;
    let acked = ctx
        .storage
        .ack_messages(req.user_id, req.chat_id, &req.message_ids)
        .await
        .map_err(internal)?;

    for message in &acked {
        let receipt = Event::ReadReceipt(ReadReceipt {
            message_id: message.message_id,
            chat_id: message.chat_id,
            reader_id: req.user_id,
            timestamp: message.read_at.unwrap_or_else(Utc::now),
        });
        if !ctx.dispatcher.send_direct(message.sender_id, &receipt).await {
            debug!(
                sender_id = %message.sender_id,
                message_id = %message.message_id,
                "read receipt not delivered live"
            );
        }
    }
    Ok(AckMessagesResponse {
        acknowledged: acked.len(),
    })
}

pub async fn sync(
    ctx: &ApiContext,
    user_id: UserId,
    last_seq_id: SeqId,
) -> Result<SyncResponse, ApiError> {
    if last_seq_id < SeqId::ZERO {
        return Err(ApiError::validation("last_seq_id must not be negative"));
    }
    ctx.sync.sync(user_id, last_seq_id).await.map_err(internal)
}

/// Socket sends run the same checks and persistence as REST sends. The
/// connection publishes the restamped message itself.
#[async_trait]
impl MessageSaver for ApiContext {
    async fn save_message(&self, message: &ChatMessage) -> anyhow::Result<SavedMessage> {
        let payload = persist_message(
            self,
            NewMessage {
                chat_id: message.chat_id,
                sender_id: message.sender_id,
                msg_type: message.kind,
                content: message.content.clone(),
                media_url: message.media_url.clone(),
                reply_id: None,
            },
        )
        .await
        .map_err(ApiException::from)?;
        self.notifier.spawn_notify(ChatMessage::from(&payload));
        Ok(SavedMessage {
            message_id: payload.message_id,
            seq_id: payload.seq_id,
            created_at: payload.created_at,
        })
    }
}

async fn persist_message(ctx: &ApiContext, message: NewMessage) -> Result<MessagePayload, ApiError> {
    validate_content(message.msg_type, &message.content, message.media_url.as_deref())?;
    ensure_membership(ctx, message.chat_id, message.sender_id).await?;
    if let Some(reply_id) = message.reply_id {
        validate_reply(ctx, message.chat_id, reply_id).await?;
    }
    let payload = ctx.storage.insert_message(message).await.map_err(internal)?;
    debug!(
        chat_id = %payload.chat_id,
        message_id = %payload.message_id,
        seq_id = %payload.seq_id,
        "message persisted"
    );
    Ok(payload)
}

fn validate_content(kind: MessageKind, content: &str, media_url: Option<&str>) -> Result<(), ApiError> {
    let has_media = media_url.is_some_and(|url| !url.trim().is_empty());
    match kind {
        MessageKind::Text if content.trim().is_empty() => {
            Err(ApiError::validation("text messages need content"))
        }
        MessageKind::Image | MessageKind::File | MessageKind::Voice if !has_media => {
            Err(ApiError::validation("media messages need a media_url"))
        }
        MessageKind::Location if content.trim().is_empty() && !has_media => {
            Err(ApiError::validation("location messages need content"))
        }
        _ => Ok(()),
    }
}

async fn validate_reply(ctx: &ApiContext, chat_id: ChatId, reply_id: MessageId) -> Result<(), ApiError> {
    let replied_chat = ctx
        .storage
        .chat_for_message(reply_id)
        .await
        .map_err(internal)?;
    if replied_chat != Some(chat_id) {
        return Err(ApiError::validation(
            "reply_id must reference a message in the same chat",
        ));
    }
    Ok(())
}

async fn ensure_user_exists(ctx: &ApiContext, user_id: UserId) -> Result<(), ApiError> {
    if ctx.storage.user_exists(user_id).await.map_err(internal)? {
        Ok(())
    } else {
        Err(ApiError::new(ErrorCode::Unauthorized, "unknown user"))
    }
}

async fn ensure_membership(
    ctx: &ApiContext,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<ChatKind, ApiError> {
    let kind = ctx
        .storage
        .chat_kind(chat_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("chat not found"))?;
    if !ctx
        .storage
        .is_member(chat_id, user_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::forbidden("user is not a member of this chat"));
    }
    Ok(kind)
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
