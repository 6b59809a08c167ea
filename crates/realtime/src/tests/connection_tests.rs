use std::{
    collections::HashSet,
    sync::atomic::{AtomicI64, Ordering},
};

use anyhow::bail;
use async_trait::async_trait;
use futures::channel::mpsc as chan;
use serde_json::{json, Value};
use shared::domain::{ChatId, ChatKind, MessageId, MessageKind, SeqId};
use tokio::{task::JoinHandle, time::timeout};

use super::*;
use crate::{dispatcher::DispatcherConfig, event::ChatMessage, event::SavedMessage};

const WAIT: Duration = Duration::from_secs(2);

struct FakeDirectory {
    members: HashSet<(ChatId, UserId)>,
}

#[async_trait]
impl ChatDirectory for FakeDirectory {
    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> anyhow::Result<bool> {
        Ok(self.members.contains(&(chat_id, user_id)))
    }

    async fn chat_ids_for_user(&self, _user_id: UserId) -> anyhow::Result<Vec<ChatId>> {
        Ok(Vec::new())
    }

    async fn chat_kind(&self, _chat_id: ChatId) -> anyhow::Result<Option<ChatKind>> {
        Ok(None)
    }

    async fn member_ids(&self, _chat_id: ChatId) -> anyhow::Result<Vec<UserId>> {
        Ok(Vec::new())
    }

    async fn display_name(&self, _user_id: UserId) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

struct FakeSaver {
    next_id: AtomicI64,
}

#[async_trait]
impl MessageSaver for FakeSaver {
    async fn save_message(&self, message: &ChatMessage) -> anyhow::Result<SavedMessage> {
        if message.content == "fail" {
            bail!("database is locked");
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(SavedMessage {
            message_id: MessageId(id),
            seq_id: SeqId(id * 10),
            created_at: Utc::now(),
        })
    }
}

fn context(ping_interval: Duration) -> ConnectionContext {
    context_with(ping_interval, DispatcherConfig::default(), DEFAULT_WRITE_TIMEOUT)
}

fn context_with(
    ping_interval: Duration,
    config: DispatcherConfig,
    write_timeout: Duration,
) -> ConnectionContext {
    let members = [(10, 1), (10, 2), (13, 1), (13, 2)]
        .into_iter()
        .map(|(chat, user)| (ChatId(chat), UserId(user)))
        .collect();
    ConnectionContext {
        dispatcher: Dispatcher::spawn(config, None),
        saver: Arc::new(FakeSaver {
            next_id: AtomicI64::new(100),
        }),
        directory: Arc::new(FakeDirectory { members }),
        ping_interval,
        write_timeout,
    }
}

struct Client {
    frames: chan::UnboundedSender<Result<Message, String>>,
    socket: chan::Receiver<Message>,
    task: JoinHandle<()>,
}

impl Client {
    fn connect(ctx: &ConnectionContext, user: i64) -> Self {
        Self::with_socket_buffer(ctx, user, 32)
    }

    fn with_socket_buffer(ctx: &ConnectionContext, user: i64, buffer: usize) -> Self {
        let (sink, socket) = chan::channel(buffer);
        let (frames, stream) = chan::unbounded();
        let task = tokio::spawn(run_connection(sink, stream, UserId(user), ctx.clone()));
        Self {
            frames,
            socket,
            task,
        }
    }

    fn send(&self, frame: Value) {
        self.frames
            .unbounded_send(Ok(Message::Text(frame.to_string())))
            .expect("client stream open");
    }

    async fn next_message(&mut self) -> Message {
        timeout(WAIT, self.socket.next())
            .await
            .expect("timed out waiting for socket frame")
            .expect("socket sink closed")
    }

    async fn next_text(&mut self) -> Value {
        loop {
            if let Message::Text(text) = self.next_message().await {
                return serde_json::from_str(&text).expect("frame json");
            }
        }
    }
}

async fn watcher(ctx: &ConnectionContext, user: i64, chat: i64) -> mpsc::Receiver<String> {
    let (entry, rx) = ctx.dispatcher.open_connection(UserId(user));
    let id = entry.id();
    ctx.dispatcher.register(entry).await;
    ctx.dispatcher.join(UserId(user), id, ChatId(chat)).await;
    rx
}

async fn next_watched(rx: &mut mpsc::Receiver<String>) -> Value {
    let frame = timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for fan-out")
        .expect("watcher queue open");
    serde_json::from_str(&frame).expect("frame json")
}

async fn wait_for_room(ctx: &ConnectionContext, chat: i64, user: i64) {
    timeout(WAIT, async {
        while !ctx.dispatcher.room_members(ChatId(chat)).await.contains(&UserId(user)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("user joined room");
}

#[tokio::test]
async fn socket_message_is_saved_then_echoed_to_the_room() {
    let ctx = context(Duration::from_secs(60));
    let mut bob = watcher(&ctx, 2, 10).await;
    let mut alice = Client::connect(&ctx, 1);

    alice.send(json!({"type": "join_chat", "chat_id": 10}));
    alice.send(json!({"type": "message", "chat_id": 10, "sender_id": 99, "content": "hi bob"}));

    let echoed = alice.next_text().await;
    assert_eq!(echoed["type"], "message");
    assert_eq!(echoed["sender_id"], 1);
    assert_eq!(echoed["message_id"], 100);
    assert_eq!(echoed["seq_id"], 1000);

    let delivered = next_watched(&mut bob).await;
    assert_eq!(delivered["content"], "hi bob");
    assert_eq!(delivered["seq_id"], 1000);
}

#[tokio::test]
async fn join_requires_chat_membership() {
    let ctx = context(Duration::from_secs(60));
    let alice = Client::connect(&ctx, 1);

    alice.send(json!({"type": "join_chat", "chat_id": 20}));
    alice.send(json!({"type": "join_chat", "chat_id": 10}));
    wait_for_room(&ctx, 10, 1).await;

    assert!(ctx.dispatcher.room_members(ChatId(20)).await.is_empty());
}

#[tokio::test]
async fn unsaved_message_is_dropped_without_fan_out() {
    let ctx = context(Duration::from_secs(60));
    let mut bob = watcher(&ctx, 2, 13).await;
    let alice = Client::connect(&ctx, 1);

    alice.send(json!({"type": "message", "chat_id": 13, "content": "fail"}));
    alice.send(json!({"type": "message", "chat_id": 13, "content": "second try"}));

    let first = next_watched(&mut bob).await;
    assert_eq!(first["content"], "second try");
}

#[tokio::test]
async fn malformed_and_binary_frames_are_skipped() {
    let ctx = context(Duration::from_secs(60));
    let mut bob = watcher(&ctx, 2, 10).await;
    let alice = Client::connect(&ctx, 1);

    alice
        .frames
        .unbounded_send(Ok(Message::Text("{not json".to_string())))
        .expect("client stream open");
    alice
        .frames
        .unbounded_send(Ok(Message::Binary(vec![1, 2, 3])))
        .expect("client stream open");
    alice.send(json!({"type": "message", "chat_id": 10, "content": "still alive"}));

    assert_eq!(next_watched(&mut bob).await["content"], "still alive");
}

#[tokio::test]
async fn typing_reaches_others_but_not_the_typist() {
    let ctx = context(Duration::from_secs(60));
    let mut bob = watcher(&ctx, 2, 10).await;
    let mut alice = Client::connect(&ctx, 1);

    alice.send(json!({"type": "join_chat", "chat_id": 10}));
    alice.send(json!({"type": "WS_TYPING", "chat_id": 10}));
    alice.send(json!({"type": "message", "chat_id": 10, "content": "done typing"}));

    let typing = next_watched(&mut bob).await;
    assert_eq!(typing["type"], "WS_TYPING");
    assert_eq!(typing["sender_id"], 1);

    // The first frame the typist sees is its own message echo.
    assert_eq!(alice.next_text().await["type"], "message");
}

#[tokio::test]
async fn client_close_unregisters_and_closes_the_socket() {
    let ctx = context(Duration::from_secs(60));
    let mut alice = Client::connect(&ctx, 1);
    alice.send(json!({"type": "join_chat", "chat_id": 10}));
    wait_for_room(&ctx, 10, 1).await;

    alice.frames.close_channel();
    timeout(WAIT, &mut alice.task)
        .await
        .expect("connection ended")
        .expect("connection task");

    assert!(!ctx.dispatcher.is_present(UserId(1)).await);
    assert!(ctx.dispatcher.room_members(ChatId(10)).await.is_empty());
    assert!(matches!(alice.next_message().await, Message::Close(None)));
}

#[tokio::test]
async fn reconnect_closes_the_superseded_socket() {
    let ctx = context(Duration::from_secs(60));
    let mut first = Client::connect(&ctx, 1);
    first.send(json!({"type": "join_chat", "chat_id": 10}));
    wait_for_room(&ctx, 10, 1).await;

    let _second = Client::connect(&ctx, 1);

    assert!(matches!(first.next_message().await, Message::Close(None)));
    timeout(WAIT, &mut first.task)
        .await
        .expect("superseded connection ended")
        .expect("connection task");

    ctx.dispatcher.flush().await;
    assert!(ctx.dispatcher.is_present(UserId(1)).await);
    assert_eq!(ctx.dispatcher.connection_count().await, 1);
}

#[tokio::test]
async fn idle_connection_is_pinged() {
    let ctx = context(Duration::from_millis(20));
    let mut alice = Client::connect(&ctx, 1);

    assert!(matches!(alice.next_message().await, Message::Ping(_)));
}

#[tokio::test]
async fn signals_only_reach_rooms_the_sender_is_watching() {
    let ctx = context(Duration::from_secs(60));
    let mut bob = watcher(&ctx, 2, 10).await;
    let outsider = Client::connect(&ctx, 3);
    let alice = Client::connect(&ctx, 1);

    outsider.send(json!({"type": "WS_TYPING", "chat_id": 10}));
    outsider.send(json!({"type": "WS_MSG_READ", "chat_id": 10, "message_id": 4242}));
    // A member who has not joined the room cannot signal into it either.
    alice.send(json!({"type": "WS_TYPING", "chat_id": 10}));
    alice.send(json!({"type": "message", "chat_id": 10, "content": "after the noise"}));

    let first = next_watched(&mut bob).await;
    assert_eq!(first["type"], "message");
    assert_eq!(first["content"], "after the noise");
    ctx.dispatcher.flush().await;
    assert!(bob.try_recv().is_err());
}

#[tokio::test]
async fn evicted_connection_with_a_stalled_socket_shuts_down() {
    let config = DispatcherConfig {
        outbound_capacity: 2,
        ..DispatcherConfig::default()
    };
    let ctx = context_with(Duration::from_secs(60), config, Duration::from_millis(100));
    // The socket side is never read, so the writer stalls after one frame.
    let mut alice = Client::with_socket_buffer(&ctx, 1, 0);
    alice.send(json!({"type": "join_chat", "chat_id": 10}));
    wait_for_room(&ctx, 10, 1).await;

    for n in 0..8 {
        ctx.dispatcher
            .publish(Event::ChatMessage(ChatMessage {
                seq_id: SeqId(n + 1),
                message_id: MessageId(n + 1),
                chat_id: ChatId(10),
                sender_id: UserId(2),
                kind: MessageKind::Text,
                content: format!("flood {n}"),
                media_url: None,
                timestamp: Utc::now(),
            }))
            .await;
    }
    ctx.dispatcher.flush().await;

    assert!(!ctx.dispatcher.is_present(UserId(1)).await);
    assert!(ctx.dispatcher.room_members(ChatId(10)).await.is_empty());
    timeout(WAIT, &mut alice.task)
        .await
        .expect("evicted connection ended")
        .expect("connection task");
}
