//! Per-connection reader and writer tasks.

use std::{fmt::Display, sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use shared::domain::UserId;
use tokio::{
    sync::mpsc,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::Dispatcher,
    event::Event,
    ports::{ChatDirectory, MessageSaver},
    registry::ConnectionId,
};

const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// What every connection needs from the rest of the process.
#[derive(Clone)]
pub struct ConnectionContext {
    pub dispatcher: Dispatcher,
    pub saver: Arc<dyn MessageSaver>,
    pub directory: Arc<dyn ChatDirectory>,
    pub ping_interval: Duration,
    /// A socket write that stalls longer than this ends the connection.
    pub write_timeout: Duration,
}

pub async fn serve_socket(socket: WebSocket, user_id: UserId, ctx: ConnectionContext) {
    let (sink, stream) = socket.split();
    run_connection(sink, stream, user_id, ctx).await;
}

/// Drives one connection until either side ends it. The registry entry is
/// always removed before this returns.
pub async fn run_connection<S, R, E>(sink: S, mut stream: R, user_id: UserId, ctx: ConnectionContext)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (entry, outbound) = ctx.dispatcher.open_connection(user_id);
    let conn_id = entry.id();
    ctx.dispatcher.register(entry).await;
    info!(%user_id, %conn_id, "socket connected");

    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound,
        ctx.ping_interval,
        ctx.write_timeout,
        user_id,
        conn_id,
    ));
    let mut writer_finished = false;

    tokio::select! {
        _ = read_loop(&mut stream, user_id, conn_id, &ctx) => {}
        _ = &mut writer => writer_finished = true,
    }

    // Dropping the registry entry closes the outbound queue, which lets the
    // writer send its close frame.
    ctx.dispatcher.unregister(user_id, conn_id).await;
    if !writer_finished && timeout(WRITER_SHUTDOWN_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(%user_id, %conn_id, "socket disconnected");
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<String>,
    ping_interval: Duration,
    write_timeout: Duration,
    user_id: UserId,
    conn_id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let period = ping_interval.max(Duration::from_millis(10));
    let mut ping = interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(text) = frame else {
                    let _ = timeout(write_timeout, sink.send(Message::Close(None))).await;
                    debug!(%user_id, %conn_id, "outbound queue closed");
                    return;
                };
                match timeout(write_timeout, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(%user_id, %conn_id, error = %err, "socket write failed");
                        return;
                    }
                    Err(_) => {
                        warn!(%user_id, %conn_id, "socket write stalled; closing connection");
                        return;
                    }
                }
            }
            _ = ping.tick() => {
                match timeout(write_timeout, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(%user_id, %conn_id, error = %err, "ping failed");
                        return;
                    }
                    Err(_) => {
                        warn!(%user_id, %conn_id, "ping stalled; closing connection");
                        return;
                    }
                }
            }
        }
    }
}

async fn read_loop<R, E>(stream: &mut R, user_id: UserId, conn_id: ConnectionId, ctx: &ConnectionContext)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(incoming) = stream.next().await {
        let text = match incoming {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return,
            Ok(_) => continue,
            Err(err) => {
                debug!(%user_id, %conn_id, error = %err, "socket read failed");
                return;
            }
        };

        match Event::decode_client(&text, user_id, Utc::now()) {
            Ok(event) => handle_event(event, user_id, conn_id, ctx).await,
            Err(err) => debug!(%user_id, %conn_id, error = %err, "skipping client frame"),
        }
    }
}

async fn handle_event(event: Event, user_id: UserId, conn_id: ConnectionId, ctx: &ConnectionContext) {
    match event {
        Event::Join { chat_id } => match ctx.directory.is_member(chat_id, user_id).await {
            Ok(true) => ctx.dispatcher.join(user_id, conn_id, chat_id).await,
            Ok(false) => warn!(%user_id, %chat_id, "join refused: not a chat member"),
            Err(err) => warn!(%user_id, %chat_id, error = %err, "membership lookup failed"),
        },
        Event::Leave { chat_id } => ctx.dispatcher.leave(user_id, conn_id, chat_id).await,
        Event::ChatMessage(mut message) => match ctx.saver.save_message(&message).await {
            Ok(saved) => {
                message.restamp(&saved);
                ctx.dispatcher.publish(Event::ChatMessage(message)).await;
            }
            Err(err) => warn!(
                %user_id,
                chat_id = %message.chat_id,
                error = %err,
                "dropping message that could not be saved"
            ),
        },
        event @ (Event::Typing { .. } | Event::ReadReceipt(_)) => {
            ctx.dispatcher.relay(event, user_id, conn_id).await;
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
