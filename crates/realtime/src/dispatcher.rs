//! The hub: one control task owns every registry mutation.
//!
//! Register, unregister, join, leave, publish and evict are commands on a
//! bounded queue consumed in order by a single task, so they never interleave.
//! `is_present` and `send_direct` run on the caller's task and only take the
//! registry's read lock.

use std::sync::Arc;

use shared::domain::{ChatId, UserId};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot, RwLock,
};
use tracing::{debug, error, info, warn};

use crate::{
    event::Event,
    ports::PresenceOracle,
    registry::{ConnectionEntry, ConnectionId, Registry},
};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Pending register/unregister/publish commands before callers wait.
    pub command_capacity: usize,
    /// Frames buffered per connection before it is evicted as unresponsive.
    pub outbound_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command_capacity: 1024,
            outbound_capacity: 256,
        }
    }
}

enum Command {
    Register(ConnectionEntry),
    Unregister {
        user_id: UserId,
        conn_id: ConnectionId,
    },
    Join {
        user_id: UserId,
        conn_id: ConnectionId,
        chat_id: ChatId,
    },
    Leave {
        user_id: UserId,
        conn_id: ConnectionId,
        chat_id: ChatId,
    },
    Publish {
        event: Event,
        exclude: Option<UserId>,
    },
    Relay {
        event: Event,
        sender: UserId,
        conn_id: ConnectionId,
    },
    Evict {
        user_id: UserId,
        conn_id: ConnectionId,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct Dispatcher {
    commands: mpsc::Sender<Command>,
    registry: Arc<RwLock<Registry>>,
    external_presence: Option<Arc<dyn PresenceOracle>>,
    outbound_capacity: usize,
}

impl Dispatcher {
    /// Starts the control task on the current runtime.
    pub fn spawn(
        config: DispatcherConfig,
        external_presence: Option<Arc<dyn PresenceOracle>>,
    ) -> Self {
        let (commands, receiver) = mpsc::channel(config.command_capacity.max(1));
        let registry = Arc::new(RwLock::new(Registry::default()));
        let control = ControlLoop {
            registry: Arc::clone(&registry),
            commands: receiver,
        };
        tokio::spawn(control.run());

        Self {
            commands,
            registry,
            external_presence,
            outbound_capacity: config.outbound_capacity.max(1),
        }
    }

    /// Creates the registry entry and outbound queue for a new connection.
    /// Nothing is visible to other users until the entry is registered.
    pub fn open_connection(&self, user_id: UserId) -> (ConnectionEntry, mpsc::Receiver<String>) {
        let (outbound, receiver) = mpsc::channel(self.outbound_capacity);
        (ConnectionEntry::new(user_id, outbound), receiver)
    }

    /// Registers a connection. A previous connection of the same user is
    /// superseded and its outbound queue closed.
    pub async fn register(&self, entry: ConnectionEntry) {
        self.submit(Command::Register(entry)).await;
    }

    pub async fn unregister(&self, user_id: UserId, conn_id: ConnectionId) {
        self.submit(Command::Unregister { user_id, conn_id }).await;
    }

    pub async fn join(&self, user_id: UserId, conn_id: ConnectionId, chat_id: ChatId) {
        self.submit(Command::Join {
            user_id,
            conn_id,
            chat_id,
        })
        .await;
    }

    pub async fn leave(&self, user_id: UserId, conn_id: ConnectionId, chat_id: ChatId) {
        self.submit(Command::Leave {
            user_id,
            conn_id,
            chat_id,
        })
        .await;
    }

    /// Fans `event` out to every connection watching its chat.
    pub async fn publish(&self, event: Event) {
        self.submit(Command::Publish {
            event,
            exclude: None,
        })
        .await;
    }

    /// Fans a client signal (typing, read receipt) out to the rest of its
    /// room. Dropped unless `conn_id` is the sender's registered connection
    /// and it is currently watching the event's chat.
    pub async fn relay(&self, event: Event, sender: UserId, conn_id: ConnectionId) {
        self.submit(Command::Relay {
            event,
            sender,
            conn_id,
        })
        .await;
    }

    /// Pushes `event` to one user's connection without going through the
    /// control task. Returns whether the frame was queued.
    pub async fn send_direct(&self, user_id: UserId, event: &Event) -> bool {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(err) => {
                error!(%user_id, error = %err, "failed to encode direct event");
                return false;
            }
        };

        let saturated = {
            let registry = self.registry.read().await;
            let Some(entry) = registry.get(user_id) else {
                return false;
            };
            match entry.try_push(frame) {
                Ok(()) => return true,
                Err(TrySendError::Closed(_)) => return false,
                Err(TrySendError::Full(_)) => entry.id(),
            }
        };

        warn!(%user_id, conn_id = %saturated, "direct send hit a full outbound queue");
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let _ = commands
                .send(Command::Evict {
                    user_id,
                    conn_id: saturated,
                })
                .await;
        });
        false
    }

    /// Local registry first, then the external presence check.
    pub async fn is_present(&self, user_id: UserId) -> bool {
        if self.is_locally_present(user_id).await {
            return true;
        }
        match &self.external_presence {
            Some(oracle) => oracle.is_externally_present(user_id).await,
            None => false,
        }
    }

    pub async fn is_locally_present(&self, user_id: UserId) -> bool {
        self.registry.read().await.contains(user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn room_members(&self, chat_id: ChatId) -> Vec<UserId> {
        self.registry.read().await.room_members(chat_id)
    }

    /// Resolves once every command submitted before it has been applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        self.submit(Command::Flush(ack)).await;
        let _ = done.await;
    }

    async fn submit(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            warn!("dispatcher control task has stopped; command dropped");
        }
    }
}

struct ControlLoop {
    registry: Arc<RwLock<Registry>>,
    commands: mpsc::Receiver<Command>,
}

impl ControlLoop {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.apply(command).await;
        }
        debug!("dispatcher control task stopped");
    }

    async fn apply(&self, command: Command) {
        match command {
            Command::Register(entry) => {
                let (user_id, conn_id) = (entry.user_id(), entry.id());
                let (superseded, total) = {
                    let mut registry = self.registry.write().await;
                    let superseded = registry.insert(entry);
                    (superseded, registry.len())
                };
                if let Some(superseded) = superseded {
                    info!(
                        %user_id,
                        conn_id = %superseded.id(),
                        "closing superseded connection"
                    );
                }
                info!(%user_id, %conn_id, total, "connection registered");
            }
            Command::Unregister { user_id, conn_id } => {
                let (removed, total) = {
                    let mut registry = self.registry.write().await;
                    let removed = registry.remove(user_id, conn_id);
                    (removed, registry.len())
                };
                if removed.is_some() {
                    info!(%user_id, %conn_id, total, "connection unregistered");
                }
            }
            Command::Join {
                user_id,
                conn_id,
                chat_id,
            } => {
                if self.registry.write().await.join(user_id, conn_id, chat_id) {
                    debug!(%user_id, %chat_id, "joined room");
                } else {
                    debug!(%user_id, %conn_id, %chat_id, "join ignored for stale connection");
                }
            }
            Command::Leave {
                user_id,
                conn_id,
                chat_id,
            } => {
                if self.registry.write().await.leave(user_id, conn_id, chat_id) {
                    debug!(%user_id, %chat_id, "left room");
                }
            }
            Command::Publish { event, exclude } => self.fan_out(&event, exclude).await,
            Command::Relay {
                event,
                sender,
                conn_id,
            } => {
                let chat_id = event.chat_id();
                let watching = self.registry.read().await.get(sender).is_some_and(|entry| {
                    entry.id() == conn_id && entry.current_room() == Some(chat_id)
                });
                if watching {
                    self.fan_out(&event, Some(sender)).await;
                } else {
                    warn!(
                        user_id = %sender,
                        %conn_id,
                        %chat_id,
                        "dropping signal for a room the sender is not watching"
                    );
                }
            }
            Command::Evict { user_id, conn_id } => {
                if self.registry.write().await.remove(user_id, conn_id).is_some() {
                    warn!(%user_id, %conn_id, "evicted unresponsive connection");
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    async fn fan_out(&self, event: &Event, exclude: Option<UserId>) {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(err) => {
                error!(error = %err, "failed to encode event");
                return;
            }
        };
        let chat_id = event.chat_id();

        let saturated = {
            let registry = self.registry.read().await;
            let mut saturated = Vec::new();
            let mut delivered = 0usize;
            for entry in registry.room_targets(chat_id, exclude) {
                match entry.try_push(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => saturated.push((entry.user_id(), entry.id())),
                    // Writer already gone; its reader unregisters shortly.
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            debug!(%chat_id, delivered, "event fanned out");
            saturated
        };

        if saturated.is_empty() {
            return;
        }
        let mut registry = self.registry.write().await;
        for (user_id, conn_id) in saturated {
            if registry.remove(user_id, conn_id).is_some() {
                warn!(%user_id, %conn_id, %chat_id, "evicted slow connection: outbound queue full");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
