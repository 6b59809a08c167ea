//! Presence registry and live room table.
//!
//! Only the dispatcher's control task mutates a [`Registry`]; everyone else
//! reads it through the dispatcher's read lock.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use shared::domain::{ChatId, UserId};
use tokio::sync::mpsc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Registry view of a live connection: who it belongs to, where its writer
/// reads from and which room it is watching.
#[derive(Debug)]
pub struct ConnectionEntry {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<String>,
    current_room: Option<ChatId>,
}

impl ConnectionEntry {
    pub(crate) fn new(user_id: UserId, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::next(),
            user_id,
            outbound,
            current_room: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn current_room(&self) -> Option<ChatId> {
        self.current_room
    }

    pub(crate) fn try_push(&self, frame: String) -> Result<(), mpsc::error::TrySendError<String>> {
        self.outbound.try_send(frame)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    connections: HashMap<UserId, ConnectionEntry>,
    rooms: HashMap<ChatId, HashSet<UserId>>,
}

impl Registry {
    /// Registers `entry`, returning the connection it supersedes, already
    /// detached from its room.
    pub(crate) fn insert(&mut self, entry: ConnectionEntry) -> Option<ConnectionEntry> {
        let previous = self.connections.insert(entry.user_id, entry);
        if let Some(previous) = &previous {
            if let Some(room) = previous.current_room {
                self.remove_from_room(room, previous.user_id);
            }
        }
        previous
    }

    /// Removes the user's entry only if it is still connection `id`.
    pub(crate) fn remove(&mut self, user_id: UserId, id: ConnectionId) -> Option<ConnectionEntry> {
        if self.connections.get(&user_id).map(ConnectionEntry::id) != Some(id) {
            return None;
        }
        let entry = self.connections.remove(&user_id)?;
        if let Some(room) = entry.current_room {
            self.remove_from_room(room, user_id);
        }
        Some(entry)
    }

    /// Moves the connection into `chat_id`'s live view, leaving whatever room
    /// it watched before. Returns false for a stale or unknown connection.
    pub(crate) fn join(&mut self, user_id: UserId, id: ConnectionId, chat_id: ChatId) -> bool {
        let Some(entry) = self.connections.get_mut(&user_id) else {
            return false;
        };
        if entry.id != id {
            return false;
        }
        let previous = entry.current_room.replace(chat_id);
        if let Some(previous) = previous.filter(|room| *room != chat_id) {
            self.remove_from_room(previous, user_id);
        }
        self.rooms.entry(chat_id).or_default().insert(user_id);
        true
    }

    /// Leaves `chat_id` if, and only if, it is the connection's current room.
    pub(crate) fn leave(&mut self, user_id: UserId, id: ConnectionId, chat_id: ChatId) -> bool {
        let Some(entry) = self.connections.get_mut(&user_id) else {
            return false;
        };
        if entry.id != id || entry.current_room != Some(chat_id) {
            return false;
        }
        entry.current_room = None;
        self.remove_from_room(chat_id, user_id);
        true
    }

    pub(crate) fn get(&self, user_id: UserId) -> Option<&ConnectionEntry> {
        self.connections.get(&user_id)
    }

    pub(crate) fn contains(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    /// Connections watching `chat_id`, minus `exclude`.
    pub(crate) fn room_targets(
        &self,
        chat_id: ChatId,
        exclude: Option<UserId>,
    ) -> impl Iterator<Item = &ConnectionEntry> + '_ {
        self.rooms
            .get(&chat_id)
            .into_iter()
            .flatten()
            .filter(move |user_id| Some(**user_id) != exclude)
            .filter_map(|user_id| self.connections.get(user_id))
    }

    pub(crate) fn room_members(&self, chat_id: ChatId) -> Vec<UserId> {
        let mut members: Vec<UserId> = self
            .rooms
            .get(&chat_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    fn remove_from_room(&mut self, chat_id: ChatId, user_id: UserId) {
        if let Some(members) = self.rooms.get_mut(&chat_id) {
            members.remove(&user_id);
            if members.is_empty() {
                self.rooms.remove(&chat_id);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
