//! Connection and room-membership tracking.
//!
//! The [`ConnectionRegistry`] is the only shared mutable structure in
//! the relay. It owns the connection ↔ user mapping and the per-user
//! rooms, created at server start and torn down at shutdown. Mutations
//! are serialized behind one mutex so every registry operation is
//! atomic relative to concurrently handled messages; outbound sends
//! happen outside the lock through each connection's frame channel.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Opaque identifier for a live connection, assigned at accept time.
///
/// Uses UUID v7 so connection ids sort by accept order in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

struct Connection {
    /// Serialized outbound frames; the socket task drains this.
    sender: mpsc::UnboundedSender<String>,
    /// Room this connection currently belongs to, at most one.
    room: Option<String>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl Inner {
    fn remove_from_room(&mut self, id: ConnectionId, user_id: &str) {
        if let Some(members) = self.rooms.get_mut(user_id) {
            members.remove(&id);
            // Rooms exist only while occupied.
            if members.is_empty() {
                self.rooms.remove(user_id);
            }
        }
    }
}

/// Tracks live connections, their identities, and room membership.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Registry state stays consistent even if a holder panicked
        // mid-operation; recover rather than poison every later caller.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a newly accepted connection with no room membership.
    pub fn register(&self, id: ConnectionId, sender: mpsc::UnboundedSender<String>) {
        let mut inner = self.lock();
        inner.connections.insert(id, Connection { sender, room: None });
        debug!(connection_id = %id, "connection registered");
    }

    /// Add a connection to the room for `user_id`.
    ///
    /// Policy for a connection already in a different room: leave the
    /// old room first, so a connection is never in two rooms at once.
    pub fn join(&self, id: ConnectionId, user_id: &str) -> Result<(), RegistryError> {
        if user_id.is_empty() {
            return Err(RegistryError::EmptyUserId);
        }
        let mut inner = self.lock();
        let previous = match inner.connections.get_mut(&id) {
            Some(connection) => connection.room.replace(user_id.to_string()),
            None => return Err(RegistryError::UnknownConnection(id)),
        };
        match previous {
            Some(ref old) if old == user_id => return Ok(()),
            Some(old) => inner.remove_from_room(id, &old),
            None => {}
        }
        inner.rooms.entry(user_id.to_string()).or_default().insert(id);
        info!(connection_id = %id, user_id, "joined room");
        Ok(())
    }

    /// Remove a connection from the room for `user_id`.
    ///
    /// Idempotent: leaving a room the connection is not in is a no-op.
    pub fn leave(&self, id: ConnectionId, user_id: &str) -> Result<(), RegistryError> {
        if user_id.is_empty() {
            return Err(RegistryError::EmptyUserId);
        }
        let mut inner = self.lock();
        if let Some(connection) = inner.connections.get_mut(&id) {
            if connection.room.as_deref() == Some(user_id) {
                connection.room = None;
            }
        }
        let was_member = inner
            .rooms
            .get(user_id)
            .is_some_and(|members| members.contains(&id));
        inner.remove_from_room(id, user_id);
        if was_member {
            info!(connection_id = %id, user_id, "left room");
        }
        Ok(())
    }

    /// Forget a connection entirely: room membership and identity.
    ///
    /// Safe to call multiple times; later calls are no-ops.
    pub fn on_disconnect(&self, id: ConnectionId) {
        let mut inner = self.lock();
        if let Some(connection) = inner.connections.remove(&id) {
            if let Some(room) = connection.room {
                inner.remove_from_room(id, &room);
                info!(connection_id = %id, user_id = %room, "user disconnected");
            }
        }
    }

    /// Current members of the room for `user_id`.
    pub fn members_of(&self, user_id: &str) -> Vec<ConnectionId> {
        let inner = self.lock();
        inner
            .rooms
            .get(user_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of open connections, reported by the liveness probe.
    pub fn connected_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Deliver a frame to every member of a room, optionally excluding
    /// one connection (the sender, for exclusive broadcast).
    ///
    /// Returns the number of connections the frame was queued for. An
    /// empty or absent room is a no-op, not an error.
    pub fn fan_out_room(
        &self,
        user_id: &str,
        except: Option<ConnectionId>,
        frame: &str,
    ) -> usize {
        let targets: Vec<mpsc::UnboundedSender<String>> = {
            let inner = self.lock();
            match inner.rooms.get(user_id) {
                Some(members) => members
                    .iter()
                    .filter(|id| Some(**id) != except)
                    .filter_map(|id| inner.connections.get(id))
                    .map(|connection| connection.sender.clone())
                    .collect(),
                None => return 0,
            }
        };
        deliver(targets, frame)
    }

    /// Deliver a frame to every open connection, sender included.
    pub fn fan_out_all(&self, frame: &str) -> usize {
        let targets: Vec<mpsc::UnboundedSender<String>> = {
            let inner = self.lock();
            inner
                .connections
                .values()
                .map(|connection| connection.sender.clone())
                .collect()
        };
        deliver(targets, frame)
    }

    /// Drop every connection and room at shutdown.
    ///
    /// Closing the frame channels makes each socket task send a Close
    /// frame and exit.
    pub fn close_all(&self) {
        let mut inner = self.lock();
        let count = inner.connections.len();
        inner.connections.clear();
        inner.rooms.clear();
        info!(closed = count, "all connections closed");
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(targets: Vec<mpsc::UnboundedSender<String>>, frame: &str) -> usize {
    let mut delivered = 0;
    for sender in targets {
        // A send error means the socket task already exited; disconnect
        // cleanup will drop the stale entry.
        if sender.send(frame.to_string()).is_ok() {
            delivered += 1;
        }
    }
    delivered
}
