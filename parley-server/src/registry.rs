//! Thread registry for one gateway instance.
//!
//! Maintains an in-memory cache of room descriptors keyed by thread id, plus
//! the local connections attached to each room. The durable conversation lives
//! in the message store; a descriptor is evicted as soon as no local
//! connection remains attached to it.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use parley_proto::message::{ListingId, ThreadId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of room descriptors the registry will hold.
pub const MAX_REGISTRY_ROOMS: usize = 10_000;

/// Identifier of one live client connection on this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a fresh connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cached state of one conversation on this instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDescriptor {
    /// Thread key.
    pub thread_id: ThreadId,
    /// Both participants, sorted.
    pub participants: [UserId; 2],
    /// Listing of the latest message seen.
    pub listing_id: ListingId,
    /// When this descriptor was created.
    pub created_at: Timestamp,
    /// Whether at least one local connection is attached.
    pub is_active: bool,
    /// Local connections attached to the room.
    pub connections: HashSet<ConnectionId>,
}

impl RoomDescriptor {
    /// Whether `user` is one of the two participants.
    #[must_use]
    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// The participant that is not `user`.
    #[must_use]
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        match &self.participants {
            [a, b] if a == user => Some(b),
            [a, b] if b == user => Some(a),
            _ => None,
        }
    }
}

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The room does not have exactly two distinct, non-blank participants.
    #[error("a room needs exactly two distinct participants")]
    InvalidParticipants,
    /// The thread id does not match the participants.
    #[error("thread id {thread_id} does not match its participants (expected {expected})")]
    ThreadMismatch {
        /// Thread id given by the caller.
        thread_id: ThreadId,
        /// Thread id derived from the participants.
        expected: ThreadId,
    },
    /// The registry has reached its maximum capacity.
    #[error("thread registry is full (max {MAX_REGISTRY_ROOMS} rooms)")]
    CapacityReached,
    /// The specified room was not found.
    #[error("room {0} not found")]
    RoomNotFound(ThreadId),
}

/// In-memory directory of room descriptors.
///
/// Thread-safe via [`RwLock`]; no lock is held across an `.await`.
#[derive(Debug)]
pub struct ThreadRegistry {
    rooms: RwLock<HashMap<ThreadId, RoomDescriptor>>,
    capacity: usize,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    /// Creates a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MAX_REGISTRY_ROOMS)
    }

    /// Creates a registry that holds at most `capacity` descriptors.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Thread key of a pair of users.
    #[must_use]
    pub fn resolve_thread_id(a: &UserId, b: &UserId) -> ThreadId {
        ThreadId::for_participants(a, b)
    }

    /// Returns the descriptor for `thread_id`, creating it if needed.
    ///
    /// The second value is `true` when the descriptor was newly created.
    /// Repeated calls never duplicate state; the listing is updated to the
    /// latest value.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidParticipants`] unless `participants`
    /// holds two distinct non-blank ids, [`RegistryError::ThreadMismatch`]
    /// if `thread_id` is not their thread key, and
    /// [`RegistryError::CapacityReached`] if no inactive descriptor can be
    /// evicted to make room.
    pub fn create_or_get_room(
        &self,
        thread_id: &ThreadId,
        participants: &[UserId],
        listing_id: &ListingId,
    ) -> Result<(RoomDescriptor, bool), RegistryError> {
        let [a, b] = participants else {
            return Err(RegistryError::InvalidParticipants);
        };
        if a == b || a.is_blank() || b.is_blank() {
            return Err(RegistryError::InvalidParticipants);
        }
        let expected = Self::resolve_thread_id(a, b);
        if &expected != thread_id {
            return Err(RegistryError::ThreadMismatch {
                thread_id: thread_id.clone(),
                expected,
            });
        }

        let mut rooms = self.rooms.write();
        if let Some(room) = rooms.get_mut(thread_id) {
            room.listing_id = listing_id.clone();
            return Ok((room.clone(), false));
        }

        if rooms.len() >= self.capacity {
            let idle = rooms
                .iter()
                .filter(|(_, room)| !room.is_active)
                .min_by_key(|(_, room)| room.created_at)
                .map(|(id, _)| id.clone());
            match idle {
                Some(id) => {
                    rooms.remove(&id);
                }
                None => return Err(RegistryError::CapacityReached),
            }
        }

        let mut sorted = [a.clone(), b.clone()];
        sorted.sort();
        let room = RoomDescriptor {
            thread_id: thread_id.clone(),
            participants: sorted,
            listing_id: listing_id.clone(),
            created_at: Timestamp::now(),
            is_active: false,
            connections: HashSet::new(),
        };
        rooms.insert(thread_id.clone(), room.clone());
        drop(rooms);

        tracing::debug!(thread_id = %thread_id, "room descriptor created");
        Ok((room, true))
    }

    /// Attaches a local connection to a room.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::RoomNotFound`] if the room is not cached.
    pub fn attach(&self, thread_id: &ThreadId, conn: ConnectionId) -> Result<(), RegistryError> {
        let mut rooms = self.rooms.write();
        let room = rooms
            .get_mut(thread_id)
            .ok_or_else(|| RegistryError::RoomNotFound(thread_id.clone()))?;
        room.connections.insert(conn);
        room.is_active = true;
        Ok(())
    }

    /// Detaches a connection from every room it was attached to.
    ///
    /// Returns the rooms it was attached to (as they were before detaching).
    /// Rooms left without any local connection are evicted.
    pub fn detach_connection(&self, conn: ConnectionId) -> Vec<RoomDescriptor> {
        let mut rooms = self.rooms.write();
        let mut left = Vec::new();
        rooms.retain(|_, room| {
            if room.connections.contains(&conn) {
                left.push(room.clone());
                room.connections.remove(&conn);
            }
            room.is_active = !room.connections.is_empty();
            room.is_active
        });
        drop(rooms);
        left
    }

    /// Returns the descriptor for a room, if it is cached.
    #[must_use]
    pub fn get(&self, thread_id: &ThreadId) -> Option<RoomDescriptor> {
        self.rooms.read().get(thread_id).cloned()
    }

    /// Whether `conn` is attached to `thread_id`.
    #[must_use]
    pub fn is_attached(&self, thread_id: &ThreadId, conn: ConnectionId) -> bool {
        self.rooms
            .read()
            .get(thread_id)
            .is_some_and(|room| room.connections.contains(&conn))
    }

    /// Every room `conn` is attached to.
    #[must_use]
    pub fn rooms_for_connection(&self, conn: ConnectionId) -> Vec<RoomDescriptor> {
        self.rooms
            .read()
            .values()
            .filter(|room| room.connections.contains(&conn))
            .cloned()
            .collect()
    }

    /// Number of cached descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.read().len()
    }

    /// Whether no descriptor is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.read().is_empty()
    }
}
