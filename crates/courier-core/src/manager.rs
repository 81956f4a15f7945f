//! Room manager.
//!
//! The manager owns every room on this process, keyed by room ID. The room
//! map is a sharded concurrent map, so looking up room B never waits on a
//! membership change in room A beyond a brief shard lock.
//!
//! Lock order is always map shard, then room members. Nothing takes a room
//! lock and then touches the map.

use crate::member::Member;
use crate::room::{validate_identifier, Room, RoomError, RoomId};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of removing a member through the manager.
#[derive(Debug, Default)]
pub struct LeaveOutcome {
    /// The room the member was in, if it existed.
    pub room: Option<Arc<Room>>,
    /// The removed member, if it was present.
    pub member: Option<Arc<Member>>,
    /// Whether the room was deleted because it became empty.
    pub room_deleted: bool,
}

/// Manager statistics.
#[derive(Debug, Clone)]
pub struct RoomStats {
    /// Number of live rooms.
    pub room_count: usize,
    /// Number of members across all rooms.
    pub member_count: usize,
}

/// Owns all rooms of this process.
#[derive(Debug, Default)]
pub struct RoomManager {
    rooms: DashMap<RoomId, Arc<Room>>,
}

impl RoomManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        info!("Creating room manager");
        Self::default()
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Get a room by ID.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::RoomNotFound`] if there is no such room.
    pub fn get_room(&self, room_id: &str) -> Result<Arc<Room>, RoomError> {
        self.rooms
            .get(room_id)
            .map(|room| Arc::clone(room.value()))
            .ok_or_else(|| RoomError::RoomNotFound(room_id.to_string()))
    }

    /// Create a room, replacing any room with the same ID.
    ///
    /// Callers that must not clobber an existing room should use
    /// [`RoomManager::join`] instead.
    pub fn add_new_room(&self, room_id: &str) -> Arc<Room> {
        let room = Arc::new(Room::new(room_id));
        self.rooms.insert(room_id.to_string(), Arc::clone(&room));
        debug!(room = %room_id, "Room created");
        room
    }

    /// Delete a room. Deleting an absent room is a no-op.
    pub fn delete_room(&self, room_id: &str) {
        if self.rooms.remove(room_id).is_some() {
            debug!(room = %room_id, "Room deleted");
        }
    }

    /// Delete a room only if it currently has no members.
    ///
    /// Returns `true` if the room was deleted.
    pub fn remove_if_empty(&self, room_id: &str) -> bool {
        let removed = self
            .rooms
            .remove_if(room_id, |_, room| room.is_empty())
            .is_some();
        if removed {
            debug!(room = %room_id, "Deleted empty room");
        }
        removed
    }

    /// Add a member to a room, creating the room on first reference.
    ///
    /// The lookup, creation and insertion happen under the room's map entry,
    /// so a concurrent last-member departure cannot delete the room between
    /// them.
    ///
    /// # Errors
    ///
    /// Returns an error if the room ID is invalid or the member name is
    /// already taken in the room.
    pub fn join(&self, room_id: &str, member: Member) -> Result<(Arc<Room>, Arc<Member>), RoomError> {
        validate_identifier(room_id).map_err(RoomError::InvalidIdentifier)?;

        let entry = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            debug!(room = %room_id, "Creating new room");
            Arc::new(Room::new(room_id))
        });
        let member = entry.add_member(member)?;
        let room = Arc::clone(entry.value());
        drop(entry);

        Ok((room, member))
    }

    /// Remove a member and delete its room if that left it empty.
    pub fn leave(&self, room_id: &str, member_id: &str) -> LeaveOutcome {
        let Ok(room) = self.get_room(room_id) else {
            return LeaveOutcome::default();
        };

        let member = room.delete_member(member_id);
        let room_deleted = self.remove_if_empty(room_id);

        LeaveOutcome {
            room: Some(room),
            member,
            room_deleted,
        }
    }

    /// Number of rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Look up a member of a room.
    #[must_use]
    pub fn find_member(&self, room_id: &str, member_id: &str) -> Option<Arc<Member>> {
        self.get_room(room_id).ok()?.member(member_id)
    }

    /// Check whether `member_id` is already present in `room_id`.
    #[must_use]
    pub fn is_member_exists(&self, room_id: &str, member_id: &str) -> bool {
        self.find_member(room_id, member_id).is_some()
    }

    /// Manager statistics.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|e| Arc::clone(e.value())).collect();
        RoomStats {
            room_count: rooms.len(),
            member_count: rooms.iter().map(|r| r.len()).sum(),
        }
    }
}
