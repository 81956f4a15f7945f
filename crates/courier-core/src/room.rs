//! Rooms group connected members that can be addressed as a unit.
//!
//! Each room guards its member map with its own lock. The lock is only held
//! to read or mutate the map; sends happen on a snapshot after it is
//! released.

use crate::member::{Member, MemberError, MemberId, MessageBody, Outbound};
use courier_protocol::frames::SystemMessage;
use courier_protocol::topics;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, trace};

/// Maximum room or member identifier length.
pub const MAX_IDENTIFIER_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Validate a room or member identifier.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_identifier(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("identifier cannot be empty");
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err("identifier too long");
    }
    if name.chars().any(char::is_control) {
        return Err("identifier contains control characters");
    }
    Ok(())
}

/// Room and membership errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Invalid room or member identifier.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(&'static str),

    /// Room not found.
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    /// The member name is already taken in this room.
    #[error("member already exists: {member} in room {room}")]
    MemberAlreadyExists {
        /// Room the join was attempted on.
        room: RoomId,
        /// Conflicting member name.
        member: MemberId,
    },

    /// No such member in this room.
    #[error("member not found: {member} in room {room}")]
    MemberNotFound {
        /// Room that was searched.
        room: RoomId,
        /// Missing member name.
        member: MemberId,
    },

    /// Writing to the member failed.
    #[error(transparent)]
    Member(#[from] MemberError),

    /// Some members of a broadcast could not be written to.
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

/// Outcome of a best-effort broadcast in which some members failed.
#[derive(Debug, Error)]
#[error(
    "broadcast reached {delivered} member(s), failed for {}: {}",
    .failures.len(),
    describe_failures(.failures)
)]
pub struct BroadcastError {
    /// Members that received the message.
    pub delivered: usize,
    /// Members that could not be written to.
    pub failures: Vec<(MemberId, MemberError)>,
}

fn describe_failures(failures: &[(MemberId, MemberError)]) -> String {
    failures
        .iter()
        .map(|(id, err)| format!("{id}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A named group of members.
pub struct Room {
    id: RoomId,
    members: RwLock<HashMap<MemberId, Arc<Member>>>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("members", &self.len())
            .finish()
    }
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(id: impl Into<RoomId>) -> Self {
        Self {
            id: id.into(),
            members: RwLock::new(HashMap::new()),
        }
    }

    /// The room identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check if a member exists.
    #[must_use]
    pub fn is_member_exists(&self, member_id: &str) -> bool {
        self.read().contains_key(member_id)
    }

    /// Get a member by ID.
    #[must_use]
    pub fn member(&self, member_id: &str) -> Option<Arc<Member>> {
        self.read().get(member_id).cloned()
    }

    /// Add a member.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::MemberAlreadyExists`] without touching the room
    /// if the name is taken.
    pub fn add_member(&self, member: Member) -> Result<Arc<Member>, RoomError> {
        validate_identifier(member.id()).map_err(RoomError::InvalidIdentifier)?;

        let mut members = self.write();
        if members.contains_key(member.id()) {
            return Err(RoomError::MemberAlreadyExists {
                room: self.id.clone(),
                member: member.id().to_string(),
            });
        }

        let member = Arc::new(member);
        members.insert(member.id().to_string(), Arc::clone(&member));
        debug!(room = %self.id, member = %member.id(), members = members.len(), "Member added");
        Ok(member)
    }

    /// Remove a member. Removing an absent member is a no-op.
    ///
    /// Returns the removed member, if it was present.
    pub fn delete_member(&self, member_id: &str) -> Option<Arc<Member>> {
        let removed = self.write().remove(member_id);
        if removed.is_some() {
            debug!(room = %self.id, member = %member_id, "Member removed");
        }
        removed
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// IDs of all members.
    #[must_use]
    pub fn member_ids(&self) -> Vec<MemberId> {
        self.read().keys().cloned().collect()
    }

    /// Send a message directly to one member.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::MemberNotFound`] if the member is absent, or the
    /// member's write error.
    pub fn send_message_to(
        &self,
        member_id: &str,
        body: impl Into<MessageBody>,
    ) -> Result<(), RoomError> {
        let member = self.member(member_id).ok_or_else(|| RoomError::MemberNotFound {
            room: self.id.clone(),
            member: member_id.to_string(),
        })?;
        member.send(body)?;
        trace!(room = %self.id, member = %member_id, "Direct message queued");
        Ok(())
    }

    /// Send a server-originated message to one member.
    ///
    /// # Errors
    ///
    /// Same as [`Room::send_message_to`].
    pub fn send_system_message(
        &self,
        member_id: &str,
        kind: &str,
        message: serde_json::Value,
    ) -> Result<(), RoomError> {
        let body = MessageBody::json(&SystemMessage::new(member_id, kind, message))?;
        self.send_message_to(member_id, body)
    }

    /// Send a server-originated error to one member.
    ///
    /// # Errors
    ///
    /// Same as [`Room::send_message_to`].
    pub fn send_system_error(
        &self,
        member_id: &str,
        message: impl Into<String>,
    ) -> Result<(), RoomError> {
        self.send_system_message(member_id, topics::ERROR, message.into().into())
    }

    /// Send a message to every member.
    ///
    /// Delivery is best-effort: every member is attempted and failures are
    /// collected. Returns the number of members that received the message.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Broadcast`] listing the members that failed.
    pub fn broadcast_message(&self, body: impl Into<MessageBody>) -> Result<usize, RoomError> {
        self.broadcast_filtered(body.into(), |_| true)
    }

    /// Send a message to every member except `excluded`.
    ///
    /// # Errors
    ///
    /// Same as [`Room::broadcast_message`].
    pub fn broadcast_except(
        &self,
        excluded: &str,
        body: impl Into<MessageBody>,
    ) -> Result<usize, RoomError> {
        self.broadcast_filtered(body.into(), |id| id != excluded)
    }

    fn broadcast_filtered(
        &self,
        body: MessageBody,
        include: impl Fn(&str) -> bool,
    ) -> Result<usize, RoomError> {
        let frame = body.into_outbound()?;
        let recipients: Vec<Arc<Member>> = self
            .read()
            .values()
            .filter(|m| include(m.id()))
            .cloned()
            .collect();

        let (delivered, failures) = fan_out(&recipients, &frame);
        trace!(room = %self.id, delivered, failed = failures.len(), "Broadcast");

        if failures.is_empty() {
            Ok(delivered)
        } else {
            Err(RoomError::Broadcast(BroadcastError {
                delivered,
                failures,
            }))
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<MemberId, Arc<Member>>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<MemberId, Arc<Member>>> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fan_out(recipients: &[Arc<Member>], frame: &Outbound) -> (usize, Vec<(MemberId, MemberError)>) {
    let mut delivered = 0;
    let mut failures = Vec::new();
    for member in recipients {
        match member.send_outbound(frame.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => failures.push((member.id().to_string(), e)),
        }
    }
    (delivered, failures)
}
