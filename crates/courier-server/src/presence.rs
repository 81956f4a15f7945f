//! Bus messages about room membership and socket delivery.
//!
//! `SendWsMessage` is how any part of the system writes to a socket it does
//! not hold. Every instance consumes it in its own consumer group and only
//! the instance holding the member's connection delivers it.

use async_trait::async_trait;
use courier_bus::{
    CommandHandler, DeliveryMode, EventHandler, HandlerContext, HandlerError, HandlerRegistry,
    Message,
};
use courier_core::{MemberError, RoomError, RoomManager};
use courier_protocol::WebsocketMessage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Topic of the greeting sent to a member after it joins.
pub const WELCOME_TOPIC: &str = "welcome";

/// Deliver `payload` to `username` in `room_id`, wherever its socket lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendWsMessage {
    /// Target room.
    pub room_id: String,
    /// Target member.
    pub username: String,
    /// Frame sent to the member as JSON.
    pub payload: Value,
}

impl Message for SendWsMessage {
    const NAME: &'static str = "SendWsMessage";
}

/// A member joined a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberJoined {
    /// The room.
    pub room_id: String,
    /// The member.
    pub username: String,
}

impl Message for MemberJoined {
    const NAME: &'static str = "MemberJoined";
}

/// A member left a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberLeft {
    /// The room.
    pub room_id: String,
    /// The member.
    pub username: String,
}

impl Message for MemberLeft {
    const NAME: &'static str = "MemberLeft";
}

/// Writes [`SendWsMessage`] payloads to sockets held by this process.
#[derive(Debug)]
pub struct DeliverToSocket {
    rooms: Arc<RoomManager>,
}

impl DeliverToSocket {
    /// Create the handler.
    #[must_use]
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self { rooms }
    }
}

#[async_trait]
impl CommandHandler for DeliverToSocket {
    type Command = SendWsMessage;

    fn name(&self) -> &'static str {
        "deliver_to_socket"
    }

    fn delivery(&self) -> DeliveryMode {
        DeliveryMode::Broadcast
    }

    async fn handle(&self, _ctx: &HandlerContext, cmd: SendWsMessage) -> Result<(), HandlerError> {
        let Ok(room) = self.rooms.get_room(&cmd.room_id) else {
            debug!(room = %cmd.room_id, "Room not held by this instance, skipping");
            return Ok(());
        };

        match room.send_message_to(&cmd.username, cmd.payload) {
            Ok(()) => {
                debug!(room = %cmd.room_id, member = %cmd.username, "Socket message delivered");
                Ok(())
            }
            Err(RoomError::MemberNotFound { .. })
            | Err(RoomError::Member(MemberError::Disconnected(_))) => {
                debug!(room = %cmd.room_id, member = %cmd.username, "Member not connected here, skipping");
                Ok(())
            }
            // A full queue is worth retrying once the writer catches up.
            Err(e) => Err(HandlerError::failed(e)),
        }
    }
}

/// Greets every member that joins, through the bus.
#[derive(Debug, Default)]
pub struct GreetMember;

#[async_trait]
impl EventHandler for GreetMember {
    type Event = MemberJoined;

    fn name(&self) -> &'static str {
        "greet_member"
    }

    async fn handle(&self, ctx: &HandlerContext, event: MemberJoined) -> Result<(), HandlerError> {
        let frame = WebsocketMessage::new(
            WELCOME_TOPIC,
            json!({ "room": event.room_id, "username": event.username }),
        );
        let payload = serde_json::to_value(frame).map_err(HandlerError::failed)?;

        ctx.send(&SendWsMessage {
            room_id: event.room_id,
            username: event.username,
            payload,
        })
        .await
        .map_err(HandlerError::failed)
    }
}

/// Register the membership handlers.
pub fn register(registry: &mut HandlerRegistry, rooms: Arc<RoomManager>) {
    registry
        .add_command_handler(DeliverToSocket::new(rooms))
        .add_event_handler(GreetMember);
}
