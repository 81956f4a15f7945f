//! # courier-core
//!
//! Rooms, members and socket topic dispatch for Courier.
//!
//! - **Member** - A connected client and its bounded outbound queue
//! - **Room** - A named group of members with direct and broadcast sends
//! - **Manager** - Owns every room of the process
//! - **Registry** - Routes inbound socket frames to topic handlers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌───────────────┐     ┌─────────────┐
//! │  Connection │────▶│ TopicRegistry │────▶│   Handler   │
//! └─────────────┘     └───────────────┘     └─────────────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌─────────────┐     ┌─────────────┐       ┌─────────────┐
//! │ RoomManager │────▶│    Room     │──────▶│   Member    │
//! └─────────────┘     └─────────────┘       └─────────────┘
//! ```

pub mod manager;
pub mod member;
pub mod registry;
pub mod room;

pub use manager::{LeaveOutcome, RoomManager, RoomStats};
pub use member::{Member, MemberError, MemberId, MessageBody, Outbound, DEFAULT_MEMBER_BUFFER};
pub use registry::{
    handler_fn, DispatchError, FnHandler, HandlerFailure, SocketContext,
    SocketHandlerError, TopicHandler, TopicRegistry,
};
pub use room::{validate_identifier, BroadcastError, Room, RoomError, RoomId};
