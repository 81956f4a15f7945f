//! # courier-protocol
//!
//! Message definitions shared by every Courier crate.
//!
//! Two independent wire formats live here:
//!
//! - **Envelope** - the durable bus message (`name`, `payload`, `metadata`),
//!   stored by transports as versioned MessagePack
//! - **Socket frames** - the JSON frames exchanged with browser clients
//!   (`{"topic": ..., "payload": ...}`)
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::new("SendWsMessage", br#"{"room_id":"r1"}"#.to_vec())
//!     .with_metadata("sent_at", "1700000000000");
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{metadata, Envelope, EnvelopeId};
pub use frames::{
    topics, ErrorPayload, InboundFrame, MemberNotice, SystemMessage, WebsocketMessage,
};

use std::any::Any;

/// Best-effort text of a caught panic payload.
#[must_use]
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
