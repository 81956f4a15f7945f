//! Typed bus messages.

use courier_protocol::Envelope;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A command or event carried by the bus.
///
/// `NAME` is the logical type name. It doubles as the topic the message is
/// published to and the routing key handlers subscribe with.
///
/// ```rust
/// use courier_bus::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct MemberJoined {
///     room_id: String,
///     username: String,
/// }
///
/// impl Message for MemberJoined {
///     const NAME: &'static str = "MemberJoined";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical type name and topic.
    const NAME: &'static str;
}

/// Marshal a message into a fresh envelope with a JSON payload.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn marshal<M: Message>(message: &M) -> Result<Envelope, serde_json::Error> {
    Ok(Envelope::new(M::NAME, serde_json::to_vec(message)?))
}

/// Unmarshal an envelope's JSON payload.
///
/// # Errors
///
/// Returns an error if the payload is not a valid `M`.
pub fn unmarshal<M: Message>(envelope: &Envelope) -> Result<M, serde_json::Error> {
    serde_json::from_slice(envelope.payload())
}
