//! Built-in socket topics.

use courier_core::{handler_fn, MessageBody, SocketContext, SocketHandlerError, TopicRegistry};
use courier_protocol::frames::SYSTEM_SENDER;
use courier_protocol::{topics, InboundFrame, WebsocketMessage};
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

/// Register `chat` and `ping`.
pub fn register(registry: &mut TopicRegistry) {
    registry
        .register(topics::CHAT, handler_fn("chat", chat))
        .register(topics::PING, handler_fn("ping", ping));
}

/// Forward a chat frame, stamped with its sender.
///
/// A frame with a `recipient` goes to that member only, one without goes to
/// every other member of the room. Frames addressed to the server are
/// dropped.
async fn chat(ctx: Arc<SocketContext>, frame: Arc<InboundFrame>) -> Result<(), SocketHandlerError> {
    let sender = ctx.member.id();
    let mut message = frame.raw().clone();
    if let Some(object) = message.as_object_mut() {
        object.insert("sender".to_string(), Value::String(sender.to_string()));
    }

    match frame.recipient() {
        Some(SYSTEM_SENDER) => {
            trace!(room = %ctx.room.id(), member = %sender, "Chat addressed to the server, ignored");
        }
        Some(recipient) if !recipient.is_empty() => {
            ctx.room.send_message_to(recipient, message)?;
        }
        _ => {
            ctx.room.broadcast_except(sender, message)?;
        }
    }
    Ok(())
}

/// Answer with a `pong` carrying the same payload.
async fn ping(ctx: Arc<SocketContext>, frame: Arc<InboundFrame>) -> Result<(), SocketHandlerError> {
    let reply = WebsocketMessage::new(topics::PONG, frame.payload().clone());
    ctx.member.send(MessageBody::json(&reply)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Member, Outbound, RoomManager};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: TopicRegistry,
        rooms: Arc<RoomManager>,
        inboxes: Vec<mpsc::Receiver<Outbound>>,
    }

    fn fixture(names: &[&str]) -> Fixture {
        let mut registry = TopicRegistry::new();
        register(&mut registry);
        let rooms = Arc::new(RoomManager::new());
        let inboxes = names
            .iter()
            .map(|name| {
                let (member, rx) = Member::channel(*name, 8);
                rooms.join("r1", member).unwrap();
                rx
            })
            .collect();
        Fixture {
            registry,
            rooms,
            inboxes,
        }
    }

    impl Fixture {
        fn ctx(&self, member: &str) -> Arc<SocketContext> {
            let room = self.rooms.get_room("r1").unwrap();
            let member = room.member(member).unwrap();
            Arc::new(SocketContext::new(room, member, Arc::clone(&self.rooms)))
        }
    }

    fn text(frame: Outbound) -> Value {
        match frame {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_direct_chat_reaches_recipient_only() {
        let mut f = fixture(&["alice", "bob", "carol"]);
        let frame = InboundFrame::parse(br#"{"topic":"chat","recipient":"bob","text":"hi"}"#).unwrap();
        f.registry.dispatch(&f.ctx("alice"), frame).await.unwrap();

        let received = text(f.inboxes[1].try_recv().unwrap());
        assert_eq!(received["sender"], "alice");
        assert_eq!(received["text"], "hi");
        assert!(f.inboxes[0].try_recv().is_err());
        assert!(f.inboxes[2].try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chat_without_recipient_reaches_others() {
        let mut f = fixture(&["alice", "bob", "carol"]);
        let frame = InboundFrame::parse(br#"{"topic":"chat","text":"all"}"#).unwrap();
        f.registry.dispatch(&f.ctx("alice"), frame).await.unwrap();

        assert!(f.inboxes[0].try_recv().is_err());
        assert_eq!(text(f.inboxes[1].try_recv().unwrap())["text"], "all");
        assert_eq!(text(f.inboxes[2].try_recv().unwrap())["sender"], "alice");
    }

    #[tokio::test]
    async fn test_chat_to_system_is_ignored() {
        let mut f = fixture(&["alice", "bob"]);
        let frame = InboundFrame::parse(br#"{"topic":"chat","recipient":"system"}"#).unwrap();
        f.registry.dispatch(&f.ctx("alice"), frame).await.unwrap();
        assert!(f.inboxes[0].try_recv().is_err());
        assert!(f.inboxes[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chat_to_absent_member_fails() {
        let f = fixture(&["alice"]);
        let frame = InboundFrame::parse(br#"{"topic":"chat","recipient":"zed"}"#).unwrap();
        let err = f.registry.dispatch(&f.ctx("alice"), frame).await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].handler, "chat");
    }

    #[tokio::test]
    async fn test_ping_echoes_payload() {
        let mut f = fixture(&["alice"]);
        let frame = InboundFrame::parse(br#"{"topic":"ping","payload":{"n":7}}"#).unwrap();
        f.registry.dispatch(&f.ctx("alice"), frame).await.unwrap();
        assert_eq!(
            text(f.inboxes[0].try_recv().unwrap()),
            json!({"topic": "pong", "payload": {"n": 7}})
        );
    }
}
