//! Connection handlers for Courier server.
//!
//! This module handles the socket lifecycle and the HTTP endpoints:
//!
//! ```text
//! upgrade ─▶ join room ─▶ read frame ─▶ dispatch ─┐
//!                ▲             ▲                  │
//!                │             └──────────────────┘
//!                │
//!           writer task ◀── member queue ◀── rooms, bus, handlers
//! ```

use crate::config::{Config, TransportKind};
use crate::identity::{Identity, IdentityError, IdentityResolver, QueryResolver};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::presence::{self, MemberJoined, MemberLeft, SendWsMessage};
use crate::topics;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_bus::{Bus, BusError, HandlerRegistry, MemoryTransport, Transport};
use courier_core::{
    Member, MessageBody, Outbound, RoomError, RoomManager, SocketContext, TopicRegistry,
};
use courier_protocol::{InboundFrame, MemberNotice, WebsocketMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a closing connection's writer may take to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors answered on the HTTP side of the server.
#[derive(Debug, Error)]
pub enum WsHandlerError {
    /// The upgrade request carried no usable identity.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The member name is taken in the room.
    #[error("{username} is already connected to room {room}")]
    AlreadyConnected {
        /// Room.
        room: String,
        /// Member name.
        username: String,
    },

    /// The bus rejected a command.
    #[error("failed to queue message: {0}")]
    Bus(#[from] BusError),
}

impl WsHandlerError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Identity(_) => StatusCode::BAD_REQUEST,
            Self::AlreadyConnected { .. } => StatusCode::CONFLICT,
            Self::Bus(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for WsHandlerError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Shared server state.
pub struct AppState {
    /// Rooms held by this process.
    pub rooms: Arc<RoomManager>,
    /// Socket topic handlers.
    pub sockets: Arc<TopicRegistry>,
    /// The command and event bus.
    pub bus: Bus,
    /// Identifies upgrade requests.
    pub resolver: Arc<dyn IdentityResolver>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state on top of a bus transport.
    #[must_use]
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let rooms = Arc::new(RoomManager::new());

        let mut handlers = HandlerRegistry::new();
        presence::register(&mut handlers, Arc::clone(&rooms));
        let bus = Bus::builder(transport)
            .registry(handlers)
            .config(config.bus_config())
            .build();

        let mut sockets = TopicRegistry::new();
        topics::register(&mut sockets);

        Self {
            rooms,
            sockets: Arc::new(sockets),
            bus,
            resolver: Arc::new(QueryResolver),
            config,
        }
    }
}

/// Build the bus transport selected by the configuration.
///
/// # Errors
///
/// Returns an error if the backend is unreachable or not compiled in.
pub async fn build_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    match config.transport.kind {
        TransportKind::Memory => Ok(Arc::new(MemoryTransport::with_max_retained(
            config.transport.max_retained,
        ))),
        TransportKind::Redis => redis_transport(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    let transport =
        courier_bus::RedisTransport::connect(&config.transport.redis_url, config.instance_id.clone())
            .await
            .with_context(|| format!("Failed to connect to {}", config.transport.redis_url))?
            .with_max_len(config.transport.stream_max_len);
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "redis"))]
async fn redis_transport(_config: &Config) -> Result<Arc<dyn Transport>> {
    anyhow::bail!("transport kind \"redis\" requires building with the `redis` feature")
}

/// Run the HTTP/WebSocket server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let transport = build_transport(&config).await?;
    let state = Arc::new(AppState::new(config, transport));
    state.bus.start().await.context("Failed to start bus")?;

    // Bind and serve
    let addr = state.config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    serve(listener, Arc::clone(&state), shutdown_signal()).await?;

    state.bus.shutdown().await.context("Failed to shut down bus")?;
    info!("Courier server stopped");
    Ok(())
}

/// Serve the application on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if accepting connections fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// The HTTP routes.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route(
            "/api/v1/rooms/:room/members/:username/messages",
            post(send_message_handler),
        )
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Queue a socket message for a member through the bus.
async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    Path((room_id, username)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, WsHandlerError> {
    debug!(room = %room_id, member = %username, "Queueing socket message");
    state
        .bus
        .send(&SendWsMessage {
            room_id,
            username,
            payload,
        })
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to send SendWsMessage");
            WsHandlerError::from(e)
        })?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Response, WsHandlerError> {
    let identity = state.resolver.resolve(&query, &headers).map_err(|e| {
        debug!(error = %e, "Rejected socket upgrade");
        WsHandlerError::from(e)
    })?;

    if state.rooms.is_member_exists(&identity.room, &identity.username) {
        warn!(room = %identity.room, member = %identity.username, "Member already exists");
        return Err(WsHandlerError::AlreadyConnected {
            room: identity.room,
            username: identity.username,
        });
    }

    Ok(ws.on_upgrade(move |socket| handle_websocket(socket, state, identity)))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let Identity { room: room_id, username } = identity;
    let (sink, mut stream) = socket.split();

    let (tx, outbound) = mpsc::channel(state.config.limits.member_buffer.max(1));
    let writer = tokio::spawn(write_loop(sink, outbound));

    let joined = state
        .rooms
        .join(&room_id, Member::new(username.clone(), tx.clone()));
    let (room, member) = match joined {
        Ok(joined) => joined,
        Err(e) => {
            // Lost a race for the name after the upgrade check.
            warn!(room = %room_id, member = %username, error = %e, "Failed to join room");
            let rejected = Member::new(username, tx);
            reply_error(&rejected, e.to_string());
            rejected.close();
            drop(rejected);
            finish_writer(writer).await;
            return;
        }
    };
    drop(tx);

    let _metrics_guard = ConnectionMetricsGuard::new();
    metrics::set_active_rooms(state.rooms.room_count());
    info!(room = %room_id, member = %username, "Member joined");

    if let Err(e) = state
        .bus
        .publish(&MemberJoined {
            room_id: room_id.clone(),
            username: username.clone(),
        })
        .await
    {
        error!(room = %room_id, member = %username, error = %e, "Failed to publish MemberJoined");
    }
    broadcast_notice(&room, &MemberNotice::joined(username.as_str()));

    let ctx = Arc::new(SocketContext::new(
        Arc::clone(&room),
        Arc::clone(&member),
        Arc::clone(&state.rooms),
    ));

    // Message processing loop
    while let Some(message) = stream.next().await {
        let data = match message {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                debug!(room = %room_id, member = %username, "Received close frame");
                break;
            }
            Err(e) => {
                warn!(room = %room_id, member = %username, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        };
        handle_frame(&state, &ctx, &data).await;
    }

    drop(ctx);
    on_disconnect(&state, &room_id, &username).await;
    member.close();
    drop(member);
    drop(room);
    finish_writer(writer).await;
}

/// Decode and dispatch one inbound frame.
async fn handle_frame(state: &AppState, ctx: &Arc<SocketContext>, data: &[u8]) {
    metrics::record_message(data.len(), "inbound");

    let limit = state.config.limits.max_message_size;
    if data.len() > limit {
        debug!(member = %ctx.member.id(), size = data.len(), limit, "Rejected oversized frame");
        reply_error(&ctx.member, format!("message exceeds {limit} bytes"));
        return;
    }

    let frame = match InboundFrame::parse(data) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(member = %ctx.member.id(), error = %e, "Rejected invalid frame");
            reply_error(&ctx.member, e.to_string());
            return;
        }
    };

    let topic = frame.topic().to_string();
    let start = Instant::now();
    let result = state.sockets.dispatch(ctx, frame).await;
    metrics::record_dispatch(start.elapsed().as_secs_f64());

    if let Err(e) = result {
        error!(room = %ctx.room.id(), member = %ctx.member.id(), topic = %topic, error = %e, "Frame handling error");
        metrics::record_dispatch_error(&topic);
        reply_error(&ctx.member, e.to_string());
    }
}

/// Remove a departed member and tell the others.
async fn on_disconnect(state: &AppState, room_id: &str, username: &str) {
    let outcome = state.rooms.leave(room_id, username);
    metrics::set_active_rooms(state.rooms.room_count());

    if outcome.room_deleted {
        info!(room = %room_id, member = %username, "Member left, room deleted");
    } else if let Some(room) = &outcome.room {
        info!(room = %room_id, member = %username, "Member left");
        broadcast_notice(room, &MemberNotice::left(username));
    }

    if let Err(e) = state
        .bus
        .publish(&MemberLeft {
            room_id: room_id.to_string(),
            username: username.to_string(),
        })
        .await
    {
        error!(room = %room_id, member = %username, error = %e, "Failed to publish MemberLeft");
    }
}

fn broadcast_notice(room: &courier_core::Room, notice: &MemberNotice) {
    let result = MessageBody::json(notice)
        .map_err(RoomError::from)
        .and_then(|body| room.broadcast_message(body));
    if let Err(e) = result {
        warn!(room = %room.id(), notice = %notice.kind, error = %e, "Broadcast failed");
    }
}

/// Queue an error frame for a member.
fn reply_error(member: &Member, message: impl Into<String>) {
    let sent = MessageBody::json(&WebsocketMessage::error(message)).and_then(|body| member.send(body));
    if let Err(e) = sent {
        debug!(member = %member.id(), error = %e, "Failed to queue error frame");
    }
}

/// Drain a member's queue into its socket.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            Outbound::Text(text) => {
                metrics::record_message(text.len(), "outbound");
                Message::Text(text)
            }
            Outbound::Binary(bytes) => {
                metrics::record_message(bytes.len(), "outbound");
                Message::Binary(bytes.to_vec())
            }
            Outbound::Close => {
                // Peer may already be gone.
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn finish_writer(mut writer: JoinHandle<()>) {
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        debug!("Socket writer did not finish in time, aborting it");
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        state: Arc<AppState>,
        stop: Option<oneshot::Sender<()>>,
        task: JoinHandle<Result<()>>,
    }

    impl TestServer {
        async fn start() -> Self {
            let config = Config {
                instance_id: "test".to_string(),
                metrics: crate::config::MetricsConfig {
                    enabled: false,
                    ..Default::default()
                },
                ..Config::default()
            };
            let state = Arc::new(AppState::new(config, Arc::new(MemoryTransport::new())));
            state.bus.start().await.unwrap();

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (stop, stopped) = oneshot::channel::<()>();
            let task = tokio::spawn(serve(listener, Arc::clone(&state), async move {
                let _ = stopped.await;
            }));

            Self {
                addr,
                state,
                stop: Some(stop),
                task,
            }
        }

        fn url(&self, query: &str) -> String {
            format!("ws://{}/api/v1/ws?{}", self.addr, query)
        }

        async fn connect(&self, room: &str, username: &str) -> Client {
            let (mut client, _) = connect_async(self.url(&format!("room={room}&username={username}")))
                .await
                .unwrap();
            // The join notice reaches the joiner too, so it marks the join as done.
            next_matching(&mut client, |frame| {
                frame["type"] == MemberNotice::JOIN && frame["member"] == username
            })
            .await;
            client
        }

        async fn stop(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            timeout(Duration::from_secs(5), self.task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            self.state.bus.shutdown().await.unwrap();
        }
    }

    async fn next_json(client: &mut Client, wait: Duration) -> Option<Value> {
        loop {
            match timeout(wait, client.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => return Some(serde_json::from_str(&text).unwrap()),
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    async fn next_matching(client: &mut Client, matches: impl Fn(&Value) -> bool) -> Value {
        loop {
            let frame = next_json(client, Duration::from_secs(5))
                .await
                .expect("timed out waiting for frame");
            if matches(&frame) {
                return frame;
            }
        }
    }

    async fn send_json(client: &mut Client, value: Value) {
        client.send(WsMessage::Text(value.to_string())).await.unwrap();
    }

    fn status_of(err: tungstenite::Error) -> StatusCode {
        match err {
            tungstenite::Error::Http(response) => {
                StatusCode::from_u16(response.status().as_u16()).unwrap()
            }
            other => panic!("expected HTTP rejection, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_direct_chat_reaches_only_recipient() {
        let server = TestServer::start().await;
        let mut alice = server.connect("r1", "alice").await;
        let mut bob = server.connect("r1", "bob").await;

        send_json(
            &mut alice,
            json!({"topic": "chat", "recipient": "bob", "text": "hello"}),
        )
        .await;

        let chat = next_matching(&mut bob, |frame| frame["topic"] == "chat").await;
        assert_eq!(chat["text"], "hello");
        assert_eq!(chat["sender"], "alice");

        // Alice hears bob join and her welcome but never her own chat.
        while let Some(frame) = next_json(&mut alice, Duration::from_millis(300)).await {
            assert_ne!(frame["topic"], "chat");
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_last_member_leaving_deletes_room() {
        let server = TestServer::start().await;
        let mut alice = server.connect("r2", "alice").await;
        assert!(server.state.rooms.room_exists("r2"));

        alice.close(None).await.unwrap();
        drop(alice);

        let rooms = Arc::clone(&server.state.rooms);
        timeout(Duration::from_secs(5), async move {
            while rooms.get_room("r2").is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("room was not deleted");
        assert!(matches!(
            server.state.rooms.get_room("r2"),
            Err(RoomError::RoomNotFound(_))
        ));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_remaining_members_hear_departure() {
        let server = TestServer::start().await;
        let alice = server.connect("r3", "alice").await;
        let mut bob = server.connect("r3", "bob").await;

        drop(alice);
        let notice = next_matching(&mut bob, |frame| frame["type"] == MemberNotice::LEFT).await;
        assert_eq!(notice["member"], "alice");
        assert!(server.state.rooms.room_exists("r3"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_username_is_rejected() {
        let server = TestServer::start().await;
        let _alice = server.connect("r4", "alice").await;

        let err = connect_async(server.url("room=r4&username=alice"))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::CONFLICT);

        // The same name in another room is fine.
        let _other = server.connect("r5", "alice").await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_missing_identity_is_rejected() {
        let server = TestServer::start().await;
        let err = connect_async(server.url("room=r6")).await.unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_frames_get_error_frames() {
        let server = TestServer::start().await;
        let mut alice = server.connect("r7", "alice").await;

        alice.send(WsMessage::Text("not json".into())).await.unwrap();
        let error = next_matching(&mut alice, |frame| frame["topic"] == "error").await;
        assert!(error["payload"]["message"].is_string());

        send_json(&mut alice, json!({"payload": 1})).await;
        next_matching(&mut alice, |frame| frame["topic"] == "error").await;

        // Unknown topics are ignored; the ping after it is still answered.
        send_json(&mut alice, json!({"topic": "nobody-handles-this"})).await;
        send_json(&mut alice, json!({"topic": "ping", "payload": "x"})).await;
        let pong = next_matching(&mut alice, |frame| {
            frame["topic"] == "pong" || frame["topic"] == "error"
        })
        .await;
        assert_eq!(pong, json!({"topic": "pong", "payload": "x"}));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let server = TestServer::start().await;
        let mut alice = server.connect("r8", "alice").await;

        let limit = server.state.config.limits.max_message_size;
        let big = json!({"topic": "ping", "payload": "a".repeat(limit)});
        send_json(&mut alice, big).await;
        let error = next_matching(&mut alice, |frame| frame["topic"] == "error").await;
        assert!(error["payload"]["message"]
            .as_str()
            .unwrap()
            .contains("exceeds"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_http_message_is_delivered_through_bus() {
        let server = TestServer::start().await;
        let mut bob = server.connect("r9", "bob").await;

        let body = json!({"topic": "note", "payload": "from http"}).to_string();
        let request = format!(
            "POST /api/v1/rooms/r9/members/bob/messages HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            server.addr,
            body.len(),
            body
        );
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 202"), "{response}");

        let note = next_matching(&mut bob, |frame| frame["topic"] == "note").await;
        assert_eq!(note["payload"], "from http");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_health() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            WsHandlerError::Identity(IdentityError::Missing("room")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WsHandlerError::AlreadyConnected {
                room: "r".into(),
                username: "u".into()
            }
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            WsHandlerError::Bus(BusError::ShutDown).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
