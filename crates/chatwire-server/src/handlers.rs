//! Connection handlers for the Chatwire server.
//!
//! Each WebSocket gets one task. The task waits for `connect`, registers
//! the connection with the hub, then multiplexes three sources: frames
//! from the client, events from the connection's outbox, and the
//! heartbeat. An overflowing outbox ends the task like any disconnect.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::persist;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use chatwire_core::{
    CallError, ChatStore, ConnectionId, Hub, LoggingStore, PublishError, RegistryError,
    ServerEvent, StoreWrite,
};
use chatwire_protocol::{codec, error_codes, Frame, ProtocolError, PROTOCOL_VERSION};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Config,
    pub store: Arc<dyn ChatStore>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn ChatStore>) -> Self {
        Self {
            hub: Arc::new(Hub::new(config.hub_config())),
            config,
            store,
        }
    }
}

/// Build the HTTP routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let store: Arc<dyn ChatStore> = Arc::new(LoggingStore);
    let state = Arc::new(AppState::new(config.clone(), Arc::clone(&store)));
    let _writer = persist::spawn_store_writer(&state.hub, store)
        .context("Store feed already taken")?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = build_router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Chatwire server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Hub statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hub.stats())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max_size = state.config.limits.max_message_size;
    ws.max_message_size(max_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// How frames are encoded for one connection, chosen by its `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    MessagePack,
    Json,
}

impl WireFormat {
    fn encode(self, frame: &Frame) -> Result<Message, ProtocolError> {
        Ok(match self {
            WireFormat::MessagePack => Message::Binary(codec::encode(frame)?.to_vec()),
            WireFormat::Json => Message::Text(codec::encode_json(frame)?),
        })
    }

    fn encode_event(self, event: &ServerEvent) -> Result<Message, ProtocolError> {
        Ok(match self {
            WireFormat::MessagePack => Message::Binary(event.encoded()?.to_vec()),
            WireFormat::Json => Message::Text(codec::encode_json(&event.to_frame())?),
        })
    }
}

fn message_len(message: &Message) -> usize {
    match message {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    }
}

/// One inbound WebSocket message, decoded.
enum Inbound {
    Frames(Vec<Frame>, usize),
    Malformed(String),
    Ping(Vec<u8>),
    Ignore,
    Closed,
}

fn decode_inbound(
    message: Option<Result<Message, axum::Error>>,
    read_buffer: &mut BytesMut,
    format: &mut Option<WireFormat>,
) -> Inbound {
    match message {
        Some(Ok(Message::Binary(data))) => {
            format.get_or_insert(WireFormat::MessagePack);
            read_buffer.extend_from_slice(&data);
            let mut frames = Vec::new();
            loop {
                match codec::decode_from(read_buffer) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(e) => {
                        read_buffer.clear();
                        return Inbound::Malformed(e.to_string());
                    }
                }
            }
            Inbound::Frames(frames, data.len())
        }
        Some(Ok(Message::Text(text))) => {
            format.get_or_insert(WireFormat::Json);
            match codec::decode_json(&text) {
                Ok(frame) => Inbound::Frames(vec![frame], text.len()),
                Err(e) => Inbound::Malformed(e.to_string()),
            }
        }
        Some(Ok(Message::Ping(data))) => Inbound::Ping(data),
        Some(Ok(Message::Pong(_))) => Inbound::Ignore,
        Some(Ok(Message::Close(_))) | None => Inbound::Closed,
        Some(Err(e)) => {
            debug!(error = %e, "WebSocket error");
            metrics::record_error("websocket");
            Inbound::Closed
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, format: WireFormat, frame: &Frame) -> Result<()> {
    let message = format.encode(frame)?;
    metrics::record_frame(message_len(&message), "outbound");
    sender.send(message).await?;
    Ok(())
}

/// Send an error and close.
async fn reject(sender: &mut WsSender, format: WireFormat, code: u16, message: impl Into<String>) {
    let message = message.into();
    debug!(code, reason = %message, "Rejecting connection");
    let _ = send_frame(sender, format, &Frame::error(0, code, message)).await;
    let _ = sender.send(Message::Close(None)).await;
}

/// Wait for the first frame, which must be `connect`.
async fn await_connect(
    receiver: &mut SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
    format: &mut Option<WireFormat>,
) -> Option<Result<Frame, String>> {
    loop {
        match decode_inbound(receiver.next().await, read_buffer, format) {
            Inbound::Frames(frames, _) => {
                if let Some(frame) = frames.into_iter().next() {
                    return Some(Ok(frame));
                }
            }
            Inbound::Malformed(reason) => return Some(Err(reason)),
            Inbound::Ping(_) | Inbound::Ignore => {}
            Inbound::Closed => return None,
        }
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut format = None;
    let timeout = state.config.heartbeat_timeout();

    let first = tokio::time::timeout(
        timeout,
        await_connect(&mut receiver, &mut read_buffer, &mut format),
    )
    .await;
    let format_or_default = format.unwrap_or(WireFormat::MessagePack);

    let user_id = match first {
        Err(_) => {
            debug!("Handshake timed out");
            return;
        }
        Ok(None) => return,
        Ok(Some(Err(reason))) => {
            reject(&mut sender, format_or_default, error_codes::BAD_REQUEST, reason).await;
            return;
        }
        Ok(Some(Ok(Frame::Connect { version, user_id }))) => {
            if !PROTOCOL_VERSION.accepts_major(version) {
                reject(
                    &mut sender,
                    format_or_default,
                    error_codes::UNSUPPORTED_VERSION,
                    format!("Unsupported protocol version {} (server speaks {})", version, PROTOCOL_VERSION),
                )
                .await;
                return;
            }
            if user_id.is_none() && !state.config.auth.allow_anonymous {
                reject(
                    &mut sender,
                    format_or_default,
                    error_codes::NOT_AUTHENTICATED,
                    "Connect requires a user",
                )
                .await;
                return;
            }
            user_id
        }
        Ok(Some(Ok(frame))) => {
            reject(
                &mut sender,
                format_or_default,
                error_codes::BAD_REQUEST,
                format!("Expected connect, got {:?}", frame.frame_type()),
            )
            .await;
            return;
        }
    };
    let format = format_or_default;

    if state.hub.registry().connection_count() >= state.config.limits.max_connections {
        warn!("Connection limit reached");
        reject(&mut sender, format, error_codes::TOO_MANY_CONNECTIONS, "Server is full").await;
        return;
    }

    let (outbox, mut events) = state.hub.open_outbox();
    let connection_id = match state.hub.on_connect(Arc::clone(&outbox), user_id.as_deref()) {
        Ok(id) => id,
        Err(e) => {
            let code = match e {
                RegistryError::TooManyConnections(_) => error_codes::TOO_MANY_CONNECTIONS,
                _ => error_codes::BAD_REQUEST,
            };
            reject(&mut sender, format, code, e.to_string()).await;
            return;
        }
    };

    let heartbeat_ms = state.config.heartbeat.interval_ms;
    let connected = Frame::connected(
        connection_id.as_str(),
        PROTOCOL_VERSION.major,
        u32::try_from(heartbeat_ms).unwrap_or(u32::MAX),
    );
    if send_frame(&mut sender, format, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        state.hub.on_disconnect(&connection_id);
        return;
    }

    let period = Duration::from_millis(heartbeat_ms.max(1));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    let mut last_seen = Instant::now();
    let mut inbound_format = Some(format);

    let reason: &'static str = 'conn: loop {
        tokio::select! {
            biased;

            _ = outbox.overflowed() => {
                metrics::record_eviction();
                warn!(
                    connection = %connection_id,
                    dropped = outbox.dropped_count(),
                    "Evicting slow connection"
                );
                let overflow = Frame::error(0, error_codes::QUEUE_OVERFLOW, "Outbound queue overflow");
                let _ = send_frame(&mut sender, format, &overflow).await;
                break 'conn "evicted";
            }

            Some(event) = events.recv() => {
                match format.encode_event(&event) {
                    Ok(message) => {
                        metrics::record_frame(message_len(&message), "outbound");
                        if sender.send(message).await.is_err() {
                            break 'conn "send failed";
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, kind = %event.kind, error = %e, "Failed to encode event");
                        metrics::record_error("encode");
                    }
                }
            }

            message = receiver.next() => {
                last_seen = Instant::now();
                match decode_inbound(message, &mut read_buffer, &mut inbound_format) {
                    Inbound::Frames(frames, bytes) => {
                        metrics::record_frame(bytes, "inbound");
                        for frame in frames {
                            let start = std::time::Instant::now();
                            let reply = handle_frame(frame, &connection_id, user_id.as_deref(), &state);
                            if let Some(reply) = reply {
                                if send_frame(&mut sender, format, &reply).await.is_err() {
                                    break 'conn "send failed";
                                }
                            }
                            metrics::record_latency(start.elapsed().as_secs_f64());
                        }
                    }
                    Inbound::Malformed(reason) => {
                        debug!(connection = %connection_id, reason = %reason, "Malformed frame");
                        metrics::record_error("decode");
                        let reply = Frame::error(0, error_codes::BAD_REQUEST, reason);
                        if send_frame(&mut sender, format, &reply).await.is_err() {
                            break 'conn "send failed";
                        }
                    }
                    Inbound::Ping(data) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break 'conn "send failed";
                        }
                    }
                    Inbound::Ignore => {}
                    Inbound::Closed => break 'conn "closed by peer",
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timeout {
                    break 'conn "heartbeat timeout";
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break 'conn "send failed";
                }
            }
        }
    };

    state.hub.on_disconnect(&connection_id);
    metrics::set_active_rooms(state.hub.rooms().room_count());
    debug!(connection = %connection_id, reason, "WebSocket disconnected");
}

fn publish_error_code(e: &PublishError) -> u16 {
    match e {
        PublishError::NotAuthenticated => error_codes::NOT_AUTHENTICATED,
        PublishError::InvalidRoom(_) => error_codes::ROOM_ERROR,
        _ => error_codes::PUBLISH_REJECTED,
    }
}

fn call_error_code(e: &CallError) -> u16 {
    match e {
        CallError::UnknownConnection(_) => error_codes::NOT_AUTHENTICATED,
        _ => error_codes::CALL_REJECTED,
    }
}

/// Handle a decoded frame, returning the reply if there is one.
fn handle_frame(
    frame: Frame,
    connection_id: &ConnectionId,
    user_id: Option<&str>,
    state: &AppState,
) -> Option<Frame> {
    let hub = &state.hub;

    match frame {
        Frame::JoinRoom { id, room } => {
            debug!(connection = %connection_id, room = %room, "Join request");
            let reply = match hub.join_room(connection_id, &room) {
                Ok(_) => Frame::ack(id),
                Err(e) => {
                    debug!(connection = %connection_id, room = %room, error = %e, "Join failed");
                    Frame::error(id, error_codes::ROOM_ERROR, e.to_string())
                }
            };
            metrics::set_active_rooms(hub.rooms().room_count());
            Some(reply)
        }

        Frame::LeaveRoom { id, room } => {
            hub.leave_room(connection_id, &room);
            metrics::set_active_rooms(hub.rooms().room_count());
            Some(Frame::ack(id))
        }

        Frame::PublishRoom {
            id,
            room,
            kind,
            payload,
        } => {
            let write = user_id
                .and_then(|user| StoreWrite::for_publish(kind, user, Some(room.as_str()), &payload));
            match hub.publish_room_event(connection_id, &room, kind, payload) {
                Ok(delivery) => {
                    metrics::record_fanout(delivery);
                    if let Some(write) = write {
                        persist::spawn_write(Arc::clone(&state.store), write);
                    }
                    id.map(Frame::ack)
                }
                Err(e) => {
                    debug!(connection = %connection_id, room = %room, error = %e, "Publish rejected");
                    Some(Frame::error(id.unwrap_or(0), publish_error_code(&e), e.to_string()))
                }
            }
        }

        Frame::PublishUser {
            id,
            target,
            kind,
            payload,
        } => {
            let write =
                user_id.and_then(|user| StoreWrite::for_publish(kind, user, None, &payload));
            match hub.publish_user_event(connection_id, &target, kind, payload) {
                Ok(delivery) => {
                    metrics::record_fanout(delivery);
                    if let Some(write) = write {
                        persist::spawn_write(Arc::clone(&state.store), write);
                    }
                    id.map(Frame::ack)
                }
                Err(e) => {
                    debug!(connection = %connection_id, target = %target, error = %e, "Publish rejected");
                    Some(Frame::error(id.unwrap_or(0), publish_error_code(&e), e.to_string()))
                }
            }
        }

        Frame::InitiateCall {
            id,
            recipient,
            call_type,
        } => Some(match hub.initiate_call(connection_id, &recipient, call_type) {
            Ok(call_id) => Frame::CallStarted { id, call_id },
            Err(e) => Frame::error(id, call_error_code(&e), e.to_string()),
        }),

        Frame::AcceptCall { id, call_id } => Some(match hub.accept_call(connection_id, &call_id) {
            Ok(_) => Frame::ack(id),
            Err(e) => Frame::error(id, call_error_code(&e), e.to_string()),
        }),

        Frame::DeclineCall { id, call_id } => Some(match hub.decline_call(connection_id, &call_id) {
            Ok(_) => Frame::ack(id),
            Err(e) => Frame::error(id, call_error_code(&e), e.to_string()),
        }),

        Frame::EndCall {
            id,
            call_id,
            duration,
        } => Some(match hub.end_call(connection_id, &call_id, duration) {
            Ok(_) => Frame::ack(id),
            Err(e) => Frame::error(id, call_error_code(&e), e.to_string()),
        }),

        Frame::Signal {
            call_id,
            kind,
            payload,
        } => {
            // Signals for finished calls are dropped silently.
            let _ = hub.relay_signal(connection_id, &call_id, kind, payload);
            None
        }

        Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),

        Frame::Pong { .. } => None,

        Frame::Connect { .. } => Some(Frame::error(
            0,
            error_codes::BAD_REQUEST,
            "Already connected",
        )),

        other => {
            warn!(connection = %connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
            Some(Frame::error(
                other.request_id().unwrap_or(0),
                error_codes::BAD_REQUEST,
                "Unexpected frame",
            ))
        }
    }
}
