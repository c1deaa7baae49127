//! Connection gateway: WebSocket termination, authentication, the local
//! connection map and event relay.
//!
//! One [`Gateway`] is constructed per process and injected wherever it is
//! needed. Each client connection runs four tasks:
//!
//! - a writer draining the connection's outbound channel into the socket;
//! - a reader feeding text frames to the processor;
//! - a processor handling events one at a time, in arrival order;
//! - a heartbeat pinging the client and dropping it when it goes silent.
//!
//! Disconnect aborts the reader, writer and heartbeat. The processor is left
//! to drain what the reader already accepted, so in-flight persistence is
//! never cancelled.
//!
//! Events for users arrive from the fan-out layer on the instance's delivery
//! channel and are pushed to the matching local connection by
//! [`Gateway::run_inbound`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parley_proto::event::{self, ClientEvent, ErrorCode, MessageEvent, ServerEvent};
use parley_proto::message::{MessageStatus, ThreadId, Timestamp, UserId};
use tokio::sync::{RwLock, mpsc};

use crate::auth::IdentityVerifier;
use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::fanout::{Broker, Delivery, Fanout, FanoutEnvelope, RoomRef, Route};
use crate::registry::{ConnectionId, RoomDescriptor, ThreadRegistry};
use crate::service::MessageService;
use crate::store::MessageStore;

/// Timeouts and limits applied to client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is dropped.
    pub heartbeat_timeout: Duration,
    /// Time a new socket has to send `connect`.
    pub connect_timeout: Duration,
    /// Maximum inbound text frame size in bytes.
    pub max_frame_size: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            max_frame_size: 64 * 1024,
        }
    }
}

impl From<&ServerConfig> for GatewaySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            max_frame_size: config.max_frame_size,
            ..Self::default()
        }
    }
}

/// A registered live connection.
#[derive(Debug, Clone)]
struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
}

/// Per-process gateway state.
pub struct Gateway<S> {
    connections: RwLock<HashMap<UserId, ConnectionHandle>>,
    service: Arc<MessageService<S>>,
    verifier: Arc<dyn IdentityVerifier>,
    settings: GatewaySettings,
}

impl<S: MessageStore> std::fmt::Debug for Gateway<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("instance_id", &self.service.fanout().instance_id())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<S: MessageStore> Gateway<S> {
    /// Wires a gateway over a store and a broker handle.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        broker: Arc<dyn Broker>,
        verifier: Arc<dyn IdentityVerifier>,
        settings: GatewaySettings,
    ) -> Self {
        let fanout = Arc::new(Fanout::new(broker));
        let service = Arc::new(MessageService::new(
            store,
            Arc::new(ThreadRegistry::new()),
            fanout,
        ));
        Self {
            connections: RwLock::new(HashMap::new()),
            service,
            verifier,
            settings,
        }
    }

    /// Id of this instance on the broker.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        self.service.fanout().instance_id()
    }

    /// The message service.
    #[must_use]
    pub const fn service(&self) -> &Arc<MessageService<S>> {
        &self.service
    }

    /// The identity verifier.
    #[must_use]
    pub fn verifier(&self) -> &dyn IdentityVerifier {
        self.verifier.as_ref()
    }

    fn registry(&self) -> &ThreadRegistry {
        self.service.registry()
    }

    fn fanout(&self) -> &Fanout {
        self.service.fanout()
    }

    /// Registers a connection, returning the one it replaced.
    async fn register(&self, user: &UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut conns = self.connections.write().await;
        conns.insert(user.clone(), handle)
    }

    /// Removes `user` if `conn` is still its registered connection.
    async fn unregister(&self, user: &UserId, conn: ConnectionId) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(user).is_some_and(|h| h.id == conn) {
            conns.remove(user);
            true
        } else {
            false
        }
    }

    async fn get_handle(&self, user: &UserId) -> Option<ConnectionHandle> {
        let conns = self.connections.read().await;
        conns.get(user).cloned()
    }

    /// Whether `user` has a live connection on this instance.
    pub async fn is_online(&self, user: &UserId) -> bool {
        self.connections.read().await.contains_key(user)
    }

    /// Number of live connections on this instance.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Handles an upgraded WebSocket connection for a single client.
    ///
    /// The connection lifecycle:
    /// 1. Wait for `connect` and verify its token.
    /// 2. Register the connection, subscribe to the user's topic, attach the
    ///    user's rooms and answer `connected`.
    /// 3. Run writer, reader, processor and heartbeat tasks.
    /// 4. On disconnect, unregister and tell room peers the user went offline.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_sender, mut ws_receiver) = socket.split();

        let token = match tokio::time::timeout(
            self.settings.connect_timeout,
            wait_for_connect(&mut ws_receiver),
        )
        .await
        {
            Ok(Ok(token)) => token,
            Ok(Err(rejection)) => {
                reject(&mut ws_sender, &rejection).await;
                return;
            }
            Err(_) => {
                tracing::warn!("no connect frame before timeout");
                let rejection = ServerEvent::error(ErrorCode::Authentication, "connect timed out");
                reject(&mut ws_sender, &rejection).await;
                return;
            }
        };

        let user = match self.verifier.verify(&token) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(error = %e, "connection refused");
                let rejection = ServerEvent::error(ErrorCode::Authentication, e.to_string());
                reject(&mut ws_sender, &rejection).await;
                return;
            }
        };

        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        if let Some(old) = self
            .register(&user, ConnectionHandle { id: conn, tx: tx.clone() })
            .await
        {
            tracing::info!(user_id = %user, old = %old.id, "replacing existing connection");
            let _ = old.tx.send(Message::Close(None));
        }
        if let Err(e) = self.fanout().subscribe_user(&user) {
            tracing::warn!(user_id = %user, error = %e, "failed to subscribe user topic");
        }
        self.attach_existing_rooms(&user, conn).await;
        reply(&tx, &ServerEvent::Connected {
            user_id: user.clone(),
        });
        tracing::info!(user_id = %user, conn = %conn, "client connected");

        let last_seen = Arc::new(AtomicU64::new(Timestamp::now().as_millis()));

        let writer_user = user.clone();
        let mut write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    tracing::debug!(user_id = %writer_user, "WebSocket write failed");
                    break;
                }
            }
        });

        let heartbeat_tx = tx.clone();
        let heartbeat_seen = Arc::clone(&last_seen);
        let settings = self.settings;
        let heartbeat_user = user.clone();
        let mut heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let silent_for = Timestamp::now()
                    .as_millis()
                    .saturating_sub(heartbeat_seen.load(Ordering::Relaxed));
                if u128::from(silent_for) > settings.heartbeat_timeout.as_millis() {
                    tracing::info!(
                        user_id = %heartbeat_user,
                        silent_ms = silent_for,
                        "heartbeat timeout"
                    );
                    break;
                }
                if heartbeat_tx.send(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel::<String>();
        let processor = Arc::clone(&self);
        let processor_user = user.clone();
        let processor_tx = tx.clone();
        tokio::spawn(async move {
            processor
                .process_events(processor_user, conn, processor_tx, events_rx)
                .await;
        });

        let reader_user = user.clone();
        let reader_tx = tx.clone();
        let max_frame_size = self.settings.max_frame_size;
        let mut read_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_receiver.next().await {
                last_seen.store(Timestamp::now().as_millis(), Ordering::Relaxed);
                match msg {
                    Message::Text(text) => {
                        let size = text.as_str().len();
                        if size > max_frame_size {
                            tracing::warn!(user_id = %reader_user, size, "frame too large");
                            reply(
                                &reader_tx,
                                &ServerEvent::error(
                                    ErrorCode::Malformed,
                                    format!("frame too large: {size} bytes (max {max_frame_size})"),
                                ),
                            );
                            continue;
                        }
                        if events_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        reply(
                            &reader_tx,
                            &ServerEvent::error(
                                ErrorCode::Malformed,
                                "binary frames are not supported",
                            ),
                        );
                    }
                    Message::Close(_) => {
                        tracing::debug!(user_id = %reader_user, "received close frame");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        });
        drop(tx);

        tokio::select! {
            _ = &mut read_task => {
                write_task.abort();
                heartbeat_task.abort();
            }
            _ = &mut write_task => {
                read_task.abort();
                heartbeat_task.abort();
            }
            _ = &mut heartbeat_task => {
                read_task.abort();
                write_task.abort();
            }
        }

        self.teardown(&user, conn).await;
    }

    async fn attach_existing_rooms(&self, user: &UserId, conn: ConnectionId) {
        let threads = match self.service.user_threads(user).await {
            Ok(threads) => threads,
            Err(e) => {
                tracing::warn!(user_id = %user, error = %e, "failed to load user threads");
                return;
            }
        };
        for thread in threads {
            let attached = self
                .registry()
                .create_or_get_room(&thread.thread_id, &thread.participants, &thread.listing_id)
                .and_then(|_| self.registry().attach(&thread.thread_id, conn));
            if let Err(e) = attached {
                tracing::warn!(
                    user_id = %user,
                    thread_id = %thread.thread_id,
                    error = %e,
                    "failed to attach room"
                );
            }
        }
    }

    async fn teardown(&self, user: &UserId, conn: ConnectionId) {
        let removed = self.unregister(user, conn).await;
        let rooms = self.registry().detach_connection(conn);
        if removed {
            self.announce_offline(user, &rooms);
        }
        if let Err(e) = self.fanout().unsubscribe_user(user) {
            tracing::warn!(user_id = %user, error = %e, "failed to unsubscribe user topic");
        }
        tracing::info!(user_id = %user, conn = %conn, replaced = !removed, "client disconnected");
    }

    fn announce_offline(&self, user: &UserId, rooms: &[RoomDescriptor]) {
        let event = ServerEvent::UserOffline {
            user_id: user.clone(),
        };
        for room in rooms {
            let Some(peer) = room.peer_of(user) else {
                continue;
            };
            let route = Route {
                room: Some(RoomRef::from(room)),
                ..Route::default()
            };
            if let Err(e) = self.fanout().publish_to_user(peer, &event, route) {
                tracing::warn!(
                    user_id = %user,
                    peer = %peer,
                    error = %e,
                    "failed to publish userOffline"
                );
            }
        }
    }

    async fn process_events(
        self: Arc<Self>,
        user: UserId,
        conn: ConnectionId,
        tx: mpsc::UnboundedSender<Message>,
        mut events: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(text) = events.recv().await {
            self.handle_event(&user, conn, &tx, &text).await;
        }
    }

    async fn handle_event(
        &self,
        user: &UserId,
        conn: ConnectionId,
        tx: &mpsc::UnboundedSender<Message>,
        text: &str,
    ) {
        let event = match event::decode_client(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(user_id = %user, error = %e, "malformed client event");
                reply(tx, &ServerEvent::error(ErrorCode::Malformed, e.to_string()));
                return;
            }
        };

        let result = match event {
            ClientEvent::Connect { .. } => {
                reply(tx, &ServerEvent::error(ErrorCode::Malformed, "already connected"));
                Ok(())
            }
            ClientEvent::Message(request) => self
                .service
                .send(request, user, Some(conn))
                .await
                .map(|message| {
                    reply(tx, &ServerEvent::Message(MessageEvent::from(message)));
                }),
            ClientEvent::Typing { room_id, is_typing } => {
                self.relay_typing(user, conn, room_id, is_typing)
            }
            ClientEvent::MessageRead { message_id } => self
                .service
                .mark_read(&message_id, user)
                .await
                .map(|_| ()),
            ClientEvent::MessageDelivered { message_id } => self
                .service
                .mark_delivered(&message_id, user)
                .await
                .map(|_| ()),
            ClientEvent::Sync {
                thread_id,
                since,
                limit,
            } => self
                .service
                .sync(&thread_id, user, since, limit)
                .await
                .map(|messages| reply(tx, &ServerEvent::SyncBatch { thread_id, messages })),
        };

        if let Err(e) = result {
            tracing::debug!(user_id = %user, error = %e, "request failed");
            reply(tx, &ServerEvent::error(e.code(), e.to_string()));
        }
    }

    fn relay_typing(
        &self,
        user: &UserId,
        conn: ConnectionId,
        room_id: ThreadId,
        is_typing: bool,
    ) -> Result<(), ChatError> {
        let room = self
            .registry()
            .get(&room_id)
            .filter(|room| room.has_participant(user) && room.connections.contains(&conn))
            .ok_or_else(|| ChatError::Authorization(format!("not a member of room {room_id}")))?;
        let Some(peer) = room.peer_of(user) else {
            return Ok(());
        };
        let event = ServerEvent::UserTyping {
            room_id,
            user_id: user.clone(),
            is_typing,
        };
        let route = Route {
            room: Some(RoomRef::from(&room)),
            ..Route::default()
        };
        if let Err(e) = self.fanout().publish_to_user(peer, &event, route) {
            tracing::debug!(user_id = %user, error = %e, "typing indicator dropped");
        }
        Ok(())
    }

    /// Pushes fan-out deliveries to local connections until the channel
    /// closes.
    pub async fn run_inbound(self: Arc<Self>, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = deliveries.recv().await {
            match FanoutEnvelope::decode(&delivery.payload) {
                Ok(envelope) => self.deliver(envelope).await,
                Err(e) => {
                    tracing::warn!(
                        topic = %delivery.topic,
                        error = %e,
                        "malformed fan-out envelope"
                    );
                }
            }
        }
        tracing::info!(instance = %self.instance_id(), "delivery channel closed");
    }

    async fn deliver(self: &Arc<Self>, envelope: FanoutEnvelope) {
        let Some(handle) = self.get_handle(&envelope.recipient).await else {
            tracing::trace!(user_id = %envelope.recipient, "recipient not connected here");
            return;
        };
        if envelope.exclude == Some(handle.id) {
            return;
        }
        if let Some(room) = &envelope.room {
            let attached = self
                .registry()
                .create_or_get_room(&room.thread_id, &room.participants, &room.listing_id)
                .and_then(|_| self.registry().attach(&room.thread_id, handle.id));
            if let Err(e) = attached {
                tracing::warn!(thread_id = %room.thread_id, error = %e, "failed to attach room");
            }
        }
        if handle.tx.send(Message::Text(envelope.frame.into())).is_err() {
            tracing::debug!(user_id = %envelope.recipient, "connection closed before delivery");
            return;
        }
        if let Some(message_id) = envelope.delivery {
            let gateway = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = gateway
                    .service
                    .delivery()
                    .advance(&message_id, MessageStatus::Delivered)
                    .await
                {
                    tracing::warn!(
                        message_id = %message_id,
                        error = %e,
                        "failed to mark delivered"
                    );
                }
            });
        }
    }
}

/// Waits for the `connect` frame and returns its token.
async fn wait_for_connect(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Result<String, ServerEvent> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                return match event::decode_client(text.as_str()) {
                    Ok(ClientEvent::Connect { auth_token }) => Ok(auth_token),
                    Ok(_) => Err(ServerEvent::error(
                        ErrorCode::Authentication,
                        "expected connect as the first event",
                    )),
                    Err(e) => Err(ServerEvent::error(ErrorCode::Malformed, e.to_string())),
                };
            }
            Message::Binary(_) => {
                return Err(ServerEvent::error(
                    ErrorCode::Malformed,
                    "binary frames are not supported",
                ));
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Err(ServerEvent::error(
        ErrorCode::Authentication,
        "connection closed before connect",
    ))
}

/// Sends an error event and closes the socket.
async fn reject(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    rejection: &ServerEvent,
) {
    if let Ok(text) = event::encode_server(rejection) {
        let _ = ws_sender.send(Message::Text(text.into())).await;
    }
    let _ = ws_sender.send(Message::Close(None)).await;
}

/// Queues a server event on a connection's outbound channel.
fn reply(tx: &mpsc::UnboundedSender<Message>, event: &ServerEvent) {
    match event::encode_server(event) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text.into()));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode server event"),
    }
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler<S: MessageStore>(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(gateway): axum::extract::State<Arc<Gateway<S>>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| gateway.handle_socket(socket))
}

/// Builds the full router: `/ws` plus the HTTP API.
pub fn router<S: MessageStore>(gateway: Arc<Gateway<S>>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<S>))
        .merge(crate::api::routes::<S>())
        .with_state(gateway)
}

/// Starts the gateway on `addr`: spawns the delivery pump and serves the
/// router. Returns the bound address and the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state<S: MessageStore>(
    addr: &str,
    gateway: Arc<Gateway<S>>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    tokio::spawn(Arc::clone(&gateway).run_inbound(deliveries));
    let app = router(gateway);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "gateway server error");
        }
    });

    Ok((bound_addr, handle))
}
