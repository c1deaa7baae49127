//! Broker hub: the process every gateway instance publishes to and
//! subscribes from.
//!
//! Instances connect over WebSocket at `/bus`, announce themselves with
//! `Hello`, then send `Subscribe`/`Unsubscribe`/`Publish` frames. Each
//! `Publish` is forwarded as a `Delivery` to every instance subscribed to the
//! topic, the publisher included. Frames from one instance are handled in
//! order by a single reader task, so per-publisher order is preserved.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use parley_proto::bus::{self, BusFrame, Topic};
use tokio::sync::{RwLock, mpsc};

use crate::fanout::TopicTable;

/// Shared hub state: connected instances and their subscriptions.
#[derive(Debug, Default)]
pub struct HubState {
    instances: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
    topics: Mutex<TopicTable>,
}

impl HubState {
    /// Creates an empty hub state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instance, replacing any previous connection with the
    /// same id.
    async fn register(
        &self,
        instance_id: &str,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        let mut instances = self.instances.write().await;
        instances.insert(instance_id.to_string(), sender)
    }

    /// Removes an instance if `sender` is still its current connection.
    async fn unregister(&self, instance_id: &str, sender: &mpsc::UnboundedSender<Message>) {
        let mut instances = self.instances.write().await;
        if instances
            .get(instance_id)
            .is_some_and(|current| current.same_channel(sender))
        {
            instances.remove(instance_id);
            drop(instances);
            self.topics.lock().remove_instance(instance_id);
        }
    }

    /// Number of connected instances.
    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Instances subscribed to `topic`.
    #[must_use]
    pub fn subscribers(&self, topic: &Topic) -> Vec<String> {
        self.topics.lock().subscribers(topic)
    }

    /// Forwards a published payload to every subscriber of `topic`.
    async fn forward(&self, topic: Topic, payload: Vec<u8>) {
        let subscribers = self.subscribers(&topic);
        if subscribers.is_empty() {
            tracing::trace!(topic = %topic, "publish with no subscriber");
            return;
        }
        let bytes = match bus::encode(&BusFrame::Delivery {
            topic: topic.clone(),
            payload,
        }) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "failed to encode delivery");
                return;
            }
        };
        let instances = self.instances.read().await;
        for instance in subscribers {
            if let Some(sender) = instances.get(&instance)
                && sender.send(Message::Binary(bytes.clone().into())).is_err()
            {
                tracing::warn!(instance = %instance, topic = %topic, "instance writer gone");
            }
        }
    }
}

/// Handles one instance connection.
///
/// 1. Wait for `Hello`.
/// 2. Register the instance and answer `Welcome`.
/// 3. Process frames in order until the socket closes.
/// 4. Drop the instance and all its subscriptions.
pub async fn handle_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(instance_id) = wait_for_hello(&mut ws_receiver).await else {
        tracing::warn!("bus connection closed before hello");
        let _ = send_frame(
            &mut ws_sender,
            &BusFrame::Error {
                reason: "expected hello".into(),
            },
        )
        .await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    if state.register(&instance_id, tx.clone()).await.is_some() {
        tracing::info!(instance = %instance_id, "replaced existing instance connection");
    }

    let welcome = BusFrame::Welcome {
        instance_id: instance_id.clone(),
    };
    if let Err(e) = send_frame(&mut ws_sender, &welcome).await {
        tracing::error!(instance = %instance_id, error = %e, "failed to send welcome");
        state.unregister(&instance_id, &tx).await;
        return;
    }
    tracing::info!(instance = %instance_id, "instance joined the hub");

    let writer_instance = instance_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(instance = %writer_instance, "bus write failed");
                break;
            }
        }
    });

    let reader_instance = instance_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_frame(&reader_instance, &data, &reader_state).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unregister(&instance_id, &tx).await;
    tracing::info!(instance = %instance_id, "instance left the hub");
}

async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => {
                return match bus::decode(&data) {
                    Ok(BusFrame::Hello { instance_id }) if !instance_id.trim().is_empty() => {
                        Some(instance_id)
                    }
                    Ok(other) => {
                        tracing::warn!(frame = ?other, "expected hello");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode hello");
                        None
                    }
                };
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn handle_frame(instance_id: &str, data: &[u8], state: &Arc<HubState>) {
    let frame = match bus::decode(data) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(instance = %instance_id, error = %e, "failed to decode bus frame");
            return;
        }
    };
    match frame {
        BusFrame::Subscribe { topic } => {
            tracing::debug!(instance = %instance_id, topic = %topic, "subscribe");
            state.topics.lock().subscribe(&topic, instance_id);
        }
        BusFrame::Unsubscribe { topic } => {
            tracing::debug!(instance = %instance_id, topic = %topic, "unsubscribe");
            state.topics.lock().unsubscribe(&topic, instance_id);
        }
        BusFrame::Publish { topic, payload } => {
            state.forward(topic, payload).await;
        }
        other => {
            tracing::warn!(
                instance = %instance_id,
                frame = ?other,
                "unexpected frame from instance"
            );
        }
    }
}

async fn send_frame(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &BusFrame,
) -> Result<(), String> {
    let bytes = bus::encode(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts a hub on `addr` with fresh state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_hub(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_hub_with_state(addr, Arc::new(HubState::new())).await
}

/// Starts a hub on `addr` with the given state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_hub_with_state(
    addr: &str,
    state: Arc<HubState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/bus", axum::routing::get(bus_handler))
        .route("/health", axum::routing::get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "hub server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn bus_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<HubState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
