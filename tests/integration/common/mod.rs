//! Shared helpers for the gateway integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parley_proto::event::{self, ClientEvent, ServerEvent};
use parley_proto::message::{ListingId, Metadata, MessageType, SendMessage, UserId};
use parley_server::auth::{IdentityVerifier, StaticTokenVerifier};
use parley_server::fanout::{Broker, Delivery, LocalBus};
use parley_server::gateway::{self, Gateway, GatewaySettings};
use parley_server::store::InMemoryMessageStore;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

pub type Client =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A gateway running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub gateway: Arc<Gateway<InMemoryMessageStore>>,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

/// Token table shared by every test server: `tok-<name>` authenticates
/// `<name>`.
pub fn verifier() -> StaticTokenVerifier {
    ["alice", "bob", "carol"]
        .into_iter()
        .fold(StaticTokenVerifier::new(), |v, user| {
            v.with_token(format!("tok-{user}"), user)
        })
}

pub fn token(user: &str) -> String {
    format!("tok-{user}")
}

/// Starts a gateway with its own store on a shared local bus.
pub async fn start_on_bus(bus: &LocalBus, instance_id: &str) -> TestServer {
    let (broker, rx) = bus.attach(instance_id);
    start_with_broker(
        Arc::new(InMemoryMessageStore::new()),
        Arc::new(broker),
        rx,
        Arc::new(verifier()),
    )
    .await
}

/// Starts a gateway on a fresh private bus.
pub async fn start_single() -> TestServer {
    start_on_bus(&LocalBus::new(), "gw-single").await
}

/// Starts a gateway on a fresh private bus with custom connection settings.
pub async fn start_with_settings(settings: GatewaySettings) -> TestServer {
    let bus = LocalBus::new();
    let (broker, rx) = bus.attach("gw-settings");
    start_gateway(
        Arc::new(InMemoryMessageStore::new()),
        Arc::new(broker),
        rx,
        Arc::new(verifier()),
        settings,
    )
    .await
}

pub async fn start_with_broker(
    store: Arc<InMemoryMessageStore>,
    broker: Arc<dyn Broker>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    verifier: Arc<dyn IdentityVerifier>,
) -> TestServer {
    start_gateway(
        store,
        broker,
        deliveries,
        verifier,
        GatewaySettings::default(),
    )
    .await
}

async fn start_gateway(
    store: Arc<InMemoryMessageStore>,
    broker: Arc<dyn Broker>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    verifier: Arc<dyn IdentityVerifier>,
    settings: GatewaySettings,
) -> TestServer {
    let gateway = Arc::new(Gateway::new(store, broker, verifier, settings));
    let (addr, _handle) =
        gateway::start_server_with_state("127.0.0.1:0", Arc::clone(&gateway), deliveries)
            .await
            .unwrap();
    TestServer { addr, gateway }
}

/// Opens a socket, sends `connect` and waits for `connected`.
pub async fn connect(server: &TestServer, user: &str) -> Client {
    let mut ws = open(server).await;
    send(&mut ws, &ClientEvent::Connect {
        auth_token: token(user),
    })
    .await;
    match recv(&mut ws).await {
        ServerEvent::Connected { user_id } => assert_eq!(user_id, UserId::new(user)),
        other => panic!("expected connected, got {other:?}"),
    }
    ws
}

/// Opens a socket without authenticating.
pub async fn open(server: &TestServer) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(server.ws_url())
        .await
        .unwrap();
    ws
}

pub async fn send(ws: &mut Client, event: &ClientEvent) {
    let text = event::encode_client(event).unwrap();
    ws.send(tungstenite::Message::Text(text.into())).await.unwrap();
}

pub async fn send_raw(ws: &mut Client, text: &str) {
    ws.send(tungstenite::Message::Text(text.to_owned().into()))
        .await
        .unwrap();
}

/// Next server event, skipping control frames.
pub async fn recv(ws: &mut Client) -> ServerEvent {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return event::decode_server(text.as_str()).unwrap();
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    panic!("socket closed while waiting for an event")
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => panic!("socket error: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no event within {RECV_TIMEOUT:?}"))
}

/// Next server event matching `pred`, skipping unrelated ones.
pub async fn recv_until(ws: &mut Client, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    loop {
        let event = recv(ws).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Asserts that no event matching `pred` arrives within `window`.
pub async fn assert_none(ws: &mut Client, window: Duration, pred: impl Fn(&ServerEvent) -> bool) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Err(_) | Ok(None) => return,
            Ok(Some(Ok(tungstenite::Message::Text(text)))) => {
                let event = event::decode_server(text.as_str()).unwrap();
                assert!(!pred(&event), "unexpected event: {event:?}");
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) => return,
        }
    }
}

/// Waits until the socket is closed by the server.
pub async fn expect_closed(ws: &mut Client) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("socket not closed within {RECV_TIMEOUT:?}"));
}

pub fn text_to(receiver: &str, listing: &str, content: &str) -> SendMessage {
    SendMessage {
        receiver_id: UserId::new(receiver),
        listing_id: ListingId::new(listing),
        content: content.to_owned(),
        message_type: MessageType::Text,
        metadata: Metadata::new(),
    }
}

pub fn is_message(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::Message(_))
}
