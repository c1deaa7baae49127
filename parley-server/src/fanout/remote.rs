//! Broker client connected to a `parley-hub` over WebSocket.
//!
//! A background task owns the socket. It says `Hello`, waits for `Welcome`,
//! re-subscribes every topic this instance holds, and then pumps outbound
//! frames and inbound deliveries until the socket drops. It reconnects after
//! a fixed delay for as long as the broker handle is alive.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use parley_proto::bus::{self, BusFrame, Topic};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Broker, Delivery, FanoutError};

type HubStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Timeout for opening the hub connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the hub's `Welcome`.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker handle backed by a hub connection.
pub struct RemoteBroker {
    instance_id: String,
    outbound: mpsc::UnboundedSender<BusFrame>,
    topics: Arc<Mutex<HashSet<Topic>>>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for RemoteBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBroker")
            .field("instance_id", &self.instance_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl RemoteBroker {
    /// Starts the connection task and returns the handle plus the channel on
    /// which deliveries arrive. Returns immediately; the first connection is
    /// made in the background.
    #[must_use]
    pub fn spawn(
        url: impl Into<String>,
        instance_id: impl Into<String>,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let instance_id = instance_id.into();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let topics = Arc::new(Mutex::new(HashSet::new()));
        let connected = Arc::new(AtomicBool::new(false));

        let link = HubLink {
            url: url.into(),
            instance_id: instance_id.clone(),
            topics: Arc::clone(&topics),
            connected: Arc::clone(&connected),
            inbound: inbound_tx,
            reconnect_delay,
        };
        let task = tokio::spawn(link.run(outbound_rx));

        (
            Self {
                instance_id,
                outbound,
                topics,
                connected,
                task,
            },
            inbound_rx,
        )
    }

    /// Whether the hub connection is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Waits until the hub connection is up, or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

impl Broker for RemoteBroker {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn publish(&self, topic: &Topic, payload: Vec<u8>) -> Result<(), FanoutError> {
        if !self.is_connected() {
            return Err(FanoutError::Disconnected);
        }
        self.outbound
            .send(BusFrame::Publish {
                topic: topic.clone(),
                payload,
            })
            .map_err(|_| FanoutError::Closed)
    }

    fn subscribe(&self, topic: &Topic) -> Result<(), FanoutError> {
        self.topics.lock().insert(topic.clone());
        self.outbound
            .send(BusFrame::Subscribe {
                topic: topic.clone(),
            })
            .map_err(|_| FanoutError::Closed)
    }

    fn unsubscribe(&self, topic: &Topic) -> Result<(), FanoutError> {
        self.topics.lock().remove(topic);
        self.outbound
            .send(BusFrame::Unsubscribe {
                topic: topic.clone(),
            })
            .map_err(|_| FanoutError::Closed)
    }
}

impl Drop for RemoteBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// State owned by the background connection task.
struct HubLink {
    url: String,
    instance_id: String,
    topics: Arc<Mutex<HashSet<Topic>>>,
    connected: Arc<AtomicBool>,
    inbound: mpsc::UnboundedSender<Delivery>,
    reconnect_delay: Duration,
}

/// Why a hub session ended.
enum SessionEnd {
    /// The socket dropped; reconnect.
    Lost,
    /// The broker handle or the delivery receiver is gone; stop.
    Shutdown,
}

impl HubLink {
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<BusFrame>) {
        loop {
            match self.handshake().await {
                Ok(ws) => {
                    tracing::info!(
                        url = %self.url,
                        instance = %self.instance_id,
                        "connected to broker hub"
                    );
                    let end = self.session(ws, &mut outbound).await;
                    self.connected.store(false, Ordering::Release);
                    if matches!(end, SessionEnd::Shutdown) {
                        return;
                    }
                    tracing::warn!(url = %self.url, "broker hub connection lost");
                }
                Err(reason) => {
                    tracing::warn!(url = %self.url, reason = %reason, "broker hub connect failed");
                }
            }
            if self.inbound.is_closed() {
                return;
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn handshake(&self) -> Result<HubStream, String> {
        let (mut ws, _response) =
            tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
                .await
                .map_err(|_| "connect timed out".to_string())?
                .map_err(|e| e.to_string())?;

        let hello = bus::encode(&BusFrame::Hello {
            instance_id: self.instance_id.clone(),
        })
        .map_err(|e| e.to_string())?;
        ws.send(Message::Binary(hello.into()))
            .await
            .map_err(|e| e.to_string())?;

        let reply = tokio::time::timeout(WELCOME_TIMEOUT, ws.next())
            .await
            .map_err(|_| "welcome timed out".to_string())?;
        match reply {
            Some(Ok(Message::Binary(data))) => match bus::decode(&data) {
                Ok(BusFrame::Welcome { .. }) => Ok(ws),
                Ok(BusFrame::Error { reason }) => Err(format!("rejected: {reason}")),
                Ok(other) => Err(format!("unexpected frame {other:?}")),
                Err(e) => Err(e.to_string()),
            },
            Some(Ok(_)) => Err("unexpected non-binary frame".into()),
            Some(Err(e)) => Err(e.to_string()),
            None => Err("stream ended during handshake".into()),
        }
    }

    async fn session(
        &self,
        ws: HubStream,
        outbound: &mut mpsc::UnboundedReceiver<BusFrame>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        // Queued subscription changes are superseded by the topic set; queued
        // publishes are replayed after it.
        let mut pending = Vec::new();
        while let Ok(frame) = outbound.try_recv() {
            if matches!(frame, BusFrame::Publish { .. }) {
                pending.push(frame);
            }
        }
        let snapshot: Vec<Topic> = self.topics.lock().iter().cloned().collect();
        let replay = snapshot
            .into_iter()
            .map(|topic| BusFrame::Subscribe { topic })
            .chain(pending);
        for frame in replay {
            if send_frame(&mut sink, &frame).await.is_err() {
                return SessionEnd::Lost;
            }
        }
        self.connected.store(true, Ordering::Release);

        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        return SessionEnd::Shutdown;
                    };
                    if send_frame(&mut sink, &frame).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match bus::decode(&data) {
                        Ok(BusFrame::Delivery { topic, payload }) => {
                            if self.inbound.send(Delivery { topic, payload }).is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Ok(BusFrame::Error { reason }) => {
                            tracing::warn!(reason = %reason, "broker hub error");
                        }
                        Ok(other) => {
                            tracing::debug!(?other, "unexpected frame from broker hub");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "malformed hub frame, skipping");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "broker hub read error");
                        return SessionEnd::Lost;
                    }
                },
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &BusFrame) -> Result<(), String>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let bytes = bus::encode(frame).map_err(|e| e.to_string())?;
    sink.send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| e.to_string())
}
