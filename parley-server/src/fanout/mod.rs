//! Fan-out layer: publish/subscribe bridge between gateway instances.
//!
//! Every user has a personal topic (`user:{id}`). A gateway instance
//! subscribes to the topic of each user it holds a live connection for, and
//! anything addressed to a user is published to that topic as a
//! [`FanoutEnvelope`]. Whichever instance holds the connection receives it,
//! including instances in other processes when a [`RemoteBroker`] is used.
//!
//! Brokers only enqueue; they never block on the network. Publish failures
//! are reported to the caller, which logs them and moves on: persistence is
//! never rolled back because an event could not be fanned out.

mod local;
mod remote;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use parley_proto::bus::Topic;
use parley_proto::codec::{self, CodecError};
use parley_proto::event::{self, ServerEvent};
use parley_proto::message::{ListingId, MessageId, ThreadId, UserId};
use serde::{Deserialize, Serialize};

use crate::registry::{ConnectionId, RoomDescriptor};

pub use local::{LocalBroker, LocalBus, TopicTable};
pub use remote::RemoteBroker;

/// Errors that can occur when handing an event to the broker.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    /// The broker is not connected right now; the event was dropped.
    #[error("broker disconnected")]
    Disconnected,
    /// The broker has shut down.
    #[error("broker closed")]
    Closed,
    /// The event could not be encoded.
    #[error("encoding failed: {0}")]
    Encode(#[from] CodecError),
}

/// A payload delivered to this instance for one of its topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic the payload was published to.
    pub topic: Topic,
    /// Opaque payload bytes (a postcard-encoded [`FanoutEnvelope`]).
    pub payload: Vec<u8>,
}

/// Pub/sub backend shared by gateway instances.
///
/// Calls only enqueue work, so they are safe to make while holding a lock.
/// Deliveries for subscribed topics arrive on the channel handed out when the
/// broker was created.
pub trait Broker: Send + Sync {
    /// Id of the instance this broker handle belongs to.
    fn instance_id(&self) -> &str;

    /// Publishes `payload` to every instance subscribed to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Disconnected`] or [`FanoutError::Closed`] if
    /// the payload cannot be handed over.
    fn publish(&self, topic: &Topic, payload: Vec<u8>) -> Result<(), FanoutError>;

    /// Starts receiving deliveries for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Closed`] if the broker has shut down.
    fn subscribe(&self, topic: &Topic) -> Result<(), FanoutError>;

    /// Stops receiving deliveries for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Closed`] if the broker has shut down.
    fn unsubscribe(&self, topic: &Topic) -> Result<(), FanoutError>;
}

/// Room a fanned-out event belongs to, so the receiving instance can cache
/// the descriptor and attach the recipient's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRef {
    /// Thread key.
    pub thread_id: ThreadId,
    /// Both participants.
    pub participants: [UserId; 2],
    /// Listing of the room.
    pub listing_id: ListingId,
}

impl From<&RoomDescriptor> for RoomRef {
    fn from(room: &RoomDescriptor) -> Self {
        Self {
            thread_id: room.thread_id.clone(),
            participants: room.participants.clone(),
            listing_id: room.listing_id.clone(),
        }
    }
}

/// Routing hints attached to a published event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    /// Room the event belongs to.
    pub room: Option<RoomRef>,
    /// Message to mark DELIVERED once pushed to a live connection.
    pub delivery: Option<MessageId>,
    /// Connection that must not receive the event (the one that caused it).
    pub exclude: Option<ConnectionId>,
}

/// What travels over the broker: one server event for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutEnvelope {
    /// Instance that published the envelope.
    pub origin: String,
    /// User the event is addressed to.
    pub recipient: UserId,
    /// Room the event belongs to.
    pub room: Option<RoomRef>,
    /// Message to mark DELIVERED once pushed.
    pub delivery: Option<MessageId>,
    /// Connection to skip.
    pub exclude: Option<ConnectionId>,
    /// The JSON text frame to push to the client.
    pub frame: String,
}

impl FanoutEnvelope {
    /// Encodes the envelope with postcard.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::to_bytes(self)
    }

    /// Decodes an envelope from postcard bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the bytes are not an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::from_bytes(bytes)
    }
}

/// Per-instance front of a [`Broker`]: reference-counted user subscriptions
/// and event publication.
pub struct Fanout {
    broker: Arc<dyn Broker>,
    subscriptions: Mutex<HashMap<Topic, usize>>,
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("instance_id", &self.broker.instance_id())
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

impl Fanout {
    /// Wraps a broker handle.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Id of this instance.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        self.broker.instance_id()
    }

    /// Subscribes this instance to a user's topic. Nested calls are counted.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Closed`] if the broker has shut down.
    pub fn subscribe_user(&self, user: &UserId) -> Result<(), FanoutError> {
        let topic = Topic::user(user);
        let mut subs = self.subscriptions.lock();
        if let Some(count) = subs.get_mut(&topic) {
            *count += 1;
        } else {
            self.broker.subscribe(&topic)?;
            subs.insert(topic, 1);
        }
        Ok(())
    }

    /// Releases one subscription to a user's topic.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Closed`] if the broker has shut down.
    pub fn unsubscribe_user(&self, user: &UserId) -> Result<(), FanoutError> {
        let topic = Topic::user(user);
        let mut subs = self.subscriptions.lock();
        let Some(count) = subs.get_mut(&topic) else {
            return Ok(());
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            subs.remove(&topic);
            self.broker.unsubscribe(&topic)?;
        }
        Ok(())
    }

    /// Whether this instance is subscribed to the user's topic.
    #[must_use]
    pub fn is_subscribed(&self, user: &UserId) -> bool {
        self.subscriptions.lock().contains_key(&Topic::user(user))
    }

    /// Publishes `event` to one user.
    ///
    /// # Errors
    ///
    /// Returns a [`FanoutError`] if the event cannot be encoded or handed to
    /// the broker.
    pub fn publish_to_user(
        &self,
        recipient: &UserId,
        event: &ServerEvent,
        route: Route,
    ) -> Result<(), FanoutError> {
        let envelope = FanoutEnvelope {
            origin: self.broker.instance_id().to_string(),
            recipient: recipient.clone(),
            room: route.room,
            delivery: route.delivery,
            exclude: route.exclude,
            frame: event::encode_server(event)?,
        };
        self.broker
            .publish(&Topic::user(recipient), envelope.encode()?)
    }

    /// Publishes `event` to both participants of a room.
    ///
    /// Both participants are attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns a [`FanoutError`] if either publish fails.
    pub fn publish(&self, room: &RoomRef, event: &ServerEvent) -> Result<(), FanoutError> {
        let mut first_err = None;
        for participant in &room.participants {
            let route = Route {
                room: Some(room.clone()),
                ..Route::default()
            };
            if let Err(e) = self.publish_to_user(participant, event, route) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
