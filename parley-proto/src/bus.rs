//! Broker bus protocol between gateway instances and the broker hub.
//!
//! Defines the [`BusFrame`] enum that is postcard-encoded and sent over
//! WebSocket binary frames. The hub never inspects publish payloads, it only
//! reads the topic to decide which instances receive a copy.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::message::UserId;

/// Prefix of per-user topics.
const USER_TOPIC_PREFIX: &str = "user:";

/// Name of a fan-out channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// The personal channel of a user.
    #[must_use]
    pub fn user(user_id: &UserId) -> Self {
        Self(format!("{USER_TOPIC_PREFIX}{user_id}"))
    }

    /// Wraps a raw topic name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the topic name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The user a personal channel belongs to, if this is one.
    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        self.0.strip_prefix(USER_TOPIC_PREFIX).map(UserId::new)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Frames exchanged between a gateway instance and the broker hub.
///
/// An instance says `Hello` first, then subscribes to topics and publishes
/// opaque payloads. The hub answers `Welcome`, and forwards every publish
/// as a `Delivery` to each subscribed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusFrame {
    /// Instance announces itself. Must be the first frame.
    Hello {
        /// Unique id of the connecting gateway instance.
        instance_id: String,
    },
    /// Hub acknowledges the `Hello`.
    Welcome {
        /// The instance id (echoed back for confirmation).
        instance_id: String,
    },
    /// Start receiving deliveries for a topic.
    Subscribe {
        /// Topic to subscribe to.
        topic: Topic,
    },
    /// Stop receiving deliveries for a topic.
    Unsubscribe {
        /// Topic to leave.
        topic: Topic,
    },
    /// Publish an opaque payload to every subscriber of a topic.
    Publish {
        /// Destination topic.
        topic: Topic,
        /// Opaque payload bytes.
        payload: Vec<u8>,
    },
    /// A payload published to a topic this instance subscribed to.
    Delivery {
        /// Topic the payload was published to.
        topic: Topic,
        /// Opaque payload bytes.
        payload: Vec<u8>,
    },
    /// Hub reports an error condition.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

/// Encodes a [`BusFrame`] into bytes using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode(frame: &BusFrame) -> Result<Vec<u8>, CodecError> {
    codec::to_bytes(frame)
}

/// Decodes a [`BusFrame`] from postcard bytes.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a valid frame.
pub fn decode(bytes: &[u8]) -> Result<BusFrame, CodecError> {
    codec::from_bytes(bytes)
}
