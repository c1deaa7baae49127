//! Domain types for listing-scoped two-party conversations.
//!
//! A [`Message`] is exchanged between exactly two users about one listing.
//! Both directions of a conversation resolve to the same [`ThreadId`], so the
//! thread key never depends on who wrote first.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum message content length, counted in characters (not bytes).
pub const MAX_CONTENT_CHARS: usize = 2000;

/// Metadata key carried by SYSTEM notices that announce a deletion.
pub const DELETED_MESSAGE_KEY: &str = "deletedMessageId";

/// Separator between the two participant ids of a thread key.
const THREAD_KEY_SEPARATOR: char = '-';

/// Opaque key/value metadata attached to a message.
pub type Metadata = BTreeMap<String, String>;

/// Unique identifier for a message, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque user identifier issued by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps an identity-service user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is blank (missing on the wire).
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the listing a conversation is about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(String);

impl ListingId {
    /// Wraps a listing reference.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is blank (missing on the wire).
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for ListingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic key of the conversation between two users.
///
/// Built by sorting the two user ids and joining them with `-`, so
/// `for_participants(a, b) == for_participants(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    /// Resolves the thread key for a pair of participants.
    #[must_use]
    pub fn for_participants(a: &UserId, b: &UserId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}{THREAD_KEY_SEPARATOR}{second}"))
    }

    /// Wraps a thread key received from a client.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// The timestamp one millisecond later.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Kind of content a message carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Plain text.
    #[default]
    Text,
    /// Image reference (content holds the URL or media key).
    Image,
    /// Shared location (content holds the encoded coordinates).
    Location,
    /// Server-originated notice. Clients cannot send these.
    System,
}

/// Delivery lifecycle of a message.
///
/// Variants are declared in lifecycle order, so the derived `Ord` matches
/// progress: `Sent < Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Persisted by the server.
    Sent,
    /// Pushed to a live connection of the receiver, or confirmed by it.
    Delivered,
    /// Displayed to the receiver and acknowledged.
    Read,
}

impl MessageStatus {
    /// Returns the state reached by moving towards `target`, or `None` when
    /// the transition would not move forward.
    ///
    /// Repeated and backward transitions are no-ops, never errors.
    #[must_use]
    pub const fn advance(self, target: Self) -> Option<Self> {
        match (self, target) {
            (Self::Sent, Self::Delivered | Self::Read) | (Self::Delivered, Self::Read) => {
                Some(target)
            }
            (Self::Sent, Self::Sent)
            | (Self::Delivered, Self::Sent | Self::Delivered)
            | (Self::Read, _) => None,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "SENT"),
            Self::Delivered => write!(f, "DELIVERED"),
            Self::Read => write!(f, "READ"),
        }
    }
}

/// A persisted message record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,
    /// Author of the message.
    pub sender_id: UserId,
    /// The other participant.
    pub receiver_id: UserId,
    /// Listing the conversation is about.
    pub listing_id: ListingId,
    /// Message body.
    pub content: String,
    /// Kind of content.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Current delivery status.
    pub status: MessageStatus,
    /// Thread key derived from the participants.
    pub thread_id: ThreadId,
    /// When the store accepted the message.
    pub created_at: Timestamp,
    /// When the message first reached the receiver.
    #[serde(default)]
    pub delivered_at: Option<Timestamp>,
    /// When the receiver acknowledged reading it.
    #[serde(default)]
    pub read_at: Option<Timestamp>,
    /// Opaque client metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Soft-delete flag; deleted messages are hidden from thread queries.
    #[serde(default)]
    pub is_deleted: bool,
    /// When the message was soft-deleted.
    #[serde(default)]
    pub deleted_at: Option<Timestamp>,
    /// Participant who deleted it.
    #[serde(default)]
    pub deleted_by: Option<UserId>,
}

impl Message {
    /// Whether `user` is the sender or the receiver.
    #[must_use]
    pub fn is_participant(&self, user: &UserId) -> bool {
        &self.sender_id == user || &self.receiver_id == user
    }

    /// The participant that is not `user`, if `user` takes part at all.
    #[must_use]
    pub fn counterpart(&self, user: &UserId) -> Option<&UserId> {
        if &self.sender_id == user {
            Some(&self.receiver_id)
        } else if &self.receiver_id == user {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    /// Both participants, sender first.
    #[must_use]
    pub fn participants(&self) -> [&UserId; 2] {
        [&self.sender_id, &self.receiver_id]
    }

    /// Id of the message a SYSTEM deletion notice refers to.
    #[must_use]
    pub fn deleted_message_id(&self) -> Option<MessageId> {
        if self.message_type != MessageType::System {
            return None;
        }
        self.metadata
            .get(DELETED_MESSAGE_KEY)
            .and_then(|raw| raw.parse().ok())
    }
}

/// Client request to send a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Recipient of the message.
    pub receiver_id: UserId,
    /// Listing the conversation is about.
    pub listing_id: ListingId,
    /// Message body.
    pub content: String,
    /// Kind of content; defaults to TEXT.
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    /// Opaque client metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Error returned when a send request fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty or whitespace.
    #[error("message content is empty")]
    EmptyContent,
    /// Message content exceeds the maximum allowed length.
    #[error("message too long ({len} characters, max {max})")]
    ContentTooLong {
        /// Actual length in characters.
        len: usize,
        /// Maximum allowed length in characters.
        max: usize,
    },
    /// A required identifier is missing.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    /// Sender and receiver are the same user.
    #[error("cannot send a message to yourself")]
    SelfAddressed,
    /// The message type is reserved for the server.
    #[error("message type {0:?} cannot be sent by clients")]
    ReservedType(MessageType),
}

impl SendMessage {
    /// Validates this request on behalf of `sender`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found: missing ids, a
    /// self-addressed message, a reserved type, empty content, or content
    /// longer than [`MAX_CONTENT_CHARS`].
    pub fn validate(&self, sender: &UserId) -> Result<(), ValidationError> {
        if sender.is_blank() {
            return Err(ValidationError::MissingField("senderId"));
        }
        if self.receiver_id.is_blank() {
            return Err(ValidationError::MissingField("receiverId"));
        }
        if self.listing_id.is_blank() {
            return Err(ValidationError::MissingField("listingId"));
        }
        if &self.receiver_id == sender {
            return Err(ValidationError::SelfAddressed);
        }
        if self.message_type == MessageType::System {
            return Err(ValidationError::ReservedType(self.message_type));
        }
        if self.content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let len = self.content.chars().count();
        if len > MAX_CONTENT_CHARS {
            return Err(ValidationError::ContentTooLong {
                len,
                max: MAX_CONTENT_CHARS,
            });
        }
        Ok(())
    }
}
