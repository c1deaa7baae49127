//! Event surface exchanged over a client's persistent connection.
//!
//! Every WebSocket text frame is one JSON object of the form
//! `{"event": "<name>", "data": <payload>}`. [`ClientEvent`] covers what a
//! client may send, [`ServerEvent`] what the server pushes back.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::message::{
    ListingId, Message, MessageId, MessageStatus, SendMessage, ThreadId, Timestamp, UserId,
};

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// First frame on a new connection; carries the identity token.
    Connect {
        /// Token issued by the identity service.
        auth_token: String,
    },
    /// Send a message to another user about a listing.
    Message(SendMessage),
    /// Typing indicator for a room. Never persisted.
    Typing {
        /// Thread the user is typing in.
        room_id: ThreadId,
        /// Whether the user started (`true`) or stopped typing.
        is_typing: bool,
    },
    /// The client displayed the message to its user.
    MessageRead {
        /// Message being acknowledged.
        message_id: MessageId,
    },
    /// The client received the message (explicit delivery confirmation).
    MessageDelivered {
        /// Message being confirmed.
        message_id: MessageId,
    },
    /// Request the messages of a thread created after `since`.
    Sync {
        /// Thread to reconcile.
        thread_id: ThreadId,
        /// Last `createdAt` the client already holds.
        #[serde(default)]
        since: Timestamp,
        /// Maximum number of messages to return.
        #[serde(default)]
        limit: Option<usize>,
    },
}

/// A message pushed to a client, with the legacy `messageId`/`timestamp`
/// aliases next to the full record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    /// The message record.
    #[serde(flatten)]
    pub message: Message,
    /// Same as `message.id`.
    pub message_id: MessageId,
    /// Same as `message.created_at`.
    pub timestamp: Timestamp,
}

impl From<Message> for MessageEvent {
    fn from(message: Message) -> Self {
        Self {
            message_id: message.id,
            timestamp: message.created_at,
            message,
        }
    }
}

/// Machine-readable category of an [`ServerEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The frame could not be parsed.
    Malformed,
    /// The request failed validation.
    Validation,
    /// The token was rejected.
    Authentication,
    /// The user may not act on the target.
    Authorization,
    /// The target does not exist.
    NotFound,
    /// The server failed to process the request.
    Internal,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// The connection was authenticated.
    Connected {
        /// Identity the connection is registered under.
        user_id: UserId,
    },
    /// A message in one of the user's threads.
    Message(MessageEvent),
    /// A room peer started or stopped typing.
    UserTyping {
        /// Room the peer is typing in.
        room_id: ThreadId,
        /// Peer who is typing.
        user_id: UserId,
        /// Whether the peer is currently typing.
        is_typing: bool,
    },
    /// Status of a message the user sent moved forward.
    MessageStatus {
        /// Message whose status changed.
        message_id: MessageId,
        /// Thread the message belongs to.
        thread_id: ThreadId,
        /// New status.
        status: MessageStatus,
    },
    /// First message in a thread created the room.
    RoomCreated {
        /// Thread key of the new room.
        room_id: ThreadId,
        /// Both participants.
        participants: Vec<UserId>,
        /// Listing the room is about.
        listing_id: ListingId,
    },
    /// A room peer went offline.
    UserOffline {
        /// Peer who disconnected.
        user_id: UserId,
    },
    /// Answer to a [`ClientEvent::Sync`] request, ascending by `createdAt`.
    SyncBatch {
        /// Thread the batch belongs to.
        thread_id: ThreadId,
        /// Messages created after the requested cursor.
        messages: Vec<Message>,
    },
    /// A request from this connection failed. Never sent to peers.
    Error {
        /// Error category.
        code: ErrorCode,
        /// Human-readable error description.
        reason: String,
    },
}

impl ServerEvent {
    /// Builds an error event.
    pub fn error(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Error {
            code,
            reason: reason.into(),
        }
    }
}

/// Encodes a [`ServerEvent`] into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_server(event: &ServerEvent) -> Result<String, CodecError> {
    codec::to_json(event)
}

/// Decodes a [`ServerEvent`] from a JSON text frame.
///
/// # Errors
///
/// Returns a [`CodecError`] if the text is not a valid server event.
pub fn decode_server(text: &str) -> Result<ServerEvent, CodecError> {
    codec::from_json(text)
}

/// Encodes a [`ClientEvent`] into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_client(event: &ClientEvent) -> Result<String, CodecError> {
    codec::to_json(event)
}

/// Decodes a [`ClientEvent`] from a JSON text frame.
///
/// # Errors
///
/// Returns a [`CodecError`] if the text is not a valid client event.
pub fn decode_client(text: &str) -> Result<ClientEvent, CodecError> {
    codec::from_json(text)
}
