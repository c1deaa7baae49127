//! Message service: validation, persistence and orchestration.
//!
//! Every operation takes the acting user explicitly; the gateway and the HTTP
//! API resolve it from the identity token before calling in. Persistence
//! always happens before fan-out, and a fan-out failure never undoes a write.

use std::sync::Arc;

use parley_proto::event::{MessageEvent, ServerEvent};
use parley_proto::message::{
    DELETED_MESSAGE_KEY, ListingId, Message, MessageId, MessageStatus, MessageType, Metadata,
    SendMessage, ThreadId, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryStateMachine;
use crate::error::ChatError;
use crate::fanout::{Fanout, FanoutError, Route, RoomRef};
use crate::registry::{ConnectionId, ThreadRegistry};
use crate::store::{ListingQuery, MessageStore, SortOrder, ThreadSummary};

/// Largest page a listing query may ask for.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_LIMIT: usize = 20;

/// Reconciliation batch size used when the caller does not ask for one.
pub const DEFAULT_SYNC_LIMIT: usize = 100;

/// Largest reconciliation batch.
pub const MAX_SYNC_LIMIT: usize = 500;

/// Content of the SYSTEM notice sent when a message is deleted.
const DELETED_NOTICE: &str = "Message deleted";

/// Page parameters of a listing query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: usize,
    /// Page size, `1..=100`.
    pub limit: usize,
    /// Ordering by `createdAt`.
    pub sort: SortOrder,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
            sort: SortOrder::Desc,
        }
    }
}

/// One page of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPage {
    /// Messages of this page.
    pub messages: Vec<Message>,
    /// Page number that was requested.
    pub page: usize,
    /// Page size that was requested.
    pub limit: usize,
    /// Number of matching messages across all pages.
    pub total: usize,
    /// Whether a further page exists.
    pub has_more: bool,
}

/// The message service of one gateway instance.
pub struct MessageService<S> {
    store: Arc<S>,
    registry: Arc<ThreadRegistry>,
    fanout: Arc<Fanout>,
    delivery: DeliveryStateMachine<S>,
}

impl<S> std::fmt::Debug for MessageService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageService")
            .field("instance_id", &self.fanout.instance_id())
            .finish_non_exhaustive()
    }
}

impl<S: MessageStore> MessageService<S> {
    /// Wires a service over its collaborators.
    pub fn new(store: Arc<S>, registry: Arc<ThreadRegistry>, fanout: Arc<Fanout>) -> Self {
        let delivery = DeliveryStateMachine::new(Arc::clone(&store), Arc::clone(&fanout));
        Self {
            store,
            registry,
            fanout,
            delivery,
        }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// This instance's thread registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    /// This instance's fan-out front.
    #[must_use]
    pub const fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    /// The delivery state machine.
    #[must_use]
    pub const fn delivery(&self) -> &DeliveryStateMachine<S> {
        &self.delivery
    }

    /// Validates, persists and fans out a new message from `sender`.
    ///
    /// The receiver gets the message on every instance holding one of its
    /// connections. The sender's other connections get a copy too; `origin`
    /// (the connection that sent it, if any) is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] before anything is written, or
    /// [`ChatError::Persistence`] if the store rejects the write.
    pub async fn send(
        &self,
        request: SendMessage,
        sender: &UserId,
        origin: Option<ConnectionId>,
    ) -> Result<Message, ChatError> {
        request.validate(sender)?;

        let thread_id = ThreadRegistry::resolve_thread_id(sender, &request.receiver_id);
        let message = Message {
            id: MessageId::new(),
            sender_id: sender.clone(),
            receiver_id: request.receiver_id,
            listing_id: request.listing_id,
            content: request.content,
            message_type: request.message_type,
            status: MessageStatus::Sent,
            thread_id,
            created_at: Timestamp::default(),
            delivered_at: None,
            read_at: None,
            metadata: request.metadata,
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
        };

        let inserted = self.store.insert(message).await.map_err(|e| {
            tracing::error!(user_id = %sender, error = %e, "failed to persist message");
            ChatError::from(e)
        })?;
        let message = inserted.message;
        tracing::info!(
            message_id = %message.id,
            thread_id = %message.thread_id,
            user_id = %sender,
            "message persisted"
        );

        let room = room_ref(&message);
        if let Some(conn) = origin {
            let attached = self
                .registry
                .create_or_get_room(&room.thread_id, &room.participants, &room.listing_id)
                .and_then(|_| self.registry.attach(&room.thread_id, conn));
            if let Err(e) = attached {
                tracing::warn!(
                    thread_id = %room.thread_id,
                    error = %e,
                    "room upsert failed"
                );
            }
        }

        if inserted.first_in_thread {
            let created = ServerEvent::RoomCreated {
                room_id: room.thread_id.clone(),
                participants: room.participants.to_vec(),
                listing_id: room.listing_id.clone(),
            };
            log_publish(&message.id, self.fanout.publish(&room, &created));
        }

        let event = ServerEvent::Message(MessageEvent::from(message.clone()));
        let to_receiver = Route {
            room: Some(room.clone()),
            delivery: Some(message.id),
            exclude: None,
        };
        log_publish(
            &message.id,
            self.fanout
                .publish_to_user(&message.receiver_id, &event, to_receiver),
        );
        let to_sender = Route {
            room: Some(room),
            delivery: None,
            exclude: origin,
        };
        log_publish(
            &message.id,
            self.fanout
                .publish_to_user(&message.sender_id, &event, to_sender),
        );

        Ok(message)
    }

    /// Messages of a listing that `user` sent or received, one page at a time.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] for a blank listing, `page == 0` or
    /// a limit outside `1..=100`.
    pub async fn get_thread(
        &self,
        listing_id: &ListingId,
        user: &UserId,
        request: PageRequest,
    ) -> Result<ThreadPage, ChatError> {
        if listing_id.is_blank() {
            return Err(ChatError::Validation("listingId is required".into()));
        }
        if request.page == 0 {
            return Err(ChatError::Validation("page must be at least 1".into()));
        }
        if !(1..=MAX_PAGE_LIMIT).contains(&request.limit) {
            return Err(ChatError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }

        let offset = (request.page - 1).saturating_mul(request.limit);
        let result = self
            .store
            .listing_page(&ListingQuery {
                listing_id: listing_id.clone(),
                user_id: user.clone(),
                offset,
                limit: request.limit,
                order: request.sort,
            })
            .await?;

        Ok(ThreadPage {
            has_more: offset.saturating_add(result.messages.len()) < result.total,
            messages: result.messages,
            page: request.page,
            limit: request.limit,
            total: result.total,
        })
    }

    /// Marks a message READ on behalf of its receiver.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotFound`] for an unknown message and
    /// [`ChatError::Authorization`] unless `user` is its receiver.
    pub async fn mark_read(&self, id: &MessageId, user: &UserId) -> Result<Message, ChatError> {
        self.acknowledge(id, user, MessageStatus::Read).await
    }

    /// Marks a message DELIVERED on behalf of its receiver.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotFound`] for an unknown message and
    /// [`ChatError::Authorization`] unless `user` is its receiver.
    pub async fn mark_delivered(
        &self,
        id: &MessageId,
        user: &UserId,
    ) -> Result<Message, ChatError> {
        self.acknowledge(id, user, MessageStatus::Delivered).await
    }

    async fn acknowledge(
        &self,
        id: &MessageId,
        user: &UserId,
        target: MessageStatus,
    ) -> Result<Message, ChatError> {
        let message = self.find_for(id, user).await?;
        if &message.receiver_id != user {
            tracing::warn!(
                message_id = %id,
                user_id = %user,
                status = %target,
                "sender tried to acknowledge"
            );
            return Err(ChatError::Authorization(format!(
                "only the receiver can mark message {id} as {target}"
            )));
        }
        let (message, _) = self.delivery.advance(id, target).await?;
        Ok(message)
    }

    /// Soft-deletes a message and tells the other participant.
    ///
    /// Returns `true` if the message was deleted by this call, `false` if it
    /// already was (no notice is sent then).
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotFound`] for an unknown message and
    /// [`ChatError::Authorization`] unless `user` is a participant.
    pub async fn delete(&self, id: &MessageId, user: &UserId) -> Result<bool, ChatError> {
        let message = self.find_for(id, user).await?;
        let now = Timestamp::now();
        if !self.store.soft_delete(id, user, now).await? {
            return Ok(false);
        }
        tracing::info!(message_id = %id, user_id = %user, "message deleted");

        let Some(peer) = message.counterpart(user).cloned() else {
            return Ok(true);
        };
        let mut metadata = Metadata::new();
        metadata.insert(DELETED_MESSAGE_KEY.to_string(), id.to_string());
        let notice = Message {
            id: MessageId::new(),
            sender_id: user.clone(),
            receiver_id: peer.clone(),
            listing_id: message.listing_id.clone(),
            content: DELETED_NOTICE.to_string(),
            message_type: MessageType::System,
            status: MessageStatus::Sent,
            thread_id: message.thread_id.clone(),
            created_at: now,
            delivered_at: None,
            read_at: None,
            metadata,
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
        };
        let event = ServerEvent::Message(MessageEvent::from(notice));
        let route = Route {
            room: Some(room_ref(&message)),
            ..Route::default()
        };
        log_publish(id, self.fanout.publish_to_user(&peer, &event, route));
        Ok(true)
    }

    /// Non-deleted messages of a thread created after `since`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Authorization`] unless `user` is a participant of
    /// the thread, and [`ChatError::Validation`] for a zero limit.
    pub async fn sync(
        &self,
        thread_id: &ThreadId,
        user: &UserId,
        since: Timestamp,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ChatError> {
        if !is_thread_participant(thread_id, user) {
            return Err(ChatError::Authorization(format!(
                "{user} is not a participant of thread {thread_id}"
            )));
        }
        let limit = match limit {
            None => DEFAULT_SYNC_LIMIT,
            Some(0) => return Err(ChatError::Validation("limit must be at least 1".into())),
            Some(n) => n.min(MAX_SYNC_LIMIT),
        };
        // Distinct pairs of hyphenated ids can share a thread key.
        let mut messages = self.store.thread_since(thread_id, since, limit).await?;
        messages.retain(|m| m.is_participant(user));
        tracing::debug!(thread_id = %thread_id, user_id = %user, count = messages.len(), "sync");
        Ok(messages)
    }

    /// Threads `user` takes part in.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] if the store fails.
    pub async fn user_threads(&self, user: &UserId) -> Result<Vec<ThreadSummary>, ChatError> {
        Ok(self.store.threads_for_user(user).await?)
    }

    async fn find_for(&self, id: &MessageId, user: &UserId) -> Result<Message, ChatError> {
        let message = self
            .store
            .find(id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {id}")))?;
        if !message.is_participant(user) {
            tracing::warn!(message_id = %id, user_id = %user, "non-participant access rejected");
            return Err(ChatError::Authorization(format!(
                "{user} is not a participant of message {id}"
            )));
        }
        Ok(message)
    }
}

/// Whether `user` is one of the two users `thread_id` was derived from.
#[must_use]
pub fn is_thread_participant(thread_id: &ThreadId, user: &UserId) -> bool {
    let key = thread_id.as_str();
    let prefix = key
        .strip_prefix(user.as_str())
        .and_then(|rest| rest.strip_prefix('-'));
    let suffix = key
        .strip_suffix(user.as_str())
        .and_then(|rest| rest.strip_suffix('-'));
    [prefix, suffix].into_iter().flatten().any(|other| {
        !other.is_empty() && ThreadId::for_participants(user, &UserId::new(other)) == *thread_id
    })
}

fn room_ref(message: &Message) -> RoomRef {
    let mut participants = [message.sender_id.clone(), message.receiver_id.clone()];
    participants.sort();
    RoomRef {
        thread_id: message.thread_id.clone(),
        participants,
        listing_id: message.listing_id.clone(),
    }
}

fn log_publish(message_id: &MessageId, result: Result<(), FanoutError>) {
    if let Err(e) = result {
        tracing::warn!(message_id = %message_id, error = %e, "fan-out publish failed");
    }
}
