//! Message store: the single source of truth for messages and their status.
//!
//! The [`MessageStore`] trait is the collaborator interface the service
//! consumes. Every mutation is a single atomic write keyed by message id, so
//! concurrent status updates from different gateway instances resolve under
//! the forward-only rule: the furthest legal transition wins, the others are
//! no-ops.
//!
//! [`InMemoryMessageStore`] keeps everything in process memory and is used by
//! single-node deployments and tests.

use std::collections::HashMap;

use parley_proto::message::{
    ListingId, Message, MessageId, MessageStatus, ThreadId, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested message does not exist.
    #[error("message {0} not found")]
    NotFound(MessageId),

    /// The underlying storage is full or unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Ordering of a thread page by `createdAt`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Oldest first.
    #[serde(alias = "ASC")]
    Asc,
    /// Newest first (live feed).
    #[default]
    #[serde(alias = "DESC")]
    Desc,
}

/// Query for the messages a user exchanged about a listing.
#[derive(Debug, Clone)]
pub struct ListingQuery {
    /// Listing the messages are about.
    pub listing_id: ListingId,
    /// Only messages this user sent or received.
    pub user_id: UserId,
    /// Number of matching messages to skip.
    pub offset: usize,
    /// Maximum number of messages to return.
    pub limit: usize,
    /// Ordering by `createdAt`.
    pub order: SortOrder,
}

/// One page of a listing query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    /// Messages in the requested order.
    pub messages: Vec<Message>,
    /// Number of matching messages across all pages.
    pub total: usize,
}

/// Outcome of a status compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The status moved forward; carries the updated record.
    Applied(Message),
    /// The transition was not forward; carries the unchanged record.
    Unchanged(Message),
}

impl StatusUpdate {
    /// The message after the update attempt.
    #[must_use]
    pub const fn message(&self) -> &Message {
        match self {
            Self::Applied(m) | Self::Unchanged(m) => m,
        }
    }
}

/// Outcome of inserting a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inserted {
    /// The stored record, with `createdAt` assigned by the store.
    pub message: Message,
    /// Whether this is the first message of its thread.
    pub first_in_thread: bool,
}

/// A conversation a user takes part in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSummary {
    /// Thread key.
    pub thread_id: ThreadId,
    /// Both participants, sorted.
    pub participants: [UserId; 2],
    /// Listing of the most recent message.
    pub listing_id: ListingId,
}

/// Trait for the durable message store.
///
/// Implementations include:
/// - [`InMemoryMessageStore`] -- process-local store for single-node runs and tests
pub trait MessageStore: Send + Sync + 'static {
    /// Inserts a new message in a single atomic write.
    ///
    /// The store assigns `createdAt`, strictly increasing across inserts.
    fn insert(
        &self,
        message: Message,
    ) -> impl std::future::Future<Output = Result<Inserted, StoreError>> + Send;

    /// Looks up a message by id, including soft-deleted ones.
    fn find(
        &self,
        id: &MessageId,
    ) -> impl std::future::Future<Output = Result<Option<Message>, StoreError>> + Send;

    /// Moves a message's status towards `target` if that is a forward
    /// transition, stamping `deliveredAt`/`readAt` with `at`.
    fn update_status(
        &self,
        id: &MessageId,
        target: MessageStatus,
        at: Timestamp,
    ) -> impl std::future::Future<Output = Result<StatusUpdate, StoreError>> + Send;

    /// Soft-deletes a message. Returns `false` if it was already deleted.
    fn soft_delete(
        &self,
        id: &MessageId,
        by: &UserId,
        at: Timestamp,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Non-deleted messages of a listing the user sent or received.
    fn listing_page(
        &self,
        query: &ListingQuery,
    ) -> impl std::future::Future<Output = Result<ListingPage, StoreError>> + Send;

    /// Non-deleted messages of a thread created after `since`, oldest first.
    fn thread_since(
        &self,
        thread_id: &ThreadId,
        since: Timestamp,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, StoreError>> + Send;

    /// Every thread the user takes part in.
    fn threads_for_user(
        &self,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<ThreadSummary>, StoreError>> + Send;
}

#[derive(Debug, Default)]
struct Inner {
    /// Messages in insertion order, which is also `createdAt` order.
    messages: Vec<Message>,
    /// Message id to position in `messages`.
    index: HashMap<MessageId, usize>,
    /// Thread key to the positions of its messages.
    threads: HashMap<ThreadId, Vec<usize>>,
    /// Last assigned `createdAt`.
    last_created: Timestamp,
}

impl Inner {
    fn get_mut(&mut self, id: &MessageId) -> Result<&mut Message, StoreError> {
        let pos = *self.index.get(id).ok_or(StoreError::NotFound(*id))?;
        self.messages
            .get_mut(pos)
            .ok_or_else(|| StoreError::Unavailable(format!("index points past end for {id}")))
    }
}

/// In-memory message store.
///
/// Thread-safe via [`RwLock`]; each operation takes the lock once, which makes
/// every write atomic with respect to concurrent readers and writers.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    inner: RwLock<Inner>,
}

impl InMemoryMessageStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages, including soft-deleted ones.
    pub async fn len(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    /// Whether the store holds no message.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.messages.is_empty()
    }
}

impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, mut message: Message) -> Result<Inserted, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.index.contains_key(&message.id) {
            return Err(StoreError::WriteFailed(format!(
                "duplicate message id {}",
                message.id
            )));
        }

        let created_at = Timestamp::now().max(inner.last_created.next());
        inner.last_created = created_at;
        message.created_at = created_at;

        let pos = inner.messages.len();
        inner.index.insert(message.id, pos);
        let thread = inner.threads.entry(message.thread_id.clone()).or_default();
        let first_in_thread = thread.is_empty();
        thread.push(pos);
        inner.messages.push(message.clone());
        drop(inner);

        Ok(Inserted {
            message,
            first_in_thread,
        })
    }

    async fn find(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .index
            .get(id)
            .and_then(|pos| inner.messages.get(*pos))
            .cloned())
    }

    async fn update_status(
        &self,
        id: &MessageId,
        target: MessageStatus,
        at: Timestamp,
    ) -> Result<StatusUpdate, StoreError> {
        let mut inner = self.inner.write().await;
        let message = inner.get_mut(id)?;
        let Some(next) = message.status.advance(target) else {
            return Ok(StatusUpdate::Unchanged(message.clone()));
        };

        message.status = next;
        match next {
            MessageStatus::Delivered => {
                message.delivered_at.get_or_insert(at);
            }
            MessageStatus::Read => {
                message.delivered_at.get_or_insert(at);
                message.read_at.get_or_insert(at);
            }
            MessageStatus::Sent => {}
        }
        Ok(StatusUpdate::Applied(message.clone()))
    }

    async fn soft_delete(
        &self,
        id: &MessageId,
        by: &UserId,
        at: Timestamp,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let message = inner.get_mut(id)?;
        if message.is_deleted {
            return Ok(false);
        }
        message.is_deleted = true;
        message.deleted_at = Some(at);
        message.deleted_by = Some(by.clone());
        Ok(true)
    }

    async fn listing_page(&self, query: &ListingQuery) -> Result<ListingPage, StoreError> {
        let inner = self.inner.read().await;
        let matching: Vec<&Message> = inner
            .messages
            .iter()
            .filter(|m| {
                !m.is_deleted
                    && m.listing_id == query.listing_id
                    && m.is_participant(&query.user_id)
            })
            .collect();
        let total = matching.len();

        let page = |iter: &mut dyn Iterator<Item = &&Message>| -> Vec<Message> {
            iter.skip(query.offset)
                .take(query.limit)
                .map(|m| (*m).clone())
                .collect()
        };
        let messages = match query.order {
            SortOrder::Asc => page(&mut matching.iter()),
            SortOrder::Desc => page(&mut matching.iter().rev()),
        };
        drop(inner);

        Ok(ListingPage { messages, total })
    }

    async fn thread_since(
        &self,
        thread_id: &ThreadId,
        since: Timestamp,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let Some(positions) = inner.threads.get(thread_id) else {
            return Ok(Vec::new());
        };
        Ok(positions
            .iter()
            .filter_map(|pos| inner.messages.get(*pos))
            .filter(|m| !m.is_deleted && m.created_at > since)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn threads_for_user(&self, user_id: &UserId) -> Result<Vec<ThreadSummary>, StoreError> {
        let inner = self.inner.read().await;
        let mut summaries = Vec::new();
        for positions in inner.threads.values() {
            let Some(latest) = positions.last().and_then(|pos| inner.messages.get(*pos)) else {
                continue;
            };
            if !latest.is_participant(user_id) {
                continue;
            }
            let mut participants = [latest.sender_id.clone(), latest.receiver_id.clone()];
            participants.sort();
            summaries.push(ThreadSummary {
                thread_id: latest.thread_id.clone(),
                participants,
                listing_id: latest.listing_id.clone(),
            });
        }
        drop(inner);
        summaries.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        Ok(summaries)
    }
}
