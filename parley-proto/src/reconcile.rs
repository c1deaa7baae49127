//! Client-side reconciliation of a thread.
//!
//! A client that was offline asks for every message created after the last
//! `createdAt` it holds and merges the answer by message id. Merging is
//! idempotent and commutative for the fields the server can change:
//!
//! - an unknown id is inserted;
//! - a known id keeps the most advanced status (statuses never move back);
//! - `deliveredAt` / `readAt` / deletion flags are kept once set.
//!
//! SYSTEM deletion notices are transient: they mark the referenced message
//! as deleted and are never stored themselves.

use std::collections::HashMap;

use crate::event::{ClientEvent, ServerEvent};
use crate::message::{Message, MessageId, MessageStatus, MessageType, ThreadId, Timestamp};

/// Result of merging one message into a [`LocalThread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The message was not known before.
    Inserted,
    /// A known message moved forward.
    Updated,
    /// Nothing changed (re-delivery of a known state).
    Unchanged,
    /// The message belongs to another thread or references an unknown id.
    Ignored,
}

/// Local copy of one thread, merged by message id.
#[derive(Debug, Clone)]
pub struct LocalThread {
    thread_id: ThreadId,
    messages: HashMap<MessageId, Message>,
    cursor: Timestamp,
}

impl LocalThread {
    /// Creates an empty local thread.
    #[must_use]
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            messages: HashMap::new(),
            cursor: Timestamp::default(),
        }
    }

    /// Thread this copy belongs to.
    #[must_use]
    pub const fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Highest `createdAt` merged so far; the `since` of the next sync.
    #[must_use]
    pub const fn cursor(&self) -> Timestamp {
        self.cursor
    }

    /// Number of messages held, including locally deleted ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no message has been merged yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Looks up a message by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Visible (non-deleted) messages, oldest first.
    #[must_use]
    pub fn visible(&self) -> Vec<&Message> {
        let mut out: Vec<&Message> = self.messages.values().filter(|m| !m.is_deleted).collect();
        out.sort_by_key(|m| (m.created_at, m.id));
        out
    }

    /// Builds the `sync` request for everything after the cursor.
    #[must_use]
    pub fn sync_request(&self, limit: Option<usize>) -> ClientEvent {
        ClientEvent::Sync {
            thread_id: self.thread_id.clone(),
            since: self.cursor,
            limit,
        }
    }

    /// Merges one message.
    pub fn merge(&mut self, incoming: Message) -> MergeOutcome {
        if incoming.thread_id != self.thread_id {
            return MergeOutcome::Ignored;
        }
        if incoming.message_type == MessageType::System {
            return match incoming.deleted_message_id() {
                Some(target) => self.mark_deleted(&target, &incoming),
                None => MergeOutcome::Ignored,
            };
        }

        self.cursor = self.cursor.max(incoming.created_at);
        let Some(local) = self.messages.get_mut(&incoming.id) else {
            self.messages.insert(incoming.id, incoming);
            return MergeOutcome::Inserted;
        };

        let mut changed = false;
        if let Some(next) = local.status.advance(incoming.status) {
            local.status = next;
            changed = true;
        }
        if local.delivered_at.is_none() && incoming.delivered_at.is_some() {
            local.delivered_at = incoming.delivered_at;
            changed = true;
        }
        if local.read_at.is_none() && incoming.read_at.is_some() {
            local.read_at = incoming.read_at;
            changed = true;
        }
        if !local.is_deleted && incoming.is_deleted {
            local.is_deleted = true;
            local.deleted_at = incoming.deleted_at;
            local.deleted_by = incoming.deleted_by;
            changed = true;
        }

        if changed {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Unchanged
        }
    }

    /// Merges a batch, returning how many messages were inserted or updated.
    pub fn merge_all(&mut self, batch: impl IntoIterator<Item = Message>) -> usize {
        batch
            .into_iter()
            .map(|m| self.merge(m))
            .filter(|o| matches!(o, MergeOutcome::Inserted | MergeOutcome::Updated))
            .count()
    }

    /// Applies a `messageStatus` notification.
    pub fn apply_status(&mut self, id: &MessageId, status: MessageStatus) -> MergeOutcome {
        let Some(local) = self.messages.get_mut(id) else {
            return MergeOutcome::Ignored;
        };
        match local.status.advance(status) {
            Some(next) => {
                local.status = next;
                MergeOutcome::Updated
            }
            None => MergeOutcome::Unchanged,
        }
    }

    /// Applies any server event relevant to this thread.
    pub fn apply_event(&mut self, event: &ServerEvent) -> MergeOutcome {
        match event {
            ServerEvent::Message(ev) => self.merge(ev.message.clone()),
            ServerEvent::MessageStatus {
                message_id,
                thread_id,
                status,
            } if *thread_id == self.thread_id => self.apply_status(message_id, *status),
            ServerEvent::SyncBatch {
                thread_id,
                messages,
            } if *thread_id == self.thread_id => {
                if self.merge_all(messages.iter().cloned()) > 0 {
                    MergeOutcome::Updated
                } else {
                    MergeOutcome::Unchanged
                }
            }
            _ => MergeOutcome::Ignored,
        }
    }

    fn mark_deleted(&mut self, target: &MessageId, notice: &Message) -> MergeOutcome {
        let Some(local) = self.messages.get_mut(target) else {
            return MergeOutcome::Ignored;
        };
        if local.is_deleted {
            return MergeOutcome::Unchanged;
        }
        local.is_deleted = true;
        local.deleted_at = Some(notice.created_at);
        local.deleted_by = Some(notice.sender_id.clone());
        MergeOutcome::Updated
    }
}
