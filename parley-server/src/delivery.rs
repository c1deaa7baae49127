//! Delivery state machine: SENT → DELIVERED → READ.
//!
//! Transitions are validated by [`MessageStatus::advance`] and persisted by the
//! store's atomic compare-and-set. Only an applied transition notifies the
//! sender; repeated or backward transitions are silent no-ops.

use std::sync::Arc;

use parley_proto::event::ServerEvent;
use parley_proto::message::{Message, MessageId, MessageStatus, Timestamp};

use crate::fanout::{Fanout, Route};
use crate::store::{MessageStore, StatusUpdate, StoreError};

/// Applies status transitions and notifies senders.
pub struct DeliveryStateMachine<S> {
    store: Arc<S>,
    fanout: Arc<Fanout>,
}

impl<S> std::fmt::Debug for DeliveryStateMachine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStateMachine").finish_non_exhaustive()
    }
}

impl<S: MessageStore> DeliveryStateMachine<S> {
    /// Creates a state machine over `store`, notifying through `fanout`.
    pub const fn new(store: Arc<S>, fanout: Arc<Fanout>) -> Self {
        Self { store, fanout }
    }

    /// Moves a message towards `target`.
    ///
    /// Returns the message as stored after the attempt, and whether the
    /// transition was applied.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id, or the store's
    /// error if the write fails.
    pub async fn advance(
        &self,
        id: &MessageId,
        target: MessageStatus,
    ) -> Result<(Message, bool), StoreError> {
        match self.store.update_status(id, target, Timestamp::now()).await? {
            StatusUpdate::Applied(message) => {
                tracing::debug!(message_id = %id, status = %message.status, "status advanced");
                self.notify_sender(&message);
                Ok((message, true))
            }
            StatusUpdate::Unchanged(message) => {
                tracing::trace!(
                    message_id = %id,
                    status = %message.status,
                    target = %target,
                    "status transition ignored"
                );
                Ok((message, false))
            }
        }
    }

    fn notify_sender(&self, message: &Message) {
        let event = ServerEvent::MessageStatus {
            message_id: message.id,
            thread_id: message.thread_id.clone(),
            status: message.status,
        };
        if let Err(e) = self
            .fanout
            .publish_to_user(&message.sender_id, &event, Route::default())
        {
            tracing::warn!(
                message_id = %message.id,
                user_id = %message.sender_id,
                error = %e,
                "failed to publish status change"
            );
        }
    }
}
