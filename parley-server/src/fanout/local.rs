//! In-process broker shared by gateway instances of one process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use parley_proto::bus::Topic;
use tokio::sync::mpsc;

use super::{Broker, Delivery, FanoutError};

/// Topic → subscribed instance ids. Used by the local bus and the hub.
#[derive(Debug, Default)]
pub struct TopicTable {
    topics: HashMap<Topic, HashSet<String>>,
}

impl TopicTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `instance` to the subscribers of `topic`.
    pub fn subscribe(&mut self, topic: &Topic, instance: &str) {
        self.topics
            .entry(topic.clone())
            .or_default()
            .insert(instance.to_string());
    }

    /// Removes `instance` from the subscribers of `topic`.
    pub fn unsubscribe(&mut self, topic: &Topic, instance: &str) {
        if let Some(subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(instance);
            if subscribers.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    /// Drops every subscription held by `instance`.
    pub fn remove_instance(&mut self, instance: &str) {
        self.topics.retain(|_, subscribers| {
            subscribers.remove(instance);
            !subscribers.is_empty()
        });
    }

    /// Instances subscribed to `topic`.
    #[must_use]
    pub fn subscribers(&self, topic: &Topic) -> Vec<String> {
        self.topics
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of topics with at least one subscriber.
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether no topic has a subscriber.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[derive(Debug, Default)]
struct BusInner {
    table: TopicTable,
    instances: HashMap<String, mpsc::UnboundedSender<Delivery>>,
}

/// In-process hub. Cloning shares the same hub.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    inner: Arc<Mutex<BusInner>>,
}

impl LocalBus {
    /// Creates a new bus with no attached instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an instance and returns its broker handle and delivery channel.
    ///
    /// Instance ids must be unique on one bus.
    #[must_use]
    pub fn attach(
        &self,
        instance_id: impl Into<String>,
    ) -> (LocalBroker, mpsc::UnboundedReceiver<Delivery>) {
        let instance_id = instance_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.table.remove_instance(&instance_id);
        inner.instances.insert(instance_id.clone(), tx);
        drop(inner);
        (
            LocalBroker {
                instance_id,
                bus: self.clone(),
            },
            rx,
        )
    }

    /// Number of attached instances.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.inner.lock().instances.len()
    }

    fn detach(&self, instance_id: &str) {
        let mut inner = self.inner.lock();
        inner.table.remove_instance(instance_id);
        inner.instances.remove(instance_id);
    }
}

/// One instance's handle on a [`LocalBus`]. Detaches on drop.
#[derive(Debug)]
pub struct LocalBroker {
    instance_id: String,
    bus: LocalBus,
}

impl Broker for LocalBroker {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn publish(&self, topic: &Topic, payload: Vec<u8>) -> Result<(), FanoutError> {
        let inner = self.bus.inner.lock();
        for instance in inner.table.subscribers(topic) {
            let Some(tx) = inner.instances.get(&instance) else {
                continue;
            };
            let delivery = Delivery {
                topic: topic.clone(),
                payload: payload.clone(),
            };
            if tx.send(delivery).is_err() {
                tracing::debug!(instance = %instance, topic = %topic, "local subscriber gone");
            }
        }
        Ok(())
    }

    fn subscribe(&self, topic: &Topic) -> Result<(), FanoutError> {
        let mut inner = self.bus.inner.lock();
        if !inner.instances.contains_key(&self.instance_id) {
            return Err(FanoutError::Closed);
        }
        inner.table.subscribe(topic, &self.instance_id);
        Ok(())
    }

    fn unsubscribe(&self, topic: &Topic) -> Result<(), FanoutError> {
        self.bus
            .inner
            .lock()
            .table
            .unsubscribe(topic, &self.instance_id);
        Ok(())
    }
}

impl Drop for LocalBroker {
    fn drop(&mut self) {
        self.bus.detach(&self.instance_id);
    }
}
