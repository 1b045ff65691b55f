use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::{mpsc, RwLock};

use super::{ChatEvent, Topic};

/// Bound on each subscriber's queue. A consumer that falls this far behind
/// starts losing events instead of growing server memory.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

type SubscriberId = u64;

/// In-process topic-addressed pub/sub. Fire-and-forget: an event reaches
/// every subscriber registered at the instant of publish, exactly once,
/// and nobody else. Nothing is persisted or acknowledged.
pub struct EventBus {
    topics: RwLock<HashMap<Topic, HashMap<SubscriberId, mpsc::Sender<ChatEvent>>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register one bounded queue under every requested topic. Registration
    /// finishes under the write lock, so a `subscribe` that has returned is
    /// guaranteed to observe any publish that starts afterwards.
    pub async fn subscribe(self: &Arc<Self>, topics: &[Topic]) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);

        let mut map = self.topics.write().await;
        for topic in topics {
            map.entry(*topic).or_default().insert(id, tx.clone());
        }

        Subscription {
            id,
            topics: topics.to_vec(),
            rx,
            bus: Arc::clone(self),
            closed: false,
        }
    }

    /// Deliver `event` to every active subscriber of its topic. A full queue
    /// drops the event for that subscriber only; a closed queue (handle
    /// dropped without `close`) gets pruned.
    pub async fn publish(&self, event: ChatEvent) {
        let topic = event.topic();
        let mut dead = Vec::new();

        {
            let map = self.topics.read().await;
            let Some(subscribers) = map.get(&topic) else {
                return;
            };
            for (&id, tx) in subscribers {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            subscriber = id,
                            topic = topic.as_str(),
                            "subscriber queue full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
                }
            }
        }

        if !dead.is_empty() {
            let mut map = self.topics.write().await;
            if let Some(subscribers) = map.get_mut(&topic) {
                for id in dead {
                    subscribers.remove(&id);
                }
            }
        }
    }

    async fn remove(&self, id: SubscriberId, topics: &[Topic]) {
        let mut map = self.topics.write().await;
        for topic in topics {
            if let Some(subscribers) = map.get_mut(topic) {
                subscribers.remove(&id);
            }
        }
    }

    #[cfg(test)]
    async fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .read()
            .await
            .get(&topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live registration on the bus. Yields events in per-topic publish order
/// until closed; across topics no order is guaranteed.
pub struct Subscription {
    id: SubscriberId,
    topics: Vec<Topic>,
    rx: mpsc::Receiver<ChatEvent>,
    bus: Arc<EventBus>,
    closed: bool,
}

impl Subscription {
    /// Next event, or `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<ChatEvent> {
        self.rx.recv().await
    }

    /// Deregister from every topic. Idempotent; safe from any teardown path.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.bus.remove(self.id, &self.topics).await;
        self.rx.close();
    }
}
