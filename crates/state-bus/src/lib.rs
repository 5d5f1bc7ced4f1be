use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage<E> {
    pub topic: String,
    /// Per-topic publish order, starting at 1.
    pub seq: u64,
    pub payload: E,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("subscription cancelled")]
    Cancelled,
    #[error("subscriber lagged behind by {0} messages")]
    Lagged(u64),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus<E>: Send + Sync {
    fn subscribe(&self, topic: &str) -> Subscription<E>;
    /// Publishes `payload` and returns how many subscribers it reached.
    /// Publishing to a topic nobody observes is not an error.
    fn publish(&self, topic: &str, payload: E) -> BusResult<usize>;
}

struct Topic<E> {
    sender: broadcast::Sender<BusMessage<E>>,
    seq: Mutex<u64>,
}

/// In-memory bus shared by every component of one process.
pub struct LocalBus<E> {
    capacity: usize,
    topics: RwLock<HashMap<String, Arc<Topic<E>>>>,
}

impl<E: Clone + Send + 'static> Default for LocalBus<E> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl<E: Clone + Send + 'static> LocalBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn topic(&self, topic: &str) -> Arc<Topic<E>> {
        if let Some(existing) = self.topics.read().get(topic) {
            return Arc::clone(existing);
        }
        let mut guard = self.topics.write();
        let capacity = self.capacity;
        Arc::clone(guard.entry(topic.to_string()).or_insert_with(|| {
            Arc::new(Topic {
                sender: broadcast::channel(capacity).0,
                seq: Mutex::new(0),
            })
        }))
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|t| t.sender.receiver_count())
            .unwrap_or(0)
    }
}

impl<E: Clone + Send + Sync + 'static> Bus<E> for LocalBus<E> {
    fn subscribe(&self, topic: &str) -> Subscription<E> {
        Subscription::new(self.topic(topic).sender.subscribe())
    }

    fn publish(&self, topic: &str, payload: E) -> BusResult<usize> {
        let entry = self.topic(topic);
        // Held across the send so delivery order matches seq.
        let mut seq = entry.seq.lock();
        *seq += 1;
        match entry.sender.send(BusMessage {
            topic: topic.to_string(),
            seq: *seq,
            payload,
        }) {
            Ok(reached) => Ok(reached),
            Err(_) => Ok(0),
        }
    }
}

/// A live subscription. Dropping it or calling [`Subscription::cancel`] ends it;
/// a pending `recv` observes the cancellation and returns `BusError::Cancelled`.
pub struct Subscription<E> {
    rx: broadcast::Receiver<BusMessage<E>>,
    cancel: CancellationToken,
}

impl<E: Clone> Subscription<E> {
    fn new(rx: broadcast::Receiver<BusMessage<E>>) -> Self {
        Self {
            rx,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn recv(&mut self) -> BusResult<BusMessage<E>> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BusError::Cancelled),
            msg = self.rx.recv() => match msg {
                Ok(msg) => Ok(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
                Err(broadcast::error::RecvError::Closed) => Err(BusError::Closed),
            },
        }
    }

    pub fn try_recv(&mut self) -> BusResult<Option<BusMessage<E>>> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
            Err(broadcast::error::TryRecvError::Closed) => Err(BusError::Closed),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that cancels this subscription from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus: LocalBus<&'static str> = LocalBus::new();
        let mut sub = bus.subscribe("connection.state");
        bus.publish("connection.state", "connecting").expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "connection.state");
        assert_eq!(msg.payload, "connecting");
        assert_eq!(msg.seq, 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus: LocalBus<u32> = LocalBus::new();
        assert_eq!(bus.publish("workspace.events", 7), Ok(0));
    }

    #[tokio::test]
    async fn preserves_publish_order() {
        let bus: LocalBus<u32> = LocalBus::new();
        let mut sub = bus.subscribe("t");
        for value in 0..10 {
            bus.publish("t", value).unwrap();
        }
        for expected in 0..10 {
            let msg = sub.recv().await.unwrap();
            assert_eq!(msg.payload, expected);
            assert_eq!(msg.seq, u64::from(expected) + 1);
        }
    }

    #[tokio::test]
    async fn cancel_wakes_pending_recv() {
        let bus: LocalBus<u32> = LocalBus::new();
        let mut sub = bus.subscribe("t");
        let token = sub.cancel_token();
        let waiter = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        let result = waiter.await.unwrap();
        assert_eq!(result, Err(BusError::Cancelled));
    }

    #[tokio::test]
    async fn slow_subscriber_reports_lag() {
        let bus: LocalBus<u32> = LocalBus::with_capacity(2);
        let mut sub = bus.subscribe("t");
        for value in 0..5 {
            bus.publish("t", value).unwrap();
        }
        assert_eq!(sub.recv().await, Err(BusError::Lagged(3)));
        assert_eq!(sub.recv().await.unwrap().payload, 3);
    }

    #[tokio::test]
    async fn dropped_subscription_detaches() {
        let bus: LocalBus<u32> = LocalBus::new();
        let sub = bus.subscribe("t");
        assert_eq!(bus.subscriber_count("t"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("t"), 0);
    }
}
