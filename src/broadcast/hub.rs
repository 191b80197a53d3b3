//! Topic-keyed publish/subscribe fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;

use super::channel::{ChannelError, MessageSource};
use super::message::Message;

/// What happens when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Evict the oldest queued message to make room. Never blocks.
    DropOldest { capacity: usize },
    /// Wait up to `timeout` for room, then drop the new message.
    Block { capacity: usize, timeout: Duration },
}

impl DeliveryPolicy {
    /// Keeps only the most recent message.
    pub fn latest_only() -> Self {
        DeliveryPolicy::DropOldest { capacity: 1 }
    }

    fn capacity(&self) -> usize {
        match *self {
            DeliveryPolicy::DropOldest { capacity } | DeliveryPolicy::Block { capacity, .. } => {
                capacity.max(1)
            }
        }
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy::Block {
            capacity: 256,
            timeout: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Default)]
struct SubscriberCounters {
    alive: AtomicBool,
    // Set before the hub lets go of the sender; the receiver turns the
    // disconnect into `Message::Exit` once the queue is drained.
    exit_requested: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

struct Slot {
    id: u64,
    sender: Sender<Message>,
    // Second handle on the queue so the publisher can evict the oldest entry.
    evict: Receiver<Message>,
    policy: DeliveryPolicy,
    counters: Arc<SubscriberCounters>,
}

impl Slot {
    fn deliver(&self, message: Message) -> bool {
        let delivered = match self.policy {
            DeliveryPolicy::DropOldest { .. } => match self.sender.try_send(message) {
                Ok(()) => true,
                Err(TrySendError::Full(message)) => {
                    if self.evict.try_recv().is_ok() {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    self.sender.try_send(message).is_ok()
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            DeliveryPolicy::Block { timeout, .. } => {
                match self.sender.send_timeout(message, timeout) {
                    Ok(()) => true,
                    Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => {
                        false
                    }
                }
            }
        };
        if delivered {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    /// Marks the subscriber for exit. The sentinel surfaces after every
    /// message already queued, once the last sender handle is dropped.
    fn request_exit(&self) {
        self.counters.exit_requested.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct HubInner {
    topics: RwLock<HashMap<String, Vec<Arc<Slot>>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl HubInner {
    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics.write();
        if let Some(slots) = topics.get_mut(topic) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// Many-to-many fan-out of [`Message`]s keyed by topic.
///
/// Every subscriber of a topic receives every message published on it,
/// in publish order per producer. Each subscriber has its own bounded
/// queue and [`DeliveryPolicy`], so a slow consumer only affects itself.
/// Cloning the hub yields another handle to the same topics.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber on `topic`.
    pub fn subscribe(&self, topic: impl Into<String>, policy: DeliveryPolicy) -> Subscription {
        let topic = topic.into();
        let (sender, receiver) = bounded(policy.capacity());
        let counters = Arc::new(SubscriberCounters::default());
        counters.alive.store(true, Ordering::Release);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .topics
            .write()
            .entry(topic.clone())
            .or_default()
            .push(Arc::new(Slot {
                id,
                sender,
                evict: receiver.clone(),
                policy,
                counters: Arc::clone(&counters),
            }));

        tracing::debug!(topic = %topic, id, ?policy, "Subscribed");

        Subscription {
            id,
            topic,
            receiver,
            counters,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Publishes `message` to every subscriber of `topic`.
    ///
    /// Returns the number of subscribers that accepted the message. A topic
    /// without subscribers is not an error. Publishing [`Message::Exit`]
    /// detaches every subscriber from the topic; each one receives the
    /// sentinel after the messages already in its queue.
    ///
    /// The topic lock is released before delivery, so a blocking
    /// subscriber never holds up publishers or subscribers of other topics.
    pub fn publish(&self, topic: &str, message: Message) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        if message.is_exit() {
            let slots = self.inner.topics.write().remove(topic).unwrap_or_default();
            for slot in &slots {
                slot.request_exit();
            }
            if !slots.is_empty() {
                tracing::debug!(topic, subscribers = slots.len(), "Published exit sentinel");
            }
            return slots.len();
        }

        let slots = match self.inner.topics.read().get(topic) {
            Some(slots) => slots.clone(),
            None => return 0,
        };

        let mut accepted = 0;
        for slot in &slots {
            if slot.deliver(message.clone()) {
                accepted += 1;
            } else {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(topic, id = slot.id, kind = message.kind(), "Subscriber dropped message");
            }
        }
        accepted
    }

    /// Sends the exit sentinel on `topic`.
    pub fn publish_exit(&self, topic: &str) -> usize {
        self.publish(topic, Message::Exit)
    }

    /// Sends the exit sentinel to a single subscriber and detaches it,
    /// leaving the other subscribers of `topic` running. Messages already
    /// queued for it are still delivered ahead of the sentinel.
    ///
    /// Returns false if the subscriber is already gone.
    pub fn exit_subscriber(&self, topic: &str, id: u64) -> bool {
        let slot = {
            let mut topics = self.inner.topics.write();
            let Some(slots) = topics.get_mut(topic) else {
                return false;
            };
            let Some(index) = slots.iter().position(|slot| slot.id == id) else {
                return false;
            };
            let slot = slots.remove(index);
            if slots.is_empty() {
                topics.remove(topic);
            }
            slot
        };
        slot.request_exit();
        tracing::debug!(topic, id, "Sent exit sentinel to subscriber");
        true
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.read().get(topic).map_or(0, Vec::len)
    }

    /// Topics that currently have subscribers, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Total publish calls.
    pub fn published_total(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Total per-subscriber deliveries that were dropped.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("topics", &self.topics())
            .field("published", &self.published_total())
            .finish()
    }
}

/// Receiving end of one subscriber.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    id: u64,
    topic: String,
    receiver: Receiver<Message>,
    counters: Arc<SubscriberCounters>,
    hub: Weak<HubInner>,
}

impl Subscription {
    /// Hub-unique id, usable with [`BroadcastHub::exit_subscriber`].
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// False once the exit sentinel has been received.
    pub fn is_alive(&self) -> bool {
        self.counters.alive.load(Ordering::Acquire)
    }

    /// Messages accepted into this subscriber's queue.
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    /// Messages that never reached this subscriber (full queue).
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Messages waiting in the queue.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Waits up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` on timeout and [`ChannelError::Closed`] after the
    /// exit sentinel has been consumed.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>, ChannelError> {
        if !self.is_alive() {
            return Err(ChannelError::Closed);
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            // The hub dropped its sender: the queue is drained.
            Err(RecvTimeoutError::Disconnected) => {
                self.counters.alive.store(false, Ordering::Release);
                if self.counters.exit_requested.load(Ordering::Acquire) {
                    tracing::debug!(topic = %self.topic, id = self.id, "Subscriber received exit");
                    Ok(Some(Message::Exit))
                } else {
                    Err(ChannelError::Closed)
                }
            }
        }
    }

    /// Detaches from the hub without waiting for a sentinel.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl MessageSource for Subscription {
    fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, ChannelError> {
        self.recv_timeout(timeout)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.counters.alive.store(false, Ordering::Release);
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.topic, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("alive", &self.is_alive())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, PixelFormat};
    use std::thread;

    fn frame(seq: u64) -> Message {
        Message::Frame(Frame::new(vec![0u8; 4], 2, 2, PixelFormat::Mono8, seq))
    }

    fn sequence_of(message: &Message) -> u64 {
        match message {
            Message::Frame(f) => f.sequence(),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.publish("nobody", frame(0)), 0);
        assert_eq!(hub.dropped_total(), 0);
    }

    #[test]
    fn test_fan_out_preserves_order() {
        const N: u64 = 10_000;
        const K: usize = 8;
        let hub = BroadcastHub::new();
        let policy = DeliveryPolicy::Block {
            capacity: 64,
            timeout: Duration::from_secs(5),
        };

        let consumers: Vec<_> = (0..K)
            .map(|_| {
                let sub = hub.subscribe("cam_free_run", policy);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        match sub.recv_timeout(Duration::from_secs(5)).unwrap() {
                            Some(Message::Exit) => break,
                            Some(message) => seen.push(sequence_of(&message)),
                            None => panic!("timed out waiting for frames"),
                        }
                    }
                    seen
                })
            })
            .collect();

        for seq in 0..N {
            assert_eq!(hub.publish("cam_free_run", frame(seq)), K);
        }
        hub.publish_exit("cam_free_run");

        for consumer in consumers {
            let seen = consumer.join().unwrap();
            assert_eq!(seen.len() as u64, N);
            assert!(seen.iter().copied().eq(0..N));
        }
        assert_eq!(hub.subscriber_count("cam_free_run"), 0);
    }

    #[test]
    fn test_drop_oldest_keeps_latest() {
        let hub = BroadcastHub::new();
        let sub = hub.subscribe("t", DeliveryPolicy::DropOldest { capacity: 2 });
        for seq in 0..5 {
            hub.publish("t", frame(seq));
        }
        assert_eq!(sub.dropped(), 3);
        let first = sub.recv_timeout(Duration::from_millis(10)).unwrap().unwrap();
        let second = sub.recv_timeout(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!((sequence_of(&first), sequence_of(&second)), (3, 4));
    }

    #[test]
    fn test_block_policy_drops_after_timeout() {
        let hub = BroadcastHub::new();
        let sub = hub.subscribe(
            "t",
            DeliveryPolicy::Block {
                capacity: 1,
                timeout: Duration::from_millis(5),
            },
        );
        assert_eq!(hub.publish("t", frame(0)), 1);
        assert_eq!(hub.publish("t", frame(1)), 0);
        assert_eq!(sub.dropped(), 1);
        assert_eq!(hub.dropped_total(), 1);
    }

    #[test]
    fn test_exit_reaches_full_queue_and_detaches() {
        let hub = BroadcastHub::new();
        let sub = hub.subscribe("t", DeliveryPolicy::DropOldest { capacity: 1 });
        hub.publish("t", frame(0));
        assert_eq!(hub.publish_exit("t"), 1);
        assert_eq!(hub.subscriber_count("t"), 0);

        let message = sub.recv_timeout(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(sequence_of(&message), 0);
        let message = sub.recv_timeout(Duration::from_millis(10)).unwrap().unwrap();
        assert!(message.is_exit());
        assert!(!sub.is_alive());
        assert!(matches!(
            sub.recv_timeout(Duration::from_millis(1)),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn test_exit_single_subscriber() {
        let hub = BroadcastHub::new();
        let recorder = hub.subscribe("t", DeliveryPolicy::default());
        let tracker = hub.subscribe("t", DeliveryPolicy::default());

        assert!(hub.exit_subscriber("t", tracker.id()));
        assert!(!hub.exit_subscriber("t", tracker.id()));
        assert_eq!(hub.subscriber_count("t"), 1);

        hub.publish("t", frame(1));
        let message = tracker.recv_timeout(Duration::from_millis(10)).unwrap().unwrap();
        assert!(message.is_exit());
        let message = recorder.recv_timeout(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(sequence_of(&message), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = BroadcastHub::new();
        let a = hub.subscribe("t", DeliveryPolicy::default());
        let _b = hub.subscribe("t", DeliveryPolicy::default());
        assert_eq!(hub.subscriber_count("t"), 2);
        a.unsubscribe();
        assert_eq!(hub.subscriber_count("t"), 1);
        assert_eq!(hub.publish("t", frame(0)), 1);
    }

    #[test]
    fn test_exit_keeps_frames_in_full_block_queue() {
        let hub = BroadcastHub::new();
        let sub = hub.subscribe(
            "t",
            DeliveryPolicy::Block {
                capacity: 2,
                timeout: Duration::from_millis(5),
            },
        );
        assert_eq!(hub.publish("t", frame(0)), 1);
        assert_eq!(hub.publish("t", frame(1)), 1);
        assert!(hub.exit_subscriber("t", sub.id()));

        let mut received = Vec::new();
        while let Ok(Some(message)) = sub.recv_timeout(Duration::from_millis(10)) {
            received.push(message);
        }
        assert_eq!(received.len(), 3);
        assert_eq!(sequence_of(&received[0]), 0);
        assert_eq!(sequence_of(&received[1]), 1);
        assert!(received[2].is_exit());
        assert_eq!(sub.dropped(), 0);
    }

    #[test]
    fn test_blocked_subscriber_does_not_stall_other_topics() {
        let hub = BroadcastHub::new();
        let _stalled = hub.subscribe(
            "slow",
            DeliveryPolicy::Block {
                capacity: 1,
                timeout: Duration::from_millis(500),
            },
        );
        hub.publish("slow", frame(0));

        let fast = hub.subscribe("fast", DeliveryPolicy::default());
        let publisher = {
            let hub = hub.clone();
            thread::spawn(move || hub.publish("slow", frame(1)))
        };
        thread::sleep(Duration::from_millis(50));

        let started = std::time::Instant::now();
        assert_eq!(hub.publish("fast", frame(2)), 1);
        assert!(hub.exit_subscriber("fast", fast.id()));
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(sequence_of(&fast.recv_timeout(Duration::from_millis(10)).unwrap().unwrap()), 2);

        assert_eq!(publisher.join().unwrap(), 0);
    }
}
