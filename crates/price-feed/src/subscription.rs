//! Live update fan-out
//!
//! Every subscriber owns a bounded queue. Broadcasting never waits: when a
//! queue is full the oldest unread update is overwritten, so a slow consumer
//! sees gaps instead of stalling the commit path.

use crossbeam::queue::ArrayQueue;
use futures::Stream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

use oracle_core::AggregatedPrice;

/// Handle identifying one subscription of one asset
pub type SubscriptionId = u64;

/// Queue shared between the broadcaster and one subscriber
#[derive(Debug)]
pub(crate) struct SubscriberQueue {
    queue: ArrayQueue<AggregatedPrice>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue, overwriting the oldest entry when full. Returns true on overwrite.
    fn push(&self, price: AggregatedPrice) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let overwritten = self.queue.force_push(price).is_some();
        if overwritten {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        overwritten
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Subscribers of one asset
#[derive(Debug, Default)]
pub(crate) struct SubscriberList {
    subscribers: Mutex<Vec<(SubscriptionId, Arc<SubscriberQueue>)>>,
    next_id: AtomicU64,
}

impl SubscriberList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        asset_id: &str,
        capacity: usize,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let queue = Arc::new(SubscriberQueue::new(capacity));
        self.subscribers.lock().push((id, Arc::clone(&queue)));

        Subscription {
            id,
            asset_id: asset_id.to_string(),
            queue,
            list: Arc::downgrade(self),
        }
    }

    /// Detach and close one subscriber
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        match subscribers.iter().position(|(sub_id, _)| *sub_id == id) {
            Some(idx) => {
                let (_, queue) = subscribers.swap_remove(idx);
                queue.close();
                true
            }
            None => false,
        }
    }

    /// Deliver to every subscriber; returns how many queues overwrote an entry
    pub(crate) fn broadcast(&self, price: &AggregatedPrice) -> usize {
        let subscribers = self.subscribers.lock();
        subscribers
            .iter()
            .filter(|(_, queue)| queue.push(price.clone()))
            .count()
    }

    pub(crate) fn close_all(&self) {
        for (_, queue) in self.subscribers.lock().drain(..) {
            queue.close();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Receiving end of a subscription
///
/// Yields every commit for the asset made after subscribing. Dropping it
/// releases the subscription slot immediately.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    asset_id: String,
    queue: Arc<SubscriberQueue>,
    list: Weak<SubscriberList>,
}

impl Subscription {
    /// A subscription that is already closed
    pub(crate) fn closed(asset_id: &str) -> Self {
        let queue = Arc::new(SubscriberQueue::new(1));
        queue.close();
        Self {
            id: 0,
            asset_id: asset_id.to_string(),
            queue,
            list: Weak::new(),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    /// Next update, or `None` once the subscription is closed and drained
    pub async fn recv(&mut self) -> Option<AggregatedPrice> {
        loop {
            if let Some(price) = self.queue.queue.pop() {
                return Some(price);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return self.queue.queue.pop();
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<AggregatedPrice> {
        self.queue.queue.pop()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }

    /// Updates this subscriber lost to queue overflow
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> impl Stream<Item = AggregatedPrice> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|price| (price, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.remove(self.id);
        }
        self.queue.close();
    }
}
