//! Bounded per-listener notification queues.
//!
//! The receive loop pushes every notification into each registered
//! listener's queue without ever waiting. When a queue is full the oldest
//! entry is discarded and the listener's drop counter is bumped, so a slow
//! consumer loses history instead of stalling the connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::protocol::codec::Notification;

/// Default number of notifications buffered per listener.
pub const DEFAULT_LISTENER_CAPACITY: usize = 64;

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug)]
struct ListenerQueue {
    queue: Mutex<VecDeque<Notification>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl ListenerQueue {
    fn push(&self, notification: Notification) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(notification);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Registry of listeners shared between the client and its receive loops.
#[derive(Debug, Default)]
pub(crate) struct ListenerRegistry {
    listeners: Mutex<Vec<(ListenerId, Arc<ListenerQueue>)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new listener with a queue of `capacity` entries.
    pub(crate) fn register(self: &Arc<Self>, capacity: usize) -> NotificationListener {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(ListenerQueue {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_LISTENER_CAPACITY))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        self.listeners.lock().push((id, Arc::clone(&queue)));
        debug!("Registered notification listener {:?}", id);

        NotificationListener {
            id,
            queue,
            registry: Arc::downgrade(self),
        }
    }

    /// Remove a listener; its `recv` then returns `None` once drained.
    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = self.listeners.lock();
            listeners
                .iter()
                .position(|(lid, _)| *lid == id)
                .map(|pos| listeners.swap_remove(pos).1)
        };
        match removed {
            Some(queue) => {
                queue.close();
                debug!("Unregistered notification listener {:?}", id);
                true
            }
            None => false,
        }
    }

    /// Enqueue a notification for every listener. Never blocks on a consumer.
    pub(crate) fn dispatch(&self, notification: &Notification) {
        let queues: Vec<Arc<ListenerQueue>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, queue)| Arc::clone(queue))
            .collect();
        for queue in queues {
            queue.push(notification.clone());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Receiving end of a notification registration.
///
/// Dropping the listener unregisters it.
#[derive(Debug)]
pub struct NotificationListener {
    id: ListenerId,
    queue: Arc<ListenerQueue>,
    registry: Weak<ListenerRegistry>,
}

impl NotificationListener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Wait for the next notification in arrival order.
    ///
    /// Returns `None` once the listener has been unregistered and its
    /// queue drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            if let Some(notification) = self.queue.queue.lock().pop_front() {
                return Some(notification);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            // notify_one stores a permit, so a push between the check and
            // this await is not lost
            self.queue.notify.notified().await;
        }
    }

    /// Take a queued notification without waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.queue.queue.lock().pop_front()
    }

    /// Number of notifications discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Number of notifications waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.queue.lock().len()
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::NotificationKind;
    use serde_json::json;
    use std::time::Duration;

    fn job_changed(job_id: u64) -> Notification {
        Notification {
            kind: NotificationKind::JobStateChanged,
            job_id: Some(job_id),
            payload: json!({"state": 1}),
        }
    }

    #[tokio::test]
    async fn test_dispatch_in_arrival_order() {
        let registry = ListenerRegistry::new();
        let mut first = registry.register(8);
        let mut second = registry.register(8);

        for id in 1..=3 {
            registry.dispatch(&job_changed(id));
        }

        for listener in [&mut first, &mut second] {
            let ids: Vec<u64> = [
                listener.recv().await.unwrap(),
                listener.recv().await.unwrap(),
                listener.recv().await.unwrap(),
            ]
            .iter()
            .filter_map(|n| n.job_id)
            .collect();
            assert_eq!(ids, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let registry = ListenerRegistry::new();
        let mut listener = registry.register(2);

        for id in 1..=5 {
            registry.dispatch(&job_changed(id));
        }

        assert_eq!(listener.dropped(), 3);
        assert_eq!(listener.pending(), 2);
        assert_eq!(listener.try_recv().unwrap().job_id, Some(4));
        assert_eq!(listener.try_recv().unwrap().job_id, Some(5));
        assert!(listener.try_recv().is_none());
    }

    #[test]
    fn test_drop_unregisters() {
        let registry = ListenerRegistry::new();
        let listener = registry.register(4);
        let other = registry.register(4);
        assert_eq!(registry.len(), 2);

        drop(listener);
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(other.id()));
        assert!(!registry.unregister(other.id()));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_dispatch_and_unregister() {
        let registry = ListenerRegistry::new();
        let mut listener = registry.register(4);
        let id = listener.id();

        let dispatcher = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            dispatcher.dispatch(&job_changed(7));
            tokio::time::sleep(Duration::from_millis(20)).await;
            dispatcher.unregister(id);
        });

        let received = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .expect("Test timed out");
        assert_eq!(received.unwrap().job_id, Some(7));

        let closed = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .expect("Test timed out");
        assert!(closed.is_none());
    }
}
