//! # Notification Channel
//!
//! Fire-and-forget fan-out of recorder lifecycle, progress and error events.
//!
//! Each subscriber owns an unbounded crossbeam receiver, so publishing never
//! blocks the producer. A subscriber that drops its receiver is pruned on the
//! next publish; `unsubscribe` removes one explicitly. Events from one
//! producer arrive at each subscriber in publish order.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Events observable by recorder clients
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Idle,
    Recording,
    RecordsUpdated,
    /// Conversion progress of `target` (file name), 0..=100
    Converting { target: String, percent: u8 },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving side handed to a subscriber
pub struct Subscription<E> {
    pub id: SubscriptionId,
    pub receiver: Receiver<E>,
}

impl<E> Subscription<E> {
    /// Drain everything delivered so far without blocking
    pub fn drain(&self) -> Vec<E> {
        self.receiver.try_iter().collect()
    }
}

struct Registry<E> {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, Sender<E>>>,
}

/// Subscription registry shared by every clone
pub struct Notifier<E = RecorderEvent> {
    registry: Arc<Registry<E>>,
}

impl<E> Clone for Notifier<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: Clone> Default for Notifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> Notifier<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    // A publisher that panicked mid-insert leaves the map itself intact.
    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Sender<E>>> {
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = unbounded();
        self.subscribers().insert(id, sender);
        Subscription { id, receiver }
    }

    /// Returns false if `id` was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers().remove(&id).is_some()
    }

    /// Best-effort delivery to every current subscriber
    pub fn publish(&self, event: E) {
        let mut subscribers = self.subscribers();
        subscribers.retain(|id, sender| match sender.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                log::debug!("Dropping disconnected subscriber {:?}", id);
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}
