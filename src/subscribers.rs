//! Subscriber handles and the per-source registry that holds them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::history::Seq;
use crate::{Line, Published};

/// Process-unique identity of a subscriber.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SubscriberId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber queue is full")]
    Lagged,
    #[error("subscriber is gone")]
    Closed,
}

/// A live delivery target.
///
/// `deliver` must not block: it is called from the broadcast loop once per
/// line for every member of the set.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> SubscriberId;

    fn deliver(&self, published: &Published) -> Result<(), DeliveryError>;
}

/// Subscriber that forwards lines into a bounded channel drained by one
/// connection.
///
/// Lines at or below `watermark` were already part of the history replay the
/// connection received, and are skipped.
pub struct ChannelSubscriber {
    id: SubscriberId,
    watermark: Seq,
    tx: mpsc::Sender<Line>,
}

impl ChannelSubscriber {
    pub fn new(watermark: Seq, tx: mpsc::Sender<Line>) -> Self {
        ChannelSubscriber {
            id: SubscriberId::next(),
            watermark,
            tx,
        }
    }
}

impl Subscriber for ChannelSubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn deliver(&self, published: &Published) -> Result<(), DeliveryError> {
        if published.seq <= self.watermark {
            return Ok(());
        }

        self.tx
            .try_send(published.line.clone())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryError::Lagged,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }
}

impl fmt::Debug for ChannelSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSubscriber")
            .field("id", &self.id)
            .field("watermark", &self.watermark)
            .finish()
    }
}

#[derive(Default)]
struct Members {
    map: HashMap<SubscriberId, Arc<dyn Subscriber>>,
    closed: bool,
}

/// Concurrency-safe registry of the subscribers attached to one source.
///
/// The lock is only ever held for map updates and cloning the membership;
/// delivery happens on a snapshot, outside the lock.
#[derive(Default)]
pub struct SubscriberSet {
    members: Mutex<Members>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        self.members
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `subscriber`.
    ///
    /// Returns `false` without touching the set if a subscriber with the same
    /// id is already present, or if the set was closed. A rejected subscriber
    /// is dropped here.
    pub fn add(&self, subscriber: Arc<dyn Subscriber>) -> bool {
        let mut members = self.lock();
        let id = subscriber.id();
        if members.closed || members.map.contains_key(&id) {
            return false;
        }
        members.map.insert(id, subscriber);
        true
    }

    /// Deregisters `id`. Removing an absent subscriber is not an error.
    pub fn remove(&self, id: SubscriberId) -> bool {
        self.lock().map.remove(&id).is_some()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock().map.contains_key(&id)
    }

    /// Current membership, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<dyn Subscriber>> {
        self.lock().map.values().cloned().collect()
    }

    /// Drops every subscriber and refuses new ones from now on. Returns how
    /// many subscribers were dropped.
    pub fn close(&self) -> usize {
        let mut members = self.lock();
        members.closed = true;
        let count = members.map.len();
        members.map.clear();
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SubscriberSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = self.lock();
        let mut ids: Vec<SubscriberId> = members.map.keys().copied().collect();
        ids.sort();
        f.debug_struct("SubscriberSet")
            .field("members", &ids)
            .field("closed", &members.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn published(seq: Seq, line: &str) -> Published {
        Published {
            seq,
            line: line.into(),
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let set = SubscriberSet::new();
        let (tx, _rx) = mpsc::channel(1);
        let sub: Arc<dyn Subscriber> = Arc::new(ChannelSubscriber::new(0, tx));

        assert!(set.add(Arc::clone(&sub)));
        assert!(!set.add(Arc::clone(&sub)));
        assert_eq!(set.len(), 1);
        assert!(set.contains(sub.id()));
    }

    #[test]
    fn test_remove_twice_is_fine() {
        let set = SubscriberSet::new();
        let (tx, _rx) = mpsc::channel(1);
        let sub: Arc<dyn Subscriber> = Arc::new(ChannelSubscriber::new(0, tx));
        let id = sub.id();
        set.add(sub);

        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(set.is_empty());
        assert!(set.snapshot().is_empty());
    }

    #[test]
    fn test_close_rejects_new_members() {
        let set = SubscriberSet::new();
        for _ in 0..3 {
            let (tx, _rx) = mpsc::channel(1);
            set.add(Arc::new(ChannelSubscriber::new(0, tx)));
        }

        assert_eq!(set.snapshot().len(), 3);
        assert_eq!(set.close(), 3);
        assert!(set.is_empty());
        assert!(set.is_closed());

        let (tx, mut rx) = mpsc::channel::<Line>(1);
        assert!(!set.add(Arc::new(ChannelSubscriber::new(0, tx))));
        // The rejected subscriber's sender is gone with it.
        assert!(rx.try_recv().is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = SubscriberId::next();
        let b = SubscriberId::next();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_channel_subscriber_skips_replayed_lines() {
        let (tx, mut rx) = mpsc::channel(4);
        let sub = ChannelSubscriber::new(2, tx);

        sub.deliver(&published(1, "old")).unwrap();
        sub.deliver(&published(2, "old too")).unwrap();
        sub.deliver(&published(3, "new")).unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("new"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_subscriber_reports_lag_and_close() {
        let (tx, rx) = mpsc::channel(1);
        let sub = ChannelSubscriber::new(0, tx);

        assert_eq!(sub.deliver(&published(1, "a")), Ok(()));
        assert_eq!(sub.deliver(&published(2, "b")), Err(DeliveryError::Lagged));

        drop(rx);
        assert_eq!(sub.deliver(&published(3, "c")), Err(DeliveryError::Closed));
    }
}
