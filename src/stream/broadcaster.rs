//! Frame fan-out to subscribers
//!
//! Each subscriber owns a small bounded queue drained by its own connection
//! task. Broadcasting only ever does `try_send`, so a slow or dead viewer can
//! neither stall the producer nor delay anyone else:
//!
//! - queue full: that subscriber skips this frame (counted as dropped)
//! - queue closed: the subscriber is removed from the set
//!
//! Frames enter every queue in the same order, so all viewers see the same
//! sequence, minus whatever they individually dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use super::frame::Frame;
use crate::error::SubscriberError;

/// Unique subscriber identifier
pub type SubscriberId = Uuid;

/// Receiving side of one subscription
pub struct Subscription {
    id: SubscriberId,
    frames: mpsc::Receiver<Frame>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next frame, or `None` once the subscriber has been removed or the
    /// relay is shutting down
    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }
}

struct SubscriberSlot {
    tx: mpsc::Sender<Frame>,
    dropped: AtomicU64,
    connected_at: Instant,
}

impl SubscriberSlot {
    fn deliver(&self, frame: &Frame) -> Result<(), SubscriberError> {
        match self.tx.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SubscriberError::Lagging)
            }
            Err(TrySendError::Closed(_)) => Err(SubscriberError::Closed),
        }
    }
}

/// Outcome of one broadcast
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: Vec<SubscriberId>,
}

/// Lifetime broadcaster counters
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BroadcasterStats {
    pub subscribers: usize,
    pub frames_broadcast: u64,
    pub frames_dropped: u64,
    pub subscribers_removed: u64,
}

/// Per-subscriber view for status output
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub connected_secs: u64,
    pub frames_dropped: u64,
}

/// The live subscriber set
pub struct Broadcaster {
    subscribers: DashMap<SubscriberId, SubscriberSlot>,
    queue_depth: usize,
    frames_broadcast: AtomicU64,
    frames_dropped: AtomicU64,
    subscribers_removed: AtomicU64,
}

impl Broadcaster {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            queue_depth: queue_depth.max(1),
            frames_broadcast: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            subscribers_removed: AtomicU64::new(0),
        }
    }

    /// Add a subscriber and return its receiving side
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, frames) = mpsc::channel(self.queue_depth);
        self.subscribers.insert(
            id,
            SubscriberSlot {
                tx,
                dropped: AtomicU64::new(0),
                connected_at: Instant::now(),
            },
        );
        tracing::debug!(subscriber = %id, clients = self.len(), "Subscriber added");
        Subscription { id, frames }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            tracing::debug!(subscriber = %id, clients = self.len(), "Subscriber removed");
        }
        removed
    }

    /// Offer `frame` to every subscriber without waiting on any of them
    pub fn broadcast(&self, frame: &Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for entry in self.subscribers.iter() {
            match entry.value().deliver(frame) {
                Ok(()) => report.delivered += 1,
                Err(SubscriberError::Lagging) => {
                    report.dropped += 1;
                    tracing::trace!(
                        subscriber = %entry.key(),
                        seq = frame.sequence(),
                        "Subscriber lagging, frame dropped"
                    );
                }
                Err(SubscriberError::Closed) => report.removed.push(*entry.key()),
            }
        }

        // Removal happens after iteration; DashMap shards are still read-locked inside the loop.
        for id in &report.removed {
            if self.subscribers.remove(id).is_some() {
                self.subscribers_removed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(subscriber = %id, "Send to subscriber failed, removing it");
            }
        }

        self.frames_broadcast.fetch_add(1, Ordering::Relaxed);
        self.frames_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }

    /// Drop every subscriber; their receivers then yield `None`
    pub fn close_all(&self) -> usize {
        let count = self.subscribers.len();
        self.subscribers.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.subscribers.contains_key(id)
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        self.subscribers
            .iter()
            .map(|entry| SubscriberInfo {
                id: *entry.key(),
                connected_secs: entry.value().connected_at.elapsed().as_secs(),
                frames_dropped: entry.value().dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn stats(&self) -> BroadcasterStats {
        BroadcasterStats {
            subscribers: self.len(),
            frames_broadcast: self.frames_broadcast.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            subscribers_removed: self.subscribers_removed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(seq: u64) -> Frame {
        Frame::new(Bytes::from(vec![0xFF, 0xD8, seq as u8, 0xFF, 0xD9]), seq)
    }

    #[test]
    fn test_failed_subscriber_is_isolated() {
        let broadcaster = Broadcaster::new(4);
        let mut healthy = broadcaster.subscribe();
        let broken = broadcaster.subscribe();
        let broken_id = broken.id();
        drop(broken); // connection gone

        let report = broadcaster.broadcast(&frame(0));

        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, vec![broken_id]);
        assert!(!broadcaster.contains(&broken_id));
        assert!(broadcaster.contains(&healthy.id()));
        assert_eq!(healthy.try_recv(), Some(frame(0)));
        assert_eq!(broadcaster.stats().subscribers_removed, 1);
    }

    #[test]
    fn test_lagging_subscriber_drops_but_stays() {
        let broadcaster = Broadcaster::new(2);
        let mut slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();

        for seq in 0..4 {
            broadcaster.broadcast(&frame(seq));
            assert_eq!(fast.try_recv(), Some(frame(seq)));
        }

        // Queue depth 2: the first two frames fit, the rest were dropped
        assert_eq!(slow.try_recv(), Some(frame(0)));
        assert_eq!(slow.try_recv(), Some(frame(1)));
        assert_eq!(slow.try_recv(), None);
        assert!(broadcaster.contains(&slow.id()));

        let info = broadcaster
            .subscribers()
            .into_iter()
            .find(|s| s.id == slow.id())
            .unwrap();
        assert_eq!(info.frames_dropped, 2);
        assert_eq!(broadcaster.stats().frames_dropped, 2);
    }

    #[test]
    fn test_order_is_shared_across_subscribers() {
        let broadcaster = Broadcaster::new(16);
        let mut subs: Vec<_> = (0..3).map(|_| broadcaster.subscribe()).collect();

        for seq in 0..10 {
            broadcaster.broadcast(&frame(seq));
        }

        for sub in &mut subs {
            let seen: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
                .map(|f| f.sequence())
                .collect();
            assert_eq!(seen, (0..10).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_close_all_ends_subscriptions() {
        let broadcaster = Broadcaster::new(4);
        let mut sub = broadcaster.subscribe();

        assert_eq!(broadcaster.close_all(), 1);
        assert!(broadcaster.is_empty());
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_unsubscribe_twice() {
        let broadcaster = Broadcaster::new(4);
        let sub = broadcaster.subscribe();

        assert!(broadcaster.unsubscribe(&sub.id()));
        assert!(!broadcaster.unsubscribe(&sub.id()));
        assert_eq!(broadcaster.len(), 0);
    }
}
