//! Pending event cache: latest undelivered event per type, for late subscribers.
//!
//! One slot per event type: a newer event overwrites, never queues behind,
//! the previous one. Entries expire `ttl` after they were stored and are
//! removed lazily when a drain walks past them.

use std::collections::HashMap;
use std::time::Duration;

use panelbridge_core::{EventType, FeatureEvent, Result};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Cached event with its expiry.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub event: FeatureEvent,
    pub expires_at: Instant,
}

impl PendingEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at < now
    }
}

/// Thread-safe single-slot-per-type TTL store.
pub struct PendingEventCache {
    entries: Mutex<HashMap<EventType, PendingEntry>>,
    ttl: Duration,
}

impl PendingEventCache {
    /// Create a cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `event` in its type's slot, replacing whatever was there.
    pub fn put(&self, event: FeatureEvent) {
        let expires_at = Instant::now() + self.ttl;
        let kind = event.kind.clone();
        let replaced = self
            .entries
            .lock()
            .insert(kind.clone(), PendingEntry { event, expires_at })
            .is_some();
        debug!("Pending event stored: {} (replaced={})", kind, replaced);
    }

    /// Offer every live entry to `sink`.
    ///
    /// Expired entries are dropped without being offered. A live entry is
    /// removed only when `sink` accepts it, so a failed push leaves it for the
    /// next subscriber. `sink` must not call back into this cache.
    /// Returns the number of entries delivered.
    pub fn drain<F>(&self, mut sink: F) -> usize
    where
        F: FnMut(&FeatureEvent) -> Result<()>,
    {
        let now = Instant::now();
        let mut delivered = 0;
        self.entries.lock().retain(|kind, entry| {
            if entry.is_expired(now) {
                debug!("Pending event expired: {}", kind);
                return false;
            }
            match sink(&entry.event) {
                Ok(()) => {
                    delivered += 1;
                    false
                }
                Err(e) => {
                    debug!("Pending event {} kept, push failed: {}", kind, e);
                    true
                }
            }
        });
        delivered
    }

    /// Drop expired entries without delivering anything. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Snapshot of an entry, mainly for diagnostics.
    pub fn peek(&self, kind: &EventType) -> Option<PendingEntry> {
        self.entries.lock().get(kind).cloned()
    }

    /// Number of slots currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelbridge_core::Error;
    use serde_json::json;

    fn event(kind: &str, v: i64) -> FeatureEvent {
        FeatureEvent::from_value(kind, json!({ "v": v }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_type_overwrites() {
        let cache = PendingEventCache::new(Duration::from_secs(60));
        cache.put(event("A", 1));
        cache.put(event("A", 2));
        cache.put(event("B", 3));
        assert_eq!(cache.len(), 2);

        let mut seen = Vec::new();
        let delivered = cache.drain(|e| {
            seen.push(e.clone());
            Ok(())
        });
        assert_eq!(delivered, 2);
        assert!(cache.is_empty());
        assert!(seen.contains(&event("A", 2)));
        assert!(!seen.contains(&event("A", 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_push_keeps_entry() {
        let cache = PendingEventCache::new(Duration::from_secs(60));
        cache.put(event("A", 1));

        let delivered = cache.drain(|_| Err(Error::ChannelClosed("test".into())));
        assert_eq!(delivered, 0);
        assert_eq!(cache.len(), 1);

        let delivered = cache.drain(|_| Ok(()));
        assert_eq!(delivered, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_dropped_not_offered() {
        let cache = PendingEventCache::new(Duration::from_secs(60));
        cache.put(event("A", 1));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.peek(&EventType::from("A")).is_some());
        assert_eq!(cache.purge_expired(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        let mut offered = 0;
        cache.drain(|_| {
            offered += 1;
            Ok(())
        });
        assert_eq!(offered, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_restarts_ttl() {
        let cache = PendingEventCache::new(Duration::from_secs(60));
        cache.put(event("A", 1));
        tokio::time::advance(Duration::from_secs(50)).await;
        cache.put(event("A", 2));
        tokio::time::advance(Duration::from_secs(50)).await;

        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.drain(|_| Ok(())), 1);
    }
}
