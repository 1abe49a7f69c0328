//! Subscriber registry: the set of live panel channels.
//!
//! Sends never block. A channel whose send fails is treated as disconnected
//! and dropped on the spot; there is no retry and no backlog per channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use panelbridge_core::{Error, FeatureEvent, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::pending::PendingEventCache;

/// Identifier of one connected subscriber channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// One connected subscriber context, as seen from the broker.
pub trait SubscriberChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Fire-and-forget push. An error means the other end is gone.
    fn send(&self, event: &FeatureEvent) -> Result<()>;
}

/// Channel backed by an unbounded queue of JSON frames.
pub struct FrameChannel {
    id: ChannelId,
    tx: mpsc::UnboundedSender<String>,
}

impl FrameChannel {
    pub fn new(id: ChannelId, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { id, tx }
    }
}

impl SubscriberChannel for FrameChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, event: &FeatureEvent) -> Result<()> {
        let frame = event.to_frame()?;
        self.tx
            .send(frame)
            .map_err(|_| Error::ChannelClosed(self.id.to_string()))
    }
}

/// Active subscriber set. Late joiners are caught up from the pending cache.
pub struct SubscriberRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<dyn SubscriberChannel>>>,
    pending: Arc<PendingEventCache>,
}

impl SubscriberRegistry {
    pub fn new(pending: Arc<PendingEventCache>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            pending,
        }
    }

    /// Add a channel and immediately drain pending events into it.
    ///
    /// Registering an id that is already present changes nothing and returns false.
    pub fn register(&self, channel: Arc<dyn SubscriberChannel>) -> bool {
        let id = channel.id();
        {
            let mut channels = self.channels.write();
            if channels.contains_key(&id) {
                return false;
            }
            channels.insert(id, channel.clone());
        }

        let caught_up = self.pending.drain(|event| channel.send(event));
        info!("Subscriber registered: {} ({} pending delivered)", id, caught_up);
        true
    }

    /// Remove a channel. Unknown ids are ignored.
    pub fn unregister(&self, id: ChannelId) -> bool {
        let removed = self.channels.write().remove(&id).is_some();
        if removed {
            info!("Subscriber unregistered: {}", id);
        }
        removed
    }

    /// Push `event` to every channel, pruning the ones that fail.
    /// Returns the number of channels that accepted it.
    pub fn broadcast(&self, event: &FeatureEvent) -> usize {
        let snapshot: Vec<Arc<dyn SubscriberChannel>> =
            self.channels.read().values().cloned().collect();

        let mut dead = Vec::new();
        let mut delivered = 0;
        for channel in snapshot {
            match channel.send(event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!("Dropping {}: {}", channel.id(), e);
                    dead.push(channel.id());
                }
            }
        }

        if !dead.is_empty() {
            let mut channels = self.channels.write();
            for id in &dead {
                channels.remove(id);
            }
            info!("Pruned {} dead subscriber(s)", dead.len());
        }
        delivered
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every channel; their receivers observe a closed stream.
    pub fn clear(&self) -> usize {
        let mut channels = self.channels.write();
        let count = channels.len();
        channels.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> (SubscriberRegistry, Arc<PendingEventCache>) {
        let pending = Arc::new(PendingEventCache::new(Duration::from_secs(60)));
        (SubscriberRegistry::new(pending.clone()), pending)
    }

    fn channel(id: u64) -> (Arc<dyn SubscriberChannel>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(FrameChannel::new(ChannelId(id), tx)), rx)
    }

    fn decode(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<FeatureEvent> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(FeatureEvent::from_frame(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_register_drains_pending() {
        let (registry, pending) = registry();
        pending.put(FeatureEvent::from_value("X", json!({"v": 1})));

        let (ch, mut rx) = channel(1);
        assert!(registry.register(ch));
        assert!(pending.is_empty());
        assert_eq!(decode(&mut rx), vec![FeatureEvent::from_value("X", json!({"v": 1}))]);
    }

    #[tokio::test]
    async fn test_register_and_unregister_are_idempotent() {
        let (registry, pending) = registry();
        let (ch, mut rx) = channel(1);
        assert!(registry.register(ch.clone()));

        pending.put(FeatureEvent::from_value("X", json!(null)));
        assert!(!registry.register(ch));
        assert_eq!(registry.len(), 1);
        // The second register did not drain.
        assert_eq!(pending.len(), 1);
        assert!(decode(&mut rx).is_empty());

        assert!(registry.unregister(ChannelId(1)));
        assert!(!registry.unregister(ChannelId(1)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_prunes_channel() {
        let (registry, _pending) = registry();
        let (alive, mut alive_rx) = channel(1);
        let (dead, dead_rx) = channel(2);
        registry.register(alive);
        registry.register(dead);
        drop(dead_rx);

        let delivered = registry.broadcast(&FeatureEvent::from_value("A", json!(1)));
        assert_eq!(delivered, 1);
        assert!(!registry.contains(ChannelId(2)));
        assert!(registry.contains(ChannelId(1)));

        registry.broadcast(&FeatureEvent::from_value("B", json!(2)));
        let got: Vec<String> = decode(&mut alive_rx)
            .into_iter()
            .map(|e| e.kind.to_string())
            .collect();
        assert_eq!(got, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_dead_channel_at_register_keeps_pending() {
        let (registry, pending) = registry();
        pending.put(FeatureEvent::from_value("X", json!(1)));

        let (ch, rx) = channel(1);
        drop(rx);
        registry.register(ch);
        assert_eq!(pending.len(), 1);
    }
}
