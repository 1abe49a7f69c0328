//! In-context notification bus.
//!
//! Business handlers inside one context observe events here and never touch
//! the transport that delivered them.

use std::pin::Pin;

use futures::Stream;
use panelbridge_core::{EventEmitter, FeatureEvent};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

/// Boxed stream of events of one type.
pub type EventStream = Pin<Box<dyn Stream<Item = FeatureEvent> + Send>>;

/// Broadcast bus local to one execution context.
#[derive(Clone)]
pub struct LocalEventBus {
    tx: broadcast::Sender<FeatureEvent>,
}

impl LocalEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeatureEvent> {
        self.tx.subscribe()
    }

    /// Stream of events whose type is `kind`. Lagged receivers skip ahead.
    pub fn events_of(&self, kind: &str) -> EventStream {
        let kind = kind.to_string();
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| match item {
            Ok(event) if event.is(&kind) => Some(event),
            Ok(_) => None,
            Err(e) => {
                warn!("Local listener for {} lagged: {}", kind, e);
                None
            }
        });
        Box::pin(stream)
    }

    /// Publish to current listeners. Silently drops if nobody listens.
    pub fn publish(&self, event: FeatureEvent) {
        let _ = self.tx.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventEmitter for LocalEventBus {
    fn emit(&self, event: FeatureEvent) {
        self.publish(event);
    }
}
