//! Event broker: the one dispatch entry point per relay process.
//!
//! `dispatch` writes through to the pending cache, pushes to every registered
//! subscriber channel and broadcasts to page contexts. It never fails toward
//! the producer; the pending cache's TTL window is the only reliability
//! mechanism.
//!
//! Caching plus subscriber push is serialized against `connect`, so a port
//! opened mid-dispatch sees the event once: from its drain or from the push.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use panelbridge_core::{
    Error, EventEmitter, FeatureEvent, RelayConfig, Result, WindowId, BRIDGE_PORT_NAME,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::pages::PageBroadcast;
use crate::pending::PendingEventCache;
use crate::registry::{ChannelId, FrameChannel, SubscriberRegistry};

/// Per-dispatch options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Keep the event for subscribers that attach within the TTL.
    pub persist: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { persist: true }
    }
}

impl DispatchOptions {
    /// Deliver only to whoever is listening right now.
    pub fn transient() -> Self {
        Self { persist: false }
    }
}

/// Brings a panel surface to the foreground.
pub trait PanelSurfaceActivator: Send + Sync {
    fn bring_to_front(&self, surface: WindowId) -> Result<()>;
}

/// Activator for platforms without a panel surface to raise.
pub struct NoopSurfaceActivator;

impl PanelSurfaceActivator for NoopSurfaceActivator {
    fn bring_to_front(&self, _surface: WindowId) -> Result<()> {
        Ok(())
    }
}

/// Panel-side end of a bridge connection. Dropping it disconnects.
pub struct BridgePort {
    id: ChannelId,
    rx: mpsc::UnboundedReceiver<String>,
    registry: Weak<SubscriberRegistry>,
}

impl BridgePort {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Next event from the broker; `None` once the broker side closed.
    /// Frames that fail to decode are skipped.
    pub async fn recv(&mut self) -> Option<FeatureEvent> {
        loop {
            let frame = self.rx.recv().await?;
            match FeatureEvent::from_frame(&frame) {
                Ok(event) => return Some(event),
                Err(e) => warn!("Skipping undecodable frame on {}: {}", self.id, e),
            }
        }
    }
}

impl Drop for BridgePort {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

/// Process-wide event broker.
pub struct EventBroker {
    pending: Arc<PendingEventCache>,
    registry: Arc<SubscriberRegistry>,
    pages: Arc<dyn PageBroadcast>,
    surfaces: Arc<dyn PanelSurfaceActivator>,
    next_channel: AtomicU64,
    closed: AtomicBool,
    delivery: Mutex<()>,
}

impl EventBroker {
    /// Create the broker for this process.
    pub fn new(
        config: &RelayConfig,
        pages: Arc<dyn PageBroadcast>,
        surfaces: Arc<dyn PanelSurfaceActivator>,
    ) -> Self {
        let pending = Arc::new(PendingEventCache::new(config.pending_ttl));
        let registry = Arc::new(SubscriberRegistry::new(pending.clone()));

        info!(
            "EventBroker initialized: pending_ttl={}ms",
            config.pending_ttl.as_millis()
        );

        Self {
            pending,
            registry,
            pages,
            surfaces,
            next_channel: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            delivery: Mutex::new(()),
        }
    }

    // ---------------------------------------------------------------
    // Producers
    // ---------------------------------------------------------------

    /// Fan an event out to subscribers and page contexts.
    pub fn dispatch(&self, event: FeatureEvent, options: DispatchOptions) {
        if self.is_closed() {
            debug!("Dispatch after shutdown ignored: {}", event.kind);
            return;
        }

        let delivered = {
            let _delivery = self.delivery.lock();
            if options.persist {
                self.pending.put(event.clone());
            }
            self.registry.broadcast(&event)
        };
        self.pages.broadcast(&event);

        debug!(
            "Dispatched {} to {} subscriber(s) (persist={})",
            event.kind, delivered, options.persist
        );
    }

    /// Ask the platform to raise the panel of `surface`. Failures are ignored.
    pub fn focus_panel_surface(&self, surface: WindowId) {
        if let Err(e) = self.surfaces.bring_to_front(surface) {
            debug!("Panel surface {} not raised: {}", surface, e);
        }
    }

    // ---------------------------------------------------------------
    // Subscribers
    // ---------------------------------------------------------------

    /// Open a bridge port. Pending events are queued on it before it is returned.
    pub fn connect(&self, name: &str) -> Result<BridgePort> {
        if self.is_closed() {
            return Err(Error::Shutdown);
        }
        if name != BRIDGE_PORT_NAME {
            return Err(Error::ConnectRefused(format!("unknown port name {:?}", name)));
        }

        let id = ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let _delivery = self.delivery.lock();
            self.registry.register(Arc::new(FrameChannel::new(id, tx)));
        }

        Ok(BridgePort {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    pub fn pending(&self) -> &PendingEventCache {
        &self.pending
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every subscriber channel but keep accepting connections, as when
    /// the relay's transport is torn down underneath live panels.
    pub fn disconnect_all(&self) -> usize {
        let dropped = self.registry.clear();
        if dropped > 0 {
            info!("Disconnected {} subscriber(s)", dropped);
        }
        dropped
    }

    /// Close every subscriber channel and refuse further connections.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.registry.clear();
        self.pending.clear();
        info!("EventBroker shut down ({} subscriber(s) closed)", dropped);
    }
}

impl EventEmitter for EventBroker {
    fn emit(&self, event: FeatureEvent) {
        self.dispatch(event, DispatchOptions::default());
    }
}
