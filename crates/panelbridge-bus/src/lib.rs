//! Relay-side event bus: pending cache, subscriber registry, page fan-out, broker.
//!
//! One [`EventBroker`] exists per relay process. Producers call
//! [`EventBroker::dispatch`]; panel contexts attach with
//! [`EventBroker::connect`] and are caught up from the pending cache.

pub mod broker;
pub mod inbox;
pub mod pages;
pub mod pending;
pub mod registry;

pub use broker::{
    BridgePort, DispatchOptions, EventBroker, NoopSurfaceActivator, PanelSurfaceActivator,
};
pub use inbox::{MessageSender, RelayInbox, RelayMessage};
pub use pages::{PageBroadcast, PageContextHandle, PageContextHub, PageContextId, PageRequest, TabInfo};
pub use pending::{PendingEntry, PendingEventCache};
pub use registry::{ChannelId, FrameChannel, SubscriberChannel, SubscriberRegistry};
