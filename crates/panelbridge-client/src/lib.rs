//! Panel/page-side client: local notification bus, reconnecting subscriber,
//! correlated request/response.

pub mod local;
pub mod request;
pub mod subscriber;

pub use local::{EventStream, LocalEventBus};
pub use request::{
    new_request_id, serve_requests, RequestAction, RequestOutcome, RequestStatus, RequestSurface,
    SlotState, StatusIndicator, SurfaceOptions, CAPTURE,
};
pub use subscriber::{BrokerConnector, ConnectionState, ReconnectingSubscriber};
