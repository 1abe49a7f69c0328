//! panelbridge core: event vocabulary, configuration, settings, errors.

pub mod config;
pub mod error;
pub mod event;
pub mod settings;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use event::{
    kinds, CorrelatedRequest, CorrelatedResponse, EventEmitter, EventType, FailureReason,
    FeatureEvent, MessageReply, Reply, WindowId, BRIDGE_PORT_NAME,
};
pub use settings::{ListenerId, Settings, SettingsProvider, SettingsStore};
