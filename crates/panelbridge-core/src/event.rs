//! Feature events and the correlated request/response messages that ride on them.
//!
//! Everything here crosses an execution-context boundary as a JSON frame, so
//! nothing relies on shared object identity between sender and receiver.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Event type names shared by producers and consumers.
pub mod kinds {
    /// Page-side button asks the relay to forward a snapshot it collected.
    pub const PAGE_SNAPSHOT_TRIGGER: &str = "PAGE_SNAPSHOT_TRIGGER";
    /// Panel asks the relay to capture whatever tab is active.
    pub const PAGE_SNAPSHOT_CAPTURE_ACTIVE_TAB: &str = "PAGE_SNAPSHOT_CAPTURE_ACTIVE_TAB";
    /// A normalized snapshot is ready for the panel.
    pub const PAGE_SNAPSHOT_READY: &str = "PAGE_SNAPSHOT_READY";
    /// A quoted selection is ready for the panel.
    pub const QUOTE_TEXT_READY: &str = "QUOTE_TEXT_READY";
    /// Relay asks one page to serialize itself.
    pub const PAGE_SNAPSHOT_COLLECT_FROM_PAGE: &str = "PAGE_SNAPSHOT_COLLECT_FROM_PAGE";

    pub const PANEL_SNAPSHOT_REQUEST: &str = "PANEL_SNAPSHOT_REQUEST";
    pub const PANEL_SNAPSHOT_RESULT: &str = "PANEL_SNAPSHOT_RESULT";
    pub const PAGE_BUTTON_SNAPSHOT_REQUEST: &str = "PAGE_BUTTON_SNAPSHOT_REQUEST";
    pub const PAGE_BUTTON_SNAPSHOT_RESULT: &str = "PAGE_BUTTON_SNAPSHOT_RESULT";
}

/// Name a panel context must present when opening its bridge port.
pub const BRIDGE_PORT_NAME: &str = "chatgpt-panel-bridge";

/// Identity of an event; the pending cache keeps one slot per type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed notification with an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub payload: Value,
}

impl FeatureEvent {
    /// Build an event from any serializable payload.
    pub fn new<T: Serialize>(kind: impl Into<EventType>, payload: &T) -> Result<Self> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Build an event from an already-decoded JSON payload.
    pub fn from_value(kind: impl Into<EventType>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind.as_str() == kind
    }

    /// Decode the payload into the consumer's shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.payload)?)
    }

    /// Encode for a context boundary.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a frame received from another context.
    pub fn from_frame(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// Browser window that hosts a panel surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

/// Why a correlated request failed. Serialized as a snake_case code so
/// UI layers can branch on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FailureReason {
    InvalidPayload,
    InvalidSnapshotPayload,
    UnsupportedActiveTabUrl,
    ActiveTabNotFound,
    CaptureRequestFailed,
    CaptureActiveTabFailed,
    SnapshotCollectFailed,
    TriggerFailed,
    /// A code outside the known vocabulary, kept verbatim.
    Other(String),
}

impl FailureReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::InvalidSnapshotPayload => "invalid_snapshot_payload",
            Self::UnsupportedActiveTabUrl => "unsupported_active_tab_url",
            Self::ActiveTabNotFound => "active_tab_not_found",
            Self::CaptureRequestFailed => "capture_request_failed",
            Self::CaptureActiveTabFailed => "capture_active_tab_failed",
            Self::SnapshotCollectFailed => "snapshot_collect_failed",
            Self::TriggerFailed => "trigger_failed",
            Self::Other(code) => code,
        }
    }
}

impl From<String> for FailureReason {
    fn from(code: String) -> Self {
        match code.as_str() {
            "invalid_payload" => Self::InvalidPayload,
            "invalid_snapshot_payload" => Self::InvalidSnapshotPayload,
            "unsupported_active_tab_url" => Self::UnsupportedActiveTabUrl,
            "active_tab_not_found" => Self::ActiveTabNotFound,
            "capture_request_failed" => Self::CaptureRequestFailed,
            "capture_active_tab_failed" => Self::CaptureActiveTabFailed,
            "snapshot_collect_failed" => Self::SnapshotCollectFailed,
            "trigger_failed" => Self::TriggerFailed,
            _ => Self::Other(code),
        }
    }
}

impl From<&str> for FailureReason {
    fn from(code: &str) -> Self {
        Self::from(code.to_string())
    }
}

impl From<FailureReason> for String {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::Other(code) => code,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an action performed on behalf of a request.
pub type Reply = std::result::Result<(), FailureReason>;

/// Request notification emitted by a requesting surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Response routed back toward every surface; only the matching one acts on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedResponse {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl CorrelatedResponse {
    pub fn from_reply(request_id: impl Into<String>, reply: Reply) -> Self {
        let request_id = request_id.into();
        match reply {
            Ok(()) => Self {
                request_id,
                ok: true,
                reason: None,
            },
            Err(reason) => Self {
                request_id,
                ok: false,
                reason: Some(reason),
            },
        }
    }

    pub fn into_reply(self) -> Reply {
        if self.ok {
            Ok(())
        } else {
            Err(self.reason.unwrap_or(FailureReason::TriggerFailed))
        }
    }
}

/// Answer to a one-off message sent to the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl From<Reply> for MessageReply {
    fn from(reply: Reply) -> Self {
        match reply {
            Ok(()) => Self {
                ok: true,
                reason: None,
            },
            Err(reason) => Self {
                ok: false,
                reason: Some(reason),
            },
        }
    }
}

impl MessageReply {
    /// A refusal without a code becomes `fallback`.
    pub fn into_reply(self, fallback: FailureReason) -> Reply {
        if self.ok {
            Ok(())
        } else {
            Err(self.reason.unwrap_or(fallback))
        }
    }
}

/// Anything that can carry an event onward: the broker, or a local bus.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: FeatureEvent);
}
