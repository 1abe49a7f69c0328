//! Page snapshot, relay side.
//!
//! Snapshots arrive as relay messages two ways: a page pushes one it
//! collected itself (`PAGE_SNAPSHOT_TRIGGER`) or the panel asks the relay to
//! capture whatever tab is active (`PAGE_SNAPSHOT_CAPTURE_ACTIVE_TAB`).
//! Either way the payload is normalized, the panel surface of the originating
//! window is raised and `PAGE_SNAPSHOT_READY` is dispatched.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use panelbridge_bus::{
    DispatchOptions, EventBroker, PageContextHub, PageContextId, RelayMessage, TabInfo,
};
use panelbridge_core::{kinds, FailureReason, FeatureEvent, MessageReply, Reply, Result, WindowId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::menus::MenuClick;

pub const FEATURE_ID: &str = "page-snapshot";

/// Pages under the panel's own host are never captured.
pub const PANEL_ORIGIN: &str = "https://chatgpt.com/";

static HTTP_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^https?://").expect("url regex"));
static UNSAFE_FILE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\\/:*?"<>|]"#).expect("file name regex"));

/// Normalized snapshot as carried by `PAGE_SNAPSHOT_READY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub feature_id: String,
    pub html: String,
    pub page_url: String,
    pub page_title: String,
    pub file_name: String,
    pub captured_at: String,
}

/// Accept a snapshot only if it has non-blank `html`. Other text fields
/// default to empty and `featureId` is always overwritten.
pub fn normalize_snapshot_payload(value: &Value) -> Option<SnapshotPayload> {
    let obj = value.as_object()?;
    let html = obj.get("html")?.as_str()?;
    if html.trim().is_empty() {
        return None;
    }

    let text = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Some(SnapshotPayload {
        feature_id: FEATURE_ID.to_string(),
        html: html.to_string(),
        page_url: text("pageUrl"),
        page_title: text("pageTitle"),
        file_name: text("fileName"),
        captured_at: text("capturedAt"),
    })
}

pub fn is_supported_page_url(url: &str) -> bool {
    HTTP_URL.is_match(url) && !url.starts_with(PANEL_ORIGIN)
}

pub fn sanitize_file_name(name: &str) -> String {
    UNSAFE_FILE_CHARS.replace_all(name, "_").into_owned()
}

/// `<host>-<timestamp>.html`, safe to use as an upload file name.
pub fn snapshot_file_name(host: &str, captured_at: DateTime<Utc>) -> String {
    let host = if host.is_empty() { "page" } else { host };
    let timestamp = captured_at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    sanitize_file_name(&format!("{}-{}.html", host, timestamp))
}

/// A page's answer to `PAGE_SNAPSHOT_COLLECT_FROM_PAGE`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

/// The tab operations snapshot capture needs.
pub trait BrowserTabs: Send + Sync {
    fn active_tab(&self) -> Option<TabInfo>;

    /// Ask a tab to serialize itself. `Err` means the tab could not be reached.
    fn collect_snapshot(&self, tab: PageContextId) -> BoxFuture<'_, Result<CollectResponse>>;
}

impl BrowserTabs for PageContextHub {
    fn active_tab(&self) -> Option<TabInfo> {
        PageContextHub::active_tab(self)
    }

    fn collect_snapshot(&self, tab: PageContextId) -> BoxFuture<'_, Result<CollectResponse>> {
        Box::pin(async move {
            let event = FeatureEvent::from_value(kinds::PAGE_SNAPSHOT_COLLECT_FROM_PAGE, Value::Null);
            let answer = self.request(tab, event).await?;
            // Anything unrecognizable counts as a failed collect.
            Ok(serde_json::from_value(answer).unwrap_or_else(|e| {
                debug!("Undecodable collect answer from {}: {}", tab, e);
                CollectResponse::default()
            }))
        })
    }
}

/// Relay-side snapshot handling.
pub struct SnapshotRelay {
    broker: Arc<EventBroker>,
    tabs: Arc<dyn BrowserTabs>,
}

impl SnapshotRelay {
    pub fn new(broker: Arc<EventBroker>, tabs: Arc<dyn BrowserTabs>) -> Self {
        Self { broker, tabs }
    }

    /// A page pushed a snapshot it collected itself.
    pub fn handle_trigger(&self, payload: &Value, window: Option<WindowId>) -> Reply {
        let snapshot = normalize_snapshot_payload(payload).ok_or(FailureReason::InvalidPayload)?;
        self.dispatch_snapshot(&snapshot, window)
    }

    /// Capture the active tab on behalf of the panel.
    pub async fn capture_active_tab(&self) -> Reply {
        let tab = self.tabs.active_tab().ok_or(FailureReason::ActiveTabNotFound)?;
        if !is_supported_page_url(&tab.url) {
            debug!("Active tab {} not capturable: {}", tab.id, tab.url);
            return Err(FailureReason::UnsupportedActiveTabUrl);
        }

        let response = self.tabs.collect_snapshot(tab.id).await.map_err(|e| {
            warn!("Snapshot request to {} failed: {}", tab.id, e);
            FailureReason::CaptureActiveTabFailed
        })?;
        if !response.ok {
            return Err(response.reason.unwrap_or(FailureReason::SnapshotCollectFailed));
        }

        let snapshot = response
            .payload
            .as_ref()
            .and_then(normalize_snapshot_payload)
            .ok_or(FailureReason::InvalidSnapshotPayload)?;
        self.dispatch_snapshot(&snapshot, Some(tab.window_id))
    }

    /// Context-menu capture. There is no UI to report to, so every failure
    /// just ends the attempt. Returns true when a snapshot was dispatched.
    pub async fn handle_context_menu_click(&self, click: &MenuClick) -> bool {
        if click.has_selection() {
            return false;
        }
        let Some(tab) = click.tab.as_ref() else {
            return false;
        };
        let page_url = click.page_url.as_deref().unwrap_or(&tab.url);
        if !is_supported_page_url(page_url) {
            return false;
        }

        let response = match self.tabs.collect_snapshot(tab.id).await {
            Ok(response) if response.ok => response,
            Ok(_) => return false,
            Err(e) => {
                debug!("Context menu snapshot of {} failed: {}", tab.id, e);
                return false;
            }
        };
        match response.payload.as_ref().and_then(normalize_snapshot_payload) {
            Some(snapshot) => self.dispatch_snapshot(&snapshot, Some(tab.window_id)).is_ok(),
            None => false,
        }
    }

    /// Answer inbox messages until every sender is gone. Types this relay
    /// does not handle are left unanswered.
    pub fn serve(
        self: Arc<Self>,
        mut messages: mpsc::UnboundedReceiver<RelayMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let relay = self.clone();
                tokio::spawn(async move { relay.handle_message(message).await });
            }
            debug!("Relay inbox closed");
        })
    }

    async fn handle_message(&self, message: RelayMessage) {
        let event = match message.event() {
            Ok(event) => event,
            Err(e) => {
                warn!("Undecodable relay message: {}", e);
                return message.ignore();
            }
        };

        let reply = if event.is(kinds::PAGE_SNAPSHOT_TRIGGER) {
            self.handle_trigger(&event.payload, message.sender.window)
        } else if event.is(kinds::PAGE_SNAPSHOT_CAPTURE_ACTIVE_TAB) {
            self.capture_active_tab().await
        } else {
            debug!("Relay message {} not handled here", event.kind);
            return message.ignore();
        };

        if let Err(e) = message.respond(&MessageReply::from(reply)) {
            warn!("Reply to {} not sent: {}", event.kind, e);
        }
    }

    fn dispatch_snapshot(&self, snapshot: &SnapshotPayload, window: Option<WindowId>) -> Reply {
        let event = FeatureEvent::new(kinds::PAGE_SNAPSHOT_READY, snapshot).map_err(|e| {
            warn!("Snapshot not encodable: {}", e);
            FailureReason::InvalidSnapshotPayload
        })?;

        if let Some(window) = window {
            self.broker.focus_panel_surface(window);
        }
        self.broker.dispatch(event, DispatchOptions::default());
        info!(
            "Page snapshot dispatched: {} ({} bytes)",
            snapshot.page_url,
            snapshot.html.len()
        );
        Ok(())
    }
}
