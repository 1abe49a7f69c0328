//! Page context hub: every open page outside the panel.
//!
//! The hub owns the sending half of each page's inbox. Broadcasts are
//! best-effort: a page that stopped listening is skipped silently. Pages can
//! also be asked a question and answer through a one-shot reply slot.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use panelbridge_core::{Error, FeatureEvent, Result, WindowId};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Identifier of one page context (a browser tab).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PageContextId(pub u64);

impl fmt::Display for PageContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

/// Page metadata the relay is allowed to see.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabInfo {
    pub id: PageContextId,
    pub url: String,
    pub title: String,
    #[serde(rename = "windowId")]
    pub window_id: WindowId,
    pub active: bool,
}

/// A question addressed to one page, answered through `reply`.
pub struct PageRequest {
    pub event: FeatureEvent,
    pub reply: oneshot::Sender<Value>,
}

/// Page-side ends of a freshly opened context.
pub struct PageContextHandle {
    pub id: PageContextId,
    /// Broadcast frames from the relay.
    pub events: mpsc::UnboundedReceiver<String>,
    /// Addressed requests that expect an answer.
    pub requests: mpsc::UnboundedReceiver<PageRequest>,
}

/// Best-effort fan-out to page contexts.
pub trait PageBroadcast: Send + Sync {
    fn broadcast(&self, event: &FeatureEvent);
}

struct PageContext {
    info: TabInfo,
    events: mpsc::UnboundedSender<String>,
    requests: mpsc::UnboundedSender<PageRequest>,
}

/// Registry of open page contexts with an active-tab notion.
pub struct PageContextHub {
    contexts: RwLock<HashMap<PageContextId, PageContext>>,
    active: RwLock<Option<PageContextId>>,
    next_id: AtomicU64,
}

impl Default for PageContextHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PageContextHub {
    pub fn new() -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a page context. The newest page becomes the active one.
    pub fn open(&self, url: &str, title: &str, window_id: WindowId) -> PageContextHandle {
        let id = PageContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        let info = TabInfo {
            id,
            url: url.to_string(),
            title: title.to_string(),
            window_id,
            active: false,
        };
        self.contexts.write().insert(
            id,
            PageContext {
                info,
                events: events_tx,
                requests: requests_tx,
            },
        );
        *self.active.write() = Some(id);
        info!("Page context opened: {} {}", id, url);

        PageContextHandle {
            id,
            events: events_rx,
            requests: requests_rx,
        }
    }

    /// Close a page context. Unknown ids are ignored.
    pub fn close(&self, id: PageContextId) -> bool {
        let removed = self.contexts.write().remove(&id).is_some();
        if removed {
            let mut active = self.active.write();
            if *active == Some(id) {
                *active = None;
            }
            info!("Page context closed: {}", id);
        }
        removed
    }

    /// Make a context the active one. Returns false for unknown ids.
    pub fn activate(&self, id: PageContextId) -> bool {
        if !self.contexts.read().contains_key(&id) {
            return false;
        }
        *self.active.write() = Some(id);
        true
    }

    /// Record a navigation.
    pub fn navigate(&self, id: PageContextId, url: &str, title: &str) -> bool {
        match self.contexts.write().get_mut(&id) {
            Some(ctx) => {
                ctx.info.url = url.to_string();
                ctx.info.title = title.to_string();
                true
            }
            None => false,
        }
    }

    pub fn tab(&self, id: PageContextId) -> Option<TabInfo> {
        let active = *self.active.read();
        self.contexts.read().get(&id).map(|ctx| TabInfo {
            active: active == Some(id),
            ..ctx.info.clone()
        })
    }

    pub fn active_tab(&self) -> Option<TabInfo> {
        let id = (*self.active.read())?;
        self.tab(id)
    }

    pub fn tabs(&self) -> Vec<TabInfo> {
        let active = *self.active.read();
        let mut tabs: Vec<TabInfo> = self
            .contexts
            .read()
            .values()
            .map(|ctx| TabInfo {
                active: active == Some(ctx.info.id),
                ..ctx.info.clone()
            })
            .collect();
        tabs.sort_by_key(|t| t.id);
        tabs
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask one page a question and wait for its answer.
    pub async fn request(&self, id: PageContextId, event: FeatureEvent) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let contexts = self.contexts.read();
            let ctx = contexts
                .get(&id)
                .ok_or_else(|| Error::ChannelClosed(format!("{} is not open", id)))?;
            ctx.requests
                .send(PageRequest {
                    event,
                    reply: reply_tx,
                })
                .map_err(|_| Error::ChannelClosed(format!("{} is not listening", id)))?;
        }
        reply_rx
            .await
            .map_err(|_| Error::ChannelClosed(format!("{} did not answer", id)))
    }
}

impl PageBroadcast for PageContextHub {
    fn broadcast(&self, event: &FeatureEvent) {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Page broadcast skipped, encode failed: {}", e);
                return;
            }
        };
        let contexts = self.contexts.read();
        for ctx in contexts.values() {
            // A page without a listener simply misses the event.
            let _ = ctx.events.send(frame.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_reaches_open_pages_and_skips_deaf_ones() {
        let hub = PageContextHub::new();
        let mut a = hub.open("https://a.example/", "A", WindowId(1));
        let b = hub.open("https://b.example/", "B", WindowId(1));
        drop(b.events);

        hub.broadcast(&FeatureEvent::from_value("X", json!(1)));
        let frame = a.events.try_recv().unwrap();
        assert!(FeatureEvent::from_frame(&frame).unwrap().is("X"));
    }

    #[tokio::test]
    async fn test_active_tab_follows_open_activate_close() {
        let hub = PageContextHub::new();
        assert!(hub.active_tab().is_none());

        let a = hub.open("https://a.example/", "A", WindowId(1));
        let b = hub.open("https://b.example/", "B", WindowId(2));
        assert_eq!(hub.active_tab().unwrap().id, b.id);

        assert!(hub.activate(a.id));
        let active = hub.active_tab().unwrap();
        assert_eq!(active.url, "https://a.example/");
        assert!(active.active);
        assert!(!hub.tab(b.id).unwrap().active);

        assert!(hub.close(a.id));
        assert!(hub.active_tab().is_none());
        assert!(!hub.activate(a.id));
    }

    #[tokio::test]
    async fn test_request_round_trip_and_unanswered() {
        let hub = PageContextHub::new();
        let mut page = hub.open("https://a.example/", "A", WindowId(1));

        let responder = tokio::spawn(async move {
            let req = page.requests.recv().await.unwrap();
            assert!(req.event.is("ASK"));
            req.reply.send(json!({"ok": true})).unwrap();
            // Drop the next request without answering.
            let _ = page.requests.recv().await;
        });

        let answer = hub
            .request(PageContextId(1), FeatureEvent::from_value("ASK", json!(null)))
            .await
            .unwrap();
        assert_eq!(answer, json!({"ok": true}));

        let err = hub
            .request(PageContextId(1), FeatureEvent::from_value("ASK", json!(null)))
            .await;
        assert!(matches!(err, Err(Error::ChannelClosed(_))));
        responder.await.unwrap();

        let missing = hub
            .request(PageContextId(9), FeatureEvent::from_value("ASK", json!(null)))
            .await;
        assert!(missing.is_err());
    }
}
