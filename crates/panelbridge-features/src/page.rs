//! Page-side agent.
//!
//! Runs inside one page context: republishes relay broadcasts on the page's
//! local bus, answers the relay's collect requests, and serves the in-page
//! snapshot button.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use panelbridge_bus::{MessageSender, PageContextHandle, PageContextId, RelayInbox};
use panelbridge_client::{
    serve_requests, LocalEventBus, RequestAction, RequestSurface, StatusIndicator, SurfaceOptions,
};
use panelbridge_core::{
    kinds, CorrelatedRequest, EventType, FailureReason, FeatureEvent, MessageReply, Reply, Result,
    WindowId,
};
use regex::Regex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::snapshot::{snapshot_file_name, CollectResponse, SnapshotPayload, FEATURE_ID};

static URL_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://([^/:?#]+)").expect("host regex"));

/// Host part of `url`, empty when there is none.
pub fn page_host(url: &str) -> &str {
    URL_HOST
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map_or("", |m| m.as_str())
}

/// Serializes the page this agent runs in.
pub trait SnapshotCollector: Send + Sync {
    fn collect(&self) -> Result<SnapshotPayload>;
}

/// Page-to-relay path for a self-collected snapshot.
pub trait SnapshotTrigger: Send + Sync {
    /// `Err` means the relay was unreachable; a relay refusal is `Ok(Err(_))`.
    fn trigger(&self, payload: Value, window: Option<WindowId>) -> BoxFuture<'_, Result<Reply>>;
}

impl SnapshotTrigger for RelayInbox {
    fn trigger(&self, payload: Value, window: Option<WindowId>) -> BoxFuture<'_, Result<Reply>> {
        Box::pin(async move {
            let event = FeatureEvent::from_value(kinds::PAGE_SNAPSHOT_TRIGGER, payload);
            let sender = MessageSender { tab: None, window };
            let reply: MessageReply = self.request(&event, sender).await?;
            Ok(reply.into_reply(FailureReason::TriggerFailed))
        })
    }
}

/// Collector over an already-rendered document.
pub struct DocumentCollector {
    pub url: String,
    pub title: String,
    pub html: String,
}

impl SnapshotCollector for DocumentCollector {
    fn collect(&self) -> Result<SnapshotPayload> {
        let now = Utc::now();
        Ok(SnapshotPayload {
            feature_id: FEATURE_ID.to_string(),
            html: format!("<!DOCTYPE html>\n{}", self.html),
            page_url: self.url.clone(),
            page_title: self.title.clone(),
            file_name: snapshot_file_name(page_host(&self.url), now),
            captured_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}

pub struct PageAgent {
    tab: PageContextId,
    bus: LocalEventBus,
    tasks: Vec<JoinHandle<()>>,
}

impl PageAgent {
    pub fn spawn(
        handle: PageContextHandle,
        window: WindowId,
        collector: Arc<dyn SnapshotCollector>,
        trigger: Arc<dyn SnapshotTrigger>,
        bus: LocalEventBus,
    ) -> Self {
        let PageContextHandle {
            id: tab,
            mut events,
            mut requests,
        } = handle;
        let mut tasks = Vec::with_capacity(3);

        let inbox_bus = bus.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(frame) = events.recv().await {
                match FeatureEvent::from_frame(&frame) {
                    Ok(event) => inbox_bus.publish(event),
                    Err(e) => debug!("{}: undecodable broadcast: {}", tab, e),
                }
            }
        }));

        let page_collector = collector.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if !request.event.is(kinds::PAGE_SNAPSHOT_COLLECT_FROM_PAGE) {
                    debug!("{}: unhandled request {}", tab, request.event.kind);
                    continue;
                }
                let answer = collect_response(page_collector.as_ref());
                let answer = serde_json::to_value(answer).unwrap_or(Value::Null);
                // The relay may have given up waiting.
                let _ = request.reply.send(answer);
            }
        }));

        let action: RequestAction = Arc::new(move |_request: CorrelatedRequest| {
            let collector = collector.clone();
            let trigger = trigger.clone();
            Box::pin(async move { trigger_snapshot(collector.as_ref(), trigger.as_ref(), window).await })
                as BoxFuture<'static, Reply>
        });
        tasks.push(serve_requests(
            &bus,
            kinds::PAGE_BUTTON_SNAPSHOT_REQUEST,
            Arc::new(bus.clone()),
            EventType::from(kinds::PAGE_BUTTON_SNAPSHOT_RESULT),
            action,
        ));

        Self { tab, bus, tasks }
    }

    pub fn tab(&self) -> PageContextId {
        self.tab
    }

    pub fn bus(&self) -> &LocalEventBus {
        &self.bus
    }

    /// The in-page snapshot button, wired to this agent's bus.
    pub fn page_button(
        &self,
        timeout: Duration,
        hold: Duration,
        indicator: Arc<dyn StatusIndicator>,
    ) -> (RequestSurface, JoinHandle<()>) {
        let surface = RequestSurface::new(
            SurfaceOptions {
                name: format!("page-button@{}", self.tab),
                request_type: EventType::from(kinds::PAGE_BUTTON_SNAPSHOT_REQUEST),
                timeout,
                hold,
            },
            Arc::new(self.bus.clone()),
            indicator,
        );
        let listener = surface.listen(&self.bus, kinds::PAGE_BUTTON_SNAPSHOT_RESULT);
        (surface, listener)
    }
}

impl Drop for PageAgent {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn collect_response(collector: &dyn SnapshotCollector) -> CollectResponse {
    let collected = collector
        .collect()
        .and_then(|snapshot| Ok(serde_json::to_value(snapshot)?));
    match collected {
        Ok(payload) => CollectResponse {
            ok: true,
            payload: Some(payload),
            reason: None,
        },
        Err(e) => {
            warn!("Snapshot collect failed: {}", e);
            CollectResponse {
                ok: false,
                payload: None,
                reason: Some(FailureReason::SnapshotCollectFailed),
            }
        }
    }
}

async fn trigger_snapshot(
    collector: &dyn SnapshotCollector,
    trigger: &dyn SnapshotTrigger,
    window: WindowId,
) -> Reply {
    let snapshot = collector.collect().map_err(|e| {
        warn!("Snapshot collect failed: {}", e);
        FailureReason::SnapshotCollectFailed
    })?;
    let payload = serde_json::to_value(snapshot).map_err(|_| FailureReason::SnapshotCollectFailed)?;

    match trigger.trigger(payload, Some(window)).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Snapshot trigger failed: {}", e);
            Err(FailureReason::TriggerFailed)
        }
    }
}
