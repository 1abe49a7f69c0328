//! Panel-side handlers: what the panel does with relay events, and the
//! panel capture button's request handler.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use panelbridge_bus::{MessageSender, RelayInbox};
use panelbridge_client::{
    serve_requests, LocalEventBus, RequestAction, RequestSurface, StatusIndicator, SurfaceOptions,
};
use panelbridge_core::{
    kinds, CorrelatedRequest, EventEmitter, EventType, FailureReason, FeatureEvent, MessageReply,
    Reply, Result,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::quote::{quote_prompt_text, QuotePayload};
use crate::snapshot::SnapshotPayload;

pub const SOURCE_PREFIX: &str = "File Source URL:";
pub const DEFAULT_SNAPSHOT_FILE_NAME: &str = "page-snapshot.html";

/// The chat prompt the panel hosts.
pub trait PromptSurface: Send + Sync {
    fn prepend_text(&self, text: &str) -> Result<()>;
    fn upload_file(&self, file_name: &str, mime: &str, contents: &str) -> Result<()>;
}

/// Capture on behalf of the panel button.
pub trait CaptureBackend: Send + Sync {
    /// `Err` means the request never reached the relay.
    fn capture_active_tab(&self) -> BoxFuture<'_, Result<Reply>>;
}

impl CaptureBackend for RelayInbox {
    fn capture_active_tab(&self) -> BoxFuture<'_, Result<Reply>> {
        Box::pin(async move {
            let event =
                FeatureEvent::from_value(kinds::PAGE_SNAPSHOT_CAPTURE_ACTIVE_TAB, Value::Null);
            let reply: MessageReply = self.request(&event, MessageSender::default()).await?;
            Ok(reply.into_reply(FailureReason::CaptureRequestFailed))
        })
    }
}

/// Prepend the source line, then attach the html. A failed prepend does not
/// stop the upload.
pub fn handle_snapshot_ready(prompt: &dyn PromptSurface, snapshot: &SnapshotPayload) {
    if !snapshot.page_url.is_empty() {
        let line = format!("{} {}\n", SOURCE_PREFIX, snapshot.page_url);
        if let Err(e) = prompt.prepend_text(&line) {
            debug!("Source line not prepended: {}", e);
        }
    }

    if snapshot.html.trim().is_empty() {
        return;
    }
    let file_name = if snapshot.file_name.is_empty() {
        DEFAULT_SNAPSHOT_FILE_NAME
    } else {
        snapshot.file_name.as_str()
    };
    match prompt.upload_file(file_name, "text/html", &snapshot.html) {
        Ok(()) => info!("Snapshot attached as {}", file_name),
        Err(e) => warn!("Snapshot upload failed: {}", e),
    }
}

pub fn handle_quote_ready(prompt: &dyn PromptSurface, quote: &QuotePayload) {
    let Some(line) = quote_prompt_text(&quote.text) else {
        return;
    };
    if let Err(e) = prompt.prepend_text(&line) {
        warn!("Quote not prepended: {}", e);
    }
}

/// Feature handlers running inside the panel context.
pub struct PanelFeatures {
    tasks: Vec<JoinHandle<()>>,
}

impl PanelFeatures {
    /// Start the handlers on the panel's local bus.
    pub fn spawn(
        bus: &LocalEventBus,
        prompt: Arc<dyn PromptSurface>,
        backend: Arc<dyn CaptureBackend>,
    ) -> Self {
        let mut tasks = Vec::with_capacity(3);

        let mut snapshots = bus.events_of(kinds::PAGE_SNAPSHOT_READY);
        let snapshot_prompt = prompt.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = snapshots.next().await {
                match event.payload_as::<SnapshotPayload>() {
                    Ok(snapshot) => handle_snapshot_ready(snapshot_prompt.as_ref(), &snapshot),
                    Err(e) => warn!("Malformed snapshot event: {}", e),
                }
            }
        }));

        let mut quotes = bus.events_of(kinds::QUOTE_TEXT_READY);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = quotes.next().await {
                match event.payload_as::<QuotePayload>() {
                    Ok(quote) => handle_quote_ready(prompt.as_ref(), &quote),
                    Err(e) => warn!("Malformed quote event: {}", e),
                }
            }
        }));

        let action: RequestAction = Arc::new(move |request: CorrelatedRequest| {
            let backend = backend.clone();
            Box::pin(async move {
                match backend.capture_active_tab().await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("Capture request {} failed: {}", request.request_id, e);
                        Err(FailureReason::CaptureRequestFailed)
                    }
                }
            }) as BoxFuture<'static, Reply>
        });
        let responses: Arc<dyn EventEmitter> = Arc::new(bus.clone());
        tasks.push(serve_requests(
            bus,
            kinds::PANEL_SNAPSHOT_REQUEST,
            responses,
            EventType::from(kinds::PANEL_SNAPSHOT_RESULT),
            action,
        ));

        Self { tasks }
    }

    /// The panel's capture button.
    pub fn capture_button(
        bus: &LocalEventBus,
        timeout: Duration,
        hold: Duration,
        indicator: Arc<dyn StatusIndicator>,
    ) -> (RequestSurface, JoinHandle<()>) {
        let surface = RequestSurface::new(
            SurfaceOptions {
                name: "panel-button".into(),
                request_type: EventType::from(kinds::PANEL_SNAPSHOT_REQUEST),
                timeout,
                hold,
            },
            Arc::new(bus.clone()),
            indicator,
        );
        let listener = surface.listen(bus, kinds::PANEL_SNAPSHOT_RESULT);
        (surface, listener)
    }
}

impl Drop for PanelFeatures {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelbridge_client::{RequestOutcome, RequestStatus, SlotState, CAPTURE};
    use crate::snapshot::SnapshotRelay;
    use panelbridge_bus::{EventBroker, NoopSurfaceActivator, PageContextHub};
    use panelbridge_core::{Error, RelayConfig};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingPrompt {
        fail_prepend: bool,
        lines: Mutex<Vec<String>>,
        files: Mutex<Vec<(String, String)>>,
    }

    impl PromptSurface for RecordingPrompt {
        fn prepend_text(&self, text: &str) -> Result<()> {
            if self.fail_prepend {
                return Err(Error::Internal("prompt not found".into()));
            }
            self.lines.lock().push(text.to_string());
            Ok(())
        }
        fn upload_file(&self, file_name: &str, _mime: &str, contents: &str) -> Result<()> {
            self.files
                .lock()
                .push((file_name.to_string(), contents.to_string()));
            Ok(())
        }
    }

    struct FixedBackend(Option<Reply>);

    impl CaptureBackend for FixedBackend {
        fn capture_active_tab(&self) -> BoxFuture<'_, Result<Reply>> {
            let reply = self.0.clone();
            Box::pin(async move { reply.ok_or_else(|| Error::ChannelClosed("relay".into())) })
        }
    }

    struct Quiet;

    impl StatusIndicator for Quiet {
        fn show(&self, _status: &RequestStatus) {}
        fn clear(&self) {}
    }

    fn snapshot(url: &str, file_name: &str) -> SnapshotPayload {
        SnapshotPayload {
            feature_id: "page-snapshot".into(),
            html: "<p>x</p>".into(),
            page_url: url.into(),
            page_title: String::new(),
            file_name: file_name.into(),
            captured_at: String::new(),
        }
    }

    #[test]
    fn test_snapshot_ready_prepends_source_then_uploads() {
        let prompt = RecordingPrompt::default();
        handle_snapshot_ready(&prompt, &snapshot("https://a.example/", "a.html"));
        assert_eq!(*prompt.lines.lock(), vec!["File Source URL: https://a.example/\n"]);
        assert_eq!(prompt.files.lock()[0].0, "a.html");

        handle_snapshot_ready(&prompt, &snapshot("", ""));
        assert_eq!(prompt.lines.lock().len(), 1);
        assert_eq!(prompt.files.lock()[1].0, "page-snapshot.html");
    }

    #[test]
    fn test_failed_prepend_does_not_block_upload() {
        let prompt = RecordingPrompt {
            fail_prepend: true,
            ..Default::default()
        };
        handle_snapshot_ready(&prompt, &snapshot("https://a.example/", "a.html"));
        assert_eq!(prompt.files.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_handlers_react_to_bus_events() {
        let bus = LocalEventBus::new(16);
        let prompt = Arc::new(RecordingPrompt::default());
        let _features = PanelFeatures::spawn(&bus, prompt.clone(), Arc::new(FixedBackend(Some(Ok(())))));
        tokio::task::yield_now().await;

        bus.publish(FeatureEvent::from_value(
            kinds::QUOTE_TEXT_READY,
            json!({"featureId": "quote-text", "text": " quoted ", "pageUrl": ""}),
        ));
        bus.publish(FeatureEvent::new(kinds::PAGE_SNAPSHOT_READY, &snapshot("", "s.html")).unwrap());
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(*prompt.lines.lock(), vec!["Quoted Text in File: quoted\n"]);
        assert_eq!(prompt.files.lock()[0].0, "s.html");
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_button_outcomes() {
        for (backend, expected) in [
            (FixedBackend(Some(Ok(()))), RequestOutcome::Succeeded),
            (
                FixedBackend(Some(Err(FailureReason::UnsupportedActiveTabUrl))),
                RequestOutcome::Failed(Some(FailureReason::UnsupportedActiveTabUrl)),
            ),
            (
                FixedBackend(None),
                RequestOutcome::Failed(Some(FailureReason::CaptureRequestFailed)),
            ),
        ] {
            let bus = LocalEventBus::new(16);
            let _features = PanelFeatures::spawn(&bus, Arc::new(RecordingPrompt::default()), Arc::new(backend));
            let (button, _listener) = PanelFeatures::capture_button(
                &bus,
                Duration::from_secs(12),
                Duration::from_millis(2500),
                Arc::new(Quiet),
            );
            tokio::task::yield_now().await;

            button.issue(CAPTURE).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            match button.state() {
                SlotState::Settled { outcome, .. } => assert_eq!(outcome, expected),
                other => panic!("not settled: {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_button_through_relay_inbox() {
        let hub = Arc::new(PageContextHub::new());
        let broker = Arc::new(EventBroker::new(
            &RelayConfig::default(),
            hub.clone(),
            Arc::new(NoopSurfaceActivator),
        ));
        let (inbox, messages) = RelayInbox::channel();
        let _server = Arc::new(SnapshotRelay::new(broker, hub)).serve(messages);

        let bus = LocalEventBus::new(16);
        let _features = PanelFeatures::spawn(&bus, Arc::new(RecordingPrompt::default()), Arc::new(inbox));
        let (button, _listener) = PanelFeatures::capture_button(
            &bus,
            Duration::from_secs(12),
            Duration::from_millis(2500),
            Arc::new(Quiet),
        );
        tokio::task::yield_now().await;

        // No tab is open, so the relay's refusal travels back to the button.
        button.issue(CAPTURE).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            button.state(),
            SlotState::Settled {
                outcome: RequestOutcome::Failed(Some(FailureReason::ActiveTabNotFound)),
                ..
            }
        ));
    }
}
