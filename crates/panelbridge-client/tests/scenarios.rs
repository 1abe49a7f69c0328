//! End-to-end relay scenarios: a broker, a panel context behind a
//! reconnecting subscriber, and requesting surfaces inside the panel.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use panelbridge_bus::{BridgePort, DispatchOptions, EventBroker, NoopSurfaceActivator, PageContextHub};
use panelbridge_client::{
    serve_requests, BrokerConnector, ConnectionState, LocalEventBus, ReconnectingSubscriber,
    RequestAction, RequestOutcome, RequestStatus, RequestSurface, SlotState, StatusIndicator,
    SurfaceOptions, CAPTURE,
};
use panelbridge_core::{
    kinds, CorrelatedRequest, CorrelatedResponse, Error, EventType, FeatureEvent, RelayConfig,
    Reply, Result, BRIDGE_PORT_NAME,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

fn broker() -> Arc<EventBroker> {
    Arc::new(EventBroker::new(
        &RelayConfig::default(),
        Arc::new(PageContextHub::new()),
        Arc::new(NoopSurfaceActivator),
    ))
}

#[derive(Default)]
struct Statuses {
    log: Mutex<Vec<RequestStatus>>,
    cleared: Mutex<usize>,
}

impl StatusIndicator for Statuses {
    fn show(&self, status: &RequestStatus) {
        self.log.lock().push(status.clone());
    }
    fn clear(&self) {
        *self.cleared.lock() += 1;
    }
}

fn panel_surface(bus: &LocalEventBus, statuses: Arc<Statuses>) -> RequestSurface {
    let surface = RequestSurface::new(
        SurfaceOptions {
            name: "panel-button".into(),
            request_type: EventType::from(kinds::PANEL_SNAPSHOT_REQUEST),
            timeout: Duration::from_millis(12_000),
            hold: Duration::from_millis(2_500),
        },
        Arc::new(bus.clone()),
        statuses,
    );
    let _ = surface.listen(bus, kinds::PANEL_SNAPSHOT_RESULT);
    surface
}

struct FailOnce {
    broker: Arc<EventBroker>,
    failed: Mutex<bool>,
}

impl BrokerConnector for FailOnce {
    fn open_port(&self) -> Result<BridgePort> {
        let mut failed = self.failed.lock();
        if !*failed {
            *failed = true;
            return Err(Error::ConnectRefused("relay restarting".into()));
        }
        EventBroker::connect(&self.broker, BRIDGE_PORT_NAME)
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_subscriber_receives_pending_event_once() {
    let broker = broker();
    broker.dispatch(
        FeatureEvent::from_value("X", json!({"v": 1})),
        DispatchOptions::default(),
    );

    tokio::time::sleep(Duration::from_secs(10)).await;

    let local = LocalEventBus::new(16);
    let mut rx = local.subscribe();
    let client = ReconnectingSubscriber::spawn(broker.clone(), local, Duration::from_millis(500));
    client.wait_for(ConnectionState::Connected).await;

    assert_eq!(
        rx.recv().await.unwrap(),
        FeatureEvent::from_value("X", json!({"v": 1}))
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_only_latest_event_per_type_is_delivered() {
    let broker = broker();
    broker.dispatch(FeatureEvent::from_value("A", json!(1)), DispatchOptions::default());
    broker.dispatch(FeatureEvent::from_value("A", json!(2)), DispatchOptions::default());

    let local = LocalEventBus::new(16);
    let mut rx = local.subscribe();
    let client = ReconnectingSubscriber::spawn(broker.clone(), local, Duration::from_millis(500));
    client.wait_for(ConnectionState::Connected).await;

    assert_eq!(rx.recv().await.unwrap(), FeatureEvent::from_value("A", json!(2)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_event_past_ttl_is_lost() {
    let broker = broker();
    broker.dispatch(FeatureEvent::from_value("X", json!(1)), DispatchOptions::default());

    tokio::time::sleep(Duration::from_secs(61)).await;

    let local = LocalEventBus::new(16);
    let mut rx = local.subscribe();
    let client = ReconnectingSubscriber::spawn(broker.clone(), local, Duration::from_millis(500));
    client.wait_for(ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_retries_then_catches_up() {
    let broker = broker();
    broker.dispatch(
        FeatureEvent::from_value(kinds::QUOTE_TEXT_READY, json!({"text": "hello"})),
        DispatchOptions::default(),
    );

    let local = LocalEventBus::new(16);
    let mut quotes = local.events_of(kinds::QUOTE_TEXT_READY);
    let started = tokio::time::Instant::now();
    let client = ReconnectingSubscriber::spawn(
        FailOnce {
            broker: broker.clone(),
            failed: Mutex::new(false),
        },
        local,
        Duration::from_millis(500),
    );

    assert_eq!(client.state(), ConnectionState::Disconnected);
    client.wait_for(ConnectionState::Connected).await;
    assert!(started.elapsed() >= Duration::from_millis(500));

    use tokio_stream::StreamExt;
    let event = quotes.next().await.unwrap();
    assert_eq!(event.payload["text"], "hello");
    assert_eq!(broker.subscriber_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_capture_request_succeeds_and_rearms() {
    let broker = broker();
    let local = LocalEventBus::new(32);
    let client = ReconnectingSubscriber::spawn(broker.clone(), local.clone(), Duration::from_millis(500));
    client.wait_for(ConnectionState::Connected).await;

    // The handler asks the relay to capture, which comes back over the bridge.
    let relay = broker.clone();
    let action: RequestAction = Arc::new(move |request: CorrelatedRequest| {
        let relay = relay.clone();
        Box::pin(async move {
            relay.dispatch(
                FeatureEvent::from_value(
                    kinds::PAGE_SNAPSHOT_READY,
                    json!({"html": "<p>x</p>", "requestId": request.request_id}),
                ),
                DispatchOptions::default(),
            );
            Ok(())
        }) as BoxFuture<'static, Reply>
    });
    let _handler = serve_requests(
        &local,
        kinds::PANEL_SNAPSHOT_REQUEST,
        Arc::new(local.clone()),
        EventType::from(kinds::PANEL_SNAPSHOT_RESULT),
        action,
    );

    let mut ready = local.events_of(kinds::PAGE_SNAPSHOT_READY);
    let statuses = Arc::new(Statuses::default());
    let surface = panel_surface(&local, statuses.clone());
    tokio::task::yield_now().await;

    let id = surface.issue(CAPTURE).unwrap();
    use tokio_stream::StreamExt;
    let snapshot = ready.next().await.unwrap();
    assert_eq!(snapshot.payload["requestId"], id.as_str());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        surface.state(),
        SlotState::Settled { outcome: RequestOutcome::Succeeded, .. }
    ));
    assert_eq!(
        *statuses.log.lock(),
        vec![RequestStatus::Requesting, RequestStatus::Sent]
    );

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(surface.state(), SlotState::Idle);
    assert_eq!(*statuses.cleared.lock(), 1);
    assert!(surface.issue(CAPTURE).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_capture_times_out_and_ignores_stale_response() {
    let local = LocalEventBus::new(32);
    let statuses = Arc::new(Statuses::default());
    let surface = panel_surface(&local, statuses.clone());
    tokio::task::yield_now().await;

    let id = surface.issue(CAPTURE).unwrap();
    tokio::time::sleep(Duration::from_millis(12_001)).await;
    assert!(matches!(
        surface.state(),
        SlotState::Settled { outcome: RequestOutcome::TimedOut, .. }
    ));

    // A response for the stale id arrives after the deadline.
    local.publish(
        FeatureEvent::new(
            kinds::PANEL_SNAPSHOT_RESULT,
            &CorrelatedResponse::from_reply(&id, Ok(())),
        )
        .unwrap(),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *statuses.log.lock(),
        vec![RequestStatus::Requesting, RequestStatus::TimedOut]
    );

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(surface.state(), SlotState::Idle);
    let next = surface.issue(CAPTURE).unwrap();
    assert_ne!(next, id);
}
