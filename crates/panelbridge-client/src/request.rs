//! Correlated request/response protocol.
//!
//! A [`RequestSurface`] is one UI element that asks for something and needs
//! the answer routed back to itself. Requests are single-flight: while one is
//! pending, `issue` is refused rather than queued or cancelling the old one.
//! Responses travel the same fan-out path as every other event, so each
//! surface discards responses whose `requestId` is not its own.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use panelbridge_core::{
    CorrelatedRequest, CorrelatedResponse, EventEmitter, EventType, FailureReason, FeatureEvent,
    Reply,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::local::LocalEventBus;

/// Request kind for "capture the active page now".
pub const CAPTURE: &str = "capture";

/// What a status indicator is asked to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Requesting,
    Sent,
    Failed(Option<FailureReason>),
    TimedOut,
}

/// Presentational sink for request progress. Called with the surface's
/// state locked, so implementations must not call back into the surface.
pub trait StatusIndicator: Send + Sync {
    fn show(&self, status: &RequestStatus);
    fn clear(&self);
}

/// How a settled request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Succeeded,
    Failed(Option<FailureReason>),
    TimedOut,
}

impl RequestOutcome {
    fn status(&self) -> RequestStatus {
        match self {
            Self::Succeeded => RequestStatus::Sent,
            Self::Failed(reason) => RequestStatus::Failed(reason.clone()),
            Self::TimedOut => RequestStatus::TimedOut,
        }
    }
}

/// Per-surface request state. Two pending requests cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Pending {
        request_id: String,
        issued_at: Instant,
        deadline: Instant,
    },
    Settled {
        request_id: String,
        outcome: RequestOutcome,
    },
}

impl SlotState {
    fn pending_id(&self) -> Option<&str> {
        match self {
            Self::Pending { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

/// Static description of a requesting surface.
#[derive(Debug, Clone)]
pub struct SurfaceOptions {
    /// Name used in logs and as the request `source`.
    pub name: String,
    /// Event type the request notification is emitted as.
    pub request_type: EventType,
    pub timeout: Duration,
    /// How long a settled status stays up before being cleared.
    pub hold: Duration,
}

struct Slot {
    state: SlotState,
    timeout_timer: Option<JoinHandle<()>>,
    hold_timer: Option<JoinHandle<()>>,
}

struct SurfaceInner {
    options: SurfaceOptions,
    emitter: Arc<dyn EventEmitter>,
    indicator: Arc<dyn StatusIndicator>,
    slot: Mutex<Slot>,
}

/// One requesting UI surface.
#[derive(Clone)]
pub struct RequestSurface {
    inner: Arc<SurfaceInner>,
}

impl RequestSurface {
    pub fn new(
        options: SurfaceOptions,
        emitter: Arc<dyn EventEmitter>,
        indicator: Arc<dyn StatusIndicator>,
    ) -> Self {
        Self {
            inner: Arc::new(SurfaceInner {
                options,
                emitter,
                indicator,
                slot: Mutex::new(Slot {
                    state: SlotState::Idle,
                    timeout_timer: None,
                    hold_timer: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn state(&self) -> SlotState {
        self.inner.slot.lock().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.slot.lock().state.pending_id().is_some()
    }

    /// Start a request of `kind`. Returns `None` without side effects while
    /// another request of this surface is pending.
    pub fn issue(&self, kind: &str) -> Option<String> {
        let inner = &self.inner;
        let request_id = new_request_id();
        {
            let mut slot = inner.slot.lock();
            if let Some(current) = slot.state.pending_id() {
                debug!("{}: request {} still pending, refusing", inner.options.name, current);
                return None;
            }
            if let Some(hold) = slot.hold_timer.take() {
                hold.abort();
            }

            let issued_at = Instant::now();
            let deadline = issued_at + inner.options.timeout;
            slot.state = SlotState::Pending {
                request_id: request_id.clone(),
                issued_at,
                deadline,
            };
            slot.timeout_timer = Some(spawn_timeout(
                Arc::downgrade(inner),
                request_id.clone(),
                deadline,
            ));
            inner.indicator.show(&RequestStatus::Requesting);
        }

        let request = CorrelatedRequest {
            request_id: request_id.clone(),
            kind: kind.to_string(),
            source: Some(inner.options.name.clone()),
        };
        match FeatureEvent::new(inner.options.request_type.clone(), &request) {
            Ok(event) => inner.emitter.emit(event),
            // Left pending; the timeout settles it.
            Err(e) => warn!("{}: request {} not emitted: {}", inner.options.name, request_id, e),
        }

        info!("{}: issued {} request {}", inner.options.name, kind, request_id);
        Some(request_id)
    }

    /// Apply a response. Returns true only when it settled the pending request.
    pub fn handle_response(&self, response: &CorrelatedResponse) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.state.pending_id() != Some(response.request_id.as_str()) {
            debug!(
                "{}: ignoring response for {}",
                self.inner.options.name, response.request_id
            );
            return false;
        }

        if let Some(timer) = slot.timeout_timer.take() {
            timer.abort();
        }
        let outcome = if response.ok {
            RequestOutcome::Succeeded
        } else {
            RequestOutcome::Failed(response.reason.clone())
        };
        self.inner
            .settle(&mut slot, response.request_id.clone(), outcome);
        true
    }

    /// Feed every response of `response_type` on `bus` into this surface.
    ///
    /// The task does not keep the surface alive. It ends with the bus, or at
    /// the first response after the last surface handle is dropped.
    pub fn listen(&self, bus: &LocalEventBus, response_type: &str) -> JoinHandle<()> {
        let surface = Arc::downgrade(&self.inner);
        let mut responses = bus.events_of(response_type);
        tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                let Some(inner) = surface.upgrade() else {
                    break;
                };
                let surface = RequestSurface { inner };
                match event.payload_as::<CorrelatedResponse>() {
                    Ok(response) => {
                        surface.handle_response(&response);
                    }
                    Err(e) => warn!("{}: malformed response: {}", surface.name(), e),
                }
            }
        })
    }
}

impl SurfaceInner {
    fn settle(self: &Arc<Self>, slot: &mut Slot, request_id: String, outcome: RequestOutcome) {
        self.indicator.show(&outcome.status());
        info!(
            "{}: request {} settled: {:?}",
            self.options.name, request_id, outcome
        );
        slot.state = SlotState::Settled {
            request_id: request_id.clone(),
            outcome,
        };
        slot.hold_timer = Some(spawn_hold(
            Arc::downgrade(self),
            request_id,
            self.options.hold,
        ));
    }

    fn expire(self: &Arc<Self>, request_id: &str) {
        let mut slot = self.slot.lock();
        if slot.state.pending_id() != Some(request_id) {
            return;
        }
        // This runs on the timeout task itself.
        slot.timeout_timer = None;
        self.settle(&mut slot, request_id.to_string(), RequestOutcome::TimedOut);
    }

    fn release(&self, request_id: &str) {
        let mut slot = self.slot.lock();
        let settled_here = matches!(
            &slot.state,
            SlotState::Settled { request_id: id, .. } if id == request_id
        );
        if settled_here {
            slot.state = SlotState::Idle;
            slot.hold_timer = None;
            self.indicator.clear();
        }
    }
}

fn spawn_timeout(inner: Weak<SurfaceInner>, request_id: String, deadline: Instant) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire(&request_id);
        }
    })
}

fn spawn_hold(inner: Weak<SurfaceInner>, request_id: String, hold: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(hold).await;
        if let Some(inner) = inner.upgrade() {
            inner.release(&request_id);
        }
    })
}

/// Millisecond timestamp plus a short random suffix.
pub fn new_request_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), &suffix[..6])
}

/// Action run by a request handler on behalf of one request.
pub type RequestAction = Arc<dyn Fn(CorrelatedRequest) -> BoxFuture<'static, Reply> + Send + Sync>;

/// Handler side: answer every request of `request_type` seen on `bus` by
/// running `action` and emitting a response of `response_type` on `responses`.
pub fn serve_requests(
    bus: &LocalEventBus,
    request_type: &str,
    responses: Arc<dyn EventEmitter>,
    response_type: EventType,
    action: RequestAction,
) -> JoinHandle<()> {
    let mut requests = bus.events_of(request_type);
    tokio::spawn(async move {
        while let Some(event) = requests.next().await {
            let request = match event.payload_as::<CorrelatedRequest>() {
                Ok(request) => request,
                Err(e) => {
                    warn!("Malformed {} request: {}", event.kind, e);
                    continue;
                }
            };
            let action = action.clone();
            let responses = responses.clone();
            let response_type = response_type.clone();
            tokio::spawn(async move {
                let request_id = request.request_id.clone();
                let reply = action(request).await;
                let response = CorrelatedResponse::from_reply(request_id, reply);
                match FeatureEvent::new(response_type, &response) {
                    Ok(event) => responses.emit(event),
                    Err(e) => warn!("Response for {} not emitted: {}", response.request_id, e),
                }
            });
        }
    })
}
