//! Reconnecting subscriber client.
//!
//! Keeps one logical connection to the broker over short-lived bridge ports:
//! `Disconnected -> Connecting -> Connected`, back to `Disconnected` on any
//! close, and a new attempt after a fixed delay. There is no retry cap and no
//! backoff; the loop runs until the client is closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use panelbridge_bus::{BridgePort, EventBroker};
use panelbridge_core::{FeatureEvent, Result, BRIDGE_PORT_NAME};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::local::LocalEventBus;

/// Opens bridge ports toward the broker.
pub trait BrokerConnector: Send + Sync + 'static {
    fn open_port(&self) -> Result<BridgePort>;
}

impl BrokerConnector for Arc<EventBroker> {
    fn open_port(&self) -> Result<BridgePort> {
        EventBroker::connect(self, BRIDGE_PORT_NAME)
    }
}

/// Connection state of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Handle to the background connection loop. Dropping it stops the loop
/// and disconnects.
pub struct ReconnectingSubscriber {
    state: watch::Receiver<ConnectionState>,
    local: LocalEventBus,
    attempts: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl ReconnectingSubscriber {
    /// Start connecting immediately; every received event is republished on `local`.
    pub fn spawn<C: BrokerConnector>(
        connector: C,
        local: LocalEventBus,
        retry_delay: Duration,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let attempts = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_connection_loop(
            connector,
            local.clone(),
            retry_delay,
            state_tx,
            attempts.clone(),
        ));

        Self {
            state: state_rx,
            local,
            attempts,
            task: Some(task),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the client reaches `target`. Returns `None` if the loop is gone.
    pub async fn wait_for(&self, target: ConnectionState) -> Option<ConnectionState> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == target).await.map(|s| *s).ok()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Number of connect attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// One-shot delivery outside the persistent channel, e.g. while disconnected.
    pub fn notify(&self, event: FeatureEvent) {
        self.local.publish(event);
    }

    pub fn local(&self) -> &LocalEventBus {
        &self.local
    }

    /// Stop reconnecting and wait until the current port is dropped.
    pub async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ReconnectingSubscriber {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_connection_loop<C: BrokerConnector>(
    connector: C,
    local: LocalEventBus,
    retry_delay: Duration,
    state: watch::Sender<ConnectionState>,
    attempts: Arc<AtomicU64>,
) {
    loop {
        state.send_replace(ConnectionState::Connecting);
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;

        match connector.open_port() {
            Ok(mut port) => {
                state.send_replace(ConnectionState::Connected);
                info!("Bridge connected on {} (attempt {})", port.id(), attempt);
                while let Some(event) = port.recv().await {
                    local.publish(event);
                }
                info!(
                    "Bridge port {} closed, reconnecting in {}ms",
                    port.id(),
                    retry_delay.as_millis()
                );
            }
            Err(e) => {
                debug!(
                    "Bridge connect failed (attempt {}): {}, retrying in {}ms",
                    attempt,
                    e,
                    retry_delay.as_millis()
                );
            }
        }

        state.send_replace(ConnectionState::Disconnected);
        tokio::time::sleep(retry_delay).await;
    }
}
