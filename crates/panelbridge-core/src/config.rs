//! Relay timing configuration and data directory management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

/// Default lifetime of an undelivered pending event.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(60);
/// Default fixed interval between subscriber reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);
/// Default timeout for a request issued from the panel button.
pub const DEFAULT_PANEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(12);
/// Default timeout for a request issued from the in-page button.
pub const DEFAULT_PAGE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time a settled request's status stays on screen.
pub const DEFAULT_STATUS_HOLD: Duration = Duration::from_millis(2500);
/// Default capacity of each in-context notification bus.
pub const DEFAULT_LOCAL_BUS_CAPACITY: usize = 256;

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RelayConfig {
    /// How long the broker keeps the latest event of each type for late subscribers.
    pub pending_ttl: Duration,
    /// Delay between reconnect attempts of a subscriber client.
    pub reconnect_delay: Duration,
    /// Correlated request timeout for the panel surface.
    pub panel_request_timeout: Duration,
    /// Correlated request timeout for the page surface.
    pub page_request_timeout: Duration,
    /// Display hold after a request settles.
    pub status_hold: Duration,
    /// Capacity of local notification buses.
    pub local_bus_capacity: usize,
    /// Data directory (`data/`).
    pub data_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pending_ttl: DEFAULT_PENDING_TTL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            panel_request_timeout: DEFAULT_PANEL_REQUEST_TIMEOUT,
            page_request_timeout: DEFAULT_PAGE_REQUEST_TIMEOUT,
            status_hold: DEFAULT_STATUS_HOLD,
            local_bus_capacity: DEFAULT_LOCAL_BUS_CAPACITY,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl RelayConfig {
    /// Create configuration from environment and defaults. Creates the data directory.
    pub fn from_env() -> std::io::Result<Self> {
        let data_dir = std::env::var("PANELBRIDGE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        Self::from_env_in(data_dir)
    }

    /// Same as [`RelayConfig::from_env`] with an explicit data directory.
    pub fn from_env_in(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        Ok(Self {
            pending_ttl: env_millis("PANELBRIDGE_PENDING_TTL_MS", DEFAULT_PENDING_TTL),
            reconnect_delay: env_millis("PANELBRIDGE_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY),
            panel_request_timeout: env_millis(
                "PANELBRIDGE_PANEL_REQUEST_TIMEOUT_MS",
                DEFAULT_PANEL_REQUEST_TIMEOUT,
            ),
            page_request_timeout: env_millis(
                "PANELBRIDGE_PAGE_REQUEST_TIMEOUT_MS",
                DEFAULT_PAGE_REQUEST_TIMEOUT,
            ),
            status_hold: env_millis("PANELBRIDGE_STATUS_HOLD_MS", DEFAULT_STATUS_HOLD),
            local_bus_capacity: env_parse(
                "PANELBRIDGE_LOCAL_BUS_CAPACITY",
                DEFAULT_LOCAL_BUS_CAPACITY,
            )
            .max(1),
            data_dir,
        })
    }

    /// Settings file (`data/settings.json`).
    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(env_parse(key, default_ms))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring malformed {}={:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
