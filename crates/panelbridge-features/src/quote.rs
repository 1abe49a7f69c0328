//! Quote text: a page selection is forwarded to the panel prompt.

use std::sync::Arc;

use panelbridge_bus::{DispatchOptions, EventBroker};
use panelbridge_core::{kinds, FeatureEvent, WindowId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const FEATURE_ID: &str = "quote-text";
pub const QUOTE_PREFIX: &str = "Quoted Text in File:";
/// Longer selections are cut and marked with `...`.
pub const MAX_QUOTE_CHARS: usize = 4000;

/// Payload of `QUOTE_TEXT_READY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotePayload {
    pub feature_id: String,
    pub text: String,
    #[serde(default)]
    pub page_url: String,
}

pub struct QuoteRelay {
    broker: Arc<EventBroker>,
}

impl QuoteRelay {
    pub fn new(broker: Arc<EventBroker>) -> Self {
        Self { broker }
    }

    /// Forward a selection. Blank selections are dropped; returns true if dispatched.
    pub fn handle_selection(&self, text: &str, page_url: &str, window: Option<WindowId>) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        let payload = QuotePayload {
            feature_id: FEATURE_ID.to_string(),
            text: text.to_string(),
            page_url: page_url.to_string(),
        };
        let event = match FeatureEvent::new(kinds::QUOTE_TEXT_READY, &payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Quote not encodable: {}", e);
                return false;
            }
        };

        if let Some(window) = window {
            self.broker.focus_panel_surface(window);
        }
        self.broker.dispatch(event, DispatchOptions::default());
        info!("Quote dispatched ({} chars) from {}", text.chars().count(), page_url);
        true
    }
}

/// Prompt line for a quoted selection, or `None` for a blank one.
pub fn quote_prompt_text(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(format!("{} {}\n", QUOTE_PREFIX, truncate_chars(text, MAX_QUOTE_CHARS)))
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
