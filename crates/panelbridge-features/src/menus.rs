//! Context menu entries and their settings.

use std::sync::Arc;

use panelbridge_bus::TabInfo;
use panelbridge_core::{ListenerId, Result, Settings, SettingsProvider};
use serde::Serialize;
use tracing::{debug, info};

use crate::quote::QuoteRelay;
use crate::snapshot::SnapshotRelay;

pub const PAGE_SNAPSHOT_MENU_ID: &str = "page-snapshot-upload";
pub const QUOTE_TEXT_MENU_ID: &str = "quote-text";

/// Where a menu entry is offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MenuContext {
    Page,
    Selection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuSpec {
    pub id: &'static str,
    pub title: &'static str,
    pub context: MenuContext,
}

pub const PAGE_SNAPSHOT_MENU: MenuSpec = MenuSpec {
    id: PAGE_SNAPSHOT_MENU_ID,
    title: "Upload Page Snapshot to Enhanced ChatGPT Panel",
    context: MenuContext::Page,
};

pub const QUOTE_TEXT_MENU: MenuSpec = MenuSpec {
    id: QUOTE_TEXT_MENU_ID,
    title: "Quote Text in Enhanced ChatGPT Panel",
    context: MenuContext::Selection,
};

/// Platform context-menu registry.
pub trait ContextMenus: Send + Sync {
    /// Create the entry, replacing any existing one with the same id.
    fn ensure(&self, spec: &MenuSpec) -> Result<()>;
    fn remove(&self, id: &str) -> Result<()>;
    fn set_visible(&self, id: &str, visible: bool) -> Result<()>;
}

/// A click on one of our menu entries.
#[derive(Debug, Clone, PartialEq)]
pub struct MenuClick {
    pub menu_id: String,
    pub selection_text: Option<String>,
    pub page_url: Option<String>,
    pub tab: Option<TabInfo>,
}

impl MenuClick {
    pub fn has_selection(&self) -> bool {
        self.selection_text
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty())
    }
}

fn apply_one(menus: &dyn ContextMenus, spec: &MenuSpec, enabled: bool) {
    let result = if enabled {
        menus.ensure(spec)
    } else {
        menus.remove(spec.id)
    };
    // Removing an entry that does not exist is routine.
    if let Err(e) = result {
        debug!("Context menu {} not updated: {}", spec.id, e);
    }
}

/// Create or remove each entry according to `settings`.
pub fn apply_menu_settings(menus: &dyn ContextMenus, settings: &Settings) {
    apply_one(menus, &PAGE_SNAPSHOT_MENU, settings.enable_page_snapshot_context_menu);
    apply_one(menus, &QUOTE_TEXT_MENU, settings.enable_quote_text_context_menu);
}

/// Apply the current settings now and again on every change.
pub fn sync_menus_with_settings(
    menus: Arc<dyn ContextMenus>,
    settings: &dyn SettingsProvider,
) -> ListenerId {
    apply_menu_settings(menus.as_ref(), &settings.current());
    settings.on_change(Box::new(move |next| {
        info!("Settings changed, re-applying context menus");
        apply_menu_settings(menus.as_ref(), next);
    }))
}

/// The menu is about to open. The snapshot entry makes no sense over a selection.
pub fn on_menu_shown(menus: &dyn ContextMenus, selection_text: Option<&str>) {
    let has_selection = selection_text.is_some_and(|text| !text.trim().is_empty());
    if let Err(e) = menus.set_visible(PAGE_SNAPSHOT_MENU_ID, !has_selection) {
        debug!("Context menu {} visibility not updated: {}", PAGE_SNAPSHOT_MENU_ID, e);
    }
}

/// Routes menu clicks to the feature that owns the entry.
pub struct MenuRouter {
    snapshot: Arc<SnapshotRelay>,
    quote: Arc<QuoteRelay>,
}

impl MenuRouter {
    pub fn new(snapshot: Arc<SnapshotRelay>, quote: Arc<QuoteRelay>) -> Self {
        Self { snapshot, quote }
    }

    /// Returns true when the click produced an event.
    pub async fn handle_click(&self, click: &MenuClick) -> bool {
        match click.menu_id.as_str() {
            PAGE_SNAPSHOT_MENU_ID => self.snapshot.handle_context_menu_click(click).await,
            QUOTE_TEXT_MENU_ID => {
                let page_url = click
                    .page_url
                    .clone()
                    .or_else(|| click.tab.as_ref().map(|tab| tab.url.clone()))
                    .unwrap_or_default();
                self.quote.handle_selection(
                    click.selection_text.as_deref().unwrap_or_default(),
                    &page_url,
                    click.tab.as_ref().map(|tab| tab.window_id),
                )
            }
            other => {
                debug!("Ignoring click on unknown menu {}", other);
                false
            }
        }
    }
}
