//! Features riding on the relay: page snapshot and quote text.
//!
//! Relay side: [`SnapshotRelay`], [`QuoteRelay`], context menus.
//! Page side: [`PageAgent`]. Panel side: [`PanelFeatures`].

pub mod menus;
pub mod page;
pub mod panel;
pub mod quote;
pub mod snapshot;

pub use menus::{
    apply_menu_settings, on_menu_shown, sync_menus_with_settings, ContextMenus, MenuClick,
    MenuContext, MenuRouter, MenuSpec, PAGE_SNAPSHOT_MENU_ID, QUOTE_TEXT_MENU_ID,
};
pub use page::{page_host, DocumentCollector, PageAgent, SnapshotCollector, SnapshotTrigger};
pub use panel::{handle_quote_ready, handle_snapshot_ready, CaptureBackend, PanelFeatures, PromptSurface};
pub use quote::{quote_prompt_text, QuotePayload, QuoteRelay};
pub use snapshot::{
    is_supported_page_url, normalize_snapshot_payload, snapshot_file_name, BrowserTabs,
    CollectResponse, SnapshotPayload, SnapshotRelay,
};
