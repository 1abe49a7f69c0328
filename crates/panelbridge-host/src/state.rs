//! Host state: the relay process with its simulated page and panel contexts.

use std::collections::HashMap;
use std::sync::Arc;

use panelbridge_bus::{EventBroker, PageContextHub, PageContextId, PanelSurfaceActivator, RelayInbox};
use panelbridge_client::{
    LocalEventBus, ReconnectingSubscriber, RequestStatus, RequestSurface, StatusIndicator, CAPTURE,
};
use panelbridge_core::{
    Error, ListenerId, RelayConfig, Result, Settings, SettingsProvider, SettingsStore, WindowId,
};
use panelbridge_features::{
    on_menu_shown, sync_menus_with_settings, ContextMenus, DocumentCollector, MenuClick,
    MenuRouter, MenuSpec, PageAgent, PanelFeatures, PromptSurface, QuoteRelay, SnapshotRelay,
    PAGE_SNAPSHOT_MENU_ID, QUOTE_TEXT_MENU_ID,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Every simulated tab lives in this window.
const WINDOW: WindowId = WindowId(1);

/// Raising the panel is just logged.
pub struct ConsoleSurfaces;

impl PanelSurfaceActivator for ConsoleSurfaces {
    fn bring_to_front(&self, surface: WindowId) -> Result<()> {
        info!("Panel surface raised for {}", surface);
        Ok(())
    }
}

/// In-memory menu registry: id to visibility.
#[derive(Default)]
pub struct ConsoleMenus {
    entries: RwLock<HashMap<&'static str, bool>>,
}

impl ConsoleMenus {
    pub fn is_offered(&self, id: &str) -> bool {
        self.entries.read().get(id).copied().unwrap_or(false)
    }

    pub fn snapshot(&self) -> Value {
        let entries = self.entries.read();
        let mut ids: Vec<_> = entries.iter().collect();
        ids.sort();
        ids.into_iter()
            .map(|(id, visible)| json!({"id": id, "visible": visible}))
            .collect()
    }
}

impl ContextMenus for ConsoleMenus {
    fn ensure(&self, spec: &MenuSpec) -> Result<()> {
        self.entries.write().insert(spec.id, true);
        debug!("Menu entry ensured: {} ({:?})", spec.id, spec.context);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        match self.entries.write().remove(id) {
            Some(_) => Ok(()),
            None => Err(Error::Internal(format!("no menu entry {}", id))),
        }
    }

    fn set_visible(&self, id: &str, visible: bool) -> Result<()> {
        match self.entries.write().get_mut(id) {
            Some(entry) => {
                *entry = visible;
                Ok(())
            }
            None => Err(Error::Internal(format!("no menu entry {}", id))),
        }
    }
}

/// The chat prompt, printed to the console.
pub struct ConsolePrompt;

impl PromptSurface for ConsolePrompt {
    fn prepend_text(&self, text: &str) -> Result<()> {
        println!("[prompt] {}", text.trim_end());
        Ok(())
    }

    fn upload_file(&self, file_name: &str, mime: &str, contents: &str) -> Result<()> {
        println!("[upload] {} ({}, {} bytes)", file_name, mime, contents.len());
        Ok(())
    }
}

pub struct ConsoleIndicator {
    name: String,
}

impl StatusIndicator for ConsoleIndicator {
    fn show(&self, status: &RequestStatus) {
        match status {
            RequestStatus::Failed(Some(reason)) => println!("[{}] failed: {}", self.name, reason),
            other => println!("[{}] {:?}", self.name, other),
        }
    }

    fn clear(&self) {
        debug!("[{}] status cleared", self.name);
    }
}

struct PageSession {
    agent: PageAgent,
    button: RequestSurface,
    _listener: JoinHandle<()>,
}

struct PanelSession {
    client: ReconnectingSubscriber,
    _features: PanelFeatures,
    button: RequestSurface,
    _listener: JoinHandle<()>,
}

/// Everything one relay process owns.
pub struct HostState {
    pub config: RelayConfig,
    pub settings: Arc<SettingsStore>,
    pub hub: Arc<PageContextHub>,
    pub broker: Arc<EventBroker>,
    pub menus: Arc<ConsoleMenus>,
    inbox: RelayInbox,
    inbox_server: JoinHandle<()>,
    router: MenuRouter,
    pages: Mutex<HashMap<PageContextId, PageSession>>,
    panel: Mutex<Option<PanelSession>>,
    menu_listener: ListenerId,
}

impl HostState {
    /// Build the relay and start the panel context. Must run inside a tokio runtime.
    pub fn new(config: RelayConfig) -> Self {
        let settings = Arc::new(SettingsStore::load(&config.settings_file()));
        let hub = Arc::new(PageContextHub::new());
        let broker = Arc::new(EventBroker::new(
            &config,
            hub.clone(),
            Arc::new(ConsoleSurfaces),
        ));

        let snapshot = Arc::new(SnapshotRelay::new(broker.clone(), hub.clone()));
        let (inbox, messages) = RelayInbox::channel();
        let inbox_server = snapshot.clone().serve(messages);
        let quote = Arc::new(QuoteRelay::new(broker.clone()));
        let router = MenuRouter::new(snapshot.clone(), quote);

        let menus = Arc::new(ConsoleMenus::default());
        let menu_listener = sync_menus_with_settings(menus.clone(), settings.as_ref());

        let state = Self {
            config,
            settings,
            hub,
            broker,
            menus,
            inbox,
            inbox_server,
            router,
            pages: Mutex::new(HashMap::new()),
            panel: Mutex::new(None),
            menu_listener,
        };
        state.start_panel();
        state
    }

    fn start_panel(&self) {
        let bus = LocalEventBus::new(self.config.local_bus_capacity);
        let features =
            PanelFeatures::spawn(&bus, Arc::new(ConsolePrompt), Arc::new(self.inbox.clone()));
        let (button, listener) = PanelFeatures::capture_button(
            &bus,
            self.config.panel_request_timeout,
            self.config.status_hold,
            Arc::new(ConsoleIndicator {
                name: "panel-button".into(),
            }),
        );
        let client =
            ReconnectingSubscriber::spawn(self.broker.clone(), bus, self.config.reconnect_delay);

        *self.panel.lock() = Some(PanelSession {
            client,
            _features: features,
            button,
            _listener: listener,
        });
    }

    // ---------------------------------------------------------------
    // Tabs
    // ---------------------------------------------------------------

    pub fn open_page(&self, url: &str, title: &str) -> PageContextId {
        let handle = self.hub.open(url, title, WINDOW);
        let id = handle.id;
        let collector = Arc::new(DocumentCollector {
            url: url.to_string(),
            title: title.to_string(),
            html: format!(
                "<html><head><title>{}</title></head><body><p>{}</p></body></html>",
                title, url
            ),
        });
        let agent = PageAgent::spawn(
            handle,
            WINDOW,
            collector,
            Arc::new(self.inbox.clone()),
            LocalEventBus::new(self.config.local_bus_capacity),
        );
        let (button, listener) = agent.page_button(
            self.config.page_request_timeout,
            self.config.status_hold,
            Arc::new(ConsoleIndicator {
                name: format!("page-button@{}", id),
            }),
        );

        self.pages.lock().insert(
            id,
            PageSession {
                agent,
                button,
                _listener: listener,
            },
        );
        id
    }

    pub fn activate(&self, id: PageContextId) -> bool {
        self.hub.activate(id)
    }

    pub fn close_page(&self, id: PageContextId) -> bool {
        self.pages.lock().remove(&id);
        self.hub.close(id)
    }

    // ---------------------------------------------------------------
    // Features
    // ---------------------------------------------------------------

    /// Quote `text` as if selected on the active tab.
    pub async fn quote(&self, text: &str) -> bool {
        let click = MenuClick {
            menu_id: QUOTE_TEXT_MENU_ID.into(),
            selection_text: Some(text.to_string()),
            page_url: None,
            tab: self.hub.active_tab(),
        };
        self.router.handle_click(&click).await
    }

    /// Press the panel capture button. `None` when disabled or still pending.
    pub fn capture(&self) -> Option<String> {
        if !self.settings.current().enable_page_snapshot_panel_button {
            info!("Panel capture button is disabled");
            return None;
        }
        let panel = self.panel.lock();
        panel.as_ref()?.button.issue(CAPTURE)
    }

    /// Press the in-page snapshot button of `id`.
    pub fn page_capture(&self, id: PageContextId) -> Option<String> {
        if !self.settings.current().enable_page_snapshot_page_button {
            info!("Page snapshot button is disabled");
            return None;
        }
        let pages = self.pages.lock();
        pages.get(&id)?.button.issue(CAPTURE)
    }

    /// Open the context menu on `id` and click whichever entry applies.
    pub async fn menu(&self, id: PageContextId, selection: Option<&str>) -> bool {
        let Some(tab) = self.hub.tab(id) else {
            return false;
        };
        on_menu_shown(self.menus.as_ref(), selection);

        let has_selection = selection.is_some_and(|s| !s.trim().is_empty());
        let menu_id = if has_selection {
            QUOTE_TEXT_MENU_ID
        } else {
            PAGE_SNAPSHOT_MENU_ID
        };
        if !self.menus.is_offered(menu_id) {
            info!("Menu entry {} not offered", menu_id);
            return false;
        }

        let click = MenuClick {
            menu_id: menu_id.into(),
            selection_text: selection.map(str::to_string),
            page_url: Some(tab.url.clone()),
            tab: Some(tab),
        };
        self.router.handle_click(&click).await
    }

    pub fn update_settings(&self, partial: &Value) -> Result<Settings> {
        self.settings.update(partial)
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    pub fn status(&self) -> Value {
        let connection = self
            .panel
            .lock()
            .as_ref()
            .map(|panel| json!(panel.client.state()))
            .unwrap_or(Value::Null);
        let page_buttons: Vec<Value> = self
            .pages
            .lock()
            .values()
            .map(|page| json!({"tab": page.agent.tab(), "pending": page.button.is_pending()}))
            .collect();

        json!({
            "panel": connection,
            "subscribers": self.broker.subscriber_count(),
            "pendingEvents": self.broker.pending().len(),
            "tabs": self.hub.tabs(),
            "pageButtons": page_buttons,
            "menus": self.menus.snapshot(),
            "settings": self.settings.current(),
        })
    }

    pub async fn shutdown(&self) {
        let panel = self.panel.lock().take();
        if let Some(panel) = panel {
            panel.client.close().await;
        }
        self.pages.lock().clear();
        self.settings.remove_listener(self.menu_listener);
        self.inbox_server.abort();
        self.broker.shutdown();
    }
}
