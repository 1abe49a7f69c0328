//! Line-oriented command console.

use panelbridge_bus::PageContextId;
use serde_json::Value;

pub const USAGE: &str = "\
Commands:
  open <url> [title]          Open a page context (becomes the active tab)
  activate <tab>              Make a tab active
  close <tab>                 Close a tab
  quote <text>                Quote text from the active tab
  capture                     Press the panel's capture button
  page-capture <tab>          Press the in-page snapshot button of a tab
  menu <tab> [selection]      Open the context menu on a tab and click our entry
  settings <json>             Merge a settings update, e.g. {\"enableQuoteTextContextMenu\":false}
  status                      Print relay status
  help                        Show this help message
  quit                        Shut down";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open { url: String, title: String },
    Activate(PageContextId),
    Close(PageContextId),
    Quote(String),
    Capture,
    PageCapture(PageContextId),
    Menu {
        tab: PageContextId,
        selection: Option<String>,
    },
    Settings(Value),
    Status,
    Help,
    Quit,
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word {
        "open" => {
            let (url, title) = match rest.split_once(char::is_whitespace) {
                Some((url, title)) => (url, title.trim()),
                None => (rest, ""),
            };
            if url.is_empty() {
                return Err("usage: open <url> [title]".into());
            }
            Command::Open {
                url: url.to_string(),
                title: title.to_string(),
            }
        }
        "activate" => Command::Activate(tab_id(rest)?),
        "close" => Command::Close(tab_id(rest)?),
        "quote" => Command::Quote(rest.to_string()),
        "capture" => Command::Capture,
        "page-capture" => Command::PageCapture(tab_id(rest)?),
        "menu" => {
            let (tab, selection) = match rest.split_once(char::is_whitespace) {
                Some((tab, selection)) => (tab, Some(selection.trim().to_string())),
                None => (rest, None),
            };
            Command::Menu {
                tab: tab_id(tab)?,
                selection,
            }
        }
        "settings" => {
            let value: Value =
                serde_json::from_str(rest).map_err(|e| format!("invalid settings json: {}", e))?;
            if !value.is_object() {
                return Err("settings update must be a JSON object".into());
            }
            Command::Settings(value)
        }
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command: {}. Type 'help' for usage.", other)),
    };
    Ok(Some(command))
}

/// Accepts `3` or `tab-3`.
fn tab_id(arg: &str) -> Result<PageContextId, String> {
    let digits = arg.strip_prefix("tab-").unwrap_or(arg);
    digits
        .parse::<u64>()
        .map(PageContextId)
        .map_err(|_| format!("not a tab id: {:?}", arg))
}
