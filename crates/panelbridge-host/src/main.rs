//! panelbridge: relay host with a simulated panel and page contexts.

use anyhow::Context;
use panelbridge_core::RelayConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod console;
mod state;

use console::{Command, USAGE};
use state::HostState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--help" | "-h" | "help" => {
                println!("panelbridge: event relay between pages and a chat panel");
                println!();
                println!("Usage: panelbridge");
                println!();
                println!("Reads commands from stdin.");
                println!("{}", USAGE);
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {}. Use 'panelbridge help' for usage.", other);
                std::process::exit(1);
            }
        }
    }

    let config = RelayConfig::from_env().context("failed to prepare data directory")?;
    info!("Data directory: {}", config.data_dir.display());

    let state = HostState::new(config);
    info!("panelbridge ready, type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match console::parse(&line) {
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => run(&state, command).await,
            Ok(None) => {}
            Err(message) => println!("{}", message),
        }
    }

    state.shutdown().await;
    info!("panelbridge stopped");
    Ok(())
}

async fn run(state: &HostState, command: Command) {
    match command {
        Command::Open { url, title } => {
            let id = state.open_page(&url, &title);
            println!("opened {}", id);
        }
        Command::Activate(id) => {
            if !state.activate(id) {
                println!("no such tab: {}", id);
            }
        }
        Command::Close(id) => {
            if !state.close_page(id) {
                println!("no such tab: {}", id);
            }
        }
        Command::Quote(text) => {
            if !state.quote(&text).await {
                println!("nothing quoted");
            }
        }
        Command::Capture => match state.capture() {
            Some(request_id) => println!("capture requested ({})", request_id),
            None => println!("capture not started"),
        },
        Command::PageCapture(id) => match state.page_capture(id) {
            Some(request_id) => println!("page capture requested ({})", request_id),
            None => println!("page capture not started"),
        },
        Command::Menu { tab, selection } => {
            if !state.menu(tab, selection.as_deref()).await {
                println!("menu click had no effect");
            }
        }
        Command::Settings(partial) => match state.update_settings(&partial) {
            Ok(settings) => println!("{}", serde_json::to_string(&settings).unwrap_or_default()),
            Err(e) => warn!("Settings not saved: {}", e),
        },
        Command::Status => match serde_json::to_string_pretty(&state.status()) {
            Ok(status) => println!("{}", status),
            Err(e) => warn!("Status not printable: {}", e),
        },
        Command::Help => println!("{}", USAGE),
        Command::Quit => {}
    }
}
