mod broker;
mod chat;
mod config;
mod fetch;
mod http;
mod janitor;
mod metadata;
mod notify;
mod request;
mod sandbox;
mod store;
mod trust;
mod vault;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{BrokerEvent, Coordinator};
use crate::chat::console::ConsoleChat;
use crate::chat::{ChatApi, NullChat};
use crate::config::{ChatTransport, Config};
use crate::fetch::CodeFetcher;
use crate::notify::Notifier;
use crate::sandbox::SandboxExecutor;
use crate::store::RequestStore;
use crate::trust::TrustCache;
use crate::vault::SecretVault;

/// Coordinator queue depth: ingress, chat, and sandbox completions share it.
const EVENT_QUEUE_DEPTH: usize = 256;

fn print_help() {
    println!(
        "\
skillgate v{}

A human-in-the-loop execution broker. Agents submit skills over HTTP;
a human operator approves each run over the chat channel; approved code
runs in a sandbox with vault-injected secrets.

USAGE:
    skillgate [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/skillgate.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG         Log level filter for tracing
                     (e.g. debug, skillgate=debug,warn)

CONSOLE OPERATOR COMMANDS (default chat transport):
    approve <request-id> [once|24h|forever]
    deny <request-id>
    reply <handle> <text>
    /add_secret NAME VALUE, /status, /ping, /help",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("skillgate v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skillgate=info")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/skillgate.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        info!("Loading configuration from {config_path}");
        Config::load(&config_path)?
    } else {
        info!("No config file at {config_path} — using defaults");
        Config::default()
    };

    info!("Store: {}", config.store.path.display());
    info!("Sandbox mode: {:?}", config.sandbox.mode);
    info!("Listening on {}", config.server.bind);

    // Durable state and the components over it
    let store = Arc::new(
        RequestStore::open(&config.store.path)
            .with_context(|| format!("open store at {}", config.store.path.display()))?,
    );
    let vault = Arc::new(SecretVault::open(Arc::clone(&store))?);
    let trust = TrustCache::new(Arc::clone(&store));
    let sandbox = Arc::new(SandboxExecutor::new(config.sandbox.clone()));
    let notifier = Arc::new(Notifier::new(&config.notify));
    let fetcher = Arc::new(CodeFetcher::new());

    let (event_tx, event_rx) = mpsc::channel::<BrokerEvent>(EVENT_QUEUE_DEPTH);

    // Chat transport → coordinator queue
    let chat: Arc<dyn ChatApi> = match config.chat.transport {
        ChatTransport::Console => {
            info!("Chat transport: console (type 'approve <id>' / 'deny <id>' here)");
            let (chat_tx, mut chat_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
            chat::console::spawn_stdin_reader(chat_tx);
            let forward = event_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = chat_rx.recv().await {
                    if forward.send(BrokerEvent::Chat(event)).await.is_err() {
                        break;
                    }
                }
            });
            Arc::new(ConsoleChat::new())
        }
        ChatTransport::None => {
            warn!("Chat transport: none — requests will stay pending");
            Arc::new(NullChat)
        }
    };

    let coordinator = Coordinator::new(
        Arc::clone(&store),
        trust,
        Arc::clone(&vault),
        sandbox,
        chat,
        notifier,
        config.server.base_url(),
        event_tx.clone(),
    );
    tokio::spawn(coordinator.run(event_rx));

    janitor::spawn(Arc::clone(&store), config.janitor.clone());

    // Ingress API
    let app = http::router(http::AppState {
        store,
        vault,
        fetcher,
        events: event_tx,
    });
    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("bind {}", config.server.bind))?;
    info!("skillgate ready — POST /execute to submit a request");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("http server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
        }
    }
    Ok(())
}
