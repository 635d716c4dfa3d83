mod core;
mod fetch;
mod http;
mod mpv;
mod pipeline;
mod reminder;
mod retry;
mod scheduler;
mod socket;
mod supervisor;
mod timers;

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vakit_proto::config::Config;
use vakit_proto::state::StateManager;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StatusUpdated,
    Reminder { prayer: String, minutes_left: i32 },
    Blink(bool),
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // panels only show warnings and errors
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // no receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

fn write_pid_file(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = vakit_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,vakit_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    if let Err(e) = write_pid_file(&config.daemon.pid_file) {
        warn!("Failed to write pid file {:?}: {}", config.daemon.pid_file, e);
    }

    let stations = core::load_stations(&config);
    let cities = core::load_cities(&config);
    let state_manager = Arc::new(StateManager::new(stations, cities));

    // Event channel: all external inputs funnel into DaemonCore
    let (event_tx, event_rx) = mpsc::channel::<core::DaemonEvent>(256);
    let (bus_tx, bus_rx) = mpsc::unbounded_channel();

    let daemon_core = core::DaemonCore::new(
        config.clone(),
        state_manager.clone(),
        mpv::MpvFactory::new(),
        broadcast_tx.clone(),
        event_tx.clone(),
        bus_tx,
    )
    .with_persistence(true);

    let clients = Arc::new(tokio::sync::RwLock::new(Vec::<socket::ClientHandle>::new()));

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        vakit_proto::platform::DAEMON_TCP_PORT,
        state_manager.clone(),
        clients.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            state_manager.clone(),
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(core::DaemonEvent::Shutdown).await;
        }
    });
    drop(event_tx);

    info!("Daemon initialised, running event loop");
    let result = daemon_core.run(event_rx, bus_rx).await;

    if let Err(e) = std::fs::remove_file(&config.daemon.pid_file) {
        warn!("Failed to remove pid file: {}", e);
    }
    result
}
