use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camstream::broker::{commands, WsBroker};
use camstream::config::ConfigStore;
use camstream::driver::{Driver, DriverManager, ReplayDriver};
use camstream::events::{EventBus, SystemEvent};
use camstream::state::AppState;
use camstream::stream::{SessionController, SnapshotWriter, StreamFlags, StreamHub};
use camstream::transcode::FrameIngress;
use camstream::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// camstream command line arguments
#[derive(Parser, Debug)]
#[command(name = "camstream")]
#[command(version, about = "Live fMP4 proxy for cloud security cameras", long_about = None)]
struct CliArgs {
    /// Listen address
    #[arg(short = 'a', long, value_name = "ADDRESS", default_value = "0.0.0.0")]
    address: String,

    /// HTTP port
    #[arg(short = 'p', long, value_name = "PORT", default_value_t = 8080)]
    port: u16,

    /// Data directory (config, snapshots, sidecar records)
    #[arg(short = 'd', long, value_name = "DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Static file root served as fallback (the web UI)
    #[arg(long, value_name = "DIR")]
    static_root: Option<PathBuf>,

    /// Replay a recorded H.264 elementary stream instead of a cloud
    /// camera (development driver)
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Camera serial exposed by the replay driver
    #[arg(long, value_name = "SERIAL", default_value = "REPLAYCAM0")]
    replay_serial: String,

    /// Log level (overrides the LOG_LEVEL config key)
    #[arg(short = 'l', long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    tokio::fs::create_dir_all(&args.data_dir).await?;

    let config_store = ConfigStore::new(&args.data_dir.join("config.json")).await?;
    let config = config_store.get();

    let level = match (args.verbose, args.log_level) {
        (1, _) => "debug",
        (v, _) if v >= 2 => "trace",
        (_, Some(level)) => level.as_str(),
        (_, None) => config.log_level.as_str(),
    };
    init_logging(level);

    tracing::info!("Starting camstream v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Data directory: {}", args.data_dir.display());

    // Driver backend: the cloud driver links in behind the Driver trait;
    // this build ships the replay backend for development
    let driver_impl: Arc<dyn Driver> = match args.replay {
        Some(path) => ReplayDriver::new(path, args.replay_serial.clone()),
        None => anyhow::bail!(
            "no frame source configured: pass --replay <elementary-stream file>"
        ),
    };

    let events = Arc::new(EventBus::new());
    let driver = DriverManager::new(driver_impl, events.clone());
    if let Err(e) = driver.start().await {
        tracing::warn!("Driver connect failed (will retry on config change): {}", e);
    }

    // Streaming pipeline
    let flags = Arc::new(StreamFlags::default());
    let hub = StreamHub::new(flags.clone());
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let ingress = FrameIngress::new(signal_tx.clone());
    let snapshots = SnapshotWriter::new(&args.data_dir, events.clone());

    let session = SessionController::new(
        hub.clone(),
        flags,
        ingress.clone(),
        driver.clone(),
        events.clone(),
        config_store.clone(),
        snapshots.clone(),
        signal_tx,
    );
    session.spawn_signal_loop(signal_rx);
    session.spawn_driver_watch();

    // WebSocket broker with the built-in command set
    let broker = WsBroker::new(driver.version());
    commands::register_all(&broker, &driver);
    spawn_event_fanout(broker.clone(), events.clone());
    spawn_image_recorder(snapshots.clone(), events.clone());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = AppState::new(
        config_store,
        events,
        driver,
        session.clone(),
        hub,
        ingress,
        snapshots,
        broker,
        shutdown_tx.clone(),
        args.static_root.clone(),
        args.data_dir.clone(),
    );

    let app = web::create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", args.address, args.port)
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", args.address))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    tokio::select! {
        _ = shutdown_signal => {
            cleanup(&state).await;
        }
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
            cleanup(&state).await;
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: &str) {
    let filter = format!("camstream={},tower_http={}", level, level);
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Forward every system event to the WebSocket peers
fn spawn_event_fanout(broker: Arc<WsBroker>, events: Arc<EventBus>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => broker.broadcast_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event fan-out lagged by {} events", n);
                }
                Err(_) => break,
            }
        }
    });
}

/// Track cloud image hashes in the picture sidecar
fn spawn_image_recorder(snapshots: Arc<SnapshotWriter>, events: Arc<EventBus>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SystemEvent::ImageDownloaded { serial, hash, .. }) => {
                    if let Err(e) = snapshots.record_cloud_image(&serial, hash).await {
                        tracing::warn!("Failed to record image hash for {}: {}", serial, e);
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
    });
}

/// Clean up subsystems on shutdown
async fn cleanup(state: &Arc<AppState>) {
    state.session.shutdown().await;
    tracing::info!("Streaming session stopped");

    state.driver.disconnect().await;
    tracing::info!("Driver disconnected");
}
