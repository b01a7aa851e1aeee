use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tower_http::services::ServeDir;

use crate::broker::WsBroker;
use crate::config::ConfigStore;
use crate::driver::DriverManager;
use crate::events::EventBus;
use crate::stream::{SessionController, SnapshotWriter, StreamHub};
use crate::transcode::FrameIngress;

/// Application-wide state shared across handlers
///
/// All session mutation goes through `session`; the hub and ingress are
/// exposed for read-side introspection (health, stream gating).
pub struct AppState {
    pub config: ConfigStore,
    pub events: Arc<EventBus>,
    pub driver: Arc<DriverManager>,
    pub session: Arc<SessionController>,
    pub hub: Arc<StreamHub>,
    pub ingress: Arc<FrameIngress>,
    pub snapshots: Arc<SnapshotWriter>,
    pub broker: Arc<WsBroker>,
    pub shutdown_tx: broadcast::Sender<()>,
    /// Static UI service, shared between the router fallback and the
    /// root-level file path in the stream handler
    pub static_files: Option<ServeDir>,
    data_dir: PathBuf,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConfigStore,
        events: Arc<EventBus>,
        driver: Arc<DriverManager>,
        session: Arc<SessionController>,
        hub: Arc<StreamHub>,
        ingress: Arc<FrameIngress>,
        snapshots: Arc<SnapshotWriter>,
        broker: Arc<WsBroker>,
        shutdown_tx: broadcast::Sender<()>,
        static_root: Option<PathBuf>,
        data_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            driver,
            session,
            hub,
            ingress,
            snapshots,
            broker,
            shutdown_tx,
            static_files: static_root.map(ServeDir::new),
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Subscribe to the shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
