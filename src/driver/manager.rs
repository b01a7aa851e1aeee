//! Driver lifecycle and event adaptation
//!
//! Wraps the driver behind a connectivity tracker, caches the entity
//! serial lists, and republishes driver events as system events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Driver, DriverEvent, LivestreamPacket};
use crate::error::{AppError, Result};
use crate::events::{EntitySource, EventBus, SystemEvent};

/// How long `wait_connected` polls before giving up
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DriverManager {
    driver: Arc<dyn Driver>,
    events: Arc<EventBus>,
    connected: AtomicBool,
    stations: RwLock<Vec<String>>,
    devices: RwLock<Vec<String>>,
}

impl DriverManager {
    pub fn new(driver: Arc<dyn Driver>, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            events,
            connected: AtomicBool::new(false),
            stations: RwLock::new(Vec::new()),
            devices: RwLock::new(Vec::new()),
        })
    }

    /// Spawn the event pump and connect
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let manager = self.clone();
        let mut rx = self.driver.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => manager.handle_event(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Driver event pump lagged by {} events", n);
                    }
                    Err(_) => {
                        tracing::debug!("Driver event channel closed");
                        break;
                    }
                }
            }
        });

        self.driver.connect().await
    }

    fn handle_event(&self, event: DriverEvent) {
        match event {
            DriverEvent::Connected { stations, devices } => {
                self.connected.store(true, Ordering::SeqCst);
                *self.stations.write() = stations;
                *self.devices.write() = devices;
                self.events.publish(SystemEvent::DriverConnected);
            }
            DriverEvent::Disconnected { reason } => {
                self.connected.store(false, Ordering::SeqCst);
                // Cached entity lists are only valid while connected
                self.stations.write().clear();
                self.devices.write().clear();
                self.events
                    .publish(SystemEvent::DriverDisconnected { reason });
            }
            DriverEvent::PropertyChanged {
                source,
                serial,
                name,
                value,
            } => {
                self.events.publish(SystemEvent::PropertyChanged {
                    source,
                    serial,
                    name,
                    value,
                });
            }
            DriverEvent::LivestreamStopped { serial } => {
                self.events.publish(SystemEvent::LivestreamStopped { serial });
            }
            DriverEvent::ImageDownloaded { serial, file, hash } => {
                self.events
                    .publish(SystemEvent::ImageDownloaded { serial, file, hash });
            }
            DriverEvent::DatabaseQueryResult { serial, data } => {
                self.events
                    .publish(SystemEvent::DatabaseQueryLatest { serial, data });
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> String {
        self.driver.version()
    }

    pub fn livestream_has_audio(&self) -> bool {
        self.driver.livestream_has_audio()
    }

    pub fn stations(&self) -> Vec<String> {
        self.stations.read().clone()
    }

    pub fn devices(&self) -> Vec<String> {
        self.devices.read().clone()
    }

    /// Wait until the driver reports connected
    pub async fn wait_connected(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let mut rx = self.driver.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(DriverEvent::Connected { .. }) => return Ok(()),
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_connected() {
                            return Ok(());
                        }
                    }
                    Err(_) => {
                        return Err(AppError::Driver("driver event channel closed".to_string()))
                    }
                }
            }
        };
        match tokio::time::timeout(CONNECT_WAIT_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Driver("driver not connected".to_string())),
        }
    }

    /// Disconnect and reconnect, used when account configuration changes
    pub async fn reconnect(&self) -> Result<()> {
        tracing::info!("Reconnecting driver after account configuration change");
        self.driver.disconnect().await;
        self.driver.connect().await
    }

    pub async fn disconnect(&self) {
        self.driver.disconnect().await;
    }

    pub async fn properties(&self, source: EntitySource, serial: &str) -> Result<Value> {
        self.driver.properties(source, serial).await
    }

    pub async fn commands(&self, serial: &str) -> Result<Vec<String>> {
        self.driver.commands(serial).await
    }

    pub async fn start_livestream(
        &self,
        serial: &str,
    ) -> Result<mpsc::Receiver<LivestreamPacket>> {
        self.driver.start_livestream(serial).await
    }

    pub async fn stop_livestream(&self, serial: &str) -> Result<()> {
        self.driver.stop_livestream(serial).await
    }

    pub async fn download_image(&self, serial: &str) -> Result<()> {
        self.driver.download_image(serial).await
    }

    pub async fn query_latest_info(&self, serial: &str) -> Result<()> {
        self.driver.query_latest_info(serial).await
    }

    pub async fn preset_position(&self, serial: &str, position: u32) -> Result<()> {
        self.driver.preset_position(serial, position).await
    }

    pub async fn pan_and_tilt(&self, serial: &str, direction: i32) -> Result<()> {
        self.driver.pan_and_tilt(serial, direction).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::replay::ReplayDriver;

    #[tokio::test]
    async fn test_connect_caches_entities() {
        let events = Arc::new(EventBus::new());
        let driver = ReplayDriver::new("/nonexistent".into(), "TESTCAM0".to_string());
        let manager = DriverManager::new(driver, events.clone());

        let mut rx = events.subscribe();
        manager.start().await.unwrap();

        // Connected event is republished on the bus
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SystemEvent::DriverConnected));
        assert!(manager.is_connected());
        assert_eq!(manager.devices(), vec!["TESTCAM0".to_string()]);

        manager.disconnect().await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SystemEvent::DriverDisconnected { .. }));
        assert!(manager.devices().is_empty());
    }
}
