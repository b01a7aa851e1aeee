//! Replay driver
//!
//! A development backend that replays a recorded H.264 elementary stream
//! from disk at frame cadence, so the whole transcode and fan-out path can
//! be driven without a camera account. Selected with `--replay <file>`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc, Mutex};

use super::{Driver, DriverEvent, LivestreamPacket, VideoCodec, VideoMetadata};
use crate::error::{AppError, Result};
use crate::events::EntitySource;

/// Bytes pushed per tick; small enough to keep latency low
const CHUNK_SIZE: usize = 32 * 1024;
/// Tick interval, roughly one frame at 20 fps
const CHUNK_INTERVAL: Duration = Duration::from_millis(50);

pub struct ReplayDriver {
    path: PathBuf,
    serial: String,
    event_tx: broadcast::Sender<DriverEvent>,
    connected: AtomicBool,
    stream_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ReplayDriver {
    pub fn new(path: PathBuf, serial: String) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            path,
            serial,
            event_tx,
            connected: AtomicBool::new(false),
            stream_task: Mutex::new(None),
        })
    }

    fn metadata(&self) -> VideoMetadata {
        VideoMetadata {
            codec: VideoCodec::H264,
            width: 1920,
            height: 1080,
            fps: 20,
        }
    }
}

#[async_trait]
impl Driver for ReplayDriver {
    fn version(&self) -> String {
        format!("replay/{}", env!("CARGO_PKG_VERSION"))
    }

    // Recordings are video-only
    fn livestream_has_audio(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.event_tx.send(DriverEvent::Connected {
            stations: vec![self.serial.clone()],
            devices: vec![self.serial.clone()],
        });
        tracing::info!("Replay driver online: {}", self.path.display());
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(task) = self.stream_task.lock().await.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.event_tx.send(DriverEvent::Disconnected {
            reason: "client disconnect".to_string(),
        });
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.event_tx.subscribe()
    }

    async fn properties(&self, _source: EntitySource, serial: &str) -> Result<Value> {
        if serial != self.serial {
            return Err(AppError::Driver(format!("unknown serial: {}", serial)));
        }
        Ok(json!({
            "serialNumber": self.serial,
            "model": "REPLAY",
            "name": "Replay camera",
            "enabled": true,
        }))
    }

    async fn commands(&self, serial: &str) -> Result<Vec<String>> {
        if serial != self.serial {
            return Err(AppError::Driver(format!("unknown serial: {}", serial)));
        }
        Ok(vec![
            "device.start_livestream".to_string(),
            "device.stop_livestream".to_string(),
        ])
    }

    async fn start_livestream(&self, serial: &str) -> Result<mpsc::Receiver<LivestreamPacket>> {
        if serial != self.serial {
            return Err(AppError::Driver(format!("unknown serial: {}", serial)));
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        let meta = self.metadata();
        let (tx, rx) = mpsc::channel(64);
        let path = self.path.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHUNK_INTERVAL);
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                interval.tick().await;
                match file.read(&mut buf).await {
                    Ok(0) => {
                        // Loop the recording for continuous playback
                        match tokio::fs::File::open(&path).await {
                            Ok(f) => file = f,
                            Err(e) => {
                                tracing::warn!("Replay source vanished: {}", e);
                                break;
                            }
                        }
                    }
                    Ok(n) => {
                        let packet = LivestreamPacket::Video {
                            data: Bytes::copy_from_slice(&buf[..n]),
                            meta,
                        };
                        if tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Replay read error: {}", e);
                        break;
                    }
                }
            }
        });

        let mut guard = self.stream_task.lock().await;
        if let Some(old) = guard.replace(task) {
            old.abort();
        }

        Ok(rx)
    }

    async fn stop_livestream(&self, serial: &str) -> Result<()> {
        if let Some(task) = self.stream_task.lock().await.take() {
            task.abort();
        }
        let _ = self.event_tx.send(DriverEvent::LivestreamStopped {
            serial: serial.to_string(),
        });
        Ok(())
    }

    async fn download_image(&self, serial: &str) -> Result<()> {
        // Completes immediately; there is no cloud to fetch from
        let _ = self.event_tx.send(DriverEvent::ImageDownloaded {
            serial: serial.to_string(),
            file: self.path.display().to_string(),
            hash: None,
        });
        Ok(())
    }

    async fn query_latest_info(&self, serial: &str) -> Result<()> {
        let _ = self.event_tx.send(DriverEvent::DatabaseQueryResult {
            serial: serial.to_string(),
            data: json!([]),
        });
        Ok(())
    }

    async fn preset_position(&self, _serial: &str, _position: u32) -> Result<()> {
        Err(AppError::Driver("device has no PTZ support".to_string()))
    }

    async fn pan_and_tilt(&self, _serial: &str, _direction: i32) -> Result<()> {
        Err(AppError::Driver("device has no PTZ support".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_livestream_delivers_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.h264");
        tokio::fs::write(&path, vec![0xAAu8; 100]).await.unwrap();

        let driver = ReplayDriver::new(path, "TESTCAM0".to_string());
        driver.connect().await.unwrap();

        let mut rx = driver.start_livestream("TESTCAM0").await.unwrap();
        match rx.recv().await.unwrap() {
            LivestreamPacket::Video { data, meta } => {
                assert_eq!(data.len(), 100);
                assert_eq!(meta.codec, VideoCodec::H264);
            }
            _ => panic!("expected video packet"),
        }

        driver.stop_livestream("TESTCAM0").await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_serial_rejected() {
        let driver = ReplayDriver::new("/nonexistent".into(), "TESTCAM0".to_string());
        assert!(driver.commands("OTHER").await.is_err());
    }
}
