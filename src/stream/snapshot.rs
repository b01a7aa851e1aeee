//! Snapshot writer
//!
//! Renders a single high-quality still from the most recent keyframe
//! fragment (init segment + fragment, self-decoding) via a transient
//! encoder invocation, persists it under `snapshots/`, and tracks
//! per-camera snapshot currency in a JSON sidecar.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};

const ENCODER_BIN: &str = "ffmpeg";
/// A still render that takes longer than this is abandoned
const RENDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-camera sidecar record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PictureRecord {
    /// Content hash of the last cloud-delivered image
    pub hash: Option<String>,
    /// When the cloud image was recorded
    pub datetime: Option<String>,
    /// When the local snapshot was last written
    pub snapshot_datetime: Option<String>,
}

pub struct SnapshotWriter {
    snapshot_dir: PathBuf,
    sidecar_path: PathBuf,
    events: Arc<EventBus>,
    /// Serializes still renders and sidecar rewrites
    write_lock: Mutex<()>,
}

impl SnapshotWriter {
    pub fn new(data_dir: &Path, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            snapshot_dir: data_dir.join("snapshots"),
            sidecar_path: data_dir.join("picture-hashes.json"),
            events,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the still for one camera
    pub fn snapshot_path(&self, serial: &str) -> PathBuf {
        self.snapshot_dir.join(format!("{}.jpg", serial))
    }

    /// Render and persist a still from a keyframe seed
    ///
    /// Any encoder or I/O failure is logged by the caller and not
    /// retried; the sidecar timestamp is only advanced on success.
    pub async fn write_still(&self, serial: &str, seed: Bytes) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        tokio::fs::create_dir_all(&self.snapshot_dir).await?;
        let out_path = self.snapshot_path(serial);

        let mut child = Command::new(ENCODER_BIN)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-y",
                "-i",
                "pipe:0",
                "-frames:v",
                "1",
                "-q:v",
                "2",
            ])
            .arg(&out_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Encoder(format!("snapshot encoder spawn: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // The seed is finite; EOF tells the encoder to flush the frame
            if let Err(e) = stdin.write_all(&seed).await {
                tracing::debug!("Snapshot seed write cut short: {}", e);
            }
        }

        let output = tokio::time::timeout(RENDER_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| AppError::Encoder("snapshot render timed out".to_string()))?
            .map_err(AppError::Io)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Encoder(format!(
                "snapshot render failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        self.update_sidecar(serial, |record| {
            record.snapshot_datetime = Some(Utc::now().to_rfc3339());
        })
        .await?;

        tracing::info!("Snapshot saved: {}", out_path.display());
        self.events.publish(SystemEvent::SnapshotSaved {
            serial: serial.to_string(),
        });
        Ok(())
    }

    /// Record the hash of a cloud-delivered image for a camera
    pub async fn record_cloud_image(&self, serial: &str, hash: Option<String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.update_sidecar(serial, |record| {
            record.hash = hash;
            record.datetime = Some(Utc::now().to_rfc3339());
        })
        .await
    }

    /// Current sidecar record for a camera
    pub async fn record(&self, serial: &str) -> Option<PictureRecord> {
        self.load_sidecar().await.ok()?.remove(serial)
    }

    async fn load_sidecar(&self) -> Result<BTreeMap<String, PictureRecord>> {
        match tokio::fs::read(&self.sidecar_path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_sidecar<F>(&self, serial: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut PictureRecord),
    {
        let mut records = self.load_sidecar().await?;
        f(records.entry(serial.to_string()).or_default());

        let json = serde_json::to_vec_pretty(&records)?;
        let tmp = self.sidecar_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.sidecar_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sidecar_round_trip() {
        let dir = tempdir().unwrap();
        let events = Arc::new(EventBus::new());
        let writer = SnapshotWriter::new(dir.path(), events);

        writer
            .record_cloud_image("CAM1", Some("abc123".to_string()))
            .await
            .unwrap();

        let record = writer.record("CAM1").await.unwrap();
        assert_eq!(record.hash.as_deref(), Some("abc123"));
        assert!(record.datetime.is_some());
        assert!(record.snapshot_datetime.is_none());
    }

    #[tokio::test]
    async fn test_sidecar_preserves_other_fields() {
        let dir = tempdir().unwrap();
        let events = Arc::new(EventBus::new());
        let writer = SnapshotWriter::new(dir.path(), events);

        writer
            .record_cloud_image("CAM1", Some("abc123".to_string()))
            .await
            .unwrap();
        writer
            .update_sidecar("CAM1", |r| {
                r.snapshot_datetime = Some("2026-01-01T00:00:00Z".to_string());
            })
            .await
            .unwrap();

        let record = writer.record("CAM1").await.unwrap();
        assert_eq!(record.hash.as_deref(), Some("abc123"));
        assert_eq!(
            record.snapshot_datetime.as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_failed_render_leaves_sidecar_untouched() {
        let dir = tempdir().unwrap();
        let events = Arc::new(EventBus::new());
        let writer = SnapshotWriter::new(dir.path(), events.clone());

        // Garbage seed: the encoder (if present) fails; either way the
        // sidecar must not gain a snapshot timestamp
        let result = writer
            .write_still("CAM1", Bytes::from_static(b"not an mp4"))
            .await;
        assert!(result.is_err());
        let record = writer.record("CAM1").await;
        assert!(record.map_or(true, |r| r.snapshot_datetime.is_none()));
    }

    #[test]
    fn test_sidecar_field_names() {
        let record = PictureRecord {
            hash: Some("h".to_string()),
            datetime: Some("d".to_string()),
            snapshot_datetime: Some("s".to_string()),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["hash"], "h");
        assert_eq!(value["datetime"], "d");
        assert_eq!(value["snapshotDatetime"], "s");
    }
}
