//! Cloud driver seam
//!
//! The cloud driver library is an external collaborator: it owns the
//! vendor protocol and delivers decoded elementary frames plus property
//! events. This module defines the trait boundary the rest of the proxy
//! programs against, the frame/metadata types crossing it, and the
//! manager that adapts driver events onto the system event bus.

pub mod manager;
pub mod replay;

pub use manager::DriverManager;
pub use replay::ReplayDriver;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;
use crate::events::EntitySource;

/// Video codec of the elementary stream delivered by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    /// Demuxer format name the encoder uses for this codec
    pub fn input_format(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "hevc",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H264"),
            VideoCodec::H265 => write!(f, "H265"),
        }
    }
}

/// Audio codec of the elementary stream (the fleet speaks AAC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
}

/// Metadata carried with every video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoMetadata {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Metadata carried with every audio frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioMetadata {
    pub codec: AudioCodec,
}

/// One frame delivered on an active livestream
#[derive(Debug, Clone)]
pub enum LivestreamPacket {
    Video { data: Bytes, meta: VideoMetadata },
    Audio { data: Bytes, meta: AudioMetadata },
}

/// Events emitted by the driver outside the frame path
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Cloud connection established; carries the known entity serials
    Connected {
        stations: Vec<String>,
        devices: Vec<String>,
    },
    /// Cloud connection lost or closed
    Disconnected { reason: String },
    /// A device or station property changed
    PropertyChanged {
        source: EntitySource,
        serial: String,
        name: String,
        value: Value,
    },
    /// The driver ended a livestream on its own (cloud-side stop)
    LivestreamStopped { serial: String },
    /// Async completion of a `download_image` request
    ImageDownloaded {
        serial: String,
        file: String,
        hash: Option<String>,
    },
    /// Async completion of a `query_latest_info` request
    DatabaseQueryResult { serial: String, data: Value },
}

/// The cloud driver boundary
///
/// Implementations own connectivity and entity bookkeeping; the proxy
/// only consumes frames and events and issues commands. All methods are
/// expected to be cheap to call; long-running work completes through
/// [`DriverEvent`]s.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver library version, reported in the WebSocket version frame
    fn version(&self) -> String;

    /// Whether livestreams from this driver carry an audio track; the
    /// encoder only opens its auxiliary input when they do
    fn livestream_has_audio(&self) -> bool {
        true
    }

    /// Establish the cloud connection
    async fn connect(&self) -> Result<()>;

    /// Close the cloud connection
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Subscribe to driver events
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;

    /// Property bag for a device or station
    async fn properties(&self, source: EntitySource, serial: &str) -> Result<Value>;

    /// Command identifiers a device supports
    async fn commands(&self, serial: &str) -> Result<Vec<String>>;

    /// Start the livestream for one camera; frames arrive on the
    /// returned channel until the stream stops
    async fn start_livestream(&self, serial: &str) -> Result<mpsc::Receiver<LivestreamPacket>>;

    /// Stop the livestream for one camera
    async fn stop_livestream(&self, serial: &str) -> Result<()>;

    /// Request the latest cloud image; completes via `ImageDownloaded`
    async fn download_image(&self, serial: &str) -> Result<()>;

    /// Query the station database; completes via `DatabaseQueryResult`
    async fn query_latest_info(&self, serial: &str) -> Result<()>;

    /// Move a PTZ camera to a stored preset position
    async fn preset_position(&self, serial: &str, position: u32) -> Result<()>;

    /// Relative pan/tilt step; direction codes are device-specific and
    /// passed through verbatim
    async fn pan_and_tilt(&self, serial: &str, direction: i32) -> Result<()>;
}
