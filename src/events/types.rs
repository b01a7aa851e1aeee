//! System event types
//!
//! Everything that can be broadcast through the event bus. The driver's
//! event surface is wide (dozens of distinct property names), so property
//! updates travel through a single generic variant instead of a variant
//! per property name.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which entity kind an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitySource {
    Device,
    Station,
}

/// System event enumeration
///
/// Serialized with `event` as the tag, producing objects like:
/// `{"event": "device.propertyChanged", "serial": "...", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SystemEvent {
    /// Driver established its cloud connection
    #[serde(rename = "driver.connected")]
    DriverConnected,

    /// Driver lost or closed its cloud connection
    #[serde(rename = "driver.disconnected")]
    DriverDisconnected { reason: String },

    /// A device or station property changed
    #[serde(rename = "device.propertyChanged")]
    PropertyChanged {
        source: EntitySource,
        serial: String,
        name: String,
        value: Value,
    },

    /// Livestream started for a camera
    #[serde(rename = "livestream.started")]
    LivestreamStarted { serial: String },

    /// Livestream stopped for a camera
    #[serde(rename = "livestream.stopped")]
    LivestreamStopped { serial: String },

    /// A still image was written for a camera
    #[serde(rename = "snapshotSaved")]
    SnapshotSaved { serial: String },

    /// Async completion of `station.download_image`
    #[serde(rename = "station.imageDownloaded")]
    ImageDownloaded {
        serial: String,
        file: String,
        hash: Option<String>,
    },

    /// Async completion of `station.database_query_latest_info`
    #[serde(rename = "station.databaseQueryLatest")]
    DatabaseQueryLatest { serial: String, data: Value },
}

impl SystemEvent {
    /// Event name as used on the wire
    pub fn event_name(&self) -> &'static str {
        match self {
            SystemEvent::DriverConnected => "driver.connected",
            SystemEvent::DriverDisconnected { .. } => "driver.disconnected",
            SystemEvent::PropertyChanged { .. } => "device.propertyChanged",
            SystemEvent::LivestreamStarted { .. } => "livestream.started",
            SystemEvent::LivestreamStopped { .. } => "livestream.stopped",
            SystemEvent::SnapshotSaved { .. } => "snapshotSaved",
            SystemEvent::ImageDownloaded { .. } => "station.imageDownloaded",
            SystemEvent::DatabaseQueryLatest { .. } => "station.databaseQueryLatest",
        }
    }
}
