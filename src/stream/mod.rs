//! Live stream delivery
//!
//! The fan-out hub delivers the encoder's fMP4 box stream to HTTP
//! subscribers with per-subscriber init gating; the session controller
//! serializes camera start/stop around subscriber activity; the snapshot
//! writer persists a still from the last keyframe fragment.

pub mod hub;
pub mod session;
pub mod snapshot;

pub use hub::{StreamFlags, StreamHub, Subscriber};
pub use session::SessionController;
pub use snapshot::SnapshotWriter;
