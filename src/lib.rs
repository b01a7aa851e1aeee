//! camstream - live fMP4 proxy for cloud security cameras
//!
//! This crate bridges a cloud camera driver (elementary H.264/H.265 video
//! and AAC audio frames) to web clients: an external encoder turns the
//! frames into a fragmented-MP4 stream which is fanned out to HTTP
//! subscribers, while camera state and commands are exposed over a JSON
//! WebSocket API.

pub mod broker;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod state;
pub mod stream;
pub mod transcode;
pub mod web;

pub use error::{AppError, Result};
