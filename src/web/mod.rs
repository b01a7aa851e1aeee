//! HTTP surface
//!
//! Live stream endpoint, configuration read/write, health, and the
//! WebSocket upgrade path.

pub mod handlers;
pub mod routes;
pub mod ws;

pub use routes::create_router;
