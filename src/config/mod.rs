//! Application configuration
//!
//! The configuration record is a flat key/value document persisted to
//! `config.json` under the data directory. Field names match the public
//! whitelist used by the `/config` HTTP endpoint.

pub mod schema;
pub mod store;

pub use schema::{AppConfig, ALLOWED_FIELDS};
pub use store::{ConfigChange, ConfigStore};
