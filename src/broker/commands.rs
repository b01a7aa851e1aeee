//! Built-in command set
//!
//! The minimum contract the browser UI relies on: state bootstrap,
//! property/command introspection, async station requests, and PTZ
//! control. Handlers capture the driver manager only; long-running work
//! completes through events.

use std::sync::Arc;

use serde_json::{json, Value};

use super::{handler, require_str, CommandError, WsBroker};
use crate::driver::DriverManager;
use crate::events::EntitySource;

/// Register every built-in command on the broker
pub fn register_all(broker: &Arc<WsBroker>, driver: &Arc<DriverManager>) {
    let d = driver.clone();
    broker.register(
        "start_listening",
        handler(move |_| {
            let d = d.clone();
            async move {
                d.wait_connected().await?;
                Ok(json!({
                    "client": { "version": d.version() },
                    "stations": d.stations(),
                    "devices": d.devices(),
                }))
            }
        }),
    );

    let d = driver.clone();
    broker.register(
        "station.get_properties",
        handler(move |payload| {
            let d = d.clone();
            async move {
                let serial = require_str(&payload, "serialNumber")?;
                let properties = d.properties(EntitySource::Station, &serial).await?;
                Ok(json!({ "serialNumber": serial, "properties": properties }))
            }
        }),
    );

    let d = driver.clone();
    broker.register(
        "device.get_properties",
        handler(move |payload| {
            let d = d.clone();
            async move {
                let serial = require_str(&payload, "serialNumber")?;
                let properties = d.properties(EntitySource::Device, &serial).await?;
                Ok(json!({ "serialNumber": serial, "properties": properties }))
            }
        }),
    );

    let d = driver.clone();
    broker.register(
        "device.get_commands",
        handler(move |payload| {
            let d = d.clone();
            async move {
                let serial = require_str(&payload, "serialNumber")?;
                let commands = d.commands(&serial).await?;
                Ok(json!({ "serialNumber": serial, "commands": commands }))
            }
        }),
    );

    let d = driver.clone();
    broker.register(
        "station.download_image",
        handler(move |payload| {
            let d = d.clone();
            async move {
                let serial = require_str(&payload, "serialNumber")?;
                d.download_image(&serial).await?;
                // Completion arrives as a station.imageDownloaded event
                Ok(json!({ "async": true }))
            }
        }),
    );

    let d = driver.clone();
    broker.register(
        "station.database_query_latest_info",
        handler(move |payload| {
            let d = d.clone();
            async move {
                let serial = require_str(&payload, "serialNumber")?;
                d.query_latest_info(&serial).await?;
                Ok(json!({ "async": true }))
            }
        }),
    );

    let d = driver.clone();
    broker.register(
        "device.preset_position",
        handler(move |payload| {
            let d = d.clone();
            async move {
                let serial = require_str(&payload, "serialNumber")?;
                let position = payload
                    .get("position")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| CommandError::new("Missing field: position"))?;
                d.preset_position(&serial, position as u32).await?;
                Ok(json!({ "serialNumber": serial, "position": position }))
            }
        }),
    );

    let d = driver.clone();
    broker.register(
        "device.pan_and_tilt",
        handler(move |payload| {
            let d = d.clone();
            async move {
                let serial = require_str(&payload, "serialNumber")?;
                let direction = payload
                    .get("direction")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| CommandError::new("Missing field: direction"))?;
                d.pan_and_tilt(&serial, direction as i32).await?;
                Ok(json!({ "serialNumber": serial, "direction": direction }))
            }
        }),
    );
}
