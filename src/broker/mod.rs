//! JSON WebSocket broker
//!
//! Request/response command dispatch plus fan-out of system events to
//! every connected peer. Commands are dispatched to registered handlers
//! keyed by command name; handlers complete asynchronously and their
//! value (or error code) becomes the result frame.

pub mod commands;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock as ParkingRwLock;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::SystemEvent;

/// Handler failure carrying the wire error code
#[derive(Debug)]
pub struct CommandError {
    pub code: String,
}

impl CommandError {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)
    }
}

impl From<crate::error::AppError> for CommandError {
    fn from(err: crate::error::AppError) -> Self {
        Self {
            code: err.to_string(),
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, CommandError>> + Send>>;

/// A registered command handler
pub type CommandHandler = Arc<dyn Fn(Map<String, Value>) -> HandlerFuture + Send + Sync>;

/// Incoming request frame
#[derive(Debug, Deserialize)]
struct RequestFrame {
    #[serde(rename = "messageId")]
    message_id: String,
    command: String,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

pub struct WsBroker {
    handlers: ParkingRwLock<HashMap<String, CommandHandler>>,
    peers: ParkingRwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    server_version: String,
    client_version: String,
}

impl WsBroker {
    pub fn new(client_version: String) -> Arc<Self> {
        Arc::new(Self {
            handlers: ParkingRwLock::new(HashMap::new()),
            peers: ParkingRwLock::new(HashMap::new()),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            client_version,
        })
    }

    /// Register a command handler; later registrations win
    pub fn register(&self, command: &str, handler: CommandHandler) {
        self.handlers.write().insert(command.to_string(), handler);
    }

    /// Whether any handlers are registered; connections are refused
    /// before registration completes
    pub fn has_handlers(&self) -> bool {
        !self.handlers.read().is_empty()
    }

    /// First frame sent to every new peer
    pub fn version_frame(&self) -> String {
        json!({
            "type": "version",
            "serverVersion": self.server_version,
            "clientVersion": self.client_version,
        })
        .to_string()
    }

    /// Attach a peer; returns its id and the outbound frame queue
    pub fn connect_peer(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.peers.write().insert(id, tx);
        tracing::info!("WebSocket peer {} connected (total: {})", id, self.peer_count());
        (id, rx)
    }

    pub fn disconnect_peer(&self, id: Uuid) {
        if self.peers.write().remove(&id).is_some() {
            tracing::info!("WebSocket peer {} disconnected", id);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Serialize an event once and write it to every open peer
    pub fn broadcast_event(&self, event: &SystemEvent) {
        let frame = match serde_json::to_value(event) {
            Ok(inner) => json!({ "type": "event", "event": inner }).to_string(),
            Err(e) => {
                tracing::warn!("Failed to serialize event {}: {}", event.event_name(), e);
                return;
            }
        };

        let mut dead = Vec::new();
        {
            let peers = self.peers.read();
            for (id, tx) in peers.iter() {
                if tx.send(frame.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.disconnect_peer(id);
        }
    }

    /// Dispatch one inbound text frame, producing the response frame
    pub async fn dispatch(&self, text: &str) -> String {
        let request: RequestFrame = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                let original_type = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|v| v.get("type").cloned());
                return json!({
                    "type": "error",
                    "error": "invalid_message",
                    "message": e.to_string(),
                    "originalType": original_type,
                })
                .to_string();
            }
        };

        let handler = self.handlers.read().get(&request.command).cloned();
        let Some(handler) = handler else {
            return json!({
                "type": "result",
                "messageId": request.message_id,
                "success": false,
                "errorCode": "Unknown command",
            })
            .to_string();
        };

        match handler(request.payload).await {
            Ok(result) => json!({
                "type": "result",
                "messageId": request.message_id,
                "success": true,
                "result": result,
            })
            .to_string(),
            Err(e) => json!({
                "type": "result",
                "messageId": request.message_id,
                "success": false,
                "errorCode": e.code,
            })
            .to_string(),
        }
    }
}

/// Wrap an async closure as a [`CommandHandler`]
pub fn handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CommandError>> + Send + 'static,
{
    Arc::new(move |payload| -> HandlerFuture { Box::pin(f(payload)) })
}

/// Extract a required string field from a command payload
pub fn require_str(payload: &Map<String, Value>, key: &str) -> Result<String, CommandError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CommandError::new(format!("Missing field: {}", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with_echo() -> Arc<WsBroker> {
        let broker = WsBroker::new("1.0.0".to_string());
        broker.register(
            "echo",
            handler(|payload| async move { Ok(Value::Object(payload)) }),
        );
        broker.register(
            "fail",
            handler(|_| async move { Err(CommandError::new("DeviceOffline")) }),
        );
        broker
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let broker = broker_with_echo();
        let response = broker
            .dispatch(r#"{"messageId": "echo", "command": "echo", "x": 7}"#)
            .await;
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["type"], "result");
        assert_eq!(value["messageId"], "echo");
        assert_eq!(value["success"], true);
        assert_eq!(value["result"]["x"], 7);
    }

    #[tokio::test]
    async fn test_dispatch_handler_error() {
        let broker = broker_with_echo();
        let response = broker
            .dispatch(r#"{"messageId": "fail", "command": "fail"}"#)
            .await;
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["errorCode"], "DeviceOffline");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_command() {
        let broker = broker_with_echo();
        let response = broker
            .dispatch(r#"{"messageId": "nope", "command": "nope"}"#)
            .await;
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["type"], "result");
        assert_eq!(value["success"], false);
        assert_eq!(value["errorCode"], "Unknown command");
    }

    #[tokio::test]
    async fn test_dispatch_malformed_input() {
        let broker = broker_with_echo();
        let response = broker.dispatch(r#"{"type": "hello"}"#).await;
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"], "invalid_message");
        assert_eq!(value["originalType"], "hello");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_peers() {
        let broker = broker_with_echo();
        let (_id1, mut rx1) = broker.connect_peer();
        let (_id2, mut rx2) = broker.connect_peer();

        broker.broadcast_event(&SystemEvent::SnapshotSaved {
            serial: "CAM1".to_string(),
        });

        for rx in [&mut rx1, &mut rx2] {
            let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["type"], "event");
            assert_eq!(frame["event"]["event"], "snapshotSaved");
            assert_eq!(frame["event"]["serial"], "CAM1");
        }
    }

    #[tokio::test]
    async fn test_dead_peer_detached_on_broadcast() {
        let broker = broker_with_echo();
        let (_id, rx) = broker.connect_peer();
        drop(rx);
        assert_eq!(broker.peer_count(), 1);

        broker.broadcast_event(&SystemEvent::DriverConnected);
        assert_eq!(broker.peer_count(), 0);
    }

    #[test]
    fn test_version_frame() {
        let broker = WsBroker::new("drv/2.1".to_string());
        let value: Value = serde_json::from_str(&broker.version_frame()).unwrap();
        assert_eq!(value["type"], "version");
        assert_eq!(value["clientVersion"], "drv/2.1");
        assert!(value["serverVersion"].is_string());
    }
}
