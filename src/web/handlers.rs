use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tower::util::ServiceExt;
use uuid::Uuid;

use crate::config::{AppConfig, ALLOWED_FIELDS};
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stream::SessionController;

// ============================================================================
// Live stream
// ============================================================================

/// Ends the subscriber's session when the HTTP response is dropped,
/// whether by peer close or by pipeline teardown
struct SubscriberGuard {
    id: Uuid,
    session: Arc<SessionController>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let session = self.session.clone();
        let id = self.id;
        tokio::spawn(async move {
            session.leave(id).await;
        });
    }
}

/// Validate the camera serial taken from `{serial}.mp4`
fn parse_serial(serial: &str) -> Result<&str> {
    if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::BadRequest(format!("invalid serial: {}", serial)));
    }
    Ok(serial)
}

/// Root-level non-stream path: hand it to the static UI service
async fn serve_root_file(state: &AppState, filename: &str) -> Result<Response> {
    let Some(serve_dir) = state.static_files.clone() else {
        return Err(AppError::BadRequest(format!(
            "not a stream path: {}",
            filename
        )));
    };
    let request = Request::builder()
        .uri(format!("/{}", filename))
        .body(Body::empty())
        .map_err(|e| AppError::Internal(e.to_string()))?;
    match serve_dir.oneshot(request).await {
        Ok(response) => Ok(response.map(Body::new).into_response()),
        Err(e) => Err(AppError::Internal(e.to_string())),
    }
}

/// `GET /{serial}.mp4` - join the live stream for one camera
///
/// The response is withheld until the subscriber is gated through the
/// init segment (10 s budget), so the first bytes on the wire are always
/// `ftyp`+`moov` of the current session.
pub async fn stream_mp4(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Response> {
    let Some(serial) = filename.strip_suffix(".mp4") else {
        return serve_root_file(&state, &filename).await;
    };
    let serial = parse_serial(serial)?;

    let (subscriber, mut rx) = state.session.join(serial).await?;
    let guard = SubscriberGuard {
        id: subscriber.id,
        session: state.session.clone(),
    };

    // Guard drop detaches on failure
    state.hub.gate(&subscriber).await?;

    let body_stream = async_stream::stream! {
        let _guard = guard;
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, std::io::Error>(chunk);
        }
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .expect("static response parts"))
}

// ============================================================================
// Configuration
// ============================================================================

enum PatchError {
    UnknownFields(Vec<String>),
    Invalid(String),
}

/// Merge a whitelisted patch into the current record
///
/// Returns the merged config and the keys whose values actually changed,
/// so a repeated identical POST reports no updates.
fn apply_config_patch(
    current: &AppConfig,
    patch: &Map<String, Value>,
) -> std::result::Result<(AppConfig, Vec<String>), PatchError> {
    let unknown: Vec<String> = patch
        .keys()
        .filter(|k| !ALLOWED_FIELDS.contains(&k.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(PatchError::UnknownFields(unknown));
    }

    let mut merged = match serde_json::to_value(current) {
        Ok(Value::Object(map)) => map,
        _ => return Err(PatchError::Invalid("config serialization".to_string())),
    };

    let mut updated = Vec::new();
    for (key, value) in patch {
        if merged.get(key) != Some(value) {
            updated.push(key.clone());
        }
        merged.insert(key.clone(), value.clone());
    }

    let config: AppConfig = serde_json::from_value(Value::Object(merged))
        .map_err(|e| PatchError::Invalid(e.to_string()))?;
    Ok((config, updated))
}

/// `GET /config` - effective whitelisted configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<AppConfig> {
    Json((*state.config.get()).clone())
}

/// `POST /config` - merge, persist, and apply side effects
pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<Map<String, Value>>,
) -> Result<Response> {
    let current = state.config.get();
    let (config, updated) = match apply_config_patch(&current, &patch) {
        Ok(result) => result,
        Err(PatchError::UnknownFields(fields)) => {
            tracing::debug!("Config update rejected, unknown fields: {:?}", fields);
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(json!({ "allowedFields": ALLOWED_FIELDS })),
            )
                .into_response());
        }
        Err(PatchError::Invalid(message)) => {
            return Err(AppError::BadRequest(message));
        }
    };

    let saved = !updated.is_empty();
    if saved {
        state.config.set(config.clone(), updated.clone()).await?;
        tracing::info!("Configuration updated: {:?}", updated);

        if AppConfig::affects_transcoding(&updated) {
            state.session.restart_encoder().await;
        }
        if AppConfig::affects_driver(&updated) {
            let driver = state.driver.clone();
            tokio::spawn(async move {
                if let Err(e) = driver.reconnect().await {
                    tracing::error!("Driver reconnect failed: {}", e);
                }
            });
        }
    }

    Ok(Json(json!({
        "success": true,
        "updatedFields": updated,
        "saved": saved,
        "config": config,
    }))
    .into_response())
}

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthInfo {
    driver_connected: bool,
    video_meta: Option<Value>,
    audio_meta: Option<Value>,
    subscribers: usize,
    is_transcoding: bool,
    current_device: Option<String>,
    scale: Option<String>,
    has_init_segment: bool,
    has_keyframe_fragment: bool,
}

/// `GET /health` - pipeline and driver state
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthInfo> {
    let config = state.config.get();
    let video_meta = state.ingress.video_meta().map(|m| {
        json!({
            "codec": m.codec.to_string(),
            "width": m.width,
            "height": m.height,
            "fps": m.fps,
        })
    });
    let audio_meta = state
        .ingress
        .audio_meta()
        .map(|_| json!({ "codec": "AAC" }));

    Json(HealthInfo {
        driver_connected: state.driver.is_connected(),
        video_meta,
        audio_meta,
        subscribers: state.hub.count(),
        is_transcoding: state.session.is_transcoding(),
        current_device: state.session.current_device().await,
        scale: config.video_scale.clone(),
        has_init_segment: state.hub.has_init_segment(),
        has_keyframe_fragment: state.session.has_keyframe_fragment(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_validation() {
        assert_eq!(parse_serial("abc123").unwrap(), "abc123");
        assert_eq!(
            parse_serial("T8410P0123456789").unwrap(),
            "T8410P0123456789"
        );
        assert!(parse_serial("abc-123").is_err());
        assert!(parse_serial("").is_err());
        assert!(parse_serial("abc/../x").is_err());
        assert!(parse_serial("abc 123").is_err());
    }

    #[test]
    fn test_patch_rejects_unknown_fields() {
        let current = AppConfig::default();
        let patch: Map<String, Value> =
            serde_json::from_str(r#"{"TRANSCODING_CRF": 25, "bogus": 1}"#).unwrap();
        match apply_config_patch(&current, &patch) {
            Err(PatchError::UnknownFields(fields)) => {
                assert_eq!(fields, vec!["bogus".to_string()]);
            }
            _ => panic!("expected unknown-field rejection"),
        }
    }

    #[test]
    fn test_patch_reports_changed_fields() {
        let current = AppConfig::default();
        let patch: Map<String, Value> =
            serde_json::from_str(r#"{"TRANSCODING_CRF": 25, "country": "US"}"#).unwrap();
        let (config, updated) = apply_config_patch(&current, &patch)
            .unwrap_or_else(|_| panic!("patch should apply"));
        // country already "US": only the CRF counts as updated
        assert_eq!(updated, vec!["TRANSCODING_CRF".to_string()]);
        assert_eq!(config.transcoding_crf, 25);
    }

    #[test]
    fn test_patch_is_idempotent() {
        let current = AppConfig::default();
        let patch: Map<String, Value> =
            serde_json::from_str(r#"{"TRANSCODING_PRESET": "fast"}"#).unwrap();

        let (config, updated) = apply_config_patch(&current, &patch)
            .unwrap_or_else(|_| panic!("patch should apply"));
        assert_eq!(updated, vec!["TRANSCODING_PRESET".to_string()]);

        let (_, updated) = apply_config_patch(&config, &patch)
            .unwrap_or_else(|_| panic!("patch should apply"));
        assert!(updated.is_empty());
    }

    #[test]
    fn test_patch_rejects_bad_types() {
        let current = AppConfig::default();
        let patch: Map<String, Value> =
            serde_json::from_str(r#"{"TRANSCODING_CRF": "not a number"}"#).unwrap();
        assert!(matches!(
            apply_config_patch(&current, &patch),
            Err(PatchError::Invalid(_))
        ));
    }
}
