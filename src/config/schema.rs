use serde::{Deserialize, Serialize};

/// Whitelisted configuration keys accepted by `POST /config`.
///
/// Anything outside this list is rejected with the list echoed back.
pub const ALLOWED_FIELDS: &[&str] = &[
    "username",
    "password",
    "country",
    "language",
    "TRANSCODING_PRESET",
    "TRANSCODING_CRF",
    "VIDEO_SCALE",
    "FFMPEG_THREADS",
    "FFMPEG_SHORT_KEYFRAMES",
    "LOG_LEVEL",
];

/// Keys that require a driver reconnect when changed
const DRIVER_FIELDS: &[&str] = &["username", "password", "country", "language"];

/// Keys that require an encoder restart when changed
const TRANSCODE_FIELDS: &[&str] = &[
    "TRANSCODING_PRESET",
    "TRANSCODING_CRF",
    "VIDEO_SCALE",
    "FFMPEG_THREADS",
    "FFMPEG_SHORT_KEYFRAMES",
];

/// Main application configuration
///
/// Serialized field names are the public whitelist keys, so the struct
/// round-trips 1:1 with the `/config` endpoint and `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Cloud account username
    pub username: String,
    /// Cloud account password
    pub password: String,
    /// Account country code (e.g. "US")
    pub country: String,
    /// Account language code (e.g. "en")
    pub language: String,
    /// Encoder speed preset (libx264 preset name)
    #[serde(rename = "TRANSCODING_PRESET")]
    pub transcoding_preset: String,
    /// Constant-rate-factor quality (lower is better)
    #[serde(rename = "TRANSCODING_CRF")]
    pub transcoding_crf: u32,
    /// Optional output scale filter (e.g. "1280:-2")
    #[serde(rename = "VIDEO_SCALE")]
    pub video_scale: Option<String>,
    /// Encoder worker thread count
    #[serde(rename = "FFMPEG_THREADS")]
    pub ffmpeg_threads: u32,
    /// Short keyframe mode: 15-frame GOP / 500 ms fragments
    /// instead of 30-frame GOP / 1000 ms fragments
    #[serde(rename = "FFMPEG_SHORT_KEYFRAMES")]
    pub short_keyframes: bool,
    /// Log verbosity
    #[serde(rename = "LOG_LEVEL")]
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            country: "US".to_string(),
            language: "en".to_string(),
            transcoding_preset: "veryfast".to_string(),
            transcoding_crf: 23,
            video_scale: None,
            ffmpeg_threads: 2,
            short_keyframes: false,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Whether any of the given keys affects the driver connection
    pub fn affects_driver(fields: &[String]) -> bool {
        fields.iter().any(|f| DRIVER_FIELDS.contains(&f.as_str()))
    }

    /// Whether any of the given keys affects the running encoder
    pub fn affects_transcoding(fields: &[String]) -> bool {
        fields.iter().any(|f| TRANSCODE_FIELDS.contains(&f.as_str()))
    }

    /// Keyframe interval in frames for the active keyframe mode
    pub fn keyframe_interval(&self) -> u32 {
        if self.short_keyframes {
            15
        } else {
            30
        }
    }

    /// Fragment target duration in microseconds for the active keyframe mode
    pub fn fragment_duration_us(&self) -> u32 {
        if self.short_keyframes {
            500_000
        } else {
            1_000_000
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.transcoding_crf, 23);
        assert_eq!(config.keyframe_interval(), 30);
        assert_eq!(config.fragment_duration_us(), 1_000_000);
    }

    #[test]
    fn test_short_keyframe_mode() {
        let config = AppConfig {
            short_keyframes: true,
            ..Default::default()
        };
        assert_eq!(config.keyframe_interval(), 15);
        assert_eq!(config.fragment_duration_us(), 500_000);
    }

    #[test]
    fn test_serialized_names_match_whitelist() {
        let value = serde_json::to_value(AppConfig::default()).unwrap();
        let object = value.as_object().unwrap();
        for key in object.keys() {
            assert!(
                ALLOWED_FIELDS.contains(&key.as_str()),
                "field {} not whitelisted",
                key
            );
        }
        assert_eq!(object.len(), ALLOWED_FIELDS.len());
    }

    #[test]
    fn test_field_classification() {
        assert!(AppConfig::affects_driver(&["password".to_string()]));
        assert!(!AppConfig::affects_driver(&["TRANSCODING_CRF".to_string()]));
        assert!(AppConfig::affects_transcoding(&[
            "VIDEO_SCALE".to_string()
        ]));
        assert!(!AppConfig::affects_transcoding(&["LOG_LEVEL".to_string()]));
    }
}
