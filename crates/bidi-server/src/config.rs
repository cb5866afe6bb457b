//! Server configuration and loading.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If the config file exists, deep-merge its JSON over the defaults
//! 3. Apply `BIDI_*` environment variable overrides (highest priority)

use std::collections::BTreeMap;
use std::path::Path;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bidi_core::protocol::{self, is_valid_event_name};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::ConfigError;

/// Configuration for a bidi-sse server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind when serving with `listen`.
    pub host: String,
    /// Port to bind (`0` picks a free one).
    pub port: u16,
    /// Path peers connect to; reverse-direction requests use it as a prefix.
    pub base_path: String,
    /// Extra headers merged into every response this server produces.
    pub headers: BTreeMap<String, String>,
    /// Inject `access-control-allow-origin: *`.
    pub cors: bool,
    /// Undelivered frames buffered per session before writes fail.
    pub max_send_queue: usize,
    /// Largest accepted reverse-direction body.
    pub max_body_bytes: usize,
    /// Interval of SSE comment pings; `0` disables them.
    pub keep_alive_secs: u64,
    /// How long `close()` waits for streams to finish.
    pub shutdown_timeout_secs: u64,
    /// Event name of the handshake carrying the session id.
    pub handshake_event: String,
    /// Query parameter naming the session on reverse requests.
    pub session_param: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            base_path: protocol::DEFAULT_BASE_PATH.into(),
            headers: BTreeMap::new(),
            cors: false,
            max_send_queue: 256,
            max_body_bytes: 1024 * 1024, // 1 MB
            keep_alive_secs: 15,
            shutdown_timeout_secs: 30,
            handshake_event: protocol::HANDSHAKE_EVENT.into(),
            session_param: protocol::SESSION_PARAM.into(),
        }
    }
}

impl ServerConfig {
    /// Config for `base_path` with every other field defaulted.
    pub fn with_base_path(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    /// Check the config and build the header map sent on every response.
    pub fn response_headers(&self) -> Result<HeaderMap, ConfigError> {
        if !self.base_path.starts_with('/') {
            return Err(ConfigError::InvalidBasePath(self.base_path.clone()));
        }
        if !is_valid_event_name(&self.handshake_event) {
            return Err(ConfigError::InvalidName {
                field: "handshake_event",
                reason: format!("{:?} cannot be an SSE event name", self.handshake_event),
            });
        }
        if self.session_param.is_empty() {
            return Err(ConfigError::InvalidName {
                field: "session_param",
                reason: "must not be empty".into(),
            });
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let header_name =
                HeaderName::try_from(name.as_str()).map_err(|e| ConfigError::InvalidHeaderName {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let header_value =
                HeaderValue::try_from(value.as_str()).map_err(|e| ConfigError::InvalidHeaderValue {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let _ = headers.insert(header_name, header_value);
        }
        if self.cors {
            let _ = headers.insert(
                axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
        }
        Ok(headers)
    }
}

/// Load a config file, deep-merged over the defaults, then apply env overrides.
///
/// A missing file yields the defaults; unreadable or invalid JSON is an error.
pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading server config from file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Layer `overlay` on top of `base`. Nested objects combine key by key and
/// a `null` in the overlay keeps the base value. Any other overlay value
/// replaces the base outright.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut fields), Value::Object(layer)) => {
            for (key, value) in layer.into_iter().filter(|(_, v)| !v.is_null()) {
                let combined = match fields.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = fields.insert(key, combined);
            }
            Value::Object(fields)
        }
        (_, overlay) => overlay,
    }
}

/// Apply `BIDI_HOST`, `BIDI_PORT`, `BIDI_BASE_PATH` and `BIDI_CORS`.
///
/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

fn apply_overrides(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("BIDI_HOST").filter(|v| !v.is_empty()) {
        config.host = v;
    }
    if let Some(v) = lookup("BIDI_PORT").and_then(|v| parse_port("BIDI_PORT", &v)) {
        config.port = v;
    }
    if let Some(v) = lookup("BIDI_BASE_PATH").filter(|v| !v.is_empty()) {
        config.base_path = v;
    }
    if let Some(v) = lookup("BIDI_CORS").and_then(|v| parse_flag("BIDI_CORS", &v)) {
        config.cors = v;
    }
}

fn parse_flag(name: &str, val: &str) -> Option<bool> {
    let result = parse_bool(val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn parse_port(name: &str, val: &str) -> Option<u16> {
    let result = val.trim().parse::<u16>().ok();
    if result.is_none() {
        warn!(key = name, value = %val, "invalid port env var, ignoring");
    }
    result
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
