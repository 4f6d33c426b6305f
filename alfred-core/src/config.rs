//! Typed view of the document's top-level `Configuration` object.
//!
//! Configuration lives inside the state document itself, so it is read
//! through the same projection path as everything else (with the
//! administrative role set, stripping any policy wrappers an operator may
//! have placed around it).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::policy::{self, roles};

/// Seconds between saves when the document does not say otherwise.
pub const DEFAULT_MIN_SAVE_INTERVAL: f64 = 60.0;

/// HTTP port used when `Configuration.Http.Port` is absent.
pub const DEFAULT_HTTP_PORT: u16 = 8100;

/// Service configuration, decoded from the `Configuration` key of the state
/// document. Every field has a default so a minimal document still runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Configuration {
    /// Minimum spacing between successive store saves, in seconds.
    pub min_save_interval: f64,
    /// Timeout applied to outbound HTTP transactions, in seconds.
    pub request_timeout_seconds: f64,
    /// Path to the TLS certificate handed to the fronting terminator.
    pub ssl_certificate: Option<String>,
    /// Path to the TLS private key.
    pub ssl_key: Option<String>,
    /// Passphrase protecting the TLS private key.
    pub ssl_key_passphrase: Option<String>,
    /// Path to the CA bundle used for outbound TLS verification.
    pub ca_certificates: Option<String>,
    /// Path to the diagnostics log file used in daemon mode.
    pub log_file: Option<String>,
    /// Component name to minimum reported severity.
    pub diagnostic_reporting_thresholds: BTreeMap<String, i64>,
    /// Raw HTTP server options, merged over the built-in defaults.
    pub http: BTreeMap<String, Value>,
    /// Largest WebSocket frame accepted from a client, in bytes.
    pub web_socket_max_frame_size: usize,
    /// Seconds a WebSocket session may remain unauthenticated.
    pub web_socket_authentication_timeout: f64,
    /// Seconds a closed session's record lingers before it is erased.
    pub web_socket_close_linger: f64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            min_save_interval: DEFAULT_MIN_SAVE_INTERVAL,
            request_timeout_seconds: 30.0,
            ssl_certificate: None,
            ssl_key: None,
            ssl_key_passphrase: None,
            ca_certificates: None,
            log_file: None,
            diagnostic_reporting_thresholds: BTreeMap::new(),
            http: BTreeMap::new(),
            web_socket_max_frame_size: 65536,
            web_socket_authentication_timeout: 30.0,
            web_socket_close_linger: 5.0,
        }
    }
}

impl Configuration {
    /// Extracts the configuration from a state document. A missing or
    /// malformed `Configuration` key falls back to defaults with a warning.
    #[must_use]
    pub fn from_document(document: &Value) -> Self {
        let raw = policy::get(document, &["Configuration"], &roles::admin());
        if raw.is_null() {
            return Self::default();
        }
        serde_json::from_value(raw).unwrap_or_else(|decode_error| {
            warn!(error = %decode_error, "malformed Configuration; using defaults");
            Self::default()
        })
    }

    /// HTTP server options as strings, merged over the built-in defaults
    /// (`Port=8100`, `TooManyRequestsThreshold=0.0`).
    #[must_use]
    pub fn http_settings(&self) -> BTreeMap<String, String> {
        let mut settings = BTreeMap::from([
            ("Port".to_string(), DEFAULT_HTTP_PORT.to_string()),
            ("TooManyRequestsThreshold".to_string(), "0.0".to_string()),
        ]);
        for (key, value) in &self.http {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            settings.insert(key.clone(), rendered);
        }
        settings
    }

    /// The TCP port for the HTTP/WS listener.
    #[must_use]
    pub fn http_port(&self) -> u16 {
        let settings = self.http_settings();
        let Some(raw) = settings.get("Port") else {
            return DEFAULT_HTTP_PORT;
        };
        raw.parse().unwrap_or_else(|_| {
            warn!(port = %raw, "unparseable Http.Port; using default");
            DEFAULT_HTTP_PORT
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_configuration_uses_defaults() {
        let config = Configuration::from_document(&json!({"Roles": {}}));
        assert!((config.min_save_interval - 60.0).abs() < f64::EPSILON);
        assert_eq!(config.http_port(), 8100);
        assert_eq!(
            config.http_settings().get("TooManyRequestsThreshold"),
            Some(&"0.0".to_string())
        );
    }

    #[test]
    fn recognises_documented_keys() {
        let config = Configuration::from_document(&json!({
            "Configuration": {
                "MinSaveInterval": 10,
                "RequestTimeoutSeconds": 5.5,
                "LogFile": "/var/log/alfred.log",
                "DiagnosticReportingThresholds": {"Store": 3, "ApiWs": 0},
                "Http": {"Port": "9000"},
                "WebSocketMaxFrameSize": 1024,
                "WebSocketAuthenticationTimeout": 5,
                "WebSocketCloseLinger": 0.5
            }
        }));
        assert!((config.min_save_interval - 10.0).abs() < f64::EPSILON);
        assert!((config.request_timeout_seconds - 5.5).abs() < f64::EPSILON);
        assert_eq!(config.log_file.as_deref(), Some("/var/log/alfred.log"));
        assert_eq!(config.diagnostic_reporting_thresholds.get("Store"), Some(&3));
        assert_eq!(config.http_port(), 9000);
        assert_eq!(config.web_socket_max_frame_size, 1024);
        assert!((config.web_socket_authentication_timeout - 5.0).abs() < f64::EPSILON);
        assert!((config.web_socket_close_linger - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn numeric_http_options_are_stringified() {
        let config = Configuration::from_document(&json!({
            "Configuration": {"Http": {"Port": 8200}}
        }));
        assert_eq!(config.http_port(), 8200);
    }

    #[test]
    fn configuration_inside_a_wrapper_is_still_found() {
        let config = Configuration::from_document(&json!({
            "data": {
                "Configuration": {"MinSaveInterval": 15}
            }
        }));
        assert!((config.min_save_interval - 15.0).abs() < f64::EPSILON);
    }
}
