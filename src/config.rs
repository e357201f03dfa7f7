//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and config formats
//! - **derive macros**: Generate Debug, Clone, Serialize, Deserialize implementations
//! - **Result<T, E>**: Loading and validation failures are returned, never panicked on
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platform conventions)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_ENDPOINT__API_KEY`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore because field names contain single ones.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - **server**: where the HTTP/WebSocket listener binds
/// - **endpoint**: how to reach the AI voice endpoint
/// - **audio**: bounded buffer sizes used by every call
/// - **performance**: admission limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub endpoint: EndpointConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection settings for the conversational AI voice endpoint.
///
/// ## Fields:
/// - `url`: `ws://` or `wss://` address of the endpoint
/// - `api_key`: sent as the `x-api-key` header when present
/// - `connect_timeout_ms`: bound on connecting plus the `session.ready` handshake
/// - `close_timeout_ms`: bound on session teardown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

/// Per-call buffer sizes, counted in frames.
///
/// ## Fields:
/// - `uplink_queue_frames`: transcoded frames waiting to be sent to the endpoint
/// - `egress_queue_frames`: µ-law chunks waiting for the telephony socket (drop-oldest)
/// - `telephony_queue_frames`: raw inbound chunks waiting for ingress
///
/// ## Tuning guidelines:
/// At 20 ms per frame, 50 frames is one second of audio. Larger queues ride
/// out longer stalls at the cost of latency once the stall clears.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub uplink_queue_frames: usize,
    pub egress_queue_frames: usize,
    pub telephony_queue_frames: usize,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Calls beyond this are refused with 503
    pub max_concurrent_calls: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(), // Localhost only (safe for development)
                port: 8080,
            },
            endpoint: EndpointConfig {
                url: "ws://127.0.0.1:9090/v1/voice".to_string(),
                api_key: None,
                connect_timeout_ms: 5000,
                close_timeout_ms: 2000,
            },
            audio: AudioConfig {
                uplink_queue_frames: 32,
                egress_queue_frames: 64,
                telephony_queue_frames: 64,
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_ENDPOINT__URL=wss://voice.example.com/v1/voice`: Override the endpoint
    /// - `APP_PERFORMANCE__MAX_CONCURRENT_CALLS=500`: Raise the call limit
    /// - `HOST=0.0.0.0`, `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // required(false): a missing config.toml is fine
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Endpoint URL is a `ws://` or `wss://` address
    /// - Timeouts, queue sizes and the call limit are all greater than 0
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let url = self.endpoint.url.trim();
        if url.is_empty() {
            return Err(anyhow::anyhow!("Endpoint URL cannot be empty"));
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(anyhow::anyhow!(
                "Endpoint URL must start with ws:// or wss://, got {}",
                url
            ));
        }

        if self.endpoint.connect_timeout_ms == 0 || self.endpoint.close_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Endpoint timeouts must be greater than 0"));
        }

        if self.audio.uplink_queue_frames == 0
            || self.audio.egress_queue_frames == 0
            || self.audio.telephony_queue_frames == 0
        {
            return Err(anyhow::anyhow!("Audio queue sizes must be greater than 0"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the fields present in the JSON change, so `{"server": {"port": 9000}}`
    /// touches nothing else. `"api_key": null` clears the key. The update is
    /// applied to a copy and only kept if the result validates.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                updated.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                updated.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(endpoint) = partial_config.get("endpoint") {
            if let Some(url) = endpoint.get("url").and_then(|v| v.as_str()) {
                updated.endpoint.url = url.to_string();
            }
            match endpoint.get("api_key") {
                Some(serde_json::Value::Null) => updated.endpoint.api_key = None,
                Some(value) => {
                    if let Some(key) = value.as_str() {
                        updated.endpoint.api_key = Some(key.to_string());
                    }
                }
                None => {}
            }
            if let Some(ms) = endpoint.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
                updated.endpoint.connect_timeout_ms = ms;
            }
            if let Some(ms) = endpoint.get("close_timeout_ms").and_then(|v| v.as_u64()) {
                updated.endpoint.close_timeout_ms = ms;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(frames) = audio.get("uplink_queue_frames").and_then(|v| v.as_u64()) {
                updated.audio.uplink_queue_frames = frames as usize;
            }
            if let Some(frames) = audio.get("egress_queue_frames").and_then(|v| v.as_u64()) {
                updated.audio.egress_queue_frames = frames as usize;
            }
            if let Some(frames) = audio.get("telephony_queue_frames").and_then(|v| v.as_u64()) {
                updated.audio.telephony_queue_frames = frames as usize;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(calls) = performance.get("max_concurrent_calls").and_then(|v| v.as_u64()) {
                updated.performance.max_concurrent_calls = calls as usize;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Same as `self` but with the API key masked, for API responses.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.endpoint.api_key.is_some() {
            copy.endpoint.api_key = Some("***".to_string());
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.egress_queue_frames, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.endpoint.url = "http://voice.example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.egress_queue_frames = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.max_concurrent_calls = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9091}, "endpoint": {"api_key": "k1"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9091);
        assert_eq!(config.endpoint.api_key.as_deref(), Some("k1"));
        assert_eq!(config.server.host, "127.0.0.1");

        assert!(config.update_from_json(r#"{"endpoint": {"api_key": null}}"#).is_ok());
        assert_eq!(config.endpoint.api_key, None);
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9091}, "audio": {"uplink_queue_frames": 0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config, AppConfig::default());

        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert!(config.update_from_json("not json").is_err());
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = AppConfig::default();
        config.endpoint.api_key = Some("secret".to_string());
        assert_eq!(config.redacted().endpoint.api_key.as_deref(), Some("***"));
        assert_eq!(AppConfig::default().redacted().endpoint.api_key, None);
    }
}
