//! # Application State Management
//!
//! Shared state accessed by every HTTP handler and every telephony media
//! connection at the same time.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets many handlers share ownership of the same data
//! - **Thread safety**: Safe to clone into actix workers and spawned tasks
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Why needed**: Requests read the config constantly; `PUT /config` writes it rarely
//!
//! ### Arc<dyn Trait>
//! - **Purpose**: The voice endpoint client is stored behind its trait, so the
//!   media handler never knows which transport it is talking to
//!
//! ## Lock poisoning:
//! A poisoned lock only means a panic happened while it was held. Metrics and
//! config stay usable, so every accessor recovers the guard instead of
//! propagating the panic.

use crate::config::AppConfig;
use crate::relay::registry::CallRegistry;
use crate::voice::VoiceSessionClient;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state that's shared across all request handlers.
///
/// ## Contents:
/// - **config**: runtime-updatable configuration
/// - **metrics**: HTTP request counters
/// - **calls**: registry of calls currently being relayed
/// - **voice_client**: factory for AI voice endpoint sessions
/// - **start_time**: for uptime reporting
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub calls: Arc<CallRegistry>,
    pub voice_client: Arc<dyn VoiceSessionClient>,
    pub start_time: Instant,
}

/// HTTP metrics collected across all requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AppState {
    /// Create a new AppState with the given configuration and endpoint client.
    ///
    /// The call registry is sized from `performance.max_concurrent_calls`.
    pub fn new(config: AppConfig, voice_client: Arc<dyn VoiceSessionClient>) -> Self {
        let calls = Arc::new(CallRegistry::new(config.performance.max_concurrent_calls));
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            calls,
            voice_client,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// A new call limit applies to calls admitted from now on. Changed
    /// endpoint settings are pushed to the voice client, and audio settings
    /// are read when a call starts, so running calls keep the values they
    /// started with.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        let mut config = write(&self.config);
        if config.endpoint != new_config.endpoint {
            tracing::info!(url = %new_config.endpoint.url, "voice endpoint settings changed");
            self.voice_client.reconfigure(&new_config.endpoint);
        }
        self.calls
            .set_max_concurrent_calls(new_config.performance.max_concurrent_calls);
        *config = new_config;
        Ok(())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        write(&self.metrics).request_count += 1;
    }

    /// Increment the total error counter.
    pub fn increment_error_count(&self) {
        write(&self.metrics).error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: The API endpoint (e.g., "GET /health", "PUT /api/v1/config")
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether this request resulted in a 4xx/5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        read(&self.metrics).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::voice::client::{CallContext, VoiceSession};
    use async_trait::async_trait;

    /// Endpoint client for handler tests; every open is refused.
    pub(crate) struct OfflineClient;

    #[async_trait]
    impl VoiceSessionClient for OfflineClient {
        async fn open(&self, _context: &CallContext) -> Result<Box<dyn VoiceSession>, SessionError> {
            Err(SessionError::Init("endpoint offline".to_string()))
        }
    }

    pub(crate) fn test_state() -> AppState {
        AppState::new(AppConfig::default(), Arc::new(OfflineClient))
    }

    /// Remembers every endpoint URL it was reconfigured with.
    #[derive(Default)]
    struct RecordingClient {
        urls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VoiceSessionClient for RecordingClient {
        async fn open(&self, _context: &CallContext) -> Result<Box<dyn VoiceSession>, SessionError> {
            Err(SessionError::Init("not connected".to_string()))
        }

        fn reconfigure(&self, endpoint: &crate::config::EndpointConfig) {
            self.urls.lock().unwrap().push(endpoint.url.clone());
        }
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_update_config_resizes_registry() {
        let state = test_state();
        let mut config = state.get_config();
        config.performance.max_concurrent_calls = 3;

        state.update_config(config).unwrap();
        assert_eq!(state.calls.max_concurrent_calls(), 3);

        let mut invalid = state.get_config();
        invalid.server.port = 0;
        assert!(state.update_config(invalid).is_err());
        assert_eq!(state.get_config().server.port, 8080);
    }

    #[test]
    fn test_endpoint_change_reconfigures_voice_client() {
        let client = Arc::new(RecordingClient::default());
        let state = AppState::new(AppConfig::default(), client.clone());

        let mut config = state.get_config();
        config.performance.max_concurrent_calls = 5;
        state.update_config(config).unwrap();
        assert!(client.urls.lock().unwrap().is_empty());

        let mut config = state.get_config();
        config.endpoint.url = "ws://10.0.0.7:9000/voice".to_string();
        state.update_config(config.clone()).unwrap();
        state.update_config(config).unwrap();
        assert_eq!(*client.urls.lock().unwrap(), vec!["ws://10.0.0.7:9000/voice".to_string()]);

        let mut invalid = state.get_config();
        invalid.endpoint.url = String::new();
        assert!(state.update_config(invalid).is_err());
        assert_eq!(client.urls.lock().unwrap().len(), 1);
    }
}
