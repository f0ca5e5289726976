//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor via
//! `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (many handlers and actors hold a reference)
//! - **RwLock**: Multiple readers OR one writer
//! - **PoisonError::into_inner**: keep serving if a writer panicked mid-update
//!
//! ### Trait objects
//! - **Arc<dyn LiveTransport>**: live sessions are written against the trait,
//!   so the real Gemini transport can be swapped without touching the bridge

use crate::audio::capture::CaptureStats;
use crate::config::AppConfig;
use crate::gemini::{GeminiClient, GeminiError};
use crate::live::{GeminiLiveTransport, LiveTransport};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and session metrics, updated by middleware and the live bridge
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// REST client for the coach features
    pub gemini: GeminiClient,

    /// Factory for live-session connections
    pub live_transport: Arc<dyn LiveTransport>,

    pub start_time: Instant,
}

/// Counters collected across all requests and live sessions.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Open `/ws/live` sockets, each owning one live session
    pub active_sessions: u32,

    /// Total live sessions accepted since start
    pub sessions_started: u64,

    /// Live sockets refused because the session limit was reached
    pub sessions_rejected: u64,

    /// Microphone frames of finished live sessions, by outcome
    pub capture_frames_sent: u64,
    pub capture_frames_dropped: u64,
    pub capture_frames_failed: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build state with the real Gemini REST client and Live transport.
    pub fn new(config: AppConfig) -> Result<Self, GeminiError> {
        let transport = Arc::new(GeminiLiveTransport::new(
            config.gemini.live_endpoint.clone(),
            config.gemini.api_key.clone(),
        ));
        Self::with_transport(config, transport)
    }

    /// Build state around an existing live transport.
    pub fn with_transport(config: AppConfig, live_transport: Arc<dyn LiveTransport>) -> Result<Self, GeminiError> {
        let gemini = GeminiClient::new(config.gemini.clone())?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            gemini,
            live_transport,
            start_time: Instant::now(),
        })
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration if it validates.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a live-session slot.
    ///
    /// Check and increment happen under one write lock, so two sockets racing
    /// for the last slot can't both get it. Returns `false` (and counts a
    /// rejection) when `limit` sessions are already open.
    pub fn try_acquire_session(&self, limit: usize) -> bool {
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions as usize >= limit {
            metrics.sessions_rejected += 1;
            return false;
        }
        metrics.active_sessions += 1;
        metrics.sessions_started += 1;
        true
    }

    /// Release a slot taken by `try_acquire_session`. Never underflows.
    pub fn release_session(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    /// Fold a finished session's capture counters into the totals.
    pub fn record_capture(&self, stats: &CaptureStats) {
        let mut metrics = self.metrics_mut();
        metrics.capture_frames_sent += stats.frames_sent();
        metrics.capture_frames_dropped += stats.frames_dropped();
        metrics.capture_frames_failed += stats.frames_failed();
    }

    /// Consistent copy of the metrics, taken without holding the lock while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics_ref();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            sessions_started: metrics.sessions_started,
            sessions_rejected: metrics.sessions_rejected,
            capture_frames_sent: metrics.capture_frames_sent,
            capture_frames_dropped: metrics.capture_frames_dropped,
            capture_frames_failed: metrics.capture_frames_failed,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
