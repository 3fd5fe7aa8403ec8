//! Prometheus metrics for the websocket front end.
//!
//! # Metrics Families
//!
//! | Metric | Type | Description | Labels |
//! |--------|------|-------------|--------|
//! | `templar_sessions_active` | Gauge | Open protocol sessions | |
//! | `templar_messages_total` | Counter | Client messages handled | `kind`, `status` |
//! | `templar_compile_latency_seconds` | Histogram | Compiler call latency | `template` |
//! | `templar_session_terminations_total` | Counter | Closed sessions | `reason` |
//!
//! Label values are client-influenced only through the message kind and
//! template name; the dispatcher maps anything unrecognized to `unknown`
//! before recording, and every value is truncated to
//! [`MAX_LABEL_VALUE_LEN`] bytes.
//!
//! # Usage
//!
//! ```rust,ignore
//! let registry = MetricsRegistry::new()?;
//! let metrics = registry.daemon_metrics();
//! metrics.session_opened();
//! metrics.message_handled("create", "ok");
//! let output = registry.encode_text()?;
//! ```

use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Histogram buckets for compiler latency, in seconds.
pub const COMPILE_LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Front-end metrics.
///
/// All metrics use interior mutability; the struct is cheap to clone and
/// safe to share across connection tasks.
#[derive(Clone)]
pub struct DaemonMetrics {
    sessions_active: Gauge,
    messages_total: CounterVec,
    compile_latency: HistogramVec,
    session_terminations_total: CounterVec,
}

impl DaemonMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let sessions_active = Gauge::with_opts(Opts::new(
            "templar_sessions_active",
            "Number of open protocol sessions",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        let messages_total = CounterVec::new(
            Opts::new(
                "templar_messages_total",
                "Client messages handled by kind and status",
            ),
            &["kind", "status"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let compile_latency = HistogramVec::new(
            HistogramOpts::new(
                "templar_compile_latency_seconds",
                "Latency of compiler calls",
            )
            .buckets(COMPILE_LATENCY_BUCKETS.to_vec()),
            &["template"],
        )?;
        registry.register(Box::new(compile_latency.clone()))?;

        let session_terminations_total = CounterVec::new(
            Opts::new(
                "templar_session_terminations_total",
                "Closed protocol sessions by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(session_terminations_total.clone()))?;

        Ok(Self {
            sessions_active,
            messages_total,
            compile_latency,
            session_terminations_total,
        })
    }

    // ========================================================================
    // Session Metrics
    // ========================================================================

    /// Records a session opening.
    pub fn session_opened(&self) {
        self.sessions_active.inc();
    }

    /// Records a session closing and why.
    pub fn session_closed(&self, reason: &str) {
        self.sessions_active.dec();
        self.session_terminations_total
            .with_label_values(&[truncate_label(reason)])
            .inc();
    }

    /// Number of open sessions.
    #[must_use]
    pub fn active_sessions(&self) -> f64 {
        self.sessions_active.get()
    }

    /// Number of sessions closed for `reason`.
    #[must_use]
    pub fn termination_count(&self, reason: &str) -> f64 {
        self.session_terminations_total
            .with_label_values(&[truncate_label(reason)])
            .get()
    }

    // ========================================================================
    // Message Metrics
    // ========================================================================

    /// Records a handled message.
    ///
    /// # Arguments
    ///
    /// * `kind` - The message kind (e.g., `create`, `bind`, `unknown`)
    /// * `status` - The outcome (e.g., `ok`, or an error code)
    pub fn message_handled(&self, kind: &str, status: &str) {
        self.messages_total
            .with_label_values(&[truncate_label(kind), truncate_label(status)])
            .inc();
    }

    /// Number of messages recorded for `kind` and `status`.
    #[must_use]
    pub fn message_count(&self, kind: &str, status: &str) -> f64 {
        self.messages_total
            .with_label_values(&[truncate_label(kind), truncate_label(status)])
            .get()
    }

    // ========================================================================
    // Compiler Metrics
    // ========================================================================

    /// Records how long a compiler call for `template` took.
    pub fn record_compile_latency(&self, template: &str, latency_secs: f64) {
        self.compile_latency
            .with_label_values(&[truncate_label(template)])
            .observe(latency_secs);
    }

    /// Number of compiler calls recorded for `template`.
    #[must_use]
    pub fn compile_count(&self, template: &str) -> u64 {
        self.compile_latency
            .with_label_values(&[truncate_label(template)])
            .get_sample_count()
    }
}

/// Metrics registry wrapper that holds the Prometheus registry and daemon
/// metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    daemon_metrics: DaemonMetrics,
}

impl MetricsRegistry {
    /// Creates a new metrics registry with all daemon metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let daemon_metrics = DaemonMetrics::new(&registry)?;
        Ok(Self {
            registry,
            daemon_metrics,
        })
    }

    /// Returns a reference to the daemon metrics.
    #[must_use]
    pub const fn daemon_metrics(&self) -> &DaemonMetrics {
        &self.daemon_metrics
    }

    /// Encodes all metrics in Prometheus text format, as served from
    /// `/metrics`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry for use across the daemon.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

/// Truncates a label value at a character boundary no later than
/// [`MAX_LABEL_VALUE_LEN`] bytes.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}
