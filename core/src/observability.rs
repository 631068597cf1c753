//! Observability hooks: metrics and tracing provider contracts plus the
//! central hooks facade.
//!
//! The core never talks to a concrete observability backend. It records
//! through two small provider traits, [`MetricsProvider`] and
//! [`TracingProvider`], which default to no-ops, and through callback
//! registries on [`ObservabilityHooks`] for code that wants raw
//! notifications (dashboards, tests, alerting glue).
//!
//! Hooks are passed where they are used (repository constructors, engines),
//! never held in process-wide state, so unit tests stay hermetic: build a
//! facade, register callbacks, hand it to the component under test.
//!
//! ```
//! use eventfold_core::observability::ObservabilityHooks;
//! use eventfold_core::stream::{StreamId, Version};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! let stored = Arc::new(AtomicU64::new(0));
//! let seen = Arc::clone(&stored);
//!
//! let mut hooks = ObservabilityHooks::default();
//! hooks.on_event_stored(move |_, _| {
//!     seen.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! hooks.record_event_stored(&StreamId::new("account-7"), Version::new(3));
//! assert_eq!(stored.load(Ordering::SeqCst), 1);
//! ```

use crate::stream::{StreamId, Version};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// What kind of measurement a [`MetricValue`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonically increasing count.
    Counter,
    /// Point-in-time value.
    Gauge,
    /// Sampled distribution.
    Histogram,
    /// Elapsed-time sample.
    Duration,
}

/// A metric sample with metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue {
    /// Metric name, `<namespace>_<subsystem>_…` style.
    pub name: String,
    /// Sample value.
    pub value: f64,
    /// Unit of measurement, empty when dimensionless.
    pub unit: String,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Label set.
    pub labels: HashMap<String, String>,
    /// Measurement kind.
    pub kind: MetricKind,
}

impl MetricValue {
    /// Create a sample taken now.
    #[must_use]
    pub fn new(name: impl Into<String>, value: f64, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            value,
            unit: String::new(),
            timestamp: Utc::now(),
            labels: HashMap::new(),
            kind,
        }
    }

    /// Attach a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Status of a trace span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanStatus {
    /// Started, not yet ended.
    #[default]
    Pending,
    /// Ended without error.
    Ok,
    /// Ended with an error.
    Error,
}

/// A trace span: one timed operation with attributes and an outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSpan {
    /// Operation name, e.g. `event_store.append`.
    pub operation: String,
    /// When the span started.
    pub start_time: DateTime<Utc>,
    /// When the span ended, if it has.
    pub end_time: Option<DateTime<Utc>>,
    /// Elapsed milliseconds once ended.
    pub duration_ms: f64,
    /// Span status.
    pub status: SpanStatus,
    /// Attached attributes.
    pub attributes: HashMap<String, String>,
    /// Error message when the status is [`SpanStatus::Error`].
    pub error: Option<String>,
}

impl TraceSpan {
    /// Start a span now.
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: 0.0,
            status: SpanStatus::Pending,
            attributes: HashMap::new(),
            error: None,
        }
    }

    /// Attach an attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// End the span. A pending span becomes [`SpanStatus::Ok`]; an already
    /// ended span keeps its first end time and status.
    pub fn end(&mut self) {
        if self.end_time.is_none() {
            let now = Utc::now();
            self.duration_ms = (now - self.start_time).num_microseconds().unwrap_or(0) as f64 / 1_000.0;
            self.end_time = Some(now);
        }
        if self.status == SpanStatus::Pending {
            self.status = SpanStatus::Ok;
        }
    }

    /// End the span with an error.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.status = SpanStatus::Error;
        let now = Utc::now();
        self.duration_ms = (now - self.start_time).num_microseconds().unwrap_or(0) as f64 / 1_000.0;
        self.end_time = Some(now);
    }
}

/// Metrics backend contract. Implement to bridge to your collection stack;
/// the default is [`NoOpMetricsProvider`].
pub trait MetricsProvider: Send + Sync {
    /// Record a fully described metric sample.
    fn record_metric(&self, metric: MetricValue);

    /// Record a counter increment.
    fn counter(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Record a gauge value.
    fn gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Record a histogram sample.
    fn histogram(&self, name: &str, value: f64, unit: &str, labels: &[(&str, &str)]);
}

/// Metrics provider that records nothing (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsProvider;

impl MetricsProvider for NoOpMetricsProvider {
    fn record_metric(&self, _metric: MetricValue) {}
    fn counter(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
    fn gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
    fn histogram(&self, _name: &str, _value: f64, _unit: &str, _labels: &[(&str, &str)]) {}
}

/// Tracing backend contract; the default is [`NoOpTracingProvider`].
pub trait TracingProvider: Send + Sync {
    /// Start a span for an operation.
    fn start_span(&self, operation: &str) -> TraceSpan;

    /// End a span, exporting it if the backend does that.
    fn end_span(&self, span: &mut TraceSpan);
}

/// Tracing provider that keeps spans local and exports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTracingProvider;

impl TracingProvider for NoOpTracingProvider {
    fn start_span(&self, operation: &str) -> TraceSpan {
        TraceSpan::new(operation)
    }

    fn end_span(&self, span: &mut TraceSpan) {
        span.end();
    }
}

type VersionCallback = Box<dyn Fn(&StreamId, Version) + Send + Sync>;
type CountCallback = Box<dyn Fn(&StreamId, usize) + Send + Sync>;
type LabelCallback = Box<dyn Fn(&StreamId, &str) + Send + Sync>;

/// Central observability facade: providers plus callback registries for the
/// event-sourcing lifecycle.
///
/// Each `record_*` method emits a canonical metric through the metrics
/// provider and then invokes every registered callback. Register callbacks
/// while the facade is still exclusively owned, then share it behind an
/// `Arc`.
pub struct ObservabilityHooks {
    metrics: Arc<dyn MetricsProvider>,
    tracing: Arc<dyn TracingProvider>,
    event_stored: Vec<VersionCallback>,
    event_loaded: Vec<CountCallback>,
    event_replayed: Vec<LabelCallback>,
    snapshot_saved: Vec<VersionCallback>,
    snapshot_loaded: Vec<VersionCallback>,
    aggregate_error: Vec<LabelCallback>,
}

impl Default for ObservabilityHooks {
    fn default() -> Self {
        Self::new(Arc::new(NoOpMetricsProvider), Arc::new(NoOpTracingProvider))
    }
}

impl ObservabilityHooks {
    /// Create a facade over the given providers.
    #[must_use]
    pub fn new(metrics: Arc<dyn MetricsProvider>, tracing: Arc<dyn TracingProvider>) -> Self {
        Self {
            metrics,
            tracing,
            event_stored: Vec::new(),
            event_loaded: Vec::new(),
            event_replayed: Vec::new(),
            snapshot_saved: Vec::new(),
            snapshot_loaded: Vec::new(),
            aggregate_error: Vec::new(),
        }
    }

    /// Replace the metrics provider.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the tracing provider.
    #[must_use]
    pub fn with_tracing(mut self, tracing: Arc<dyn TracingProvider>) -> Self {
        self.tracing = tracing;
        self
    }

    /// The metrics provider.
    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn MetricsProvider> {
        &self.metrics
    }

    /// Register a callback for events stored: `(aggregate_id, new_version)`.
    pub fn on_event_stored(&mut self, callback: impl Fn(&StreamId, Version) + Send + Sync + 'static) {
        self.event_stored.push(Box::new(callback));
    }

    /// Register a callback for events loaded: `(aggregate_id, count)`.
    pub fn on_event_loaded(&mut self, callback: impl Fn(&StreamId, usize) + Send + Sync + 'static) {
        self.event_loaded.push(Box::new(callback));
    }

    /// Register a callback for events replayed: `(aggregate_id, event_type)`.
    pub fn on_event_replayed(&mut self, callback: impl Fn(&StreamId, &str) + Send + Sync + 'static) {
        self.event_replayed.push(Box::new(callback));
    }

    /// Register a callback for snapshots saved: `(aggregate_id, version)`.
    pub fn on_snapshot_saved(&mut self, callback: impl Fn(&StreamId, Version) + Send + Sync + 'static) {
        self.snapshot_saved.push(Box::new(callback));
    }

    /// Register a callback for snapshots loaded: `(aggregate_id, version)`.
    pub fn on_snapshot_loaded(&mut self, callback: impl Fn(&StreamId, Version) + Send + Sync + 'static) {
        self.snapshot_loaded.push(Box::new(callback));
    }

    /// Register a callback for aggregate errors: `(aggregate_id, error)`.
    pub fn on_aggregate_error(&mut self, callback: impl Fn(&StreamId, &str) + Send + Sync + 'static) {
        self.aggregate_error.push(Box::new(callback));
    }

    /// Record that events were stored for an aggregate.
    pub fn record_event_stored(&self, aggregate_id: &StreamId, version: Version) {
        self.metrics.counter(
            "eventfold_events_stored_total",
            1.0,
            &[("aggregate_id", aggregate_id.as_str())],
        );
        for callback in &self.event_stored {
            callback(aggregate_id, version);
        }
    }

    /// Record that events were loaded for an aggregate.
    pub fn record_event_loaded(&self, aggregate_id: &StreamId, count: usize) {
        self.metrics.histogram(
            "eventfold_events_loaded_count",
            count as f64,
            "events",
            &[("aggregate_id", aggregate_id.as_str())],
        );
        for callback in &self.event_loaded {
            callback(aggregate_id, count);
        }
    }

    /// Record that an event was replayed into an aggregate.
    pub fn record_event_replayed(&self, aggregate_id: &StreamId, event_type: &str) {
        self.metrics.counter(
            "eventfold_events_replayed_total",
            1.0,
            &[
                ("aggregate_id", aggregate_id.as_str()),
                ("event_type", event_type),
            ],
        );
        for callback in &self.event_replayed {
            callback(aggregate_id, event_type);
        }
    }

    /// Record that a snapshot was saved.
    pub fn record_snapshot_saved(&self, aggregate_id: &StreamId, version: Version) {
        self.metrics.counter(
            "eventfold_snapshots_saved_total",
            1.0,
            &[("aggregate_id", aggregate_id.as_str())],
        );
        for callback in &self.snapshot_saved {
            callback(aggregate_id, version);
        }
    }

    /// Record that a snapshot was loaded.
    pub fn record_snapshot_loaded(&self, aggregate_id: &StreamId, version: Version) {
        self.metrics.counter(
            "eventfold_snapshots_loaded_total",
            1.0,
            &[("aggregate_id", aggregate_id.as_str())],
        );
        for callback in &self.snapshot_loaded {
            callback(aggregate_id, version);
        }
    }

    /// Record an aggregate processing error.
    pub fn record_aggregate_error(&self, aggregate_id: &StreamId, error: &str) {
        self.metrics.counter(
            "eventfold_aggregate_errors_total",
            1.0,
            &[("aggregate_id", aggregate_id.as_str())],
        );
        for callback in &self.aggregate_error {
            callback(aggregate_id, error);
        }
        tracing::warn!(aggregate_id = %aggregate_id, error, "aggregate error");
    }

    /// Start a span for an event-store operation (`event_store.<operation>`).
    #[must_use]
    pub fn start_store_span(&self, operation: &str) -> TraceSpan {
        self.tracing.start_span(&format!("event_store.{operation}"))
    }

    /// End an event-store operation span.
    pub fn end_store_span(&self, span: &mut TraceSpan) {
        self.tracing.end_span(span);
    }
}

impl std::fmt::Debug for ObservabilityHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityHooks")
            .field("event_stored_callbacks", &self.event_stored.len())
            .field("event_loaded_callbacks", &self.event_loaded.len())
            .field("event_replayed_callbacks", &self.event_replayed.len())
            .field("snapshot_saved_callbacks", &self.snapshot_saved.len())
            .field("snapshot_loaded_callbacks", &self.snapshot_loaded.len())
            .field("aggregate_error_callbacks", &self.aggregate_error.len())
            .finish_non_exhaustive()
    }
}
