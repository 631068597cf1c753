//! Metrics-facade provider: bridges the core [`MetricsProvider`] contract
//! onto the `metrics` crate.
//!
//! The core records through its provider trait and stays backend-agnostic.
//! [`FacadeMetricsProvider`] forwards those calls to the `metrics` macros,
//! so whatever recorder the application installs (Prometheus, StatsD,
//! anything implementing `metrics::Recorder`) receives the canonical
//! Eventfold series. Installing and exposing a recorder is the
//! application's concern, not this crate's.
//!
//! # Example
//!
//! ```
//! use eventfold_core::observability::ObservabilityHooks;
//! use eventfold_runtime::metrics::{FacadeMetricsProvider, register_metrics};
//! use std::sync::Arc;
//!
//! register_metrics();
//! let hooks = ObservabilityHooks::default()
//!     .with_metrics(Arc::new(FacadeMetricsProvider::new()));
//! ```

use eventfold_core::observability::{MetricKind, MetricValue, MetricsProvider};
use metrics::{Label, counter, describe_counter, describe_histogram, gauge, histogram};

/// [`MetricsProvider`] that forwards to the `metrics` crate macros.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeMetricsProvider;

impl FacadeMetricsProvider {
    /// Create a provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn to_labels(labels: &[(&str, &str)]) -> Vec<Label> {
    labels
        .iter()
        .map(|(key, value)| Label::new((*key).to_string(), (*value).to_string()))
        .collect()
}

impl MetricsProvider for FacadeMetricsProvider {
    fn record_metric(&self, metric: MetricValue) {
        let labels: Vec<Label> = metric
            .labels
            .iter()
            .map(|(key, value)| Label::new(key.clone(), value.clone()))
            .collect();
        match metric.kind {
            MetricKind::Counter => {
                counter!(metric.name.clone(), labels).increment(metric.value as u64);
            }
            MetricKind::Gauge => {
                gauge!(metric.name.clone(), labels).set(metric.value);
            }
            MetricKind::Histogram | MetricKind::Duration => {
                histogram!(metric.name.clone(), labels).record(metric.value);
            }
        }
    }

    fn counter(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        counter!(name.to_string(), to_labels(labels)).increment(value as u64);
    }

    fn gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        gauge!(name.to_string(), to_labels(labels)).set(value);
    }

    fn histogram(&self, name: &str, value: f64, _unit: &str, labels: &[(&str, &str)]) {
        histogram!(name.to_string(), to_labels(labels)).record(value);
    }
}

/// Register descriptions for the canonical Eventfold series.
///
/// Call once at startup, after installing a recorder.
pub fn register_metrics() {
    describe_counter!(
        "eventfold_events_stored_total",
        "Total number of events stored per aggregate"
    );
    describe_histogram!(
        "eventfold_events_loaded_count",
        "Number of events loaded per aggregate load"
    );
    describe_counter!(
        "eventfold_events_replayed_total",
        "Total number of events replayed into aggregates"
    );
    describe_counter!(
        "eventfold_snapshots_saved_total",
        "Total number of snapshots saved"
    );
    describe_counter!(
        "eventfold_snapshots_loaded_total",
        "Total number of snapshots loaded"
    );
    describe_counter!(
        "eventfold_aggregate_errors_total",
        "Total number of aggregate processing errors"
    );
}
