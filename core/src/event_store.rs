//! Event store contract: ordered per-stream append with optimistic
//! concurrency and a snapshot slot.
//!
//! The [`EventStore`] trait is the single mutation point for durable state.
//! It provides exactly what event sourcing needs:
//!
//! - append events to a stream, optionally asserting the expected version
//! - load a stream (or a suffix of it) for state reconstruction
//! - save and load one snapshot per aggregate to shortcut long replays
//!
//! # Ordering
//!
//! Within one stream, `load` always observes append order. Across streams
//! nothing is promised. Concurrent appenders to the same stream are
//! serialized by the expected-version check: one wins, the other receives
//! [`EventStoreError::ConcurrencyConflict`] and must reload and retry.
//!
//! # Implementations
//!
//! - `InMemoryEventStore` (in `eventfold-memory`): deterministic, for tests
//!   and single-process deployments
//! - external storage adapters implement the same contract; a composite
//!   uniqueness constraint on `(aggregate_id, stream_position)` gives them
//!   the same conflict semantics at the storage layer
//!
//! # Dyn compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so
//! the store can travel as `Arc<dyn EventStore>` through repositories and
//! handler closures.

use crate::message::EventEnvelope;
use crate::stream::{StreamId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: the expected stream version did not
    /// match the actual one. Retryable: reload the aggregate and try again.
    #[error(
        "concurrency conflict on stream '{stream_id}': expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// Stream where the conflict occurred.
        stream_id: StreamId,
        /// The version the writer expected.
        expected: Version,
        /// The stream's actual version.
        actual: Version,
    },

    /// Transport-level failure from a storage adapter.
    #[error("storage error: {0}")]
    Storage(String),

    /// Event or snapshot (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EventStoreError {
    /// Whether the error is resolved by reloading and retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// An event at a position in its stream.
///
/// Positions are stream-local, contiguous, and start at 0; they are assigned
/// by [`EventStore::append`] in input order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// The stream the event belongs to.
    pub stream_id: StreamId,
    /// Zero-based position within the stream.
    pub position: u64,
    /// The event itself.
    pub event: EventEnvelope,
}

/// A cached aggregate state at a specific version.
///
/// At most one snapshot exists per aggregate id; saving replaces the previous
/// one atomically (last writer wins). The snapshot slot is independent of the
/// event log; a snapshot may lag behind the stream head, in which case the
/// repository replays the remaining events on top of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The aggregate (stream) this snapshot belongs to.
    pub aggregate_id: StreamId,
    /// Type tag of the aggregate, checked on load.
    pub aggregate_type: String,
    /// Number of events folded into this snapshot.
    pub version: Version,
    /// Serialized aggregate state.
    pub state: serde_json::Value,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Create a snapshot taken now.
    #[must_use]
    pub fn new(
        aggregate_id: StreamId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            state,
            created_at: Utc::now(),
        }
    }
}

/// Ordered per-stream event persistence with optimistic concurrency.
///
/// # Failure model
///
/// [`EventStoreError::ConcurrencyConflict`] is non-fatal and retryable; the
/// store never retries on the caller's behalf. Every other error propagates
/// unchanged.
pub trait EventStore: Send + Sync {
    /// Append events to a stream.
    ///
    /// An empty `events` vector is a no-op: the current version is returned
    /// and the expected-version guard is not evaluated, so an empty append
    /// can never conflict.
    ///
    /// With `Some(expected)`, the append succeeds only when `expected`
    /// equals the stream's current version (its event count). Events are
    /// assigned contiguous positions `current..current + events.len()` in
    /// input order.
    ///
    /// Returns the stream version after the append.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::ConcurrencyConflict`] on an expected-version
    ///   mismatch
    /// - [`EventStoreError::Storage`] / [`EventStoreError::Serialization`]
    ///   from the adapter
    fn append(
        &self,
        stream_id: StreamId,
        events: Vec<EventEnvelope>,
        expected_version: Option<Version>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>>;

    /// Load events at positions `[from_version, end)` in position order.
    ///
    /// A missing stream, or a `from_version` past the end, yields an empty
    /// vector, not an error: new streams start empty.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::Storage`] / [`EventStoreError::Serialization`]
    /// from the adapter.
    fn load(
        &self,
        stream_id: StreamId,
        from_version: Option<Version>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>>;

    /// Atomically replace the current snapshot for the snapshot's aggregate.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::Storage`] from the adapter.
    fn save_snapshot(
        &self,
        snapshot: Snapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>>;

    /// Load the current snapshot for an aggregate, if any.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::Storage`] / [`EventStoreError::Serialization`]
    /// from the adapter.
    fn load_snapshot(
        &self,
        aggregate_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Snapshot>, EventStoreError>> + Send + '_>>;

    /// Liveness probe for the backing storage.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::Storage`] when the backend is unreachable.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>>;
}
