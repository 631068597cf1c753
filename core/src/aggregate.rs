//! Aggregate roots and the repository that loads and saves them.
//!
//! An aggregate's state is derived entirely from its event stream. Domain
//! code defines a plain state type implementing [`Aggregate`] and registers
//! one transition function per event type in a [`TransitionTable`]: an
//! explicit, compile-time-checked replacement for resolving handlers from
//! method names at runtime. An event type with no registered transition is
//! silently ignored during apply and replay; that is the established
//! convention, and it is what lets old streams replay through code that has
//! dropped interest in an event.
//!
//! [`AggregateRoot`] wraps the state with the sourcing bookkeeping: the
//! aggregate id, the version (count of applied events), and the buffer of
//! uncommitted events produced since the last save.
//!
//! # Example
//!
//! ```
//! use eventfold_core::aggregate::{Aggregate, AggregateRoot, TransitionTable};
//! use eventfold_core::message::EventEnvelope;
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct BankAccount {
//!     owner: String,
//!     balance: f64,
//! }
//!
//! impl Aggregate for BankAccount {
//!     fn aggregate_type() -> &'static str {
//!         "BankAccount"
//!     }
//!
//!     fn transitions() -> TransitionTable<Self> {
//!         TransitionTable::new()
//!             .on("AccountOpened", |state: &mut BankAccount, event| {
//!                 if let Some(owner) = event.field("owner").and_then(|v| v.as_str()) {
//!                     state.owner = owner.to_string();
//!                 }
//!             })
//!             .on("Deposited", |state: &mut BankAccount, event| {
//!                 state.balance += event.field("amount").and_then(|v| v.as_f64()).unwrap_or(0.0);
//!             })
//!     }
//! }
//!
//! let mut account = AggregateRoot::<BankAccount>::new("account-7");
//! account.apply(EventEnvelope::for_aggregate(
//!     "account-7",
//!     "AccountOpened",
//!     json!({ "owner": "alice" }),
//! ));
//! account.apply(EventEnvelope::for_aggregate(
//!     "account-7",
//!     "Deposited",
//!     json!({ "amount": 25.0 }),
//! ));
//!
//! assert_eq!(account.version().value(), 2);
//! assert_eq!(account.state().balance, 25.0);
//! assert_eq!(account.uncommitted_events().len(), 2);
//! ```
//!
//! Transitions must be deterministic and free of I/O: no clocks, no
//! randomness, nothing outside the event's own fields. Replaying the same
//! stream must always produce the same state.

use crate::event_store::{EventStore, EventStoreError, Snapshot};
use crate::message::EventEnvelope;
use crate::observability::ObservabilityHooks;
use crate::stream::{StreamId, Version};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A pure state transition: fold one event into the aggregate state.
pub type Transition<A> = fn(&mut A, &EventEnvelope);

/// Explicit registry of state transitions, keyed by event type tag.
#[derive(Debug)]
pub struct TransitionTable<A> {
    transitions: HashMap<&'static str, Transition<A>>,
}

impl<A> TransitionTable<A> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            transitions: HashMap::new(),
        }
    }

    /// Register the transition for an event type. Registering the same type
    /// twice keeps the last transition.
    #[must_use]
    pub fn on(mut self, event_type: &'static str, transition: Transition<A>) -> Self {
        self.transitions.insert(event_type, transition);
        self
    }

    /// Look up the transition for an event type.
    #[must_use]
    pub fn get(&self, event_type: &str) -> Option<Transition<A>> {
        self.transitions.get(event_type).copied()
    }

    /// Number of registered transitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// Whether the table has no transitions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

impl<A> Default for TransitionTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate state rebuilt from events.
///
/// `Default` is the empty state a fresh stream starts from; `Serialize` /
/// `DeserializeOwned` carry the state through snapshots.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type tag, recorded on snapshots.
    fn aggregate_type() -> &'static str;

    /// The transition table for this aggregate's event types.
    fn transitions() -> TransitionTable<Self>;
}

/// An aggregate instance: state plus sourcing bookkeeping.
///
/// Invariants:
///
/// - `version` equals the number of events applied, replayed or fresh
/// - `uncommitted_events` holds exactly the events produced since the last
///   commit mark, in production order
#[derive(Debug)]
pub struct AggregateRoot<A: Aggregate> {
    aggregate_id: StreamId,
    version: Version,
    state: A,
    uncommitted_events: Vec<EventEnvelope>,
    transitions: TransitionTable<A>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Create a fresh aggregate with default state at version 0.
    #[must_use]
    pub fn new(aggregate_id: impl Into<StreamId>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            version: Version::INITIAL,
            state: A::default(),
            uncommitted_events: Vec::new(),
            transitions: A::transitions(),
        }
    }

    /// Rebuild a root from snapshotted state at a known version.
    #[must_use]
    pub fn from_snapshot(aggregate_id: StreamId, version: Version, state: A) -> Self {
        Self {
            aggregate_id,
            version,
            state,
            uncommitted_events: Vec::new(),
            transitions: A::transitions(),
        }
    }

    /// The aggregate id (stream name).
    #[must_use]
    pub const fn aggregate_id(&self) -> &StreamId {
        &self.aggregate_id
    }

    /// Count of events applied so far.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// The current state.
    #[must_use]
    pub const fn state(&self) -> &A {
        &self.state
    }

    /// Events produced since the last commit mark, in order.
    #[must_use]
    pub fn uncommitted_events(&self) -> &[EventEnvelope] {
        &self.uncommitted_events
    }

    /// Apply a freshly produced event: run its transition, buffer it as
    /// uncommitted, and advance the version.
    pub fn apply(&mut self, event: EventEnvelope) {
        self.when(&event);
        self.uncommitted_events.push(event);
        self.version = self.version.next();
    }

    /// Replay already-persisted events: transitions run and the version
    /// advances, but nothing is buffered.
    pub fn replay<'a>(&mut self, events: impl IntoIterator<Item = &'a EventEnvelope>) {
        for event in events {
            self.when(event);
            self.version = self.version.next();
        }
    }

    /// Clear the uncommitted buffer after persistence.
    pub fn mark_events_committed(&mut self) {
        self.uncommitted_events.clear();
    }

    fn when(&mut self, event: &EventEnvelope) {
        if let Some(transition) = self.transitions.get(event.event_type()) {
            transition(&mut self.state, event);
        } else {
            // Unregistered event types are ignored; streams may carry events
            // the current code no longer folds.
            tracing::trace!(
                aggregate_id = %self.aggregate_id,
                event_type = event.event_type(),
                "no transition registered, event ignored"
            );
        }
    }
}

/// Errors from repository operations.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// No events (and no snapshot) exist for the aggregate id.
    #[error("aggregate '{0}' not found")]
    AggregateNotFound(String),

    /// The event store failed; a [`EventStoreError::ConcurrencyConflict`]
    /// passes through here untouched so callers can reload and retry.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Snapshot state could not be (de)serialized.
    #[error("snapshot serialization error: {0}")]
    Snapshot(String),
}

/// Loads and saves aggregates against an [`EventStore`].
///
/// The repository owns the serialization boundary: envelopes in the store,
/// typed state in memory. It does not retry; an optimistic-concurrency
/// conflict surfaces to the caller, which reloads and retries the command.
///
/// Observability hooks are injected per repository (no process-wide state),
/// defaulting to no-ops.
pub struct AggregateRepository {
    store: Arc<dyn EventStore>,
    hooks: Arc<ObservabilityHooks>,
}

impl AggregateRepository {
    /// Create a repository over an event store.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            hooks: Arc::new(ObservabilityHooks::default()),
        }
    }

    /// Attach observability hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<ObservabilityHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Load an aggregate by replaying its events.
    ///
    /// When a snapshot for the matching aggregate type exists, state is
    /// seeded from it and only events past the snapshot version are
    /// replayed.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::AggregateNotFound`] when the stream is empty and
    ///   no snapshot exists
    /// - [`RepositoryError::Store`] on storage failure
    /// - [`RepositoryError::Snapshot`] when snapshot state does not
    ///   deserialize into `A`
    pub async fn load<A: Aggregate>(
        &self,
        aggregate_id: StreamId,
    ) -> Result<AggregateRoot<A>, RepositoryError> {
        let mut span = self.hooks.start_store_span("load");
        span.set_attribute("aggregate_id", aggregate_id.as_str());
        let result = self.load_inner(aggregate_id).await;
        if let Err(error) = &result {
            span.set_error(error.to_string());
        }
        self.hooks.end_store_span(&mut span);
        result
    }

    async fn load_inner<A: Aggregate>(
        &self,
        aggregate_id: StreamId,
    ) -> Result<AggregateRoot<A>, RepositoryError> {
        let snapshot = self
            .store
            .load_snapshot(aggregate_id.clone())
            .await?
            .filter(|snapshot| snapshot.aggregate_type == A::aggregate_type());

        let (mut root, from_version) = match snapshot {
            Some(snapshot) => {
                let state: A = serde_json::from_value(snapshot.state)
                    .map_err(|e| RepositoryError::Snapshot(e.to_string()))?;
                self.hooks
                    .record_snapshot_loaded(&aggregate_id, snapshot.version);
                tracing::debug!(
                    aggregate_id = %aggregate_id,
                    version = %snapshot.version,
                    "state seeded from snapshot"
                );
                (
                    AggregateRoot::from_snapshot(aggregate_id.clone(), snapshot.version, state),
                    Some(snapshot.version),
                )
            }
            None => (AggregateRoot::new(aggregate_id.clone()), None),
        };

        let records = self.store.load(aggregate_id.clone(), from_version).await?;
        if records.is_empty() && root.version().is_initial() {
            self.hooks
                .record_aggregate_error(&aggregate_id, "aggregate not found");
            return Err(RepositoryError::AggregateNotFound(
                aggregate_id.into_inner(),
            ));
        }

        self.hooks.record_event_loaded(&aggregate_id, records.len());
        for record in &records {
            self.hooks
                .record_event_replayed(&aggregate_id, record.event.event_type());
        }
        root.replay(records.iter().map(|record| &record.event));

        tracing::debug!(
            aggregate_id = %root.aggregate_id(),
            version = %root.version(),
            replayed = records.len(),
            "aggregate loaded"
        );
        Ok(root)
    }

    /// Persist an aggregate's uncommitted events.
    ///
    /// A no-op when the buffer is empty. The expected version passed to the
    /// store is the version the stream was at when this instance was loaded
    /// (`version - uncommitted.len()`), so a concurrent writer is detected
    /// as a conflict. On success the buffer is cleared.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Store`]: including the pass-through
    /// [`EventStoreError::ConcurrencyConflict`], after which the caller
    /// should reload and retry.
    pub async fn save<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
    ) -> Result<(), RepositoryError> {
        if root.uncommitted_events().is_empty() {
            return Ok(());
        }

        let mut span = self.hooks.start_store_span("append");
        span.set_attribute("aggregate_id", root.aggregate_id().as_str());
        let result = self.save_inner(root).await;
        if let Err(error) = &result {
            span.set_error(error.to_string());
        }
        self.hooks.end_store_span(&mut span);
        result
    }

    async fn save_inner<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
    ) -> Result<(), RepositoryError> {
        let pending = root.uncommitted_events().len() as u64;
        let expected = Version::new(root.version().value() - pending);
        let events = root.uncommitted_events().to_vec();

        match self
            .store
            .append(root.aggregate_id().clone(), events, Some(expected))
            .await
        {
            Ok(new_version) => {
                root.mark_events_committed();
                self.hooks
                    .record_event_stored(root.aggregate_id(), new_version);
                tracing::debug!(
                    aggregate_id = %root.aggregate_id(),
                    version = %new_version,
                    appended = pending,
                    "aggregate saved"
                );
                Ok(())
            }
            Err(error) => {
                self.hooks
                    .record_aggregate_error(root.aggregate_id(), &error.to_string());
                Err(error.into())
            }
        }
    }

    /// Snapshot an aggregate's current state at its current version.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Snapshot`] when the state does not serialize;
    /// [`RepositoryError::Store`] on storage failure.
    pub async fn snapshot<A: Aggregate>(
        &self,
        root: &AggregateRoot<A>,
    ) -> Result<(), RepositoryError> {
        let state = serde_json::to_value(root.state())
            .map_err(|e| RepositoryError::Snapshot(e.to_string()))?;
        let snapshot = Snapshot::new(
            root.aggregate_id().clone(),
            A::aggregate_type(),
            root.version(),
            state,
        );
        self.store.save_snapshot(snapshot).await?;
        self.hooks
            .record_snapshot_saved(root.aggregate_id(), root.version());
        Ok(())
    }
}

impl std::fmt::Debug for AggregateRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRepository").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Panics: tests fail loudly

    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        value: i64,
    }

    impl Aggregate for Counter {
        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn transitions() -> TransitionTable<Self> {
            TransitionTable::new()
                .on("Incremented", |state: &mut Self, event| {
                    state.value += event.field("by").and_then(serde_json::Value::as_i64).unwrap_or(1);
                })
                .on("Reset", |state, _| state.value = 0)
        }
    }

    fn incremented(by: i64) -> EventEnvelope {
        EventEnvelope::for_aggregate("counter-1", "Incremented", json!({ "by": by }))
    }

    #[test]
    fn apply_buffers_and_advances_version() {
        let mut counter = AggregateRoot::<Counter>::new("counter-1");
        counter.apply(incremented(2));
        counter.apply(incremented(3));

        assert_eq!(counter.version(), Version::new(2));
        assert_eq!(counter.state().value, 5);
        assert_eq!(counter.uncommitted_events().len(), 2);
    }

    #[test]
    fn replay_advances_version_without_buffering() {
        let events = [incremented(1), incremented(1), incremented(1)];
        let mut counter = AggregateRoot::<Counter>::new("counter-1");
        counter.replay(events.iter());

        assert_eq!(counter.version(), Version::new(3));
        assert_eq!(counter.state().value, 3);
        assert!(counter.uncommitted_events().is_empty());
    }

    #[test]
    fn unregistered_event_types_are_ignored() {
        let mut counter = AggregateRoot::<Counter>::new("counter-1");
        counter.apply(EventEnvelope::for_aggregate("counter-1", "Renamed", json!({})));

        // State untouched, but the event still counts toward the version.
        assert_eq!(counter.state().value, 0);
        assert_eq!(counter.version(), Version::new(1));
    }

    #[test]
    fn uncommitted_events_rebuild_equal_state() {
        let mut counter = AggregateRoot::<Counter>::new("counter-1");
        counter.apply(incremented(4));
        counter.apply(EventEnvelope::for_aggregate("counter-1", "Reset", json!({})));
        counter.apply(incremented(7));

        let mut rebuilt = AggregateRoot::<Counter>::new("counter-1");
        rebuilt.replay(counter.uncommitted_events().iter());

        assert_eq!(rebuilt.state(), counter.state());
        assert_eq!(rebuilt.version(), counter.version());
    }

    #[test]
    fn commit_mark_clears_the_buffer_only() {
        let mut counter = AggregateRoot::<Counter>::new("counter-1");
        counter.apply(incremented(1));
        counter.mark_events_committed();

        assert!(counter.uncommitted_events().is_empty());
        assert_eq!(counter.version(), Version::new(1));
        assert_eq!(counter.state().value, 1);
    }

    #[test]
    fn transition_table_last_registration_wins() {
        let table = TransitionTable::<Counter>::new()
            .on("Incremented", |state, _| state.value += 100)
            .on("Incremented", |state, _| state.value += 1);
        assert_eq!(table.len(), 1);

        let mut state = Counter::default();
        table.get("Incremented").unwrap()(&mut state, &incremented(0));
        assert_eq!(state.value, 1);
    }
}
