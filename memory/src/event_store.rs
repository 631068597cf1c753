//! In-memory event store with optimistic concurrency and snapshots.

use eventfold_core::event_store::{
    EventStore, EventStoreError, RecordedEvent, Snapshot,
};
use eventfold_core::message::EventEnvelope;
use eventfold_core::stream::{StreamId, Version};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// In-memory [`EventStore`].
///
/// Streams live in a map guarded by an async `RwLock`; taking the write
/// guard serializes appends, so the expected-version check and the position
/// assignment are atomic per store. Snapshots occupy an independent slot per
/// aggregate, replaced on write (last writer wins).
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamId, Vec<RecordedEvent>>>,
    snapshots: RwLock<HashMap<StreamId, Snapshot>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of streams with at least one event.
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        stream_id: StreamId,
        events: Vec<EventEnvelope>,
        expected_version: Option<Version>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if events.is_empty() {
                // Empty appends never evaluate the version guard.
                let streams = self.streams.read().await;
                let current = streams.get(&stream_id).map_or(0, Vec::len) as u64;
                return Ok(Version::new(current));
            }

            let mut streams = self.streams.write().await;
            let stream = streams.entry(stream_id.clone()).or_default();
            let actual = Version::new(stream.len() as u64);

            if let Some(expected) = expected_version {
                if expected != actual {
                    tracing::warn!(
                        stream_id = %stream_id,
                        expected = %expected,
                        actual = %actual,
                        "append rejected: version conflict"
                    );
                    return Err(EventStoreError::ConcurrencyConflict {
                        stream_id,
                        expected,
                        actual,
                    });
                }
            }

            let appended = events.len();
            let mut position = stream.len() as u64;
            for event in events {
                stream.push(RecordedEvent {
                    stream_id: stream_id.clone(),
                    position,
                    event,
                });
                position += 1;
            }

            tracing::info!(
                stream_id = %stream_id,
                appended,
                version = position,
                "events appended"
            );
            Ok(Version::new(position))
        })
    }

    fn load(
        &self,
        stream_id: StreamId,
        from_version: Option<Version>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let streams = self.streams.read().await;
            let records = streams.get(&stream_id).map_or_else(Vec::new, |stream| {
                let from = from_version.map_or(0, |v| v.value() as usize);
                stream.get(from..).unwrap_or_default().to_vec()
            });
            tracing::debug!(
                stream_id = %stream_id,
                loaded = records.len(),
                "events loaded"
            );
            Ok(records)
        })
    }

    fn save_snapshot(
        &self,
        snapshot: Snapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(
                aggregate_id = %snapshot.aggregate_id,
                version = %snapshot.version,
                "snapshot saved"
            );
            self.snapshots
                .write()
                .await
                .insert(snapshot.aggregate_id.clone(), snapshot);
            Ok(())
        })
    }

    fn load_snapshot(
        &self,
        aggregate_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Snapshot>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let snapshot = self.snapshots.read().await.get(&aggregate_id).cloned();
            if let Some(snapshot) = &snapshot {
                tracing::debug!(
                    aggregate_id = %aggregate_id,
                    version = %snapshot.version,
                    "snapshot loaded"
                );
            }
            Ok(snapshot)
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>> {
        Box::pin(async { Ok(true) })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Panics: tests fail loudly

    use super::*;
    use serde_json::json;

    fn deposited(amount: f64) -> EventEnvelope {
        EventEnvelope::for_aggregate("account-7", "Deposited", json!({ "amount": amount }))
    }

    #[tokio::test]
    async fn append_assigns_contiguous_positions_in_input_order() {
        let store = InMemoryEventStore::new();
        let id = StreamId::new("account-7");

        store
            .append(id.clone(), vec![deposited(1.0), deposited(2.0)], None)
            .await
            .unwrap();
        let version = store
            .append(id.clone(), vec![deposited(3.0)], None)
            .await
            .unwrap();
        assert_eq!(version, Version::new(3));

        let records = store.load(id, None).await.unwrap();
        assert_eq!(records.len(), 3);
        for (index, record) in records.iter().enumerate() {
            assert_eq!(record.position, index as u64);
        }
        assert_eq!(records[2].event.field("amount"), Some(&json!(3.0)));
    }

    #[tokio::test]
    async fn expected_version_guards_concurrent_appends() {
        let store = InMemoryEventStore::new();
        let id = StreamId::new("account-7");

        store
            .append(id.clone(), vec![deposited(1.0)], Some(Version::INITIAL))
            .await
            .unwrap();

        // A second writer that also expected an empty stream loses.
        let error = store
            .append(id.clone(), vec![deposited(2.0)], Some(Version::INITIAL))
            .await
            .unwrap_err();
        match error {
            EventStoreError::ConcurrencyConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, Version::new(0));
                assert_eq!(actual, Version::new(1));
            }
            other => unreachable!("expected conflict, got {other}"),
        }

        // Retrying with the reloaded head succeeds.
        store
            .append(id, vec![deposited(2.0)], Some(Version::new(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_append_is_a_no_op_and_never_conflicts() {
        let store = InMemoryEventStore::new();
        let id = StreamId::new("account-7");
        store.append(id.clone(), vec![deposited(1.0)], None).await.unwrap();

        // A stale expected version cannot matter when there is nothing to append.
        let version = store
            .append(id.clone(), Vec::new(), Some(Version::new(99)))
            .await
            .unwrap();
        assert_eq!(version, Version::new(1));
        assert_eq!(store.load(id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_stream_and_past_the_end_load_empty() {
        let store = InMemoryEventStore::new();
        let id = StreamId::new("account-7");

        assert!(store.load(id.clone(), None).await.unwrap().is_empty());

        store.append(id.clone(), vec![deposited(1.0)], None).await.unwrap();
        let past_end = store
            .load(id, Some(Version::new(10)))
            .await
            .unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn load_from_version_returns_the_suffix() {
        let store = InMemoryEventStore::new();
        let id = StreamId::new("account-7");
        store
            .append(
                id.clone(),
                vec![deposited(1.0), deposited(2.0), deposited(3.0)],
                None,
            )
            .await
            .unwrap();

        let suffix = store.load(id, Some(Version::new(1))).await.unwrap();
        assert_eq!(suffix.len(), 2);
        assert_eq!(suffix[0].position, 1);
        assert_eq!(suffix[1].position, 2);
    }

    #[test]
    fn snapshot_slot_replaces_atomically() {
        tokio_test::block_on(async {
            let store = InMemoryEventStore::new();
            let id = StreamId::new("account-7");

            assert!(store.load_snapshot(id.clone()).await.unwrap().is_none());

            store
                .save_snapshot(Snapshot::new(
                    id.clone(),
                    "BankAccount",
                    Version::new(10),
                    json!({ "balance": 5.0 }),
                ))
                .await
                .unwrap();
            store
                .save_snapshot(Snapshot::new(
                    id.clone(),
                    "BankAccount",
                    Version::new(20),
                    json!({ "balance": 9.0 }),
                ))
                .await
                .unwrap();

            let current = store.load_snapshot(id).await.unwrap().unwrap();
            assert_eq!(current.version, Version::new(20));
        });
    }

    #[test]
    fn ping_reports_alive() {
        tokio_test::block_on(async {
            let store = InMemoryEventStore::new();
            assert!(store.ping().await.unwrap());
        });
    }
}
