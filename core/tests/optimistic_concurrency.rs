//! Optimistic concurrency: two writers race on one aggregate; exactly one
//! save succeeds and the loser recovers by reloading.

#![allow(clippy::unwrap_used)] // Panics: tests fail loudly

use eventfold_core::aggregate::{Aggregate, AggregateRepository, AggregateRoot, RepositoryError, TransitionTable};
use eventfold_core::event_store::{EventStore, EventStoreError};
use eventfold_core::message::EventEnvelope;
use eventfold_core::stream::{StreamId, Version};
use eventfold_memory::InMemoryEventStore;
use eventfold_runtime::retry::{FixedDelay, retry};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Serialize, Deserialize)]
struct BankAccount {
    balance: f64,
}

impl Aggregate for BankAccount {
    fn aggregate_type() -> &'static str {
        "BankAccount"
    }

    fn transitions() -> TransitionTable<Self> {
        TransitionTable::new().on("Deposited", |state, event| {
            state.balance += event
                .field("amount")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0);
        })
    }
}

fn deposited(aggregate_id: &str, amount: f64) -> EventEnvelope {
    EventEnvelope::for_aggregate(aggregate_id, "Deposited", json!({ "amount": amount }))
}

async fn seed_stream(store: &InMemoryEventStore, aggregate_id: &str, events: u64) {
    let envelopes = (0..events)
        .map(|_| deposited(aggregate_id, 10.0))
        .collect();
    store
        .append(StreamId::new(aggregate_id), envelopes, Some(Version::INITIAL))
        .await
        .unwrap();
}

#[tokio::test]
async fn exactly_one_of_two_racing_writers_wins() {
    let store = Arc::new(InMemoryEventStore::new());
    let repository = AggregateRepository::new(Arc::clone(&store) as _);
    seed_stream(&store, "acct-1", 5).await;

    // Both callers load the aggregate at version 5.
    let mut first: AggregateRoot<BankAccount> =
        repository.load(StreamId::new("acct-1")).await.unwrap();
    let mut second: AggregateRoot<BankAccount> =
        repository.load(StreamId::new("acct-1")).await.unwrap();
    assert_eq!(first.version(), Version::new(5));
    assert_eq!(second.version(), Version::new(5));

    first.apply(deposited("acct-1", 1.0));
    second.apply(deposited("acct-1", 2.0));

    repository.save(&mut first).await.unwrap();

    let error = repository.save(&mut second).await.unwrap_err();
    match error {
        RepositoryError::Store(EventStoreError::ConcurrencyConflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, Version::new(5));
            assert_eq!(actual, Version::new(6));
        }
        other => unreachable!("expected a concurrency conflict, got {other}"),
    }

    // The loser recovers under a retry policy: reload, reapply, save.
    let policy = FixedDelay::new(3, Duration::from_millis(1));
    retry(&policy, || async {
        let mut retried: AggregateRoot<BankAccount> =
            repository.load(StreamId::new("acct-1")).await?;
        retried.apply(deposited("acct-1", 2.0));
        repository.save(&mut retried).await
    })
    .await
    .unwrap();

    let final_state: AggregateRoot<BankAccount> =
        repository.load(StreamId::new("acct-1")).await.unwrap();
    assert_eq!(final_state.version(), Version::new(7));
    assert_eq!(final_state.state().balance, 53.0);
}

#[tokio::test]
async fn loading_a_missing_aggregate_is_not_found() {
    let repository = AggregateRepository::new(Arc::new(InMemoryEventStore::new()));
    let error = repository
        .load::<BankAccount>(StreamId::new("acct-missing"))
        .await
        .unwrap_err();
    assert!(matches!(error, RepositoryError::AggregateNotFound(id) if id == "acct-missing"));
}

#[tokio::test]
async fn saving_without_changes_is_a_no_op() {
    let store = Arc::new(InMemoryEventStore::new());
    let repository = AggregateRepository::new(Arc::clone(&store) as _);
    seed_stream(&store, "acct-1", 2).await;

    let mut account: AggregateRoot<BankAccount> =
        repository.load(StreamId::new("acct-1")).await.unwrap();
    repository.save(&mut account).await.unwrap();

    let records = store.load(StreamId::new("acct-1"), None).await.unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn snapshot_shortcuts_replay_and_stays_consistent() {
    let store = Arc::new(InMemoryEventStore::new());
    let repository = AggregateRepository::new(Arc::clone(&store) as _);
    seed_stream(&store, "acct-1", 5).await;

    let account: AggregateRoot<BankAccount> =
        repository.load(StreamId::new("acct-1")).await.unwrap();
    repository.snapshot(&account).await.unwrap();

    // More events arrive after the snapshot.
    store
        .append(
            StreamId::new("acct-1"),
            vec![deposited("acct-1", 100.0)],
            Some(Version::new(5)),
        )
        .await
        .unwrap();

    let reloaded: AggregateRoot<BankAccount> =
        repository.load(StreamId::new("acct-1")).await.unwrap();
    assert_eq!(reloaded.version(), Version::new(6));
    assert_eq!(reloaded.state().balance, 150.0);
}
