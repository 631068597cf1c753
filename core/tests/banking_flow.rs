//! End-to-end flow: commands over the bus, events through the repository
//! into the store, and a projection folding the stream into a read model.

#![allow(clippy::unwrap_used)] // Panics: tests fail loudly

use eventfold_core::aggregate::{Aggregate, AggregateRepository, AggregateRoot, RepositoryError, TransitionTable};
use eventfold_core::bus::AsyncMessageBus;
use eventfold_core::event_store::EventStore;
use eventfold_core::message::{
    Command, EventEnvelope, Message, MessageMetadata, validate_in_range, validate_non_negative,
    validate_not_empty, validate_positive,
};
use eventfold_core::observability::ObservabilityHooks;
use eventfold_core::projection::ProjectionEngine;
use eventfold_core::stream::StreamId;
use eventfold_memory::{InMemoryEventStore, InMemoryProjectionStateStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default, Serialize, Deserialize)]
struct BankAccount {
    owner: String,
    balance: f64,
}

impl Aggregate for BankAccount {
    fn aggregate_type() -> &'static str {
        "BankAccount"
    }

    fn transitions() -> TransitionTable<Self> {
        TransitionTable::new()
            .on("AccountOpened", |state: &mut BankAccount, event| {
                if let Some(owner) = event.field("owner").and_then(serde_json::Value::as_str) {
                    state.owner = owner.to_string();
                }
                state.balance += event
                    .field("initial_deposit")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0);
            })
            .on("Deposited", |state: &mut BankAccount, event| {
                state.balance += event
                    .field("amount")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0);
            })
            .on("InterestApplied", |state: &mut BankAccount, event| {
                let rate = event
                    .field("rate")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0);
                state.balance += state.balance * rate;
            })
    }
}

#[derive(Debug)]
struct OpenAccount {
    meta: MessageMetadata,
    account_id: String,
    owner: String,
    initial_deposit: f64,
}

impl Message for OpenAccount {
    fn metadata(&self) -> &MessageMetadata {
        &self.meta
    }
}
impl Command for OpenAccount {}

#[derive(Debug)]
struct Deposit {
    meta: MessageMetadata,
    account_id: String,
    amount: f64,
}

impl Message for Deposit {
    fn metadata(&self) -> &MessageMetadata {
        &self.meta
    }
}
impl Command for Deposit {}

#[derive(Debug)]
struct ApplyInterest {
    meta: MessageMetadata,
    account_id: String,
    rate: f64,
}

impl Message for ApplyInterest {
    fn metadata(&self) -> &MessageMetadata {
        &self.meta
    }
}
impl Command for ApplyInterest {}

fn command_bus(repository: Arc<AggregateRepository>) -> AsyncMessageBus {
    let mut bus = AsyncMessageBus::new();

    let repo = Arc::clone(&repository);
    bus.subscribe::<OpenAccount, _, _>(move |command| {
        let repo = Arc::clone(&repo);
        async move {
            validate_not_empty(&command.owner, "owner")?;
            validate_non_negative(command.initial_deposit, "initial_deposit")?;
            let mut account = AggregateRoot::<BankAccount>::new(command.account_id.as_str());
            account.apply(
                EventEnvelope::for_aggregate(
                    &command.account_id,
                    "AccountOpened",
                    json!({ "owner": command.owner, "initial_deposit": command.initial_deposit }),
                )
                .caused_by(command.metadata()),
            );
            repo.save(&mut account).await?;
            Ok(())
        }
    });

    let repo = Arc::clone(&repository);
    bus.subscribe::<Deposit, _, _>(move |command| {
        let repo = Arc::clone(&repo);
        async move {
            validate_positive(command.amount, "amount")?;
            let mut account: AggregateRoot<BankAccount> =
                repo.load(StreamId::new(command.account_id.as_str())).await?;
            account.apply(
                EventEnvelope::for_aggregate(
                    &command.account_id,
                    "Deposited",
                    json!({ "amount": command.amount }),
                )
                .caused_by(command.metadata()),
            );
            repo.save(&mut account).await?;
            Ok(())
        }
    });

    let repo = Arc::clone(&repository);
    bus.subscribe::<ApplyInterest, _, _>(move |command| {
        let repo = Arc::clone(&repo);
        async move {
            validate_in_range(command.rate, 0.0, 1.0, "rate")?;
            let mut account: AggregateRoot<BankAccount> =
                repo.load(StreamId::new(command.account_id.as_str())).await?;
            account.apply(
                EventEnvelope::for_aggregate(
                    &command.account_id,
                    "InterestApplied",
                    json!({ "rate": command.rate }),
                )
                .caused_by(command.metadata()),
            );
            repo.save(&mut account).await?;
            Ok(())
        }
    });

    bus
}

#[tokio::test]
async fn commands_become_events_become_read_models() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let store = Arc::new(InMemoryEventStore::new());

    let stored_events = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&stored_events);
    let mut hooks = ObservabilityHooks::default();
    hooks.on_event_stored(move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let repository = Arc::new(
        AggregateRepository::new(Arc::clone(&store) as _).with_hooks(Arc::new(hooks)),
    );

    let bus = command_bus(Arc::clone(&repository));

    // Drive the write side through commands.
    let open = OpenAccount {
        meta: MessageMetadata::of::<OpenAccount>(),
        account_id: "acct-1".to_string(),
        owner: "alice".to_string(),
        initial_deposit: 50.0,
    };
    let open_id = open.id().to_string();
    bus.publish(open).await.unwrap();
    bus.publish(Deposit {
        meta: MessageMetadata::of::<Deposit>(),
        account_id: "acct-1".to_string(),
        amount: 70.0,
    })
    .await
    .unwrap();
    bus.publish(Deposit {
        meta: MessageMetadata::of::<Deposit>(),
        account_id: "acct-1".to_string(),
        amount: 30.0,
    })
    .await
    .unwrap();
    bus.publish(ApplyInterest {
        meta: MessageMetadata::of::<ApplyInterest>(),
        account_id: "acct-1".to_string(),
        rate: 0.5,
    })
    .await
    .unwrap();

    // Aggregate state reflects the full stream: 50 + 70 + 30, then +50%.
    let account: AggregateRoot<BankAccount> =
        repository.load(StreamId::new("acct-1")).await.unwrap();
    assert_eq!(account.state().owner, "alice");
    assert_eq!(account.state().balance, 225.0);
    assert_eq!(stored_events.load(Ordering::SeqCst), 4);

    // Events carry causation back to their commands.
    let records = store.load(StreamId::new("acct-1"), None).await.unwrap();
    assert_eq!(
        records[0].event.metadata.causation_id.as_deref(),
        Some(open_id.as_str())
    );

    // The read side folds the same stream into a balance view.
    let balances: Arc<Mutex<HashMap<String, f64>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut engine = ProjectionEngine::new(
        "balance-view",
        Arc::new(InMemoryProjectionStateStore::new()),
    );
    let view = Arc::clone(&balances);
    engine.on("AccountOpened", move |event| {
        let view = Arc::clone(&view);
        async move {
            let account_id = event.metadata.subject.clone().unwrap_or_default();
            let opening = event
                .field("initial_deposit")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0);
            view.lock().unwrap().insert(account_id, opening);
            Ok(())
        }
    });
    let view = Arc::clone(&balances);
    engine.on("Deposited", move |event| {
        let view = Arc::clone(&view);
        async move {
            let account_id = event.metadata.subject.clone().unwrap_or_default();
            let amount = event
                .field("amount")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0);
            *view.lock().unwrap().entry(account_id).or_insert(0.0) += amount;
            Ok(())
        }
    });
    let view = Arc::clone(&balances);
    engine.on("InterestApplied", move |event| {
        let view = Arc::clone(&view);
        async move {
            let account_id = event.metadata.subject.clone().unwrap_or_default();
            let rate = event
                .field("rate")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0);
            let mut view = view.lock().unwrap();
            let balance = view.entry(account_id).or_insert(0.0);
            *balance += *balance * rate;
            Ok(())
        }
    });
    engine.process_stream(&records).await.unwrap();

    assert_eq!(balances.lock().unwrap().get("acct-1"), Some(&225.0));
    assert!(engine.is_healthy());
}

#[tokio::test]
async fn invalid_command_surfaces_as_total_failure() {
    let repository = Arc::new(AggregateRepository::new(Arc::new(InMemoryEventStore::new())));
    let bus = command_bus(repository);

    // Each handler rejects a bad command before touching the aggregate;
    // with a single handler that is a total dispatch failure.
    let error = bus
        .publish(Deposit {
            meta: MessageMetadata::of::<Deposit>(),
            account_id: "acct-1".to_string(),
            amount: 0.0,
        })
        .await
        .unwrap_err();
    assert_eq!(error.message_type, "Deposit");
    assert_eq!(error.failures, 1);

    let error = bus
        .publish(OpenAccount {
            meta: MessageMetadata::of::<OpenAccount>(),
            account_id: "acct-2".to_string(),
            owner: "   ".to_string(),
            initial_deposit: 10.0,
        })
        .await
        .unwrap_err();
    assert_eq!(error.message_type, "OpenAccount");

    let error = bus
        .publish(OpenAccount {
            meta: MessageMetadata::of::<OpenAccount>(),
            account_id: "acct-2".to_string(),
            owner: "bob".to_string(),
            initial_deposit: -5.0,
        })
        .await
        .unwrap_err();
    assert_eq!(error.message_type, "OpenAccount");

    let error = bus
        .publish(ApplyInterest {
            meta: MessageMetadata::of::<ApplyInterest>(),
            account_id: "acct-1".to_string(),
            rate: 1.5,
        })
        .await
        .unwrap_err();
    assert_eq!(error.message_type, "ApplyInterest");
}

#[tokio::test]
async fn depositing_into_a_missing_account_fails() {
    let repository = Arc::new(AggregateRepository::new(Arc::new(InMemoryEventStore::new())));

    let error = repository
        .load::<BankAccount>(StreamId::new("acct-404"))
        .await
        .unwrap_err();
    assert!(matches!(error, RepositoryError::AggregateNotFound(_)));
}
