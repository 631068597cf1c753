//! # Eventfold Core
//!
//! Core contracts and coordination for an in-process event-sourcing and CQRS
//! runtime:
//!
//! - **Messages** ([`message`]): immutable commands and events with
//!   CloudEvents-aligned metadata, plus the persisted event envelope
//! - **Buses** ([`bus`]): type-keyed fan-out dispatch with a defined
//!   partial-failure policy, in cooperative and blocking variants
//! - **Event store** ([`event_store`]): ordered per-stream append with
//!   optimistic concurrency and a snapshot slot
//! - **Aggregates** ([`aggregate`]): explicit transition tables, event
//!   replay, uncommitted-event buffering, and an optimistic repository
//! - **Projections** ([`projection`]): at-least-once read-model building
//!   with idempotent cursor advancement
//! - **Sagas** ([`saga`]): ordered steps with reverse-order compensation
//! - **Versioning** ([`versioning`]): per-event-type upcaster chains
//! - **Dead letters** ([`dead_letter`]): a sink for unprocessable messages
//! - **Observability** ([`observability`]): metrics/tracing provider
//!   contracts and a hooks facade, injected by constructor
//!
//! Storage and transport adapters are external collaborators: they implement
//! the [`event_store::EventStore`], [`projection::ProjectionStateStore`],
//! [`saga::SagaStateStore`], and [`dead_letter::DeadLetterQueue`] contracts.
//! The `eventfold-memory` crate provides in-memory implementations for tests
//! and single-process deployments; `eventfold-runtime` adds retry policies
//! and a metrics-facade provider.
//!
//! # Ordering guarantees
//!
//! - Within one stream, readers always observe append order.
//! - Two publishes on the same bus are ordered only when the caller fully
//!   awaits the first before issuing the second.
//! - Handlers for the same message observe no mutual ordering on the
//!   cooperative bus, and registration order on the blocking one.
//! - Projections advance in the order events are fed to them.
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
//! struct Tally {
//!     count: i64,
//! }
//!
//! impl Aggregate for Tally {
//!     fn aggregate_type() -> &'static str {
//!         "Tally"
//!     }
//!
//!     fn transitions() -> TransitionTable<Self> {
//!         TransitionTable::new().on("Bumped", |state, _| state.count += 1)
//!     }
//! }
//!
//! let mut tally = AggregateRoot::<Tally>::new("tally-1");
//! tally.apply(EventEnvelope::for_aggregate("tally-1", "Bumped", json!({})));
//! assert_eq!(tally.state().count, 1);
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Boxed error type carried by handler, action, and upcaster failures.
///
/// Foreign failures cross the library boundary as this type; the library's
/// own errors are structured enums per module.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub mod aggregate;
pub mod bus;
pub mod dead_letter;
pub mod event_store;
pub mod message;
pub mod observability;
pub mod projection;
pub mod saga;
pub mod stream;
pub mod versioning;
