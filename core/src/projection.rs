//! Projection engine: fold an event stream into read models with
//! at-least-once delivery and idempotent advancement.
//!
//! Projections are the query side of CQRS. The engine consumes
//! [`RecordedEvent`]s in order, dispatches each to the handlers registered
//! for its exact event type, and tracks progress in a persisted
//! [`ProjectionState`] cursor. Delivery is at-least-once (an event may be
//! handed to the engine again after a crash), and the cursor's
//! last-processed-event-id guard makes redelivery of the most recent event a
//! no-op. Handlers themselves must be idempotent: an interruption *before*
//! the cursor persists means the interrupted event is reprocessed on the
//! next dispatch.
//!
//! The engine is single-writer per projection id (`process` takes
//! `&mut self`) and provides no source of events; feed it from an
//! event-store read or any ordered feed.
//!
//! # Example
//!
//! ```
//! use eventfold_core::projection::ProjectionEngine;
//! use eventfold_memory::InMemoryProjectionStateStore;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let mut engine = ProjectionEngine::new(
//!     "account-balances",
//!     Arc::new(InMemoryProjectionStateStore::new()),
//! );
//! engine.on("Deposited", |event| async move {
//!     // update the read model from event.data
//!     let _ = event.field("amount");
//!     Ok(())
//! });
//! engine.initialize().await?;
//! # Ok::<(), eventfold_core::projection::ProjectionError>(())
//! # });
//! ```

use crate::BoxError;
use crate::event_store::RecordedEvent;
use crate::message::{EventEnvelope, Message, short_type_name};
use crate::observability::TracingProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors from projection operations.
#[derive(Error, Debug)]
pub enum ProjectionError {
    /// The projection state store failed.
    #[error("projection state store error: {0}")]
    StateStore(String),

    /// A handler failed while processing an event. The cursor's error count
    /// was incremented and persisted before this was returned; the caller
    /// owns the retry policy.
    #[error("handler '{handler}' failed for event '{event_type}' (id {event_id}): {source}")]
    Handler {
        /// Name of the failing handler.
        handler: String,
        /// Type tag of the event being processed.
        event_type: String,
        /// Id of the event being processed.
        event_id: String,
        /// The handler's failure.
        #[source]
        source: BoxError,
    },
}

/// Persisted progress cursor for one projection.
///
/// `last_processed_event_id` advances monotonically; `error_count` is
/// monotonic until a replay resets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionState {
    /// Unique projection identifier.
    pub projection_id: String,
    /// Id of the last successfully processed event.
    pub last_processed_event_id: Option<String>,
    /// Stream position of the last successfully processed event.
    pub last_processed_position: u64,
    /// When the cursor last changed.
    pub updated_at: DateTime<Utc>,
    /// Number of handler failures since the last replay.
    pub error_count: u64,
    /// False after any handler failure, until a replay.
    pub is_healthy: bool,
}

impl ProjectionState {
    /// A fresh cursor at the beginning of the stream.
    #[must_use]
    pub fn new(projection_id: impl Into<String>) -> Self {
        Self {
            projection_id: projection_id.into(),
            last_processed_event_id: None,
            last_processed_position: 0,
            updated_at: Utc::now(),
            error_count: 0,
            is_healthy: true,
        }
    }
}

/// Persistence for projection cursors.
///
/// Per projection id the store is single-writer by convention; concurrent
/// writes to the same id are undefined.
pub trait ProjectionStateStore: Send + Sync {
    /// Load the cursor for a projection, if one was ever saved.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::StateStore`] on storage failure.
    fn load_state(
        &self,
        projection_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProjectionState>, ProjectionError>> + Send + '_>>;

    /// Persist a cursor.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::StateStore`] on storage failure.
    fn save_state(
        &self,
        state: ProjectionState,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProjectionError>> + Send + '_>>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
type HandlerFn = Arc<dyn Fn(Arc<EventEnvelope>) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
struct ProjectionHandler {
    name: &'static str,
    invoke: HandlerFn,
}

/// Folds events into read models, tracking progress in a persisted cursor.
pub struct ProjectionEngine {
    projection_id: String,
    state_store: Arc<dyn ProjectionStateStore>,
    tracing: Option<Arc<dyn TracingProvider>>,
    handlers: HashMap<String, Vec<ProjectionHandler>>,
    state: Option<ProjectionState>,
}

impl ProjectionEngine {
    /// Create an engine for a projection id over a state store.
    #[must_use]
    pub fn new(projection_id: impl Into<String>, state_store: Arc<dyn ProjectionStateStore>) -> Self {
        Self {
            projection_id: projection_id.into(),
            state_store,
            tracing: None,
            handlers: HashMap::new(),
            state: None,
        }
    }

    /// Attach a tracing provider; each handler invocation gets a span.
    #[must_use]
    pub fn with_tracing(mut self, tracing: Arc<dyn TracingProvider>) -> Self {
        self.tracing = Some(tracing);
        self
    }

    /// Register a handler for an event type. Handlers for the same type run
    /// in registration order; the same handler may be registered twice and
    /// will run twice.
    pub fn on<F, Fut>(&mut self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let event_type = event_type.into();
        let name = short_type_name::<F>();
        let invoke: HandlerFn = Arc::new(move |event| Box::pin(handler(event)) as HandlerFuture);
        tracing::debug!(
            projection_id = %self.projection_id,
            event_type = %event_type,
            handler = name,
            "projection handler registered"
        );
        self.handlers
            .entry(event_type)
            .or_default()
            .push(ProjectionHandler { name, invoke });
    }

    /// Load the cursor from the state store, creating and persisting a fresh
    /// one on first run.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::StateStore`] on storage failure.
    pub async fn initialize(&mut self) -> Result<(), ProjectionError> {
        let loaded = self.state_store.load_state(&self.projection_id).await?;
        match loaded {
            Some(state) => {
                tracing::info!(
                    projection_id = %self.projection_id,
                    position = state.last_processed_position,
                    healthy = state.is_healthy,
                    "projection cursor loaded"
                );
                self.state = Some(state);
            }
            None => {
                let state = ProjectionState::new(self.projection_id.clone());
                self.state_store.save_state(state.clone()).await?;
                tracing::info!(projection_id = %self.projection_id, "projection cursor created");
                self.state = Some(state);
            }
        }
        Ok(())
    }

    /// Process one recorded event.
    ///
    /// No-op when no handler is registered for the event type, and when the
    /// cursor already names this event id (idempotency guard against
    /// redelivery). Otherwise every handler runs in turn; on the first
    /// failure the error counters persist and the failure is returned. When
    /// all handlers succeed the cursor advances and persists.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::Handler`] on handler failure,
    /// [`ProjectionError::StateStore`] on cursor persistence failure.
    pub async fn process(&mut self, record: &RecordedEvent) -> Result<(), ProjectionError> {
        if self.state.is_none() {
            self.initialize().await?;
        }

        let Some(handlers) = self.handlers.get(record.event.event_type()).cloned() else {
            return Ok(());
        };

        if self
            .state
            .as_ref()
            .and_then(|state| state.last_processed_event_id.as_deref())
            == Some(record.event.id())
        {
            tracing::debug!(
                projection_id = %self.projection_id,
                event_id = record.event.id(),
                "event already processed, skipping"
            );
            return Ok(());
        }

        let store = Arc::clone(&self.state_store);
        let shared = Arc::new(record.event.clone());
        for handler in &handlers {
            let span = self.tracing.as_ref().map(|tracing| {
                let mut span =
                    tracing.start_span(&format!("projection.handle.{}", record.event.event_type()));
                span.set_attribute("projection_id", self.projection_id.clone());
                span.set_attribute("event_id", record.event.id());
                span
            });

            let outcome = (handler.invoke)(Arc::clone(&shared)).await;

            if let (Some(tracing_provider), Some(mut span)) = (self.tracing.as_ref(), span) {
                if let Err(error) = &outcome {
                    span.set_error(error.to_string());
                }
                tracing_provider.end_span(&mut span);
            }

            if let Err(error) = outcome {
                tracing::error!(
                    projection_id = %self.projection_id,
                    event_type = record.event.event_type(),
                    event_id = record.event.id(),
                    handler = handler.name,
                    error = %error,
                    "projection handler failed"
                );
                if let Some(state) = self.state.as_mut() {
                    state.error_count += 1;
                    state.is_healthy = false;
                    state.updated_at = Utc::now();
                    let snapshot = state.clone();
                    store.save_state(snapshot).await?;
                }
                return Err(ProjectionError::Handler {
                    handler: handler.name.to_string(),
                    event_type: record.event.event_type().to_string(),
                    event_id: record.event.id().to_string(),
                    source: error,
                });
            }
        }

        if let Some(state) = self.state.as_mut() {
            state.last_processed_event_id = Some(record.event.id().to_string());
            state.last_processed_position = record.position;
            state.updated_at = Utc::now();
            let snapshot = state.clone();
            store.save_state(snapshot).await?;
        }
        Ok(())
    }

    /// Process a stream of events sequentially; stops at the first failure.
    ///
    /// # Errors
    ///
    /// The first error from [`ProjectionEngine::process`].
    pub async fn process_stream(&mut self, records: &[RecordedEvent]) -> Result<(), ProjectionError> {
        for record in records {
            self.process(record).await?;
        }
        Ok(())
    }

    /// Reset the cursor and reprocess the given events from scratch.
    ///
    /// Destructive to progress: intended for rebuilds after handler-code
    /// changes. The reset cursor is persisted before reprocessing starts.
    ///
    /// # Errors
    ///
    /// As for [`ProjectionEngine::process_stream`].
    pub async fn replay(&mut self, records: &[RecordedEvent]) -> Result<(), ProjectionError> {
        if self.state.is_none() {
            self.initialize().await?;
        }

        let store = Arc::clone(&self.state_store);
        if let Some(state) = self.state.as_mut() {
            state.last_processed_event_id = None;
            state.last_processed_position = 0;
            state.error_count = 0;
            state.is_healthy = true;
            state.updated_at = Utc::now();
            let snapshot = state.clone();
            store.save_state(snapshot).await?;
        }
        tracing::info!(
            projection_id = %self.projection_id,
            events = records.len(),
            "projection replay started"
        );
        self.process_stream(records).await
    }

    /// The current cursor, if initialized.
    #[must_use]
    pub const fn state(&self) -> Option<&ProjectionState> {
        self.state.as_ref()
    }

    /// Whether the projection is initialized and has seen no handler
    /// failures since the last replay.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.is_healthy)
    }
}

impl std::fmt::Debug for ProjectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionEngine")
            .field("projection_id", &self.projection_id)
            .field("event_types", &self.handlers.len())
            .field("initialized", &self.state.is_some())
            .finish_non_exhaustive()
    }
}
