//! Saga orchestration: multi-step processes with compensation-based
//! rollback.
//!
//! A saga executes an ordered list of steps, each an action with an optional
//! compensation. When a step fails, the compensations of the steps completed
//! so far run in reverse order, and the original failure surfaces to the
//! caller afterwards. Sagas provide rollback-by-compensation in lieu of
//! ACID: each step's effects are undone by explicit inverse operations, not
//! by a transaction manager.
//!
//! Saga progress persists to a [`SagaStateStore`] after every transition, so
//! a saga remains queryable through and after its execution. A saga instance
//! is single-threaded with respect to itself; distinct instances may run
//! concurrently.
//!
//! # Policies
//!
//! Two knobs cover behaviors the pattern leaves open:
//!
//! - [`Saga::compensate_failed_step`]: whether the *failed* step's own
//!   compensation runs (first) during rollback. Default `true`: a step that
//!   failed midway may have left partial effects.
//! - [`Saga::compensation_policy`]: what happens when a compensation itself
//!   fails. [`CompensationPolicy::StopOnFailure`] (default) marks the saga
//!   failed and stops; [`CompensationPolicy::BestEffort`] keeps compensating
//!   the remaining steps and records each outcome.
//!
//! # Example
//!
//! ```
//! use eventfold_core::saga::{Saga, SagaStep};
//! use eventfold_memory::InMemorySagaStateStore;
//! use serde_json::{Map, json};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let steps = vec![
//!     SagaStep::new("debit", |ctx| async move {
//!         let amount = ctx.arg("amount").cloned().unwrap_or(json!(0));
//!         Ok(json!({ "debited": amount }))
//!     })?
//!     .with_compensation(|ctx| async move {
//!         // credit the amount back using ctx.result
//!         let _ = ctx.result;
//!         Ok(())
//!     }),
//!     SagaStep::new("credit", |_ctx| async move { Ok(json!({ "ok": true })) })?,
//! ];
//!
//! let mut saga = Saga::new("MoneyTransfer", steps, Arc::new(InMemorySagaStateStore::new()))?;
//! let mut args = Map::new();
//! args.insert("amount".to_string(), json!(50.0));
//! let result = saga.execute(args).await?;
//! assert_eq!(result, json!({ "ok": true }));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

use crate::BoxError;
use crate::observability::TracingProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors from saga construction and execution.
#[derive(Error, Debug)]
pub enum SagaError {
    /// A step's action failed; compensation has already been attempted by
    /// the time this reaches the caller.
    #[error("saga step '{step}' failed: {source}")]
    StepFailed {
        /// Name of the failed step.
        step: String,
        /// The action's failure.
        #[source]
        source: BoxError,
    },

    /// Two steps share a name.
    #[error("duplicate saga step name '{0}'")]
    DuplicateStep(String),

    /// A step was given an empty name.
    #[error("saga step name cannot be empty")]
    EmptyStepName,

    /// The saga state store failed.
    #[error("saga state store error: {0}")]
    StateStore(String),
}

/// Overall status of a saga execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Created but not started.
    Pending,
    /// Currently executing steps.
    InProgress,
    /// Every step completed.
    Completed,
    /// Rolling back after a step failure.
    Compensating,
    /// Terminal failure; compensations were attempted per policy.
    Failed,
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet finished.
    Pending,
    /// Action succeeded.
    Completed,
    /// Compensation is running.
    Compensating,
    /// Compensation succeeded.
    Compensated,
    /// Action or compensation failed.
    Failed,
}

/// Persisted status of one step's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepState {
    /// Step name.
    pub step_name: String,
    /// Current status.
    pub status: StepStatus,
    /// Result recorded by a completed action.
    pub result: Option<Value>,
    /// Error message when the step failed.
    pub error: Option<String>,
    /// When the step (or its compensation) started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl SagaStepState {
    fn started(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }
}

/// Persisted state of a saga execution, for recovery and monitoring.
///
/// The persisted record is immutable from the store's point of view; the
/// running [`Saga`] mutates a working copy in memory and hands clones to the
/// store on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaState {
    /// Unique saga id.
    pub saga_id: String,
    /// Saga type tag, e.g. `"MoneyTransfer"`.
    pub saga_type: String,
    /// Overall status.
    pub status: SagaStatus,
    /// Per-step status, keyed by step name.
    pub step_statuses: HashMap<String, SagaStepState>,
    /// Index of the step currently (or last) executing.
    pub current_step_index: usize,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the saga reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// The failure that triggered compensation, if any.
    pub error: Option<String>,
}

impl SagaState {
    /// A fresh pending state.
    #[must_use]
    pub fn new(saga_id: impl Into<String>, saga_type: impl Into<String>) -> Self {
        Self {
            saga_id: saga_id.into(),
            saga_type: saga_type.into(),
            status: SagaStatus::Pending,
            step_statuses: HashMap::new(),
            current_step_index: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Whether the saga reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SagaStatus::Completed | SagaStatus::Failed)
    }
}

/// Persistence for saga state.
///
/// Per saga id the store is single-writer by convention.
pub trait SagaStateStore: Send + Sync {
    /// Load the state for a saga id, if one was ever saved.
    ///
    /// # Errors
    ///
    /// [`SagaError::StateStore`] on storage failure.
    fn load_state(
        &self,
        saga_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SagaState>, SagaError>> + Send + '_>>;

    /// Persist a state.
    ///
    /// # Errors
    ///
    /// [`SagaError::StateStore`] on storage failure.
    fn save_state(
        &self,
        state: SagaState,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>>;
}

/// Arguments and prior results available to a step's action.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The arguments `execute` was called with.
    pub args: Arc<Map<String, Value>>,
    /// Results of completed prior steps, by step name.
    pub results: HashMap<String, Value>,
}

impl StepContext {
    /// A named execution argument.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// A prior step's recorded result.
    #[must_use]
    pub fn result_of(&self, step_name: &str) -> Option<&Value> {
        self.results.get(step_name)
    }
}

/// What a compensation receives: the step's own recorded result plus the
/// results of the other completed steps by name.
#[derive(Debug, Clone)]
pub struct CompensationContext {
    /// The compensated step's recorded action result.
    pub result: Option<Value>,
    /// Results of the other completed steps, by step name.
    pub results: HashMap<String, Value>,
}

type ActionFuture = Pin<Box<dyn Future<Output = Result<Value, BoxError>> + Send>>;
type ActionFn = Arc<dyn Fn(StepContext) -> ActionFuture + Send + Sync>;
type CompensationFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
type CompensationFn = Arc<dyn Fn(CompensationContext) -> CompensationFuture + Send + Sync>;

/// One saga step: a named action with an optional compensation.
#[derive(Clone)]
pub struct SagaStep {
    name: String,
    action: ActionFn,
    compensation: Option<CompensationFn>,
}

impl SagaStep {
    /// Create a step.
    ///
    /// # Errors
    ///
    /// [`SagaError::EmptyStepName`] when the name is blank.
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Result<Self, SagaError>
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SagaError::EmptyStepName);
        }
        Ok(Self {
            name,
            action: Arc::new(move |ctx| Box::pin(action(ctx)) as ActionFuture),
            compensation: None,
        })
    }

    /// Attach the compensation that undoes this step.
    #[must_use]
    pub fn with_compensation<F, Fut>(mut self, compensation: F) -> Self
    where
        F: Fn(CompensationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.compensation = Some(Arc::new(move |ctx| {
            Box::pin(compensation(ctx)) as CompensationFuture
        }));
        self
    }

    /// The step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("has_compensation", &self.compensation.is_some())
            .finish_non_exhaustive()
    }
}

/// What to do when a compensation itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompensationPolicy {
    /// Mark the saga failed and stop; remaining compensations do not run.
    #[default]
    StopOnFailure,
    /// Keep compensating the remaining steps, recording each outcome.
    BestEffort,
}

/// Orchestrates one saga execution.
pub struct Saga {
    saga_id: String,
    saga_type: String,
    steps: Vec<SagaStep>,
    state_store: Arc<dyn SagaStateStore>,
    tracing: Option<Arc<dyn TracingProvider>>,
    compensate_failed_step: bool,
    compensation_policy: CompensationPolicy,
    state: Option<SagaState>,
    step_results: HashMap<String, Value>,
}

impl Saga {
    /// Create a saga with a fresh id.
    ///
    /// # Errors
    ///
    /// [`SagaError::DuplicateStep`] when two steps share a name.
    pub fn new(
        saga_type: impl Into<String>,
        steps: Vec<SagaStep>,
        state_store: Arc<dyn SagaStateStore>,
    ) -> Result<Self, SagaError> {
        let mut names = HashSet::new();
        for step in &steps {
            if !names.insert(step.name.clone()) {
                return Err(SagaError::DuplicateStep(step.name.clone()));
            }
        }
        Ok(Self {
            saga_id: Uuid::new_v4().to_string(),
            saga_type: saga_type.into(),
            steps,
            state_store,
            tracing: None,
            compensate_failed_step: true,
            compensation_policy: CompensationPolicy::default(),
            state: None,
            step_results: HashMap::new(),
        })
    }

    /// Use a known saga id (for rehydrating a persisted saga).
    #[must_use]
    pub fn with_saga_id(mut self, saga_id: impl Into<String>) -> Self {
        self.saga_id = saga_id.into();
        self
    }

    /// Attach a tracing provider; each step and compensation gets a span.
    #[must_use]
    pub fn with_tracing(mut self, tracing: Arc<dyn TracingProvider>) -> Self {
        self.tracing = Some(tracing);
        self
    }

    /// Whether the failed step's own compensation runs during rollback
    /// (default `true`).
    #[must_use]
    pub const fn compensate_failed_step(mut self, compensate: bool) -> Self {
        self.compensate_failed_step = compensate;
        self
    }

    /// Set the compensation-failure policy (default
    /// [`CompensationPolicy::StopOnFailure`]).
    #[must_use]
    pub const fn compensation_policy(mut self, policy: CompensationPolicy) -> Self {
        self.compensation_policy = policy;
        self
    }

    /// The saga id.
    #[must_use]
    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    /// The current state, if initialized.
    #[must_use]
    pub const fn state(&self) -> Option<&SagaState> {
        self.state.as_ref()
    }

    /// Whether the saga reached a terminal status.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.as_ref().is_some_and(SagaState::is_terminal)
    }

    /// Whether the saga completed without failure.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.status == SagaStatus::Completed)
    }

    /// Load persisted state for this saga id, or create and persist a fresh
    /// pending state.
    ///
    /// Loading an in-progress saga does not resume execution; call
    /// [`Saga::execute`] explicitly to run.
    ///
    /// # Errors
    ///
    /// [`SagaError::StateStore`] on storage failure.
    pub async fn initialize(&mut self) -> Result<(), SagaError> {
        match self.state_store.load_state(&self.saga_id).await? {
            Some(state) => {
                tracing::info!(
                    saga_id = %self.saga_id,
                    saga_type = %self.saga_type,
                    status = ?state.status,
                    "saga state loaded"
                );
                self.state = Some(state);
            }
            None => {
                let state = SagaState::new(self.saga_id.clone(), self.saga_type.clone());
                self.state_store.save_state(state.clone()).await?;
                self.state = Some(state);
            }
        }
        Ok(())
    }

    /// Execute the steps in order.
    ///
    /// On success, returns the last step's result and the saga is
    /// [`SagaStatus::Completed`]. On a step failure, compensation runs per
    /// the configured policies and the original failure is returned as
    /// [`SagaError::StepFailed`]; the saga ends [`SagaStatus::Failed`].
    ///
    /// # Errors
    ///
    /// [`SagaError::StepFailed`] after compensation, or
    /// [`SagaError::StateStore`] when persisting progress fails.
    pub async fn execute(&mut self, args: Map<String, Value>) -> Result<Value, SagaError> {
        if self.state.is_none() {
            self.initialize().await?;
        }

        self.update_state(|state| {
            state.status = SagaStatus::InProgress;
            state.started_at = Some(Utc::now());
        });
        self.persist().await?;
        tracing::info!(
            saga_id = %self.saga_id,
            saga_type = %self.saga_type,
            steps = self.steps.len(),
            "saga started"
        );

        let args = Arc::new(args);
        let mut last_result = Value::Null;
        for index in 0..self.steps.len() {
            let step_name = self.steps[index].name.clone();
            match self.execute_step(index, &args).await? {
                Ok(result) => {
                    self.step_results.insert(step_name, result.clone());
                    last_result = result;
                }
                Err(error) => {
                    tracing::error!(
                        saga_id = %self.saga_id,
                        step = %step_name,
                        error = %error,
                        "saga step failed, compensating"
                    );
                    self.compensate(index, &error.to_string()).await?;
                    return Err(SagaError::StepFailed {
                        step: step_name,
                        source: error,
                    });
                }
            }
        }

        self.update_state(|state| {
            state.status = SagaStatus::Completed;
            state.completed_at = Some(Utc::now());
        });
        self.persist().await?;
        tracing::info!(saga_id = %self.saga_id, "saga completed");
        Ok(last_result)
    }

    /// Run one step's action. The outer `Result` is infrastructure (state
    /// store); the inner one is the action's own outcome.
    async fn execute_step(
        &mut self,
        index: usize,
        args: &Arc<Map<String, Value>>,
    ) -> Result<Result<Value, BoxError>, SagaError> {
        let step_name = self.steps[index].name.clone();
        let action = Arc::clone(&self.steps[index].action);

        self.update_state(|state| {
            state.current_step_index = index;
            state
                .step_statuses
                .insert(step_name.clone(), SagaStepState::started(step_name.clone()));
        });
        self.persist().await?;

        let context = StepContext {
            args: Arc::clone(args),
            results: self.step_results.clone(),
        };
        let mut span = self.start_span(&format!("saga.step.{step_name}"));
        let outcome = action(context).await;
        self.end_span(span.as_mut(), outcome.as_ref().err());

        self.update_state(|state| {
            if let Some(step_state) = state.step_statuses.get_mut(&step_name) {
                step_state.completed_at = Some(Utc::now());
                match &outcome {
                    Ok(result) => {
                        step_state.status = StepStatus::Completed;
                        step_state.result = Some(result.clone());
                    }
                    Err(error) => {
                        step_state.status = StepStatus::Failed;
                        step_state.error = Some(error.to_string());
                    }
                }
            }
        });
        self.persist().await?;
        Ok(outcome)
    }

    /// Compensate completed steps in reverse order, starting from the
    /// failed step (inclusive or not, per policy).
    async fn compensate(&mut self, failed_index: usize, reason: &str) -> Result<(), SagaError> {
        self.update_state(|state| {
            state.status = SagaStatus::Compensating;
            state.error = Some(reason.to_string());
        });
        self.persist().await?;

        for index in (0..=failed_index).rev() {
            if index == failed_index && !self.compensate_failed_step {
                continue;
            }
            let step_name = self.steps[index].name.clone();
            let Some(compensation) = self.steps[index].compensation.clone() else {
                continue;
            };

            self.update_state(|state| {
                let step_state = state
                    .step_statuses
                    .entry(step_name.clone())
                    .or_insert_with(|| SagaStepState::started(step_name.clone()));
                step_state.status = StepStatus::Compensating;
                step_state.started_at = Some(Utc::now());
            });

            let context = CompensationContext {
                result: self.step_results.get(&step_name).cloned(),
                results: self
                    .step_results
                    .iter()
                    .filter(|(name, _)| name.as_str() != step_name)
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            };
            let mut span = self.start_span(&format!("saga.compensate.{step_name}"));
            let outcome = compensation(context).await;
            self.end_span(span.as_mut(), outcome.as_ref().err());

            let failed = outcome.is_err();
            self.update_state(|state| {
                if let Some(step_state) = state.step_statuses.get_mut(&step_name) {
                    step_state.completed_at = Some(Utc::now());
                    match &outcome {
                        Ok(()) => step_state.status = StepStatus::Compensated,
                        Err(error) => {
                            step_state.status = StepStatus::Failed;
                            step_state.error = Some(error.to_string());
                        }
                    }
                }
                if failed {
                    state.status = SagaStatus::Failed;
                }
            });
            self.persist().await?;

            if failed {
                tracing::error!(
                    saga_id = %self.saga_id,
                    step = %step_name,
                    "compensation failed"
                );
                if self.compensation_policy == CompensationPolicy::StopOnFailure {
                    break;
                }
            } else {
                tracing::info!(saga_id = %self.saga_id, step = %step_name, "step compensated");
            }
        }

        self.update_state(|state| {
            if state.status == SagaStatus::Compensating {
                state.status = SagaStatus::Failed;
            }
            state.completed_at = Some(Utc::now());
        });
        self.persist().await
    }

    fn update_state(&mut self, mutate: impl FnOnce(&mut SagaState)) {
        if let Some(state) = self.state.as_mut() {
            mutate(state);
        }
    }

    async fn persist(&self) -> Result<(), SagaError> {
        if let Some(state) = &self.state {
            self.state_store.save_state(state.clone()).await?;
        }
        Ok(())
    }

    fn start_span(&self, operation: &str) -> Option<crate::observability::TraceSpan> {
        self.tracing
            .as_ref()
            .map(|tracing| tracing.start_span(operation))
    }

    fn end_span(
        &self,
        span: Option<&mut crate::observability::TraceSpan>,
        error: Option<&BoxError>,
    ) {
        if let (Some(tracing), Some(span)) = (self.tracing.as_ref(), span) {
            if let Some(error) = error {
                span.set_error(error.to_string());
            }
            tracing.end_span(span);
        }
    }
}

impl std::fmt::Debug for Saga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga")
            .field("saga_id", &self.saga_id)
            .field("saga_type", &self.saga_type)
            .field("steps", &self.steps.len())
            .finish_non_exhaustive()
    }
}
