//! In-memory projection and saga state stores.

use eventfold_core::projection::{ProjectionError, ProjectionState, ProjectionStateStore};
use eventfold_core::saga::{SagaError, SagaState, SagaStateStore};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// In-memory [`ProjectionStateStore`] keyed by projection id.
#[derive(Debug, Default)]
pub struct InMemoryProjectionStateStore {
    states: RwLock<HashMap<String, ProjectionState>>,
}

impl InMemoryProjectionStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProjectionStateStore for InMemoryProjectionStateStore {
    fn load_state(
        &self,
        projection_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProjectionState>, ProjectionError>> + Send + '_>>
    {
        let projection_id = projection_id.to_string();
        Box::pin(async move { Ok(self.states.read().await.get(&projection_id).cloned()) })
    }

    fn save_state(
        &self,
        state: ProjectionState,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProjectionError>> + Send + '_>> {
        Box::pin(async move {
            self.states
                .write()
                .await
                .insert(state.projection_id.clone(), state);
            Ok(())
        })
    }
}

/// In-memory [`SagaStateStore`] keyed by saga id.
#[derive(Debug, Default)]
pub struct InMemorySagaStateStore {
    states: RwLock<HashMap<String, SagaState>>,
}

impl InMemorySagaStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sagas with persisted state.
    pub async fn count(&self) -> usize {
        self.states.read().await.len()
    }
}

impl SagaStateStore for InMemorySagaStateStore {
    fn load_state(
        &self,
        saga_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SagaState>, SagaError>> + Send + '_>> {
        let saga_id = saga_id.to_string();
        Box::pin(async move { Ok(self.states.read().await.get(&saga_id).cloned()) })
    }

    fn save_state(
        &self,
        state: SagaState,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + '_>> {
        Box::pin(async move {
            self.states
                .write()
                .await
                .insert(state.saga_id.clone(), state);
            Ok(())
        })
    }
}
