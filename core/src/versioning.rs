//! Event schema versioning via chained upcasters.
//!
//! Event schemas evolve; stored events do not. An upcaster migrates an event
//! one version forward (`n -> n+1`) for a named event type, and the
//! [`UpcasterRegistry`] chains single-step upcasters to reach any higher
//! target version on read. Downcasting is forbidden; dropping fields loses
//! data.
//!
//! # Example
//!
//! ```
//! use eventfold_core::message::EventEnvelope;
//! use eventfold_core::versioning::{FnUpcaster, UpcasterRegistry, VersionedEvent};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let mut registry = UpcasterRegistry::new();
//! registry.register(
//!     "OrderCreated",
//!     Arc::new(FnUpcaster::new(1, |mut event: VersionedEvent| async move {
//!         // v1 orders predate multi-currency support
//!         event.event.data["currency"] = json!("USD");
//!         Ok(event)
//!     })),
//! )?;
//!
//! let v1 = VersionedEvent::new(
//!     EventEnvelope::new("OrderCreated", json!({ "order_id": "o-1", "total": 10.0 })),
//!     1,
//! )?;
//! let v2 = registry.upcast(v1, "OrderCreated", 2).await?;
//! assert_eq!(v2.version, 2);
//! assert_eq!(v2.event.field("currency"), Some(&json!("USD")));
//! # Ok::<(), eventfold_core::versioning::UpcasterError>(())
//! # });
//! ```

use crate::BoxError;
use crate::message::EventEnvelope;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors from upcaster registration and application.
#[derive(Error, Debug)]
pub enum UpcasterError {
    /// The chain has a gap: no upcaster covers this hop.
    #[error("no upcaster found for {event_type} v{from_version}->v{target}")]
    NoUpcasterFound {
        /// Event type being migrated.
        event_type: String,
        /// Version the chain reached.
        from_version: u32,
        /// Version the missing hop would produce.
        target: u32,
    },

    /// The target version is below the event's version.
    #[error("cannot downcast {event_type} from v{from} to v{to}")]
    DowncastForbidden {
        /// Event type being migrated.
        event_type: String,
        /// The event's version.
        from: u32,
        /// The requested (lower) target.
        to: u32,
    },

    /// An upcaster in the chain failed.
    #[error("upcasting {event_type} v{from}->v{to} failed: {source}")]
    TransformFailed {
        /// Event type being migrated.
        event_type: String,
        /// Hop source version.
        from: u32,
        /// Hop target version.
        to: u32,
        /// The upcaster's failure.
        #[source]
        source: BoxError,
    },

    /// Event versions start at 1.
    #[error("invalid event version {0}: versions start at 1")]
    InvalidVersion(u32),

    /// The upcaster's version pair is not a `(n, n+1)` step with `n >= 1`.
    #[error(
        "invalid upcaster for '{event_type}': v{from_version}->v{target} (target must be source + 1, source >= 1)"
    )]
    InvalidUpcaster {
        /// Event type being registered.
        event_type: String,
        /// Declared source version.
        from_version: u32,
        /// Declared target version.
        target: u32,
    },

    /// The `(event type, source, target)` key is already registered.
    #[error("upcaster already registered for {event_type} v{from_version}->v{target}")]
    DuplicateUpcaster {
        /// Event type being registered.
        event_type: String,
        /// Declared source version.
        from_version: u32,
        /// Declared target version.
        target: u32,
    },

    /// The event type name is empty.
    #[error("event type cannot be empty")]
    EmptyEventType,
}

/// An event paired with its explicit schema version.
///
/// Construction validates the version, so every `VersionedEvent` in flight
/// carries a usable version, the typed replacement for checking a dynamic
/// `version` attribute at upcast time.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedEvent {
    /// The event payload and metadata.
    pub event: EventEnvelope,
    /// Type tag (mirrors the envelope's).
    pub event_type: String,
    /// Schema version, starting at 1.
    pub version: u32,
}

impl VersionedEvent {
    /// Wrap an envelope with its schema version.
    ///
    /// # Errors
    ///
    /// [`UpcasterError::InvalidVersion`] when `version < 1`;
    /// [`UpcasterError::EmptyEventType`] when the envelope has no type tag.
    pub fn new(event: EventEnvelope, version: u32) -> Result<Self, UpcasterError> {
        if version < 1 {
            return Err(UpcasterError::InvalidVersion(version));
        }
        let event_type = event.event_type().to_string();
        if event_type.is_empty() {
            return Err(UpcasterError::EmptyEventType);
        }
        Ok(Self {
            event,
            event_type,
            version,
        })
    }
}

/// A pure async transformation of an event from one schema version to the
/// next (`source_version -> source_version + 1`).
pub trait Upcaster: Send + Sync {
    /// The version this upcaster consumes.
    fn source_version(&self) -> u32;

    /// The version this upcaster produces; must be `source_version() + 1`.
    fn target_version(&self) -> u32 {
        self.source_version() + 1
    }

    /// Transform the event to the next version.
    ///
    /// The registry overwrites the result's version with the hop target, so
    /// implementations only need to migrate the payload.
    fn upcast(
        &self,
        event: VersionedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<VersionedEvent, BoxError>> + Send + '_>>;
}

type TransformFuture = Pin<Box<dyn Future<Output = Result<VersionedEvent, BoxError>> + Send>>;
type TransformFn = Arc<dyn Fn(VersionedEvent) -> TransformFuture + Send + Sync>;

/// Closure-backed [`Upcaster`] for one `n -> n+1` hop.
#[derive(Clone)]
pub struct FnUpcaster {
    source_version: u32,
    transform: TransformFn,
}

impl FnUpcaster {
    /// Create an upcaster from `source_version` to `source_version + 1`.
    pub fn new<F, Fut>(source_version: u32, transform: F) -> Self
    where
        F: Fn(VersionedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<VersionedEvent, BoxError>> + Send + 'static,
    {
        Self {
            source_version,
            transform: Arc::new(move |event| Box::pin(transform(event)) as TransformFuture),
        }
    }
}

impl Upcaster for FnUpcaster {
    fn source_version(&self) -> u32 {
        self.source_version
    }

    fn upcast(
        &self,
        event: VersionedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<VersionedEvent, BoxError>> + Send + '_>> {
        (self.transform)(event)
    }
}

impl std::fmt::Debug for FnUpcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnUpcaster")
            .field("source_version", &self.source_version)
            .field("target_version", &(self.source_version + 1))
            .finish_non_exhaustive()
    }
}

/// Registry of upcasters keyed by `(event type, source, target)`, applying
/// chains transitively on read.
#[derive(Default)]
pub struct UpcasterRegistry {
    upcasters: HashMap<(String, u32, u32), Arc<dyn Upcaster>>,
}

impl UpcasterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an upcaster for an event type.
    ///
    /// # Errors
    ///
    /// - [`UpcasterError::EmptyEventType`] for a blank type name
    /// - [`UpcasterError::InvalidUpcaster`] when the version pair is not a
    ///   `(n, n+1)` step with `n >= 1`
    /// - [`UpcasterError::DuplicateUpcaster`] when the key already exists
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        upcaster: Arc<dyn Upcaster>,
    ) -> Result<(), UpcasterError> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(UpcasterError::EmptyEventType);
        }
        let source = upcaster.source_version();
        let target = upcaster.target_version();
        if source < 1 || target != source + 1 {
            return Err(UpcasterError::InvalidUpcaster {
                event_type,
                from_version: source,
                target,
            });
        }
        let key = (event_type.clone(), source, target);
        if self.upcasters.contains_key(&key) {
            return Err(UpcasterError::DuplicateUpcaster {
                event_type,
                from_version: source,
                target,
            });
        }
        tracing::debug!(event_type = %key.0, source, target, "upcaster registered");
        self.upcasters.insert(key, upcaster);
        Ok(())
    }

    /// Look up the single-step upcaster for one hop.
    #[must_use]
    pub fn get(&self, event_type: &str, source: u32, target: u32) -> Option<&Arc<dyn Upcaster>> {
        self.upcasters
            .get(&(event_type.to_string(), source, target))
    }

    /// Migrate an event to `target_version`, chaining hops as needed.
    ///
    /// An event already at the target version is returned unchanged. Each
    /// hop's output has its version forcibly set to the hop target.
    ///
    /// # Errors
    ///
    /// - [`UpcasterError::DowncastForbidden`] when the target is below the
    ///   event's version
    /// - [`UpcasterError::NoUpcasterFound`] on a gap in the chain
    /// - [`UpcasterError::TransformFailed`] when a hop fails
    pub async fn upcast(
        &self,
        event: VersionedEvent,
        event_type: &str,
        target_version: u32,
    ) -> Result<VersionedEvent, UpcasterError> {
        if event.version == target_version {
            return Ok(event);
        }
        if event.version > target_version {
            return Err(UpcasterError::DowncastForbidden {
                event_type: event_type.to_string(),
                from: event.version,
                to: target_version,
            });
        }

        let mut current = event;
        for hop_source in current.version..target_version {
            let hop_target = hop_source + 1;
            let upcaster = self.get(event_type, hop_source, hop_target).ok_or_else(|| {
                UpcasterError::NoUpcasterFound {
                    event_type: event_type.to_string(),
                    from_version: hop_source,
                    target: hop_target,
                }
            })?;

            current = upcaster.upcast(current).await.map_err(|source| {
                UpcasterError::TransformFailed {
                    event_type: event_type.to_string(),
                    from: hop_source,
                    to: hop_target,
                    source,
                }
            })?;
            current.version = hop_target;
            tracing::debug!(event_type, from = hop_source, to = hop_target, "event upcasted");
        }
        Ok(current)
    }

    /// The registered `(source, target)` hops for an event type, in source
    /// order.
    #[must_use]
    pub fn chain_info(&self, event_type: &str) -> Vec<(u32, u32)> {
        let mut hops: Vec<(u32, u32)> = self
            .upcasters
            .keys()
            .filter(|(name, _, _)| name == event_type)
            .map(|&(_, source, target)| (source, target))
            .collect();
        hops.sort_unstable();
        hops
    }
}

impl std::fmt::Debug for UpcasterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpcasterRegistry")
            .field("upcasters", &self.upcasters.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)] // Panics: tests fail loudly

    use super::*;
    use serde_json::json;

    fn order_created_v1() -> VersionedEvent {
        VersionedEvent::new(
            EventEnvelope::new(
                "OrderCreated",
                json!({ "order_id": "o-1", "customer_id": "c-9", "total": 99.5 }),
            ),
            1,
        )
        .unwrap()
    }

    fn add_field_upcaster(source: u32, field: &'static str, value: &'static str) -> Arc<FnUpcaster> {
        Arc::new(FnUpcaster::new(source, move |mut event: VersionedEvent| async move {
            event.event.data[field] = json!(value);
            Ok(event)
        }))
    }

    #[tokio::test]
    async fn same_version_is_returned_unchanged() {
        let registry = UpcasterRegistry::new();
        let event = order_created_v1();
        let unchanged = registry.upcast(event.clone(), "OrderCreated", 1).await.unwrap();
        assert_eq!(unchanged, event);
    }

    #[tokio::test]
    async fn chain_applies_every_hop_and_preserves_fields() {
        let mut registry = UpcasterRegistry::new();
        registry
            .register("OrderCreated", add_field_upcaster(1, "currency", "USD"))
            .unwrap();
        registry
            .register("OrderCreated", add_field_upcaster(2, "created_by", "system"))
            .unwrap();

        let result = registry
            .upcast(order_created_v1(), "OrderCreated", 3)
            .await
            .unwrap();

        assert_eq!(result.version, 3);
        assert_eq!(result.event.field("currency"), Some(&json!("USD")));
        assert_eq!(result.event.field("created_by"), Some(&json!("system")));
        assert_eq!(result.event.field("order_id"), Some(&json!("o-1")));
        assert_eq!(result.event.field("total"), Some(&json!(99.5)));
    }

    #[tokio::test]
    async fn missing_hop_names_the_gap() {
        let mut registry = UpcasterRegistry::new();
        registry
            .register("OrderCreated", add_field_upcaster(1, "currency", "USD"))
            .unwrap();
        registry
            .register("OrderCreated", add_field_upcaster(2, "created_by", "system"))
            .unwrap();

        let error = registry
            .upcast(order_created_v1(), "OrderCreated", 4)
            .await
            .unwrap_err();

        match error {
            UpcasterError::NoUpcasterFound {
                event_type,
                from_version,
                target,
            } => {
                assert_eq!(event_type, "OrderCreated");
                assert_eq!(from_version, 3);
                assert_eq!(target, 4);
            }
            other => panic!("expected NoUpcasterFound, got {other}"),
        }
    }

    #[tokio::test]
    async fn downcasting_is_forbidden() {
        let registry = UpcasterRegistry::new();
        let v3 = VersionedEvent::new(EventEnvelope::new("OrderCreated", json!({})), 3).unwrap();
        let error = registry.upcast(v3, "OrderCreated", 2).await.unwrap_err();
        assert!(matches!(error, UpcasterError::DowncastForbidden { from: 3, to: 2, .. }));
    }

    #[tokio::test]
    async fn transform_failure_is_wrapped_with_hop_context() {
        let mut registry = UpcasterRegistry::new();
        registry
            .register(
                "OrderCreated",
                Arc::new(FnUpcaster::new(1, |_event: VersionedEvent| async move {
                    Err(BoxError::from("payload corrupt"))
                })),
            )
            .unwrap();

        let error = registry
            .upcast(order_created_v1(), "OrderCreated", 2)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            UpcasterError::TransformFailed { from: 1, to: 2, .. }
        ));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = UpcasterRegistry::new();
        registry
            .register("OrderCreated", add_field_upcaster(1, "a", "x"))
            .unwrap();
        let error = registry
            .register("OrderCreated", add_field_upcaster(1, "b", "y"))
            .unwrap_err();
        assert!(matches!(error, UpcasterError::DuplicateUpcaster { from_version: 1, target: 2, .. }));
    }

    #[test]
    fn invalid_version_pairs_rejected() {
        let mut registry = UpcasterRegistry::new();
        let error = registry
            .register("OrderCreated", add_field_upcaster(0, "a", "x"))
            .unwrap_err();
        assert!(matches!(error, UpcasterError::InvalidUpcaster { from_version: 0, .. }));
    }

    #[test]
    fn versioned_event_validates_on_construction() {
        let invalid = VersionedEvent::new(EventEnvelope::new("X", json!({})), 0);
        assert!(matches!(invalid, Err(UpcasterError::InvalidVersion(0))));
    }

    #[test]
    fn chain_info_lists_hops_in_order() {
        let mut registry = UpcasterRegistry::new();
        registry
            .register("OrderCreated", add_field_upcaster(2, "a", "x"))
            .unwrap();
        registry
            .register("OrderCreated", add_field_upcaster(1, "b", "y"))
            .unwrap();
        registry
            .register("OrderShipped", add_field_upcaster(1, "c", "z"))
            .unwrap();

        assert_eq!(registry.chain_info("OrderCreated"), vec![(1, 2), (2, 3)]);
        assert_eq!(registry.chain_info("OrderShipped"), vec![(1, 2)]);
        assert!(registry.chain_info("Unknown").is_empty());
    }
}
