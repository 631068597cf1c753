//! Message buses: type-keyed fan-out dispatch with a partial-failure policy.
//!
//! Two buses share the same subscription model and differ only in execution:
//!
//! - [`AsyncMessageBus`]: cooperative. `publish` starts every handler for
//!   the message's exact type and awaits them together; handlers observe no
//!   ordering relative to each other. Two publishes are ordered only when
//!   the caller fully awaits the first before issuing the second.
//! - [`BlockingMessageBus`]: synchronous. `publish` invokes handlers
//!   serially in registration order on the calling thread and returns when
//!   the last one has.
//!
//! The two buses never share a registry; register handlers on the variant
//! you publish on.
//!
//! # Subscription model
//!
//! Handlers are keyed by the exact Rust type of the message (no subtype
//! polymorphism). Registration is type-safe ([`AsyncMessageBus::subscribe`]
//! takes a statically-typed handler and erases it internally) and performs
//! no de-duplication: register the same function twice and it runs twice.
//! There is no unsubscribe; handlers live as long as the bus.
//!
//! # Partial-failure policy
//!
//! Every handler outcome is collected before deciding the result:
//!
//! - at least one handler succeeded: `publish` returns `Ok`, each failure
//!   is logged with the message type, the handler's name, and the cause
//! - every handler failed: `publish` returns a [`HandlerError`] naming the
//!   message type and the failure count
//! - no handler registered: no-op, `Ok`
//!
//! # Example
//!
//! ```
//! use eventfold_core::bus::AsyncMessageBus;
//! use eventfold_core::message::{Event, Message, MessageMetadata};
//!
//! #[derive(Debug)]
//! struct AccountOpened {
//!     meta: MessageMetadata,
//! }
//!
//! impl Message for AccountOpened {
//!     fn metadata(&self) -> &MessageMetadata {
//!         &self.meta
//!     }
//! }
//! impl Event for AccountOpened {}
//!
//! # tokio_test::block_on(async {
//! let mut bus = AsyncMessageBus::new();
//! bus.subscribe::<AccountOpened, _, _>(|event| async move {
//!     println!("opened: {}", event.id());
//!     Ok(())
//! });
//!
//! bus.publish(AccountOpened { meta: MessageMetadata::of::<AccountOpened>() })
//!     .await?;
//! # Ok::<(), eventfold_core::bus::HandlerError>(())
//! # });
//! ```

use crate::BoxError;
use crate::message::{Message, short_type_name};
use futures::future::join_all;
use smallvec::SmallVec;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Total dispatch failure: every handler registered for the message type
/// failed.
///
/// Never produced on partial success; individual failures are logged, not
/// raised. The `handler` descriptor is `"all_handlers"`; per-handler causes
/// are in the log, keyed by message type and handler name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler '{handler}' failed for message type '{message_type}': {failures} handler(s) failed")]
pub struct HandlerError {
    /// Type tag of the message being dispatched.
    pub message_type: String,
    /// Failing handler descriptor (`"all_handlers"` for total failure).
    pub handler: String,
    /// Number of handlers that failed.
    pub failures: usize,
}

const ALL_HANDLERS: &str = "all_handlers";

type ErasedFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
type ErasedAsyncFn = Box<dyn Fn(Arc<dyn Any + Send + Sync>) -> ErasedFuture + Send + Sync>;
type ErasedBlockingFn = Box<dyn Fn(&(dyn Any + Send + Sync)) -> Result<(), BoxError> + Send + Sync>;

struct AsyncSubscriber {
    name: &'static str,
    invoke: ErasedAsyncFn,
}

struct BlockingSubscriber {
    name: &'static str,
    invoke: ErasedBlockingFn,
}

fn mismatch(handler: &'static str) -> BoxError {
    // Unreachable while the registry is keyed by TypeId; surfaces as a
    // handler failure rather than a panic if that invariant ever breaks.
    Box::from(format!("message type mismatch dispatching to '{handler}'"))
}

/// Cooperative message bus: concurrent fan-out, awaited together.
///
/// Registration happens through `&mut self` (typically at startup, before
/// the bus is shared); dispatch through `&self`, so a built bus can be
/// shared behind an `Arc` without locking.
#[derive(Default)]
pub struct AsyncMessageBus {
    handlers: HashMap<TypeId, Vec<AsyncSubscriber>>,
}

impl AsyncMessageBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for messages of type `M`.
    ///
    /// The handler receives the message behind an `Arc` because all handlers
    /// for a message run concurrently over the same instance.
    pub fn subscribe<M, H, Fut>(&mut self, handler: H)
    where
        M: Message,
        H: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let name = short_type_name::<H>();
        let invoke: ErasedAsyncFn = Box::new(move |message| {
            message.downcast::<M>().map_or_else(
                |_| -> ErasedFuture { Box::pin(async move { Err(mismatch(name)) }) },
                |message| -> ErasedFuture { Box::pin(handler(message)) },
            )
        });
        self.handlers
            .entry(TypeId::of::<M>())
            .or_default()
            .push(AsyncSubscriber { name, invoke });
        tracing::debug!(
            message_type = short_type_name::<M>(),
            handler = name,
            "async handler subscribed"
        );
    }

    /// Number of handlers registered for `M`.
    #[must_use]
    pub fn handler_count<M: Message>(&self) -> usize {
        self.handlers
            .get(&TypeId::of::<M>())
            .map_or(0, Vec::len)
    }

    /// Publish a message to every handler registered for its exact type.
    ///
    /// All handlers are started and awaited together; outcomes are collected
    /// before the success decision. A handler future cancelled by the runtime
    /// cancels the whole publish; from the policy's point of view a
    /// cancelled handler never succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] only when every registered handler failed.
    /// Publishing a message type with no handlers is a no-op.
    pub async fn publish<M: Message>(&self, message: M) -> Result<(), HandlerError> {
        let message_type = short_type_name::<M>();
        let Some(subscribers) = self.handlers.get(&TypeId::of::<M>()) else {
            tracing::debug!(message_type, "no handlers registered, publish is a no-op");
            return Ok(());
        };

        tracing::info!(
            message_type,
            message_id = message.id(),
            handler_count = subscribers.len(),
            "publishing message"
        );

        let message: Arc<M> = Arc::new(message);
        let futures: Vec<ErasedFuture> = subscribers
            .iter()
            .map(|subscriber| {
                (subscriber.invoke)(Arc::clone(&message) as Arc<dyn Any + Send + Sync>)
            })
            .collect();
        let outcomes = join_all(futures).await;

        let mut failures: SmallVec<[&'static str; 4]> = SmallVec::new();
        for (subscriber, outcome) in subscribers.iter().zip(outcomes) {
            if let Err(error) = outcome {
                tracing::error!(
                    message_type,
                    handler = subscriber.name,
                    error = %error,
                    "handler failed"
                );
                failures.push(subscriber.name);
            }
        }

        if !failures.is_empty() && failures.len() == subscribers.len() {
            return Err(HandlerError {
                message_type: message_type.to_string(),
                handler: ALL_HANDLERS.to_string(),
                failures: failures.len(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for AsyncMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncMessageBus")
            .field("message_types", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

/// Blocking message bus: serial dispatch in registration order.
#[derive(Default)]
pub struct BlockingMessageBus {
    handlers: HashMap<TypeId, Vec<BlockingSubscriber>>,
}

impl BlockingMessageBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler for messages of type `M`.
    pub fn subscribe<M, H>(&mut self, handler: H)
    where
        M: Message,
        H: Fn(&M) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let name = short_type_name::<H>();
        let invoke: ErasedBlockingFn = Box::new(move |message| {
            message
                .downcast_ref::<M>()
                .map_or_else(|| Err(mismatch(name)), &handler)
        });
        self.handlers
            .entry(TypeId::of::<M>())
            .or_default()
            .push(BlockingSubscriber { name, invoke });
        tracing::debug!(
            message_type = short_type_name::<M>(),
            handler = name,
            "blocking handler subscribed"
        );
    }

    /// Number of handlers registered for `M`.
    #[must_use]
    pub fn handler_count<M: Message>(&self) -> usize {
        self.handlers
            .get(&TypeId::of::<M>())
            .map_or(0, Vec::len)
    }

    /// Publish a message, invoking handlers serially in registration order.
    ///
    /// Returns after the last handler has; the same partial-failure policy
    /// as the async bus applies.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] only when every registered handler failed.
    pub fn publish<M: Message>(&self, message: &M) -> Result<(), HandlerError> {
        let message_type = short_type_name::<M>();
        let Some(subscribers) = self.handlers.get(&TypeId::of::<M>()) else {
            tracing::debug!(message_type, "no handlers registered, publish is a no-op");
            return Ok(());
        };

        tracing::info!(
            message_type,
            message_id = message.id(),
            handler_count = subscribers.len(),
            "publishing message (blocking)"
        );

        let mut failures: SmallVec<[&'static str; 4]> = SmallVec::new();
        for subscriber in subscribers {
            if let Err(error) = (subscriber.invoke)(message as &(dyn Any + Send + Sync)) {
                tracing::error!(
                    message_type,
                    handler = subscriber.name,
                    error = %error,
                    "handler failed"
                );
                failures.push(subscriber.name);
            }
        }

        if !failures.is_empty() && failures.len() == subscribers.len() {
            return Err(HandlerError {
                message_type: message_type.to_string(),
                handler: ALL_HANDLERS.to_string(),
                failures: failures.len(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for BlockingMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingMessageBus")
            .field("message_types", &self.handlers.len())
            .finish_non_exhaustive()
    }
}
