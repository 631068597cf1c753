//! # Eventfold Runtime
//!
//! Runtime utilities for the Eventfold event-sourcing core:
//!
//! - [`retry`]: pluggable retry policies ([`retry::NoRetry`],
//!   [`retry::FixedDelay`], [`retry::LinearBackoff`],
//!   [`retry::ExponentialBackoff`]) plus async and blocking retry wrappers
//! - [`metrics`]: a [`metrics::FacadeMetricsProvider`] bridging the core's
//!   `MetricsProvider` contract onto the `metrics` crate, and registration
//!   of the canonical metric descriptions
//!
//! ## Example
//!
//! ```
//! use eventfold_runtime::retry::{FixedDelay, retry};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = FixedDelay::new(3, Duration::from_millis(50));
//! let value = retry(&policy, || async { Ok::<_, String>("done") }).await?;
//! assert_eq!(value, "done");
//! # Ok(())
//! # }
//! ```

pub mod metrics;
pub mod retry;

pub use retry::{ExponentialBackoff, FixedDelay, LinearBackoff, NoRetry, RetryPolicy};
