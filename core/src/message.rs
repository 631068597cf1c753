//! Message model: CloudEvents-aligned metadata, commands, events, and the
//! persisted event envelope.
//!
//! Every message in the system, whether a command expressing intent or an
//! event recording a fact, carries the same immutable [`MessageMetadata`]: a unique
//! id, a type tag, a source URI, a timestamp, and optional CloudEvents
//! attributes plus correlation/causation extensions for tracing.
//!
//! Domain code defines its own message types and implements the [`Message`]
//! trait (plus the [`Command`] or [`Event`] marker) over an embedded metadata
//! field:
//!
//! ```
//! use eventfold_core::message::{Command, Message, MessageMetadata};
//!
//! #[derive(Debug)]
//! struct OpenAccount {
//!     meta: MessageMetadata,
//!     owner: String,
//! }
//!
//! impl Message for OpenAccount {
//!     fn metadata(&self) -> &MessageMetadata {
//!         &self.meta
//!     }
//! }
//!
//! impl Command for OpenAccount {}
//!
//! let command = OpenAccount {
//!     meta: MessageMetadata::of::<OpenAccount>(),
//!     owner: "alice".to_string(),
//! };
//! assert_eq!(command.message_type(), "OpenAccount");
//! ```
//!
//! Events destined for the event store travel as [`EventEnvelope`]s: metadata
//! plus a JSON payload, so adapters can persist every attribute round-trip
//! without knowing the domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Default `source` attribute for messages constructed without one.
pub const DEFAULT_SOURCE: &str = "eventfold";

/// The unqualified name of a type, e.g. `"OpenAccount"` for
/// `my_app::commands::OpenAccount`.
#[must_use]
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Immutable CloudEvents-aligned message metadata.
///
/// | field | CloudEvents | notes |
/// |---|---|---|
/// | `id` | `id` | UUID v4 by default |
/// | `message_type` | `type` | defaults to the unqualified type name |
/// | `source` | `source` | context URI, defaults to [`DEFAULT_SOURCE`] |
/// | `timestamp` | `time` | RFC 3339 with timezone |
/// | `subject` | `subject` | typically the aggregate id |
/// | `datacontenttype` | `datacontenttype` | |
/// | `dataschema` | `dataschema` | |
/// | `correlation_id` | extension | trace root across services |
/// | `causation_id` | extension | id of the message that caused this one |
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Unique message id.
    pub id: String,
    /// Message type tag.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Context in which the message occurred.
    pub source: String,
    /// When the message occurred.
    pub timestamp: DateTime<Utc>,
    /// Subject of the message within the source (usually the aggregate id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Content type of the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// Schema the payload adheres to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,
    /// Trace root linking related messages across aggregates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Id of the message that caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

impl MessageMetadata {
    /// Create metadata with the given type tag, a fresh UUID v4 id, the
    /// default source, and the current time.
    #[must_use]
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            source: DEFAULT_SOURCE.to_string(),
            timestamp: Utc::now(),
            subject: None,
            datacontenttype: None,
            dataschema: None,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Create metadata whose type tag is the unqualified name of `M`.
    #[must_use]
    pub fn of<M: 'static>() -> Self {
        Self::new(short_type_name::<M>())
    }

    /// Set the source URI.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the subject.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the payload content type.
    #[must_use]
    pub fn with_datacontenttype(mut self, datacontenttype: impl Into<String>) -> Self {
        self.datacontenttype = Some(datacontenttype.into());
        self
    }

    /// Set the payload schema URI.
    #[must_use]
    pub fn with_dataschema(mut self, dataschema: impl Into<String>) -> Self {
        self.dataschema = Some(dataschema.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the causation id.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Link this message to its cause: the causation id becomes the cause's
    /// id, and the correlation id is inherited from the cause (falling back
    /// to the cause's own id when the cause started the trace).
    #[must_use]
    pub fn caused_by(mut self, cause: &Self) -> Self {
        self.causation_id = Some(cause.id.clone());
        self.correlation_id = Some(
            cause
                .correlation_id
                .clone()
                .unwrap_or_else(|| cause.id.clone()),
        );
        self
    }
}

/// A message: an immutable record with CloudEvents-aligned metadata.
///
/// Implementors embed a [`MessageMetadata`] and return it from
/// [`Message::metadata`]; the provided accessors read from it.
pub trait Message: fmt::Debug + Send + Sync + 'static {
    /// The message's metadata.
    fn metadata(&self) -> &MessageMetadata;

    /// Unique message id.
    fn id(&self) -> &str {
        &self.metadata().id
    }

    /// Message type tag.
    fn message_type(&self) -> &str {
        &self.metadata().message_type
    }
}

/// A command: an intent to change state, consumed by one logical handler.
pub trait Command: Message {}

/// An event: a fact about something that happened; events may fan out to any
/// number of subscribers.
pub trait Event: Message {}

/// The canonical persisted event record: metadata plus a JSON payload.
///
/// Envelopes are what the event store appends and loads, what projections
/// consume, and what upcasters transform. Serializing an envelope yields a
/// CloudEvents-shaped JSON object with the payload under `data`; all
/// attributes survive a round-trip.
///
/// ```
/// use eventfold_core::message::EventEnvelope;
/// use serde_json::json;
///
/// let event = EventEnvelope::for_aggregate(
///     "account-7",
///     "AccountOpened",
///     json!({ "owner": "alice" }),
/// );
/// assert_eq!(event.event_type(), "AccountOpened");
/// assert_eq!(event.metadata.subject.as_deref(), Some("account-7"));
/// assert_eq!(event.field("owner"), Some(&json!("alice")));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// CloudEvents attributes.
    #[serde(flatten)]
    pub metadata: MessageMetadata,
    /// Domain payload.
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Create an envelope with the given type tag and payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            metadata: MessageMetadata::new(event_type)
                .with_datacontenttype("application/json"),
            data,
        }
    }

    /// Create an envelope produced by an aggregate: the subject carries the
    /// aggregate id and the source names the producing stream.
    #[must_use]
    pub fn for_aggregate(
        aggregate_id: impl AsRef<str>,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let aggregate_id = aggregate_id.as_ref();
        Self {
            metadata: MessageMetadata::new(event_type)
                .with_source(format!("/{aggregate_id}"))
                .with_subject(aggregate_id)
                .with_datacontenttype("application/json"),
            data,
        }
    }

    /// Link this envelope to the message that caused it.
    #[must_use]
    pub fn caused_by(mut self, cause: &MessageMetadata) -> Self {
        self.metadata = self.metadata.caused_by(cause);
        self
    }

    /// The event type tag.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.metadata.message_type
    }

    /// A named field of the payload, when the payload is a JSON object.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.get(name)
    }
}

impl Message for EventEnvelope {
    fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }
}

impl Event for EventEnvelope {}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (id {}, subject {})",
            self.metadata.message_type,
            self.metadata.id,
            self.metadata.subject.as_deref().unwrap_or("-"),
        )
    }
}

/// Validation failure on message construction or a domain precondition.
///
/// Non-retryable: it signals a programming or input defect, not a transient
/// condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A named field failed validation.
    #[error("validation failed for '{field}': {message}")]
    Field {
        /// The field that failed.
        field: String,
        /// What was wrong with it.
        message: String,
    },
    /// A validation failure not tied to a single field.
    #[error("{0}")]
    Message(String),
}

/// Validate that a string is neither empty nor whitespace-only.
///
/// # Errors
///
/// Returns [`ValidationError::Field`] when the value is blank.
pub fn validate_not_empty(value: &str, field: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Field {
            field: field.to_string(),
            message: format!("{field} cannot be empty"),
        });
    }
    Ok(())
}

/// Validate that a number is strictly positive.
///
/// # Errors
///
/// Returns [`ValidationError::Field`] when the value is zero or negative.
pub fn validate_positive(value: f64, field: &str) -> Result<(), ValidationError> {
    if value <= 0.0 {
        return Err(ValidationError::Field {
            field: field.to_string(),
            message: format!("{field} must be positive"),
        });
    }
    Ok(())
}

/// Validate that a number is zero or positive.
///
/// # Errors
///
/// Returns [`ValidationError::Field`] when the value is negative.
pub fn validate_non_negative(value: f64, field: &str) -> Result<(), ValidationError> {
    if value < 0.0 {
        return Err(ValidationError::Field {
            field: field.to_string(),
            message: format!("{field} cannot be negative"),
        });
    }
    Ok(())
}

/// Validate that a number lies within an inclusive range.
///
/// # Errors
///
/// Returns [`ValidationError::Field`] when the value falls outside
/// `[min, max]`.
pub fn validate_in_range(
    value: f64,
    min: f64,
    max: f64,
    field: &str,
) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::Field {
            field: field.to_string(),
            message: format!("{field} must be between {min} and {max}"),
        });
    }
    Ok(())
}
