//! Error types for the broker domain.
//!
//! The codec and repositories return these typed errors and never log; only
//! the gRPC handlers and background runners translate them to user-visible
//! statuses and emit structured log lines.

/// The result type used throughout pylon-broker.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in broker operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A CloudEvent was missing a required attribute or carried a malformed
    /// one.
    #[error("malformed event: {message}")]
    MalformedEvent {
        /// Description of what made the event malformed.
        message: String,
    },

    /// The event's data type is not recognized by the broker.
    #[error("unsupported cloudevents data type {data_type}")]
    UnsupportedDataType {
        /// The unrecognized data type string.
        data_type: String,
    },

    /// The event's action is not recognized by the broker.
    #[error("unsupported action {action}")]
    UnsupportedAction {
        /// The unrecognized action string.
        action: String,
    },

    /// A subscription topic did not match the topic grammar.
    #[error("invalid subscription topic {topic:?}, it should match `{pattern}`")]
    InvalidTopic {
        /// The rejected topic.
        topic: String,
        /// The grammar it must match.
        pattern: &'static str,
    },

    /// The stored status does not carry the shape the encoder requires.
    #[error("status shape mismatch: {message}")]
    StatusShapeMismatch {
        /// Description of the missing or malformed status field.
        message: String,
    },

    /// The requested entity was not found.
    #[error("not found: {kind} with id {id}")]
    NotFound {
        /// The kind of entity that was looked up.
        kind: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// The id already exists in the store.
    #[error("conflict: {kind} with id {id} already exists")]
    Conflict {
        /// The kind of entity that collided.
        kind: &'static str,
        /// The identifier that collided.
        id: String,
    },

    /// A subscriber transport send failed.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Broker configuration is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new malformed-event error.
    #[must_use]
    pub fn malformed_event(message: impl Into<String>) -> Self {
        Self::MalformedEvent {
            message: message.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            id: id.into(),
        }
    }

    /// Creates a new transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error is a not-found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<pylon_core::CanonicalJsonError> for Error {
    fn from(err: pylon_core::CanonicalJsonError) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::MalformedEvent { .. }
            | Error::UnsupportedDataType { .. }
            | Error::UnsupportedAction { .. }
            | Error::InvalidTopic { .. } => Self::invalid_argument(message),
            Error::NotFound { .. } => Self::not_found(message),
            // Conflicts arise only from duplicate creates; the caller
            // re-reads and switches to an update.
            Error::Conflict { .. } => Self::already_exists(message),
            Error::Transport { .. } => Self::unavailable(message),
            Error::StatusShapeMismatch { .. }
            | Error::Configuration { .. }
            | Error::Serialization { .. }
            | Error::Storage { .. }
            | Error::Internal { .. } => Self::internal(message),
        }
    }
}
