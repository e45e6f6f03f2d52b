//! Error types for resnotify.
//!
//! All errors are strongly typed using thiserror. The four families mirror how
//! the pipeline treats a failure:
//! - validation and configuration errors are returned to the caller and abort
//!   the operation before anything is mutated;
//! - lookup errors are returned on reads;
//! - delivery errors stay inside the delivery worker that hit them.

use thiserror::Error;

/// Malformed input rejected before it reaches the pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField { field: String },

    #[error("Invalid resource type '{value}'")]
    InvalidResourceType { value: String },

    #[error("Invalid resource id '{value}'")]
    InvalidResourceId { value: String },

    #[error("Invalid subscription id '{value}'")]
    InvalidSubscriptionId { value: String },

    #[error("Invalid criteria '{criteria}': {reason}")]
    InvalidCriteria { criteria: String, reason: String },

    #[error("Invalid endpoint for {channel_type} subscription: {reason}")]
    InvalidEndpoint { channel_type: String, reason: String },

    #[error("Resource snapshot does not match the message: {reason}")]
    SnapshotMismatch { reason: String },
}

/// A named item was requested but is not registered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("Subscription not found: {id}")]
    SubscriptionNotFound { id: String },

    #[error("Channel not found: {name}")]
    ChannelNotFound { name: String },
}

/// Invalid wiring of channels or channel types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Channel '{name}' carries {existing}, requested as {requested}")]
    ChannelTypeMismatch {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("Channel type '{channel_type}' is not supported by this pipeline")]
    UnsupportedChannelType { channel_type: String },

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Failure of a single external send.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Transport failure: {message}")]
    Transport { message: String },

    #[error("Endpoint rejected delivery (status {status})")]
    Rejected { status: u16 },

    #[error("Socket session '{session_id}' is closed")]
    SessionClosed { session_id: String },

    #[error("Socket session '{session_id}' not found")]
    SessionNotFound { session_id: String },

    #[error("Delivery timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Endpoint does not match channel type: {reason}")]
    EndpointMismatch { reason: String },
}

impl DeliveryError {
    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Returns true if a later attempt could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Rejected { status } => *status >= 500 || *status == 429,
            Self::SessionClosed { .. } | Self::SessionNotFound { .. } | Self::EndpointMismatch { .. } => {
                false
            }
        }
    }
}

/// Top-level error type for resnotify.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Channel '{name}' is closed")]
    ChannelClosed { name: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl NotifyError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a lookup error.
    #[must_use]
    pub const fn is_lookup(&self) -> bool {
        matches!(self, Self::Lookup(_))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a delivery error.
    #[must_use]
    pub const fn is_delivery(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Delivery(e) => e.is_retryable(),
            Self::Validation(_)
            | Self::Lookup(_)
            | Self::Configuration(_)
            | Self::ChannelClosed { .. }
            | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for resnotify operations.
pub type NotifyResult<T> = Result<T, NotifyError>;
