//! Error types for the canvas conversation engine.

use serde::Serialize;
use thiserror::Error;

/// A shared error type for the whole engine.
///
/// Lower layers translate their failures into one of these variants before
/// anything crosses into the reconciler. Duplicate or out-of-order events are
/// never errors; the reconciler treats them as no-ops.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum CanvasError {
    /// Network/backend hiccup. Retried with backoff by the subscription and
    /// stream layers, never surfaced as fatal.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// A directive payload could not be resolved to a document edit.
    #[error("Malformed directive: {0}")]
    MalformedDirective(String),

    /// Two events disagree about which durable id belongs to a local key.
    #[error("Identity conflict: local key '{local_id}' already bound to '{existing}', got '{incoming}'")]
    IdentityConflict {
        local_id: String,
        existing: String,
        incoming: String,
    },

    /// A durable write failed or its confirmation never arrived.
    #[error("Durability failure for '{local_id}': {message}")]
    Durability { local_id: String, message: String },

    /// Entity not found error with type information
    #[error("Entity not found: {entity_type} '{id}'")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },

    /// Lifecycle misuse (e.g. appending to a closed stream session)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {format} - {message}")]
    Serialization { format: String, message: String },

    /// IO error (file system operations)
    #[error("IO error: {message}")]
    Io { message: String },

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CanvasError {
    // ============================================================================
    // Constructor helpers
    // ============================================================================

    /// Creates a TransientIo error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo(message.into())
    }

    /// Creates a Durability error
    pub fn durability(local_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Durability {
            local_id: local_id.into(),
            message: message.into(),
        }
    }

    /// Creates a NotFound error
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    /// Creates an InvalidState error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Creates a Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    // ============================================================================
    // Type checking methods
    // ============================================================================

    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::Io { .. })
    }

    /// Check if this is a NotFound error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a durability failure
    pub fn is_durability(&self) -> bool {
        matches!(self, Self::Durability { .. })
    }

    /// Check if this is a lifecycle misuse error
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }
}

// ============================================================================
// From implementations for automatic conversion
// ============================================================================

impl From<std::io::Error> for CanvasError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{} (kind: {:?})", err, err.kind()),
        }
    }
}

impl From<serde_json::Error> for CanvasError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "JSON".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for CanvasError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for CanvasError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<String> for CanvasError {
    fn from(err: String) -> Self {
        Self::Internal(err)
    }
}

/// A type alias for `Result<T, CanvasError>`.
pub type Result<T> = std::result::Result<T, CanvasError>;
