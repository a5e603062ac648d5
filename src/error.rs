//! Error types for docflow
//!
//! Provides structured error types with context for better debugging.
//! Most non-fatal conditions (dropped view options, consolidation conflicts,
//! dangling view links) are logged and never reach this type.

use thiserror::Error;

/// The main error type for docflow operations
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Schema Errors
    // ==========================================================================
    #[error("Entity '{entity}' is not declared in the schema")]
    EntityNotFound { entity: String },

    #[error("Path '{path}' does not match any entity")]
    UnknownPath { path: String },

    #[error("Invalid schema declaration: {message}")]
    InvalidDeclaration { message: String },

    #[error("Invalid version '{value}'")]
    InvalidVersion { value: String },

    // ==========================================================================
    // Path Errors
    // ==========================================================================
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    // ==========================================================================
    // Write-intent Errors
    // ==========================================================================
    #[error("Invalid instruction '{opcode}'")]
    InvalidInstruction { opcode: String },

    #[error("Intent for '{path}' is missing its {field}")]
    IncompleteIntent { path: String, field: &'static str },

    // ==========================================================================
    // Storage Errors
    // ==========================================================================
    #[error("Transaction conflict on '{path}'")]
    TransactionConflict { path: String },

    #[error("Internal lock poisoned: {what}")]
    LockPoisoned { what: &'static str },

    // ==========================================================================
    // Dispatch Errors
    // ==========================================================================
    #[error("Logic '{logic}' asked to cancel and retry")]
    RetryRequested { logic: String },

    #[error("Retry queue is full ({capacity} entries)")]
    RetryQueueFull { capacity: usize },

    // ==========================================================================
    // Validation Errors
    // ==========================================================================
    #[error("Invalid {kind} '{value}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Reserved name '{name}' cannot be used")]
    ReservedName { name: String },

    // ==========================================================================
    // Serialization Errors
    // ==========================================================================
    #[error("Failed to parse YAML: {message}")]
    YamlParseError { message: String },

    #[error("Failed to parse JSON: {message}")]
    JsonParseError { message: String },

    #[error("Failed to parse marker: {message}")]
    MarkerParseError { message: String },

    // ==========================================================================
    // Catch-all
    // ==========================================================================
    #[error("{0}")]
    Other(String),
}

/// Result type alias for docflow operations
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Conversions from external error types
// =============================================================================

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::YamlParseError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonParseError {
            message: err.to_string(),
        }
    }
}

impl From<viewmark::ParseError> for Error {
    fn from(err: viewmark::ParseError) -> Self {
        Error::MarkerParseError {
            message: err.to_string(),
        }
    }
}

impl From<crate::validation::ValidationError> for Error {
    fn from(err: crate::validation::ValidationError) -> Self {
        match err {
            crate::validation::ValidationError::InvalidIdentifier(value, reason) => {
                Error::InvalidIdentifier {
                    kind: "identifier",
                    value,
                    reason,
                }
            }
            crate::validation::ValidationError::TooLong(value, _max) => Error::InvalidIdentifier {
                kind: "identifier",
                value,
                reason: "exceeds maximum length",
            },
            crate::validation::ValidationError::Empty => Error::InvalidIdentifier {
                kind: "identifier",
                value: String::new(),
                reason: "cannot be empty",
            },
            crate::validation::ValidationError::Reserved(name) => Error::ReservedName { name },
            crate::validation::ValidationError::InvalidPath(path, reason) => Error::InvalidPath { path, reason },
        }
    }
}

// =============================================================================
// Error Display Helpers
// =============================================================================

impl Error {
    /// Returns a suggestion for fixing the error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::EntityNotFound { .. } => {
                Some("Declare the entity and reference it from the schema structure")
            }
            Error::UnknownPath { .. } | Error::InvalidPath { .. } => {
                Some("Check that the path alternates collection names and document IDs")
            }
            Error::InvalidInstruction { .. } => {
                Some("Use one of: ++, --, +N, -N, arr+(id), arr-(id), del")
            }
            Error::InvalidIdentifier { .. } => {
                Some("Use only letters, numbers, underscores, and hyphens")
            }
            Error::RetryRequested { .. } | Error::TransactionConflict { .. } => {
                Some("Retry the surrounding transaction")
            }
            _ => None,
        }
    }

    /// Returns true if the operation that produced this error may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RetryRequested { .. } | Error::TransactionConflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::EntityNotFound {
            entity: "user".to_string(),
        };
        assert_eq!(err.to_string(), "Entity 'user' is not declared in the schema");
    }

    #[test]
    fn test_error_suggestion() {
        let err = Error::InvalidInstruction {
            opcode: "**".to_string(),
        };
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::RetryRequested { logic: "x".into() }.is_retryable());
        assert!(!Error::UnknownPath { path: "a".into() }.is_retryable());
    }
}
