//! Input validation for docflow
//!
//! Entity names end up inside `{entityId}` placeholders and regexes, and
//! document IDs end up as path segments, so both are restricted to a safe
//! character set. Names starting with `@` are reserved for bookkeeping
//! collections such as `@views`.

use thiserror::Error;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid identifier '{0}': {1}")]
    InvalidIdentifier(String, &'static str),

    #[error("Identifier '{0}' is too long (max {1} characters)")]
    TooLong(String, usize),

    #[error("Identifier cannot be empty")]
    Empty,

    #[error("Reserved name: '{0}'")]
    Reserved(String),

    #[error("Invalid path '{0}': {1}")]
    InvalidPath(String, &'static str),
}

/// Maximum length for identifiers
pub const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Reserved names that cannot be used
const RESERVED_NAMES: &[&str] = &[".", "..", "__name__"];

/// Validate an entity name
///
/// Rules:
/// - Must be 1-255 characters
/// - Only ASCII letters and digits (the name is embedded in `{nameId}`)
/// - Must start with a letter
pub fn validate_entity_name(name: &str) -> Result<(), ValidationError> {
    check_length(name)?;

    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_alphanumeric() {
            return Err(ValidationError::InvalidIdentifier(
                name.to_string(),
                "contains invalid characters (only letters and digits allowed)",
            ));
        }
        if i == 0 && !c.is_ascii_alphabetic() {
            return Err(ValidationError::InvalidIdentifier(
                name.to_string(),
                "must start with a letter",
            ));
        }
    }

    Ok(())
}

/// Validate a document ID
///
/// Rules:
/// - Must be 1-255 characters
/// - Cannot contain `/` or braces
/// - Cannot start with `@` (bookkeeping namespace)
/// - Cannot be a reserved name
pub fn validate_document_id(id: &str) -> Result<(), ValidationError> {
    check_length(id)?;

    if id.contains('/') || id.contains('{') || id.contains('}') {
        return Err(ValidationError::InvalidIdentifier(
            id.to_string(),
            "contains path or placeholder characters",
        ));
    }

    if id.starts_with('@') {
        return Err(ValidationError::InvalidIdentifier(
            id.to_string(),
            "cannot start with '@'",
        ));
    }

    if RESERVED_NAMES.contains(&id) {
        return Err(ValidationError::Reserved(id.to_string()));
    }

    Ok(())
}

/// Validate a concrete document path: an even number of non-empty segments
/// whose document IDs pass [`validate_document_id`]
pub fn validate_doc_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::Empty);
    }
    let segments: Vec<&str> = path.split('/').collect();

    if segments.iter().any(|s| s.is_empty()) {
        return Err(ValidationError::InvalidPath(
            path.to_string(),
            "contains an empty segment",
        ));
    }
    if segments.len() % 2 != 0 {
        return Err(ValidationError::InvalidPath(
            path.to_string(),
            "does not address a document",
        ));
    }
    for id in segments.iter().skip(1).step_by(2) {
        validate_document_id(id)?;
    }

    Ok(())
}

fn check_length(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::TooLong(name.to_string(), MAX_IDENTIFIER_LENGTH));
    }
    Ok(())
}
