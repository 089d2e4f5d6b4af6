//! Typed errors for metadata construction, value conversion, and API calls.

use thiserror::Error;

/// Errors raised while building or validating a metadata domain.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("missing reference: {kind} '{name}'")]
    MissingReference { kind: &'static str, name: String },
    #[error("invalid primary key: type {type_name} property {prop}")]
    InvalidPrimaryKey { type_name: String, prop: String },
    #[error("duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("invalid pattern on {prop}: {detail}")]
    InvalidPattern { prop: String, detail: String },
    #[error("validation: {0}")]
    Validation(String),
}

/// Synchronous value-level errors. Never swallowed; these propagate
/// unchanged up to application code.
#[derive(Error, Debug, Clone)]
pub enum DataError {
    #[error("cannot parse '{value}' as {field}: {detail}")]
    Parse {
        field: String,
        value: String,
        detail: String,
    },
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("unknown property '{prop}' on type '{type_name}'")]
    UnknownProperty { type_name: String, prop: String },
    #[error("unknown method '{method}' on type '{type_name}'")]
    UnknownMethod { type_name: String, method: String },
    #[error("file value '{0}' cannot be serialized to a DTO")]
    FileSerialization(String),
}

impl DataError {
    pub fn parse(field: &str, value: impl std::fmt::Display, detail: &str) -> Self {
        DataError::Parse {
            field: field.to_string(),
            value: value.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// API call failures. Updated into caller state and also returned, so
/// calling code observes the failure both ways.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("network: {0}")]
    Network(String),
    #[error("http {status}: {message}")]
    Server {
        status: u16,
        message: String,
        validation_issues: Vec<crate::response::ValidationIssue>,
    },
    #[error("unexpected non-JSON response (status {status})")]
    NonJson { status: u16 },
    #[error("a request is already pending")]
    AlreadyPending,
    #[error("validation failed: {0}")]
    LocalValidation(String),
}
