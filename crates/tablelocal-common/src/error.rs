//! Error types for tablelocal
//!
//! One error enum is shared by the catalog, the entity store and the router.
//! Each variant knows its HTTP status and the service error code string that
//! client libraries turn into typed exceptions.

use crate::types::{KeyError, TableNameError};
use thiserror::Error;

/// Common result type for tablelocal operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    PreconditionFailed,
    BadRequest,
    MethodNotAllowed,
    Unauthorized,
    Timeout,
    Internal,
}

/// Common error type for tablelocal
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Catalog errors
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("invalid table name: {0}")]
    InvalidTableName(#[from] TableNameError),

    // Entity errors
    #[error("the specified resource does not exist: {table}({key})")]
    EntityNotFound { table: String, key: String },

    #[error("the specified entity already exists: {table}({key})")]
    EntityAlreadyExists { table: String, key: String },

    #[error("the update condition specified in the request was not satisfied")]
    UpdateConditionNotSatisfied,

    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("invalid property value: {0}")]
    PropertyValueInvalid(String),

    // Request errors
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid request URI: {0}")]
    InvalidUri(String),

    #[error("missing required header: {0}")]
    MissingRequiredHeader(&'static str),

    #[error("unsupported HTTP verb: {0}")]
    MethodNotAllowed(String),

    // Batch errors
    #[error("all commands in a batch must operate on the same partition")]
    BatchPartitionMismatch,

    #[error("the batch request contains multiple changes to the same entity")]
    BatchDuplicateRow,

    // Auth errors
    #[error("server failed to authenticate the request: {0}")]
    AuthenticationFailed(String),

    // Service errors
    #[error("operation could not be completed within the permitted time")]
    Timeout,

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an entity not found error
    pub fn entity_not_found(table: &str, key: &crate::EntityKey) -> Self {
        Self::EntityNotFound {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    /// Create an entity already exists error
    pub fn entity_exists(table: &str, key: &crate::EntityKey) -> Self {
        Self::EntityAlreadyExists {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    /// Taxonomy bucket of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::TableNotFound(_) | Self::EntityNotFound { .. } => ErrorKind::NotFound,
            Self::TableAlreadyExists(_) | Self::EntityAlreadyExists { .. } => ErrorKind::Conflict,
            Self::UpdateConditionNotSatisfied => ErrorKind::PreconditionFailed,
            Self::InvalidTableName(_)
            | Self::InvalidKey(_)
            | Self::PropertyValueInvalid(_)
            | Self::InvalidInput(_)
            | Self::InvalidFilter(_)
            | Self::InvalidUri(_)
            | Self::MissingRequiredHeader(_)
            | Self::BatchPartitionMismatch
            | Self::BatchDuplicateRow => ErrorKind::BadRequest,
            Self::MethodNotAllowed(_) => ErrorKind::MethodNotAllowed,
            Self::AuthenticationFailed(_) => ErrorKind::Unauthorized,
            Self::Timeout => ErrorKind::Timeout,
            Self::Persistence(_) | Self::Configuration(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    /// Get HTTP status code
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::MethodNotAllowed => 405,
            ErrorKind::Conflict => 409,
            ErrorKind::PreconditionFailed => 412,
            ErrorKind::Timeout | ErrorKind::Internal => 500,
        }
    }

    /// Get the service error code for API compatibility
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::TableNotFound(_) => "TableNotFound",
            Self::TableAlreadyExists(_) => "TableAlreadyExists",
            Self::InvalidTableName(_) => "OutOfRangeInput",
            Self::EntityNotFound { .. } => "ResourceNotFound",
            Self::EntityAlreadyExists { .. } => "EntityAlreadyExists",
            Self::UpdateConditionNotSatisfied => "UpdateConditionNotSatisfied",
            Self::InvalidKey(_) | Self::InvalidInput(_) | Self::InvalidFilter(_) => {
                "InvalidInput"
            }
            Self::PropertyValueInvalid(_) => "PropertyValueInvalid",
            Self::InvalidUri(_) => "InvalidUri",
            Self::MissingRequiredHeader(_) => "MissingRequiredHeader",
            Self::MethodNotAllowed(_) => "UnsupportedHttpVerb",
            Self::BatchPartitionMismatch => "CommandsInBatchActOnDifferentPartitions",
            Self::BatchDuplicateRow => "InvalidDuplicateRow",
            Self::AuthenticationFailed(_) => "AuthenticationFailed",
            Self::Timeout => "OperationTimedOut",
            Self::Persistence(_) | Self::Configuration(_) | Self::Internal(_) => "InternalError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityKey;

    #[test]
    fn test_error_not_found() {
        assert!(Error::TableNotFound("t".into()).is_not_found());
        let key = EntityKey::new("pk", "rk").unwrap();
        assert!(Error::entity_not_found("t", &key).is_not_found());
        assert!(!Error::UpdateConditionNotSatisfied.is_not_found());
    }

    #[test]
    fn test_error_http_status() {
        let key = EntityKey::new("pk", "rk").unwrap();
        assert_eq!(Error::entity_exists("t", &key).http_status_code(), 409);
        assert_eq!(Error::UpdateConditionNotSatisfied.http_status_code(), 412);
        assert_eq!(Error::BatchPartitionMismatch.http_status_code(), 400);
        assert_eq!(Error::AuthenticationFailed("x".into()).http_status_code(), 403);
        assert_eq!(Error::Timeout.http_status_code(), 500);
        assert_eq!(Error::Internal("x".into()).http_status_code(), 500);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::TableNotFound("t".into()).error_code(), "TableNotFound");
        assert_eq!(
            Error::BatchPartitionMismatch.error_code(),
            "CommandsInBatchActOnDifferentPartitions"
        );
        assert_eq!(
            Error::from(TableNameError::TooShort).error_code(),
            "OutOfRangeInput"
        );
        assert_eq!(Error::Timeout.error_code(), "OperationTimedOut");
    }
}
