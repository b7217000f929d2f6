//! Core type definitions for tablelocal
//!
//! Table names, entity keys and version tokens. Names and keys are validated
//! newtypes so that everything past the router can assume well-formed input.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name reserved by the service for the table listing resource
pub const RESERVED_TABLE_NAME: &str = "tables";

/// Maximum size of a PartitionKey or RowKey in bytes
pub const MAX_KEY_BYTES: usize = 1024;

/// Name of a table.
///
/// Table names are case-insensitive: `Orders` and `orders` address the same
/// table. The original casing is kept for display, [`TableName::key`] gives
/// the normalized form used for lookups.
#[derive(Clone, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct TableName(String);

impl TableName {
    /// Create a new table name (validates naming rules)
    pub fn new(name: impl Into<String>) -> Result<Self, TableNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the table name as given at creation
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-folded lookup key
    #[must_use]
    pub fn key(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// Validate: 3-63 alphanumeric characters, starting with a letter
    fn validate(name: &str) -> Result<(), TableNameError> {
        if name.len() < 3 {
            return Err(TableNameError::TooShort);
        }
        if name.len() > 63 {
            return Err(TableNameError::TooLong);
        }

        let mut chars = name.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(TableNameError::InvalidStartChar);
        }
        if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric()) {
            return Err(TableNameError::InvalidChar(c));
        }

        if name.eq_ignore_ascii_case(RESERVED_TABLE_NAME) {
            return Err(TableNameError::Reserved);
        }

        Ok(())
    }
}

impl PartialEq for TableName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for TableName {}

impl fmt::Debug for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableName({:?})", self.0)
    }
}

/// Errors that can occur when creating a table name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableNameError {
    #[error("table name must be at least 3 characters")]
    TooShort,
    #[error("table name must be at most 63 characters")]
    TooLong,
    #[error("table name must start with a letter")]
    InvalidStartChar,
    #[error("table name contains invalid character: {0:?}")]
    InvalidChar(char),
    #[error("table name is reserved")]
    Reserved,
}

/// Compound identity of an entity within a table.
///
/// Ordering is by PartitionKey, then RowKey, which is the order scans return.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub partition_key: String,
    pub row_key: String,
}

impl EntityKey {
    /// Create a new entity key (validates both halves)
    pub fn new(
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let partition_key = partition_key.into();
        let row_key = row_key.into();
        validate_key("PartitionKey", &partition_key)?;
        validate_key("RowKey", &row_key)?;
        Ok(Self {
            partition_key,
            row_key,
        })
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey({:?}, {:?})", self.partition_key, self.row_key)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PartitionKey='{}',RowKey='{}'",
            self.partition_key, self.row_key
        )
    }
}

fn validate_key(field: &'static str, value: &str) -> Result<(), KeyError> {
    if value.len() > MAX_KEY_BYTES {
        return Err(KeyError::TooLong { field });
    }
    if let Some(c) = value
        .chars()
        .find(|c| matches!(c, '/' | '\\' | '#' | '?') || c.is_control())
    {
        return Err(KeyError::InvalidChar { field, char: c });
    }
    Ok(())
}

/// Errors that can occur when creating an entity key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("{field} cannot exceed 1024 bytes")]
    TooLong { field: &'static str },
    #[error("{field} contains invalid character {char:?}")]
    InvalidChar { field: &'static str, char: char },
}

/// Opaque version token of an entity.
///
/// Callers only ever compare ETags for equality; the contents are not
/// meant to be interpreted.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ETag(String);

impl ETag {
    /// Wrap a raw ETag value as received on the wire
    #[must_use]
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ETag({})", self.0)
    }
}

/// Condition attached to a write through `If-Match`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfMatch {
    /// `*`: apply regardless of the current version
    Any,
    /// Apply only if the stored ETag equals this one
    ETag(ETag),
}

impl IfMatch {
    /// Parse an `If-Match` header value
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value == "*" {
            Self::Any
        } else {
            Self::ETag(ETag::from_raw(value))
        }
    }

    /// Whether an entity currently at `current` satisfies the condition
    #[must_use]
    pub fn matches(&self, current: &ETag) -> bool {
        match self {
            Self::Any => true,
            Self::ETag(expected) => expected == current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_valid() {
        assert!(TableName::new("test").is_ok());
        assert!(TableName::new("Orders2024").is_ok());
        assert!(TableName::new("abc").is_ok());
    }

    #[test]
    fn test_table_name_invalid() {
        assert_eq!(TableName::new("ab"), Err(TableNameError::TooShort));
        assert_eq!(TableName::new("1abc"), Err(TableNameError::InvalidStartChar));
        assert_eq!(
            TableName::new("my-table"),
            Err(TableNameError::InvalidChar('-'))
        );
        assert_eq!(TableName::new("Tables"), Err(TableNameError::Reserved));
        assert_eq!(TableName::new("a".repeat(64)), Err(TableNameError::TooLong));
    }

    #[test]
    fn test_table_name_case_insensitive() {
        let upper = TableName::new("Orders").unwrap();
        let lower = TableName::new("orders").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.key(), "orders");
        assert_eq!(upper.as_str(), "Orders");
    }

    #[test]
    fn test_entity_key_validation() {
        assert!(EntityKey::new("", "").is_ok());
        assert!(EntityKey::new("pk", "rk with spaces").is_ok());
        assert!(matches!(
            EntityKey::new("a/b", "rk"),
            Err(KeyError::InvalidChar { field: "PartitionKey", char: '/' })
        ));
        assert!(matches!(
            EntityKey::new("pk", "line\nbreak"),
            Err(KeyError::InvalidChar { field: "RowKey", .. })
        ));
        assert!(matches!(
            EntityKey::new("x".repeat(1025), "rk"),
            Err(KeyError::TooLong { .. })
        ));
    }

    #[test]
    fn test_entity_key_ordering() {
        let a1 = EntityKey::new("A", "1").unwrap();
        let a2 = EntityKey::new("A", "2").unwrap();
        let b0 = EntityKey::new("B", "0").unwrap();
        assert!(a1 < a2);
        assert!(a2 < b0);
    }

    #[test]
    fn test_if_match() {
        let current = ETag::from_raw("W/\"datetime'1'\"");
        assert!(IfMatch::parse("*").matches(&current));
        assert!(IfMatch::parse("W/\"datetime'1'\"").matches(&current));
        assert!(!IfMatch::parse("W/\"datetime'2'\"").matches(&current));
    }
}
