//! Entity data model
//!
//! An entity is a property bag addressed by (PartitionKey, RowKey). Property
//! values are a tagged union over the EDM primitive types understood by the
//! table service.

use crate::types::{ETag, EntityKey};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Maximum number of user-defined properties on one entity
pub const MAX_PROPERTIES: usize = 252;

/// Maximum length of a property name in characters
pub const MAX_PROPERTY_NAME_LEN: usize = 255;

/// Property names managed by the service
pub const SYSTEM_PROPERTIES: [&str; 3] = ["PartitionKey", "RowKey", "Timestamp"];

/// EDM type of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdmType {
    String,
    Int32,
    Int64,
    Double,
    Boolean,
    Binary,
    DateTime,
    Guid,
}

impl EdmType {
    /// Wire name used in `@odata.type` annotations
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "Edm.String",
            Self::Int32 => "Edm.Int32",
            Self::Int64 => "Edm.Int64",
            Self::Double => "Edm.Double",
            Self::Boolean => "Edm.Boolean",
            Self::Binary => "Edm.Binary",
            Self::DateTime => "Edm.DateTime",
            Self::Guid => "Edm.Guid",
        }
    }

    /// Parse a wire type name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "Edm.String" => Self::String,
            "Edm.Int32" => Self::Int32,
            "Edm.Int64" => Self::Int64,
            "Edm.Double" => Self::Double,
            "Edm.Boolean" => Self::Boolean,
            "Edm.Binary" => Self::Binary,
            "Edm.DateTime" => Self::DateTime,
            "Edm.Guid" => Self::Guid,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int32 | Self::Int64 | Self::Double)
    }
}

impl fmt::Display for EdmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    String(String),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    Binary(Vec<u8>),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
}

impl PropertyValue {
    #[must_use]
    pub const fn edm_type(&self) -> EdmType {
        match self {
            Self::String(_) => EdmType::String,
            Self::Int32(_) => EdmType::Int32,
            Self::Int64(_) => EdmType::Int64,
            Self::Double(_) => EdmType::Double,
            Self::Boolean(_) => EdmType::Boolean,
            Self::Binary(_) => EdmType::Binary,
            Self::DateTime(_) => EdmType::DateTime,
            Self::Guid(_) => EdmType::Guid,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Order two values of compatible types.
    ///
    /// Numeric types compare with each other by value; every other type only
    /// compares with itself. Returns `None` for incompatible types and for NaN.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Binary(a), Self::Binary(b)) => Some(a.cmp(b)),
            (Self::DateTime(a), Self::DateTime(b)) => Some(a.cmp(b)),
            (Self::Guid(a), Self::Guid(b)) => Some(a.cmp(b)),
            (Self::Int32(a), Self::Int32(b)) => Some(a.cmp(b)),
            (Self::Int64(a), Self::Int64(b)) => Some(a.cmp(b)),
            (Self::Int32(a), Self::Int64(b)) => Some(i64::from(*a).cmp(b)),
            (Self::Int64(a), Self::Int32(b)) => Some(a.cmp(&i64::from(*b))),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(f64::from(*v)),
            Self::Int64(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Uuid> for PropertyValue {
    fn from(value: Uuid) -> Self {
        Self::Guid(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

/// Property bag of an entity, ordered by property name
pub type Properties = BTreeMap<String, PropertyValue>;

/// A stored entity.
///
/// `timestamp` and `etag` are assigned by the store on every write; values
/// supplied by clients are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
    pub etag: ETag,
}

impl Entity {
    #[must_use]
    pub fn partition_key(&self) -> &str {
        &self.key.partition_key
    }

    #[must_use]
    pub fn row_key(&self) -> &str {
        &self.key.row_key
    }

    /// Look up a property, including the system properties.
    ///
    /// System properties are materialized on demand so filters can address
    /// them like any other property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "PartitionKey" => Some(PropertyValue::String(self.key.partition_key.clone())),
            "RowKey" => Some(PropertyValue::String(self.key.row_key.clone())),
            "Timestamp" => Some(PropertyValue::DateTime(self.timestamp)),
            _ => self.properties.get(name).cloned(),
        }
    }
}

/// Client-supplied entity content for a write: key plus user properties.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityData {
    pub key: EntityKey,
    pub properties: Properties,
}

impl EntityData {
    #[must_use]
    pub const fn new(key: EntityKey, properties: Properties) -> Self {
        Self { key, properties }
    }

    /// Add a property (builder style, used heavily by tests)
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// Render a timestamp the way the service does: RFC 3339 with 7 fractional digits.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        ts.format("%Y-%m-%dT%H:%M:%S"),
        ts.timestamp_subsec_nanos() / 100
    )
}

/// Render a user DateTime property value (millisecond precision is what
/// clients round-trip, full precision is kept when present).
#[must_use]
pub fn format_datetime(ts: &DateTime<Utc>) -> String {
    if ts.timestamp_subsec_nanos() == 0 {
        ts.to_rfc3339_opts(SecondsFormat::Secs, true)
    } else {
        format_timestamp(ts)
    }
}

/// Parse an RFC 3339 date-time into UTC
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
