//! OData JSON codec for entities and tables.
//!
//! Clients choose how much type information they get back through the
//! `Accept` header (`odata=nometadata|minimalmetadata|fullmetadata`). JSON
//! has no way to tell an Int64, a DateTime, a Guid or a Binary apart from a
//! string, so those values travel with a `Name@odata.type` annotation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Number, Value};
use tablelocal_common::entity::{format_datetime, format_timestamp, parse_datetime};
use tablelocal_common::{
    EdmType, Entity, EntityData, EntityKey, Error, Properties, PropertyValue, Result, TableName,
};
use uuid::Uuid;

const TYPE_SUFFIX: &str = "@odata.type";

/// Amount of OData metadata in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataLevel {
    NoMetadata,
    #[default]
    Minimal,
    Full,
}

impl MetadataLevel {
    /// Pick the level from an `Accept` header; minimal when unspecified
    #[must_use]
    pub fn from_accept(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Self::Minimal;
        };
        let accept = accept.to_ascii_lowercase();
        if accept.contains("odata=nometadata") {
            Self::NoMetadata
        } else if accept.contains("odata=fullmetadata") {
            Self::Full
        } else {
            Self::Minimal
        }
    }

    #[must_use]
    pub const fn content_type(&self) -> &'static str {
        match self {
            Self::NoMetadata => "application/json;odata=nometadata;streaming=true;charset=utf-8",
            Self::Minimal => "application/json;odata=minimalmetadata;streaming=true;charset=utf-8",
            Self::Full => "application/json;odata=fullmetadata;streaming=true;charset=utf-8",
        }
    }

    /// Whether a value of this type needs an explicit type annotation
    const fn annotates(&self, ty: EdmType) -> bool {
        match self {
            Self::NoMetadata => false,
            Self::Minimal => matches!(
                ty,
                EdmType::Int64 | EdmType::DateTime | EdmType::Guid | EdmType::Binary
            ),
            Self::Full => !matches!(ty, EdmType::String | EdmType::Boolean | EdmType::Int32),
        }
    }
}

/// Where a serialized resource lives, for the `odata.*` links
#[derive(Debug, Clone)]
pub struct ServiceRoot {
    /// `http://host/account`
    pub base_url: String,
    pub account: String,
}

impl ServiceRoot {
    #[must_use]
    pub fn new(host: &str, account: &str) -> Self {
        Self {
            base_url: format!("http://{host}/{account}"),
            account: account.to_string(),
        }
    }

    fn metadata(&self, fragment: &str) -> Value {
        Value::String(format!("{}/$metadata#{fragment}", self.base_url))
    }
}

// ---- Decoding ----

/// Read the table name out of a create-table body
pub fn table_name_from_json(body: &[u8]) -> Result<TableName> {
    let object = parse_object(body)?;
    match object.get("TableName") {
        Some(Value::String(name)) => Ok(TableName::new(name.as_str())?),
        Some(_) => Err(Error::invalid_input("TableName must be a string")),
        None => Err(Error::invalid_input("request body has no TableName")),
    }
}

/// Decode an entity body.
///
/// When the request URL already names the entity, `url_key` wins over any
/// keys in the body. Otherwise both keys must be present in the body.
pub fn entity_from_json(body: &[u8], url_key: Option<&EntityKey>) -> Result<EntityData> {
    let object = parse_object(body)?;
    entity_from_object(&object, url_key)
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>> {
    if body.is_empty() {
        return Err(Error::invalid_input("request body is empty"));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(Error::invalid_input("request body must be a JSON object")),
        Err(e) => Err(Error::invalid_input(format!("malformed JSON body: {e}"))),
    }
}

fn entity_from_object(object: &Map<String, Value>, url_key: Option<&EntityKey>) -> Result<EntityData> {
    let mut partition_key = None;
    let mut row_key = None;
    let mut properties = Properties::new();

    for (name, value) in object {
        if name.contains('@') || name.starts_with("odata.") {
            continue;
        }
        match name.as_str() {
            "PartitionKey" => partition_key = Some(key_string(name, value)?),
            "RowKey" => row_key = Some(key_string(name, value)?),
            // server-assigned
            "Timestamp" => {}
            _ => {
                let annotation = object
                    .get(&format!("{name}{TYPE_SUFFIX}"))
                    .map(|v| {
                        v.as_str()
                            .and_then(EdmType::parse)
                            .ok_or_else(|| invalid_value(name, "unknown type annotation"))
                    })
                    .transpose()?;
                if let Some(value) = decode_value(name, value, annotation)? {
                    properties.insert(name.clone(), value);
                }
            }
        }
    }

    let key = match url_key {
        Some(key) => key.clone(),
        None => match (partition_key, row_key) {
            (Some(pk), Some(rk)) => EntityKey::new(pk, rk)?,
            (None, _) => return Err(Error::invalid_input("PartitionKey is required")),
            (_, None) => return Err(Error::invalid_input("RowKey is required")),
        },
    };
    Ok(EntityData::new(key, properties))
}

fn key_string(name: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_input(format!("{name} must be a string")))
}

fn invalid_value(name: &str, reason: &str) -> Error {
    Error::PropertyValueInvalid(format!("{name}: {reason}"))
}

/// Convert one JSON value. `None` for JSON null, which drops the property.
fn decode_value(name: &str, value: &Value, annotation: Option<EdmType>) -> Result<Option<PropertyValue>> {
    if value.is_null() {
        return Ok(None);
    }
    let Some(ty) = annotation else {
        return infer_value(name, value).map(Some);
    };

    let text = value.as_str();
    let mismatch = || invalid_value(name, &format!("value does not match {ty}"));
    let decoded = match ty {
        EdmType::String => PropertyValue::String(text.ok_or_else(mismatch)?.to_string()),
        EdmType::Boolean => PropertyValue::Boolean(value.as_bool().ok_or_else(mismatch)?),
        EdmType::Int32 => {
            let n = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            };
            PropertyValue::Int32(n.and_then(|n| i32::try_from(n).ok()).ok_or_else(mismatch)?)
        }
        EdmType::Int64 => {
            let n = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            };
            PropertyValue::Int64(n.ok_or_else(mismatch)?)
        }
        EdmType::Double => {
            let n = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => parse_double(s),
                _ => None,
            };
            PropertyValue::Double(n.ok_or_else(mismatch)?)
        }
        EdmType::Binary => PropertyValue::Binary(
            BASE64
                .decode(text.ok_or_else(mismatch)?)
                .map_err(|_| mismatch())?,
        ),
        EdmType::DateTime => {
            PropertyValue::DateTime(parse_datetime(text.ok_or_else(mismatch)?).ok_or_else(mismatch)?)
        }
        EdmType::Guid => {
            PropertyValue::Guid(Uuid::parse_str(text.ok_or_else(mismatch)?).map_err(|_| mismatch())?)
        }
    };
    Ok(Some(decoded))
}

/// Type of an unannotated value from its JSON shape
fn infer_value(name: &str, value: &Value) -> Result<PropertyValue> {
    match value {
        Value::String(s) => Ok(PropertyValue::String(s.clone())),
        Value::Bool(b) => Ok(PropertyValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i32::try_from(i).map_or(PropertyValue::Int64(i), PropertyValue::Int32))
            } else {
                n.as_f64()
                    .map(PropertyValue::Double)
                    .ok_or_else(|| invalid_value(name, "number out of range"))
            }
        }
        Value::Array(_) | Value::Object(_) => {
            Err(invalid_value(name, "nested values are not supported"))
        }
        Value::Null => Err(invalid_value(name, "null")),
    }
}

fn parse_double(s: &str) -> Option<f64> {
    match s {
        "NaN" => Some(f64::NAN),
        "Infinity" | "INF" => Some(f64::INFINITY),
        "-Infinity" | "-INF" => Some(f64::NEG_INFINITY),
        _ => s.parse().ok(),
    }
}

// ---- Encoding ----

fn insert_annotated(
    out: &mut Map<String, Value>,
    name: &str,
    value: &PropertyValue,
    level: MetadataLevel,
) {
    let (json, needs_type) = match value {
        PropertyValue::String(s) => (Value::String(s.clone()), false),
        PropertyValue::Boolean(b) => (Value::Bool(*b), false),
        PropertyValue::Int32(i) => (Value::from(*i), false),
        PropertyValue::Int64(i) => (Value::String(i.to_string()), false),
        PropertyValue::Double(d) => match Number::from_f64(*d) {
            Some(n) => (Value::Number(n), false),
            None => (Value::String(double_text(*d).to_string()), true),
        },
        PropertyValue::Binary(b) => (Value::String(BASE64.encode(b)), false),
        PropertyValue::DateTime(ts) => (Value::String(format_datetime(ts)), false),
        PropertyValue::Guid(g) => (Value::String(g.hyphenated().to_string()), false),
    };
    let ty = value.edm_type();
    if level.annotates(ty) || (needs_type && level != MetadataLevel::NoMetadata) {
        out.insert(format!("{name}{TYPE_SUFFIX}"), Value::String(ty.as_str().into()));
    }
    out.insert(name.to_string(), json);
}

const fn double_text(d: f64) -> &'static str {
    if d.is_nan() {
        "NaN"
    } else if d.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    }
}

/// Absolute URL of one entity
#[must_use]
pub fn entity_url(root: &ServiceRoot, table: &str, key: &EntityKey) -> String {
    format!(
        "{}/{table}(PartitionKey='{}',RowKey='{}')",
        root.base_url,
        urlencoding::encode(&key.partition_key.replace('\'', "''")),
        urlencoding::encode(&key.row_key.replace('\'', "''"))
    )
}

/// Whether `$select` keeps a property
fn selected(select: Option<&[String]>, name: &str) -> bool {
    select.is_none_or(|names| names.iter().any(|n| n == name))
}

/// Serialize an entity as a JSON object.
///
/// `element` adds the single-entity `odata.metadata` link; entities inside a
/// feed leave it out.
#[must_use]
pub fn entity_to_json(
    entity: &Entity,
    table: &str,
    root: &ServiceRoot,
    level: MetadataLevel,
    select: Option<&[String]>,
    element: bool,
) -> Value {
    let mut out = Map::new();
    if level != MetadataLevel::NoMetadata {
        if element {
            out.insert(
                "odata.metadata".into(),
                root.metadata(&format!("{table}/@Element")),
            );
        }
        if level == MetadataLevel::Full {
            let id = entity_url(root, table, &entity.key);
            out.insert(
                "odata.type".into(),
                Value::String(format!("{}.{table}", root.account)),
            );
            out.insert("odata.id".into(), Value::String(id.clone()));
            out.insert(
                "odata.editLink".into(),
                Value::String(id[root.base_url.len() + 1..].to_string()),
            );
        }
        out.insert(
            "odata.etag".into(),
            Value::String(entity.etag.as_str().to_string()),
        );
    }

    if selected(select, "PartitionKey") {
        out.insert(
            "PartitionKey".into(),
            Value::String(entity.key.partition_key.clone()),
        );
    }
    if selected(select, "RowKey") {
        out.insert("RowKey".into(), Value::String(entity.key.row_key.clone()));
    }
    if selected(select, "Timestamp") {
        if level != MetadataLevel::NoMetadata {
            out.insert(
                format!("Timestamp{TYPE_SUFFIX}"),
                Value::String(EdmType::DateTime.as_str().into()),
            );
        }
        out.insert(
            "Timestamp".into(),
            Value::String(format_timestamp(&entity.timestamp)),
        );
    }
    for (name, value) in &entity.properties {
        if selected(select, name) {
            insert_annotated(&mut out, name, value, level);
        }
    }
    Value::Object(out)
}

/// Serialize a page of entities as an OData feed
#[must_use]
pub fn entities_feed(
    entities: &[Entity],
    table: &str,
    root: &ServiceRoot,
    level: MetadataLevel,
    select: Option<&[String]>,
) -> Value {
    let mut out = Map::new();
    if level != MetadataLevel::NoMetadata {
        out.insert("odata.metadata".into(), root.metadata(table));
    }
    out.insert(
        "value".into(),
        Value::Array(
            entities
                .iter()
                .map(|e| entity_to_json(e, table, root, level, select, false))
                .collect(),
        ),
    );
    Value::Object(out)
}

/// Serialize one table entry
#[must_use]
pub fn table_to_json(name: &TableName, root: &ServiceRoot, level: MetadataLevel, element: bool) -> Value {
    let mut out = Map::new();
    if level != MetadataLevel::NoMetadata {
        if element {
            out.insert("odata.metadata".into(), root.metadata("Tables/@Element"));
        }
        if level == MetadataLevel::Full {
            let link = format!("Tables('{name}')");
            out.insert(
                "odata.type".into(),
                Value::String(format!("{}.Tables", root.account)),
            );
            out.insert(
                "odata.id".into(),
                Value::String(format!("{}/{link}", root.base_url)),
            );
            out.insert("odata.editLink".into(), Value::String(link));
        }
    }
    out.insert("TableName".into(), Value::String(name.to_string()));
    Value::Object(out)
}

/// Serialize a page of tables as an OData feed
#[must_use]
pub fn tables_feed(names: &[TableName], root: &ServiceRoot, level: MetadataLevel) -> Value {
    let mut out = Map::new();
    if level != MetadataLevel::NoMetadata {
        out.insert("odata.metadata".into(), root.metadata("Tables"));
    }
    out.insert(
        "value".into(),
        Value::Array(
            names
                .iter()
                .map(|n| table_to_json(n, root, level, false))
                .collect(),
        ),
    );
    Value::Object(out)
}
