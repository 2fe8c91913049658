//! Record model decoded from claimed rows.
//!
//! A claimed row arrives as a [`RawRow`], an ordered list of named column
//! values built from the driver's column metadata. [`Record::decode`] picks
//! out the bookkeeping columns by name and keeps every other column as an
//! ordered business field.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Primary key column.
pub const ID_COLUMN: &str = "id";
/// Delivery flag column.
pub const PROCESSED_COLUMN: &str = "is_processed";
/// Persisted retry counter column.
pub const RETRY_COLUMN: &str = "retry";

/// Columns every source table must carry.
pub const BOOKKEEPING_COLUMNS: [&str; 3] = [ID_COLUMN, PROCESSED_COLUMN, RETRY_COLUMN];

/// Primary key of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A single column value as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    /// SQL NULL
    Null,
    /// Boolean column
    Bool(bool),
    /// Any integer column, widened
    Int(i64),
    /// Any character column
    Text(String),
    /// A type the decoder does not understand, carrying its SQL type name
    Unsupported(String),
}

impl RawValue {
    fn type_name(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(_) => "bool".to_string(),
            Self::Int(_) => "integer".to_string(),
            Self::Text(_) => "text".to_string(),
            Self::Unsupported(name) => name.to_lowercase(),
        }
    }
}

/// Ordered, named column values of one claimed row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    columns: Vec<(String, RawValue)>,
}

impl RawRow {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a column, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: RawValue) -> Self {
        self.push(name, value);
        self
    }

    /// Appends a column.
    pub fn push(&mut self, name: impl Into<String>, value: RawValue) {
        self.columns.push((name.into(), value));
    }

    /// Looks up a column by name.
    pub fn get(&self, name: &str) -> Option<&RawValue> {
        self.columns.iter().find(|(column, _)| column == name).map(|(_, value)| value)
    }

    /// Columns in the order the store returned them.
    pub fn columns(&self) -> &[(String, RawValue)] {
        &self.columns
    }

    /// Best-effort id for logging rows that fail to decode.
    pub fn id_hint(&self) -> Option<i64> {
        match self.get(ID_COLUMN) {
            Some(RawValue::Int(id)) => Some(*id),
            _ => None,
        }
    }
}

/// A named business column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessField {
    /// Column name
    pub name: String,
    /// Column value
    pub value: String,
}

/// A decoded row: bookkeeping fields plus ordered business fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Primary key
    pub id: RecordId,
    /// Whether the remote endpoint has acknowledged this record
    pub is_processed: bool,
    /// Number of cycles in which delivery failed
    pub retry_count: i32,
    /// Business columns in table order
    pub fields: Vec<BusinessField>,
}

impl Record {
    /// Decodes a claimed row.
    ///
    /// Bookkeeping columns are located by name, so column order in the table
    /// does not matter. Every other column becomes a business field and must
    /// hold text; a NULL business value decodes as the empty string.
    pub fn decode(row: RawRow) -> Result<Self, DecodeError> {
        let id = match required(&row, ID_COLUMN)? {
            RawValue::Int(id) => RecordId(*id),
            other => return Err(invalid_type(ID_COLUMN, "integer", other)),
        };

        let is_processed = match required(&row, PROCESSED_COLUMN)? {
            RawValue::Bool(flag) => *flag,
            other => return Err(invalid_type(PROCESSED_COLUMN, "bool", other)),
        };

        let retry_count = match required(&row, RETRY_COLUMN)? {
            RawValue::Int(count) => i32::try_from(*count).map_err(|_| DecodeError::InvalidType {
                column: RETRY_COLUMN.to_string(),
                expected: "32-bit integer",
                found: count.to_string(),
            })?,
            other => return Err(invalid_type(RETRY_COLUMN, "integer", other)),
        };

        let mut fields = Vec::with_capacity(row.columns.len().saturating_sub(3));
        for (name, value) in row.columns {
            if BOOKKEEPING_COLUMNS.contains(&name.as_str()) {
                continue;
            }
            match value {
                RawValue::Text(value) => fields.push(BusinessField { name, value }),
                RawValue::Null => fields.push(BusinessField { name, value: String::new() }),
                other => return Err(invalid_type(&name, "text", &other)),
            }
        }

        Ok(Self { id, is_processed, retry_count, fields })
    }

    /// JSON object of the business fields, in column order.
    ///
    /// Bookkeeping columns never appear in the body.
    pub fn body(&self) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|field| (field.name.clone(), serde_json::Value::String(field.value.clone())))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

fn required<'a>(row: &'a RawRow, column: &'static str) -> Result<&'a RawValue, DecodeError> {
    match row.get(column) {
        None => Err(DecodeError::MissingColumn(column)),
        Some(RawValue::Null) => Err(DecodeError::NullValue { column: column.to_string() }),
        Some(value) => Ok(value),
    }
}

fn invalid_type(column: &str, expected: &'static str, found: &RawValue) -> DecodeError {
    DecodeError::InvalidType { column: column.to_string(), expected, found: found.type_name() }
}
